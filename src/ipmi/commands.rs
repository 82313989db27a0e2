//! Request builders and response parsers for the RMCP+ bring-up sequence
//! and session maintenance.
//!
//! Builders return payload bytes only; the transport wraps them in the
//! appropriate session frame (`codec::build_v15_packet` /
//! `codec::build_v2_packet`) and owns the sequence counters.

use crate::ipmi::codec::{self, IpmiResponse};
use crate::ipmi::SolError;

/// Administrator privilege level, requested everywhere.
pub const PRIV_ADMIN: u8 = 0x04;

/// IPMI network functions.
pub mod netfn {
    /// Application commands (session management, GetDeviceID).
    pub const APP: u8 = 0x06;
    /// Transport commands (SOL configuration).
    pub const TRANSPORT: u8 = 0x0C;
}

/// IPMI command numbers used by this client.
pub mod cmd {
    /// GetChannelAuthenticationCapabilities.
    pub const GET_CHANNEL_AUTH_CAPS: u8 = 0x38;
    /// SetSessionPrivilegeLevel.
    pub const SET_SESSION_PRIVILEGE: u8 = 0x3B;
    /// CloseSession.
    pub const CLOSE_SESSION: u8 = 0x3C;
    /// ActivatePayload.
    pub const ACTIVATE_PAYLOAD: u8 = 0x25;
    /// DeactivatePayload.
    pub const DEACTIVATE_PAYLOAD: u8 = 0x26;
    /// GetDeviceID — the session keepalive.
    pub const GET_DEVICE_ID: u8 = 0x01;
    /// SetSolConfigurationParameters.
    pub const SET_SOL_CONFIG: u8 = 0x21;
}

/// SOL payload type number in Activate/DeactivatePayload requests.
pub const PAYLOAD_SOL: u8 = 0x01;

/// ActivatePayload completion code "payload already active".
pub const CC_PAYLOAD_ALREADY_ACTIVE: u8 = 0x80;

/// Fallback for the negotiated outbound payload size when the activate
/// response is too short to carry one.
pub const DEFAULT_MAX_OUTBOUND: usize = 200;

// ============================================================================
// Pre-session (IPMI 1.5)
// ============================================================================

/// GetChannelAuthenticationCapabilities for the current channel (0x0E),
/// with bit 7 set to request IPMI v2.0 extended data, at Administrator.
pub fn get_channel_auth_caps(rq_seq: u8) -> Vec<u8> {
    codec::build_ipmi_request(netfn::APP, cmd::GET_CHANNEL_AUTH_CAPS, rq_seq, &[0x8E, PRIV_ADMIN])
}

/// Validate the auth-caps response: well-formed, zero completion code and
/// the 8 advisory capability bytes present.
pub fn check_auth_caps_response(msg: &[u8]) -> Result<(), SolError> {
    let resp = codec::parse_ipmi_response(msg)?;
    if resp.completion != 0 {
        return Err(SolError::BadCompletionCode(resp.completion));
    }
    if resp.data.len() < 8 {
        return Err(SolError::Truncated { need: 8, have: resp.data.len() });
    }
    Ok(())
}

// ============================================================================
// RMCP+ open session
// ============================================================================

/// Algorithm selections agreed during the open-session exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSessionResponse {
    /// BMC-assigned session id for all subsequent traffic.
    pub bmc_session_id: u32,
    /// Authentication (RAKP) algorithm.
    pub auth_alg: u8,
    /// Integrity algorithm (0 = none).
    pub integrity_alg: u8,
    /// Confidentiality algorithm (0 = none).
    pub confidentiality_alg: u8,
}

/// Open-session request offering RAKP-HMAC-SHA1 with no integrity and no
/// confidentiality.
pub fn open_session_request(console_session_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.push(0x00); // message tag
    buf.push(PRIV_ADMIN); // requested maximum privilege
    buf.extend_from_slice(&[0x00, 0x00]); // reserved
    buf.extend_from_slice(&console_session_id.to_le_bytes());
    // Authentication algorithm payload: RAKP-HMAC-SHA1.
    buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00]);
    // Integrity algorithm payload: none.
    buf.extend_from_slice(&[0x01, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00]);
    // Confidentiality algorithm payload: none.
    buf.extend_from_slice(&[0x02, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00]);
    buf
}

/// Parse the open-session response (payload type 0x11).
pub fn parse_open_session_response(buf: &[u8]) -> Result<OpenSessionResponse, SolError> {
    if buf.len() < 2 {
        return Err(SolError::Truncated { need: 2, have: buf.len() });
    }
    if buf[1] != 0 {
        return Err(SolError::HandshakeRejected { step: "open session", status: buf[1] });
    }
    if buf.len() < 36 {
        return Err(SolError::Truncated { need: 36, have: buf.len() });
    }
    Ok(OpenSessionResponse {
        bmc_session_id: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        auth_alg: buf[16] & 0x3F,
        integrity_alg: buf[24] & 0x3F,
        confidentiality_alg: buf[32] & 0x3F,
    })
}

// ============================================================================
// RAKP 1–4
// ============================================================================

/// RAKP message 1: console random number plus the identity the BMC should
/// look the privilege up under.
pub fn rakp1(bmc_session_id: u32, rm: &[u8; 16], role: u8, username: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(28 + username.len());
    buf.push(0x00); // message tag
    buf.extend_from_slice(&[0x00, 0x00, 0x00]); // reserved
    buf.extend_from_slice(&bmc_session_id.to_le_bytes());
    buf.extend_from_slice(rm);
    buf.push(role);
    buf.extend_from_slice(&[0x00, 0x00]); // reserved
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf
}

/// The fields of RAKP message 2 this client consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rakp2 {
    /// BMC random number.
    pub rc: [u8; 16],
    /// BMC GUID.
    pub guid: [u8; 16],
}

/// Parse RAKP message 2; any non-zero status is fatal.
pub fn parse_rakp2(buf: &[u8]) -> Result<Rakp2, SolError> {
    if buf.len() < 2 {
        return Err(SolError::Truncated { need: 2, have: buf.len() });
    }
    if buf[1] != 0 {
        return Err(SolError::HandshakeRejected { step: "RAKP 2", status: buf[1] });
    }
    if buf.len() < 40 {
        return Err(SolError::Truncated { need: 40, have: buf.len() });
    }
    let mut rc = [0u8; 16];
    rc.copy_from_slice(&buf[8..24]);
    let mut guid = [0u8; 16];
    guid.copy_from_slice(&buf[24..40]);
    Ok(Rakp2 { rc, guid })
}

/// RAKP message 3 carrying the console auth code.
pub fn rakp3(bmc_session_id: u32, auth_code: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + auth_code.len());
    buf.push(0x00); // message tag
    buf.push(0x00); // status: no errors
    buf.extend_from_slice(&[0x00, 0x00]); // reserved
    buf.extend_from_slice(&bmc_session_id.to_le_bytes());
    buf.extend_from_slice(auth_code);
    buf
}

/// Parse RAKP message 4; only the status byte matters (the integrity check
/// value is not verified — see DESIGN.md).
pub fn parse_rakp4(buf: &[u8]) -> Result<(), SolError> {
    if buf.len() < 2 {
        return Err(SolError::Truncated { need: 2, have: buf.len() });
    }
    if buf[1] != 0 {
        return Err(SolError::HandshakeRejected { step: "RAKP 4", status: buf[1] });
    }
    Ok(())
}

// ============================================================================
// In-session commands
// ============================================================================

/// SetSessionPrivilegeLevel to Administrator.
pub fn set_session_privilege(rq_seq: u8) -> Vec<u8> {
    codec::build_ipmi_request(netfn::APP, cmd::SET_SESSION_PRIVILEGE, rq_seq, &[PRIV_ADMIN])
}

/// ActivatePayload for SOL instance `instance`, no encryption and no
/// authentication on the payload itself.
pub fn activate_sol(rq_seq: u8, instance: u8) -> Vec<u8> {
    codec::build_ipmi_request(
        netfn::APP,
        cmd::ACTIVATE_PAYLOAD,
        rq_seq,
        &[PAYLOAD_SOL, instance, 0x00, 0x00, 0x00, 0x00],
    )
}

/// DeactivatePayload for SOL instance `instance`.
pub fn deactivate_sol(rq_seq: u8, instance: u8) -> Vec<u8> {
    codec::build_ipmi_request(
        netfn::APP,
        cmd::DEACTIVATE_PAYLOAD,
        rq_seq,
        &[PAYLOAD_SOL, instance, 0x00, 0x00, 0x00, 0x00],
    )
}

/// Extract the negotiated maximum outbound payload size from an activate
/// response: the two-byte LE field at offset 6 of the response data,
/// clamped to `[1, 255]`, defaulting when absent.
pub fn max_outbound_from_activate(resp: &IpmiResponse) -> usize {
    if resp.data.len() < 8 {
        return DEFAULT_MAX_OUTBOUND;
    }
    let raw = u16::from_le_bytes([resp.data[6], resp.data[7]]) as usize;
    raw.clamp(1, 255)
}

/// SetSolConfigurationParameters "SOL enable" on the current channel.
pub fn set_sol_enable(rq_seq: u8, enable: bool) -> Vec<u8> {
    codec::build_ipmi_request(
        netfn::TRANSPORT,
        cmd::SET_SOL_CONFIG,
        rq_seq,
        &[0x0E, 0x01, u8::from(enable)],
    )
}

/// GetDeviceID — the keepalive. The point is not the answer; it is making
/// the BMC notice a dead session.
pub fn get_device_id(rq_seq: u8) -> Vec<u8> {
    codec::build_ipmi_request(netfn::APP, cmd::GET_DEVICE_ID, rq_seq, &[])
}

/// CloseSession for the BMC-assigned session id.
pub fn close_session(rq_seq: u8, bmc_session_id: u32) -> Vec<u8> {
    codec::build_ipmi_request(
        netfn::APP,
        cmd::CLOSE_SESSION,
        rq_seq,
        &bmc_session_id.to_le_bytes(),
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipmi::codec::checksum;

    #[test]
    fn test_open_session_request_layout() {
        let req = open_session_request(0x0102_0304);
        assert_eq!(req.len(), 32);
        assert_eq!(req[1], PRIV_ADMIN);
        assert_eq!(&req[4..8], &0x0102_0304u32.to_le_bytes());
        assert_eq!(req[8], 0x00, "auth payload type");
        assert_eq!(req[12], 0x01, "RAKP-HMAC-SHA1");
        assert_eq!(req[16], 0x01, "integrity payload type");
        assert_eq!(req[20], 0x00, "integrity none");
        assert_eq!(req[24], 0x02, "confidentiality payload type");
        assert_eq!(req[28], 0x00, "confidentiality none");
    }

    #[test]
    fn test_open_session_response_round_trip() {
        // Echo the shape a BMC produces back through the parser.
        let mut resp = vec![0x00, 0x00, PRIV_ADMIN, 0x00];
        resp.extend_from_slice(&0xAABB_CCDDu32.to_le_bytes()); // console id echo
        resp.extend_from_slice(&0x0011_2233u32.to_le_bytes()); // bmc id
        resp.extend_from_slice(&[0x00, 0, 0, 0x08, 0x01, 0, 0, 0]);
        resp.extend_from_slice(&[0x01, 0, 0, 0x08, 0x00, 0, 0, 0]);
        resp.extend_from_slice(&[0x02, 0, 0, 0x08, 0x00, 0, 0, 0]);

        let parsed = parse_open_session_response(&resp).unwrap();
        assert_eq!(parsed.bmc_session_id, 0x0011_2233);
        assert_eq!(parsed.auth_alg, 0x01);
        assert_eq!(parsed.integrity_alg, 0x00);
        assert_eq!(parsed.confidentiality_alg, 0x00);
    }

    #[test]
    fn test_open_session_nonzero_status() {
        let resp = vec![0x00, 0x01];
        assert!(matches!(
            parse_open_session_response(&resp),
            Err(SolError::HandshakeRejected { step: "open session", status: 0x01 })
        ));
    }

    #[test]
    fn test_rakp1_layout() {
        let rm = [0x5Au8; 16];
        let req = rakp1(0x0011_2233, &rm, PRIV_ADMIN, "ADMIN");
        assert_eq!(&req[4..8], &0x0011_2233u32.to_le_bytes());
        assert_eq!(&req[8..24], &rm);
        assert_eq!(req[24], PRIV_ADMIN);
        assert_eq!(req[27], 5);
        assert_eq!(&req[28..], b"ADMIN");
    }

    #[test]
    fn test_rakp2_round_trip() {
        let mut resp = vec![0x00, 0x00, 0x00, 0x00];
        resp.extend_from_slice(&0xAABB_CCDDu32.to_le_bytes());
        resp.extend_from_slice(&[0x77; 16]); // Rc
        resp.extend_from_slice(&[0x88; 16]); // GUID
        let parsed = parse_rakp2(&resp).unwrap();
        assert_eq!(parsed.rc, [0x77; 16]);
        assert_eq!(parsed.guid, [0x88; 16]);
    }

    #[test]
    fn test_rakp2_rejection_status() {
        // 0x0D = invalid role; seen from BMCs when the user lacks admin.
        let resp = vec![0x00, 0x0D];
        assert!(matches!(
            parse_rakp2(&resp),
            Err(SolError::HandshakeRejected { step: "RAKP 2", status: 0x0D })
        ));
    }

    #[test]
    fn test_rakp4_status() {
        assert!(parse_rakp4(&[0x00, 0x00, 0, 0, 1, 2, 3, 4]).is_ok());
        assert!(parse_rakp4(&[0x00, 0x02]).is_err());
    }

    #[test]
    fn test_requests_are_checksum_clean() {
        for msg in [
            get_channel_auth_caps(0),
            set_session_privilege(1),
            activate_sol(2, 1),
            deactivate_sol(3, 1),
            set_sol_enable(4, true),
            get_device_id(5),
            close_session(6, 0xDEAD_BEEF),
        ] {
            assert_eq!(checksum(&msg[..3]), 0);
            assert_eq!(checksum(&msg[3..]), 0);
        }
    }

    #[test]
    fn test_max_outbound_parse() {
        let mk = |data: Vec<u8>| IpmiResponse {
            netfn: 0x07,
            cmd: cmd::ACTIVATE_PAYLOAD,
            rq_seq: 0,
            completion: 0,
            data,
        };
        // aux(4) + inbound(2) + outbound(2): outbound = 0x00C8 = 200.
        let resp = mk(vec![0, 0, 0, 0, 0x64, 0x00, 0xC8, 0x00, 0x6F, 0x02, 0, 0]);
        assert_eq!(max_outbound_from_activate(&resp), 200);

        // Oversized values clamp to 255.
        let resp = mk(vec![0, 0, 0, 0, 0, 0, 0xFF, 0x01]);
        assert_eq!(max_outbound_from_activate(&resp), 255);

        // Zero clamps to 1 rather than wedging the write pump.
        let resp = mk(vec![0, 0, 0, 0, 0, 0, 0x00, 0x00]);
        assert_eq!(max_outbound_from_activate(&resp), 1);

        // Short data falls back to the default.
        let resp = mk(vec![0, 0, 0, 0]);
        assert_eq!(max_outbound_from_activate(&resp), DEFAULT_MAX_OUTBOUND);
    }
}
