//! Wire codec for RMCP / RMCP+ datagrams.
//!
//! Every IPMI datagram starts with the 4-byte RMCP header `06 00 FF 07`.
//! Pre-session traffic uses the IPMI 1.5 session header; everything after
//! the RAKP exchange uses the 12-byte RMCP+ (IPMI 2.0) header:
//!
//! ```text
//! IPMI 1.5:  [rmcp:4] [auth=0x00] [seq:4 LE] [session:4 LE] [len:1] [payload]
//! IPMI 2.0:  [rmcp:4] [auth=0x06] [ptype:1] [session:4 LE] [seq:4 LE] [len:2 LE] [payload]
//! ```
//!
//! In the 2.0 header bit 7 of `ptype` marks an encrypted payload and bit 6
//! an authenticated one (HMAC trailer after the payload). The SOL
//! sub-packet riding inside payload type `0x01` is:
//!
//! ```text
//! [pkt_seq:1] [ack_seq:1] [accepted:1] [op/status:1] [character data…]
//! ```
//!
//! All functions here are pure and allocation-honest: builders return a
//! fresh `Vec<u8>`, parsers return borrowed views into the input slice.

use crate::ipmi::crypto;
use crate::ipmi::SolError;

/// RMCP header: version 0x06, reserved, sequence 0xFF (no RMCP ack), class
/// 0x07 (IPMI).
pub const RMCP_HEADER: [u8; 4] = [0x06, 0x00, 0xFF, 0x07];

/// Auth type byte of IPMI 1.5 frames sent outside a session.
pub const AUTH_TYPE_NONE: u8 = 0x00;

/// Auth type byte of every RMCP+ (IPMI 2.0) frame.
pub const AUTH_TYPE_RMCP_PLUS: u8 = 0x06;

/// BMC responder address.
pub const BMC_ADDR: u8 = 0x20;

/// Remote-console requester address (software ID).
pub const CONSOLE_ADDR: u8 = 0x81;

/// RMCP+ payload types.
pub mod payload {
    /// Encapsulated IPMI message.
    pub const IPMI: u8 = 0x00;
    /// Serial-over-LAN.
    pub const SOL: u8 = 0x01;
    /// RMCP+ open session request.
    pub const OPEN_SESSION_REQUEST: u8 = 0x10;
    /// RMCP+ open session response.
    pub const OPEN_SESSION_RESPONSE: u8 = 0x11;
    /// RAKP message 1.
    pub const RAKP1: u8 = 0x12;
    /// RAKP message 2.
    pub const RAKP2: u8 = 0x13;
    /// RAKP message 3.
    pub const RAKP3: u8 = 0x14;
    /// RAKP message 4.
    pub const RAKP4: u8 = 0x15;

    /// Payload is AES-encrypted.
    pub const ENCRYPTED_BIT: u8 = 0x80;
    /// Payload carries an HMAC integrity trailer.
    pub const AUTHENTICATED_BIT: u8 = 0x40;
    /// Mask selecting the payload type number itself.
    pub const TYPE_MASK: u8 = 0x3F;
}

/// Two's-complement checksum over `bytes`: the returned value makes the
/// covered range sum to zero modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

fn need(buf: &[u8], n: usize) -> Result<(), SolError> {
    if buf.len() < n {
        return Err(SolError::Truncated { need: n, have: buf.len() });
    }
    Ok(())
}

// ============================================================================
// IPMI 1.5 session frames (pre-session only)
// ============================================================================

/// Build an IPMI 1.5 frame with auth type none.
pub fn build_v15_packet(seq: u32, session_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(14 + payload.len());
    buf.extend_from_slice(&RMCP_HEADER);
    buf.push(AUTH_TYPE_NONE);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&session_id.to_le_bytes());
    buf.push(payload.len() as u8);
    buf.extend_from_slice(payload);
    buf
}

/// Parse an IPMI 1.5 frame, returning the payload view. Trailing bytes
/// beyond the declared payload length are tolerated (RMCP pad).
pub fn parse_v15_packet(buf: &[u8]) -> Result<&[u8], SolError> {
    need(buf, 14)?;
    if buf[..4] != RMCP_HEADER {
        return Err(SolError::Truncated { need: 14, have: buf.len() });
    }
    let len = buf[13] as usize;
    need(buf, 14 + len)?;
    Ok(&buf[14..14 + len])
}

// ============================================================================
// IPMI 2.0 / RMCP+ session frames
// ============================================================================

/// Parsed view of an RMCP+ frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V2Header {
    /// Payload type with the encrypted/authenticated bits masked off.
    pub payload_type: u8,
    /// Encrypted bit was set.
    pub encrypted: bool,
    /// Authenticated bit was set (HMAC trailer follows the payload).
    pub authenticated: bool,
    /// Session id as sent on the wire.
    pub session_id: u32,
    /// Session sequence number.
    pub seq: u32,
}

/// Build a plain (unauthenticated, unencrypted) RMCP+ frame.
pub fn build_v2_packet(payload_type: u8, session_id: u32, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.extend_from_slice(&RMCP_HEADER);
    buf.push(AUTH_TYPE_RMCP_PLUS);
    buf.push(payload_type);
    buf.extend_from_slice(&session_id.to_le_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Build an RMCP+ frame with an HMAC-SHA1-96 integrity trailer keyed by K1.
///
/// The integrity pad (0xFF bytes) aligns the span from the auth-type byte
/// through the next-header byte to a multiple of 4; the trailer is
/// `[pad…] [pad_len] [next_header=0x07] [hmac…12]`.
pub fn build_v2_packet_signed(
    payload_type: u8,
    session_id: u32,
    seq: u32,
    payload: &[u8],
    k1: &[u8],
) -> Vec<u8> {
    let mut buf = build_v2_packet(
        payload_type | payload::AUTHENTICATED_BIT,
        session_id,
        seq,
        payload,
    );
    // Signed span starts after the RMCP header, at the auth-type byte.
    // Pad so that span + pad + pad_len(1) + next_header(1) is 4-aligned.
    let span = buf.len() - 4;
    let pad_len = (4 - (span + 2) % 4) % 4;
    for _ in 0..pad_len {
        buf.push(0xFF);
    }
    buf.push(pad_len as u8);
    buf.push(0x07); // next header, fixed value per IPMI 2.0
    let mac = crypto::hmac_sha1(k1, &buf[4..]);
    buf.extend_from_slice(&mac[..12]);
    buf
}

/// Parse an RMCP+ frame. Returns the header and the payload view (for
/// authenticated frames the trailer is *not* stripped from `payload` by
/// length — the declared payload length already excludes it).
pub fn parse_v2_packet(buf: &[u8]) -> Result<(V2Header, &[u8]), SolError> {
    need(buf, 16)?;
    if buf[..4] != RMCP_HEADER || buf[4] != AUTH_TYPE_RMCP_PLUS {
        return Err(SolError::Truncated { need: 16, have: buf.len() });
    }
    let ptype_raw = buf[5];
    let session_id = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let seq = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
    let len = u16::from_le_bytes([buf[14], buf[15]]) as usize;
    need(buf, 16 + len)?;
    let header = V2Header {
        payload_type: ptype_raw & payload::TYPE_MASK,
        encrypted: ptype_raw & payload::ENCRYPTED_BIT != 0,
        authenticated: ptype_raw & payload::AUTHENTICATED_BIT != 0,
        session_id,
        seq,
    };
    Ok((header, &buf[16..16 + len]))
}

/// Verify the HMAC-SHA1-96 trailer of an authenticated frame against K1.
pub fn verify_v2_signature(buf: &[u8], k1: &[u8]) -> Result<(), SolError> {
    need(buf, 16 + 12)?;
    let mac_start = buf.len() - 12;
    let mac = crypto::hmac_sha1(k1, &buf[4..mac_start]);
    if mac[..12] != buf[mac_start..] {
        return Err(SolError::BadChecksum);
    }
    Ok(())
}

// ============================================================================
// IPMI messages (the LUN/netFn/cmd envelope riding inside a session frame)
// ============================================================================

/// Build an IPMI request message addressed BMC-ward.
///
/// Layout: `[rsAddr] [netFn<<2|rsLUN] [ck1] [rqAddr] [rqSeq<<2|rqLUN] [cmd]
/// [data…] [ck2]` where ck1 covers the first two bytes and ck2 everything
/// from rqAddr onward.
pub fn build_ipmi_request(netfn: u8, cmd: u8, rq_seq: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7 + data.len());
    buf.push(BMC_ADDR);
    buf.push(netfn << 2);
    buf.push(checksum(&buf[..2]));
    buf.push(CONSOLE_ADDR);
    buf.push(rq_seq << 2);
    buf.push(cmd);
    buf.extend_from_slice(data);
    let ck2 = checksum(&buf[3..]);
    buf.push(ck2);
    buf
}

/// Parsed IPMI response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpmiResponse {
    /// Response network function (request netFn | 1).
    pub netfn: u8,
    /// Command echoed from the request.
    pub cmd: u8,
    /// Requester sequence echoed from the request.
    pub rq_seq: u8,
    /// Completion code; 0x00 is success.
    pub completion: u8,
    /// Bytes after the completion code, before the trailing checksum.
    pub data: Vec<u8>,
}

/// Parse and checksum-validate an IPMI response message.
pub fn parse_ipmi_response(buf: &[u8]) -> Result<IpmiResponse, SolError> {
    need(buf, 8)?;
    if checksum(&buf[..3]) != 0 {
        return Err(SolError::BadChecksum);
    }
    if checksum(&buf[3..]) != 0 {
        return Err(SolError::BadChecksum);
    }
    Ok(IpmiResponse {
        netfn: buf[1] >> 2,
        cmd: buf[5],
        rq_seq: buf[4] >> 2,
        completion: buf[6],
        data: buf[7..buf.len() - 1].to_vec(),
    })
}

// ============================================================================
// SOL sub-packets
// ============================================================================

/// SOL operation bit (console → BMC): generate serial break.
pub const SOL_OP_BREAK: u8 = 0x10;

/// SOL status bit (BMC → console): packet was NACKed, do not advance.
pub const SOL_STATUS_NACK: u8 = 0x40;

/// Parsed view of a SOL sub-packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolPayload<'a> {
    /// Sender's packet sequence; 0 means ACK-only.
    pub pkt_seq: u8,
    /// Sequence being acknowledged, or 0.
    pub ack_seq: u8,
    /// Accepted character count of the acknowledged packet.
    pub accepted: u8,
    /// Operation bits (console→BMC) or status bits (BMC→console).
    pub op: u8,
    /// Character data.
    pub data: &'a [u8],
}

/// Build a SOL sub-packet.
pub fn build_sol_payload(pkt_seq: u8, ack_seq: u8, accepted: u8, op: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.push(pkt_seq);
    buf.push(ack_seq);
    buf.push(accepted);
    buf.push(op);
    buf.extend_from_slice(data);
    buf
}

/// Build the ACK-only SOL sub-packet answering a data-bearing BMC packet.
pub fn build_sol_ack(ack_seq: u8) -> Vec<u8> {
    build_sol_payload(0, ack_seq, 0xFF, 0, &[])
}

/// Parse a SOL sub-packet.
pub fn parse_sol_payload(buf: &[u8]) -> Result<SolPayload<'_>, SolError> {
    need(buf, 4)?;
    Ok(SolPayload {
        pkt_seq: buf[0],
        ack_seq: buf[1],
        accepted: buf[2],
        op: buf[3],
        data: &buf[4..],
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Checksums ─────────────────────────────────────────────────────────

    #[test]
    fn test_checksum_sums_to_zero() {
        for bytes in [&[0x20u8, 0x18][..], &[0x81, 0x04, 0x38, 0x8E, 0x04][..], &[][..]] {
            let ck = checksum(bytes);
            let total = bytes.iter().fold(ck, |acc, b| acc.wrapping_add(*b));
            assert_eq!(total, 0, "checksum over {bytes:?} must zero the sum");
        }
    }

    // ── IPMI 1.5 frames ───────────────────────────────────────────────────

    #[test]
    fn test_v15_round_trip() {
        let payload = b"\x20\x18\xc8\x81\x00\x38\x8e\x04";
        let pkt = build_v15_packet(0, 0, &payload[..]);
        assert_eq!(&pkt[..4], &RMCP_HEADER);
        assert_eq!(pkt[4], AUTH_TYPE_NONE);
        assert_eq!(parse_v15_packet(&pkt).unwrap(), &payload[..]);
    }

    #[test]
    fn test_v15_tolerates_trailing_pad() {
        let mut pkt = build_v15_packet(0, 0, b"abc");
        pkt.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(parse_v15_packet(&pkt).unwrap(), b"abc");
    }

    #[test]
    fn test_v15_truncated() {
        let pkt = build_v15_packet(0, 0, b"abcdef");
        assert!(matches!(
            parse_v15_packet(&pkt[..pkt.len() - 3]),
            Err(SolError::Truncated { .. })
        ));
    }

    // ── IPMI 2.0 frames ───────────────────────────────────────────────────

    #[test]
    fn test_v2_round_trip() {
        let pkt = build_v2_packet(payload::SOL, 0xDEAD_BEEF, 42, b"console bytes");
        let (header, body) = parse_v2_packet(&pkt).unwrap();
        assert_eq!(header.payload_type, payload::SOL);
        assert!(!header.encrypted);
        assert!(!header.authenticated);
        assert_eq!(header.session_id, 0xDEAD_BEEF);
        assert_eq!(header.seq, 42);
        assert_eq!(body, b"console bytes");
    }

    #[test]
    fn test_v2_masks_payload_bits() {
        let pkt = build_v2_packet(
            payload::SOL | payload::ENCRYPTED_BIT | payload::AUTHENTICATED_BIT,
            1,
            1,
            b"x",
        );
        let (header, _) = parse_v2_packet(&pkt).unwrap();
        assert_eq!(header.payload_type, payload::SOL);
        assert!(header.encrypted);
        assert!(header.authenticated);
    }

    #[test]
    fn test_v2_declared_length_beyond_slice() {
        let mut pkt = build_v2_packet(payload::IPMI, 1, 1, b"abcd");
        pkt.truncate(pkt.len() - 2);
        assert!(matches!(parse_v2_packet(&pkt), Err(SolError::Truncated { .. })));
    }

    #[test]
    fn test_v2_signed_verifies_and_pads_to_four() {
        let k1 = [0x0Bu8; 20];
        for payload_len in 0..8usize {
            let body = vec![0x55u8; payload_len];
            let pkt = build_v2_packet_signed(payload::IPMI, 7, 9, &body, &k1);
            // Span from auth-type byte to next-header byte must be 4-aligned.
            assert_eq!((pkt.len() - 12 - 4) % 4, 0, "payload_len={payload_len}");
            verify_v2_signature(&pkt, &k1).unwrap();
            let (header, parsed) = parse_v2_packet(&pkt).unwrap();
            assert!(header.authenticated);
            assert_eq!(parsed, &body[..]);
        }
    }

    #[test]
    fn test_v2_signature_rejects_tamper() {
        let k1 = [0x0Bu8; 20];
        let mut pkt = build_v2_packet_signed(payload::IPMI, 7, 9, b"payload", &k1);
        pkt[17] ^= 0x01;
        assert!(matches!(verify_v2_signature(&pkt, &k1), Err(SolError::BadChecksum)));
    }

    // ── IPMI messages ─────────────────────────────────────────────────────

    #[test]
    fn test_ipmi_request_checksums() {
        let msg = build_ipmi_request(0x06, 0x38, 0, &[0x8E, 0x04]);
        assert_eq!(checksum(&msg[..3]), 0);
        assert_eq!(checksum(&msg[3..]), 0);
        assert_eq!(msg[0], BMC_ADDR);
        assert_eq!(msg[1], 0x06 << 2);
        assert_eq!(msg[5], 0x38);
    }

    #[test]
    fn test_ipmi_response_round_trip() {
        // Hand-build a response the way a BMC would answer GetDeviceID.
        let mut msg = vec![CONSOLE_ADDR, (0x07) << 2];
        msg.push(checksum(&msg));
        let tail_start = msg.len();
        msg.extend_from_slice(&[BMC_ADDR, 3 << 2, 0x01, 0x00, 0x20, 0x81]);
        let ck2 = checksum(&msg[tail_start..]);
        msg.push(ck2);

        let resp = parse_ipmi_response(&msg).unwrap();
        assert_eq!(resp.netfn, 0x07);
        assert_eq!(resp.cmd, 0x01);
        assert_eq!(resp.rq_seq, 3);
        assert_eq!(resp.completion, 0x00);
        assert_eq!(resp.data, vec![0x20, 0x81]);
    }

    #[test]
    fn test_ipmi_response_bad_checksum() {
        let mut msg = vec![CONSOLE_ADDR, 0x07 << 2];
        msg.push(checksum(&msg).wrapping_add(1));
        msg.extend_from_slice(&[BMC_ADDR, 0, 0x01, 0x00]);
        let ck2 = checksum(&msg[3..]);
        msg.push(ck2);
        assert!(matches!(parse_ipmi_response(&msg), Err(SolError::BadChecksum)));
    }

    // ── SOL sub-packets ───────────────────────────────────────────────────

    #[test]
    fn test_sol_round_trip() {
        let pkt = build_sol_payload(5, 3, 0x80, SOL_OP_BREAK, b"DHCP....");
        let sol = parse_sol_payload(&pkt).unwrap();
        assert_eq!(sol.pkt_seq, 5);
        assert_eq!(sol.ack_seq, 3);
        assert_eq!(sol.accepted, 0x80);
        assert_eq!(sol.op, SOL_OP_BREAK);
        assert_eq!(sol.data, b"DHCP....");
    }

    #[test]
    fn test_sol_ack_shape() {
        let ack = build_sol_ack(9);
        let sol = parse_sol_payload(&ack).unwrap();
        assert_eq!(sol.pkt_seq, 0, "ACK-only packets use the reserved sequence 0");
        assert_eq!(sol.ack_seq, 9);
        assert_eq!(sol.accepted, 0xFF);
        assert!(sol.data.is_empty());
    }

    #[test]
    fn test_sol_too_short() {
        assert!(matches!(
            parse_sol_payload(&[1, 2, 3]),
            Err(SolError::Truncated { .. })
        ));
    }
}
