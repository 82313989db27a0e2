//! Error taxonomy for the SOL engine.

use thiserror::Error;

/// Everything that can go wrong between "dial the BMC" and "session closed".
///
/// Codec-level variants (`Truncated`, `BadChecksum`, `BadPad`,
/// `BadCompletionCode`) are returned unwrapped by the pure functions;
/// the transport adds the session-lifecycle variants on top.
#[derive(Debug, Error)]
pub enum SolError {
    /// A declared length field exceeds the bytes actually present.
    #[error("truncated packet: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// An IPMI message checksum did not sum to zero.
    #[error("IPMI message checksum mismatch")]
    BadChecksum,

    /// The AES-CBC confidentiality trailer is malformed.
    #[error("malformed confidentiality pad")]
    BadPad,

    /// A command response carried a non-zero completion code.
    #[error("completion code {0:#04x}")]
    BadCompletionCode(u8),

    /// The BMC selected an algorithm this client does not implement
    /// (e.g. the MD5 variants, which are recognised but unsupported).
    #[error("unsupported algorithm {0:#04x}")]
    UnsupportedAlgorithm(u8),

    /// A handshake step answered with a non-zero RMCP+ status code.
    #[error("{step} rejected with status {status:#04x}")]
    HandshakeRejected { step: &'static str, status: u8 },

    /// ActivatePayload kept answering 0x80 after the deactivate retry and
    /// the SOL channel disable/enable cycle.
    #[error("SOL payload busy after retry and channel reset")]
    ActivationBusy,

    /// ActivatePayload failed with a completion code other than 0x00/0x80.
    #[error("SOL activation failed with completion code {0:#04x}")]
    ActivationFailed(u8),

    /// No datagram of any kind from the BMC within the inactivity window.
    #[error("no BMC traffic within the inactivity timeout")]
    InactivityTimeout,

    /// The underlying UDP socket failed.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// A write was submitted after the session closed.
    #[error("write on a closed session")]
    WriteWhileClosed,

    /// Subscribe/SendCommand named a server with no active session.
    #[error("no active session for server {0:?}")]
    SubscribeNotFound(String),
}

impl SolError {
    /// True for errors that terminate the session (as opposed to errors a
    /// caller of `write` can retry on the same session).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SolError::BadCompletionCode(_) | SolError::WriteWhileClosed)
    }
}
