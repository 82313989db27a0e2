//! IPMI v2.0 / RMCP+ Serial-over-LAN client engine.
//!
//! Layering, bottom up:
//!
//! - [`codec`] — pure pack/unpack of RMCP, IPMI session headers, IPMI
//!   messages and SOL sub-packets. No I/O, no state.
//! - [`crypto`] — RAKP-HMAC key derivation, HMAC integrity trailers and the
//!   AES-CBC-128 confidentiality envelope.
//! - [`commands`] — request builders and response parsers for the handshake
//!   and session-maintenance commands.
//! - [`transport`] — one UDP socket per BMC: the connect state machine and
//!   the read / write / keepalive pumps.

pub mod codec;
pub mod commands;
pub mod crypto;
mod error;
pub mod transport;

pub use error::SolError;
pub use transport::{SolConfig, SolTransport};
