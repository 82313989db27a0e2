//! Session supervision and fan-out.

pub mod broadcast;
pub mod daemon;
pub mod supervisor;

pub use broadcast::{BroadcastHub, Subscription};
pub use supervisor::{SessionStatus, SessionSupervisor};
