//! Server inventory: the external-source seam and the reconciliation actor.

pub mod bmh;
pub mod source;
pub mod sync;
pub mod types;

pub use bmh::HttpInventorySource;
pub use source::InventorySource;
pub use sync::InventorySync;
pub use types::{InventoryEvent, ServerEntry};
