//! The inventory-source seam.
//!
//! The core never talks to a concrete inventory system; it consumes this
//! trait. [`crate::inventory::HttpInventorySource`] is the production
//! implementation, tests plug in fixtures.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::inventory::types::{InventoryEvent, ServerEntry};

/// A source of server inventory.
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Full authoritative snapshot of the current inventory.
    async fn list(&self) -> Result<Vec<ServerEntry>>;

    /// Optional push-style updates between list polls. Sources without a
    /// watch capability return `None` and the sync loop relies on polling
    /// alone. Deletes arriving here are advisory (see
    /// [`InventoryEvent::Deleted`]).
    fn events(&self) -> Option<mpsc::Receiver<InventoryEvent>> {
        None
    }
}
