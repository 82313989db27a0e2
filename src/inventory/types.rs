//! Inventory data model.

use serde::{Deserialize, Serialize};

/// One server as the inventory source describes it. Identity is the
/// logical `name`; everything else may change across updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    /// BMC IPv4 address (optionally `host:port`).
    pub bmc_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_mac: Option<String>,
    /// IPMI user; empty means "use the configured fallback".
    #[serde(default)]
    pub username: String,
    /// IPMI password; empty means "use the configured fallback".
    #[serde(default)]
    pub password: String,
    /// Reachability hint from the source; informational.
    #[serde(default)]
    pub powered_on: bool,
}

impl ServerEntry {
    /// True when a change between two versions of the same server
    /// requires tearing down and redialling the session.
    pub fn requires_restart(&self, other: &ServerEntry) -> bool {
        self.bmc_address != other.bmc_address
            || self.username != other.username
            || self.password != other.password
    }
}

/// A watch-style update about one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryEvent {
    Added(ServerEntry),
    Modified(ServerEntry),
    /// Advisory only: the replicated object store behind the watch is
    /// known to emit spurious deletes. Removal happens exclusively via
    /// list reconciliation.
    Deleted(ServerEntry),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ServerEntry {
        ServerEntry {
            name: "srvA".into(),
            bmc_address: "10.0.0.10".into(),
            boot_mac: Some("aa:bb:cc:dd:ee:ff".into()),
            username: "ADMIN".into(),
            password: "ADMIN".into(),
            powered_on: true,
        }
    }

    #[test]
    fn test_requires_restart_on_material_changes() {
        let base = entry();
        assert!(!base.requires_restart(&base.clone()));

        let mut addr = entry();
        addr.bmc_address = "10.0.0.11".into();
        assert!(base.requires_restart(&addr));

        let mut pass = entry();
        pass.password = "changed".into();
        assert!(base.requires_restart(&pass));

        // Power state flapping alone never restarts a session.
        let mut powered = entry();
        powered.powered_on = false;
        assert!(!base.requires_restart(&powered));
    }

    #[test]
    fn test_entry_json_round_trip() {
        let json = serde_json::to_string(&entry()).unwrap();
        let back: ServerEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry());
    }

    #[test]
    fn test_minimal_json_fills_defaults() {
        let back: ServerEntry =
            serde_json::from_str(r#"{"name":"x","bmc_address":"10.0.0.1"}"#).unwrap();
        assert!(back.username.is_empty());
        assert!(back.boot_mac.is_none());
        assert!(!back.powered_on);
    }
}
