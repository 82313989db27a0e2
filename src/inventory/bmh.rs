//! HTTP inventory source.
//!
//! Polls the inventory service (`discovery.bmhUrl`) for the full host
//! list. The wire shape mirrors the bare-metal-host records the service
//! exposes:
//!
//! ```json
//! [{"name": "srvA", "bmcAddress": "10.0.0.10",
//!   "bootMACAddress": "aa:bb:cc:dd:ee:ff",
//!   "username": "ADMIN", "password": "ADMIN", "poweredOn": true}]
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::inventory::source::InventorySource;
use crate::inventory::types::ServerEntry;

/// One host record as served over HTTP.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostRecord {
    name: String,
    bmc_address: String,
    #[serde(default, rename = "bootMACAddress")]
    boot_mac_address: Option<String>,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    powered_on: bool,
}

impl From<HostRecord> for ServerEntry {
    fn from(record: HostRecord) -> Self {
        ServerEntry {
            name: record.name,
            bmc_address: record.bmc_address,
            boot_mac: record.boot_mac_address,
            username: record.username,
            password: record.password,
            powered_on: record.powered_on,
        }
    }
}

/// Polling inventory client for `discovery.bmhUrl`.
pub struct HttpInventorySource {
    client: reqwest::Client,
    base_url: String,
    namespace: Option<String>,
}

impl HttpInventorySource {
    pub fn new(base_url: impl Into<String>, namespace: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building inventory HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            namespace,
        })
    }
}

#[async_trait]
impl InventorySource for HttpInventorySource {
    async fn list(&self) -> Result<Vec<ServerEntry>> {
        let mut request = self.client.get(format!("{}/hosts", self.base_url));
        if let Some(namespace) = &self.namespace {
            request = request.query(&[("namespace", namespace.as_str())]);
        }
        let records: Vec<HostRecord> = request
            .send()
            .await
            .context("inventory request failed")?
            .error_for_status()
            .context("inventory request rejected")?
            .json()
            .await
            .context("decoding inventory response")?;
        Ok(records.into_iter().map(ServerEntry::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_record_maps_to_entry() {
        let raw = r#"[
            {"name": "srvA", "bmcAddress": "10.0.0.10",
             "bootMACAddress": "aa:bb:cc:dd:ee:ff",
             "username": "ADMIN", "password": "ADMIN", "poweredOn": true},
            {"name": "srvB", "bmcAddress": "10.0.0.11"}
        ]"#;
        let records: Vec<HostRecord> = serde_json::from_str(raw).unwrap();
        let entries: Vec<ServerEntry> = records.into_iter().map(ServerEntry::from).collect();

        assert_eq!(entries[0].name, "srvA");
        assert_eq!(entries[0].bmc_address, "10.0.0.10");
        assert_eq!(entries[0].boot_mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(entries[0].powered_on);

        assert_eq!(entries[1].name, "srvB");
        assert!(entries[1].username.is_empty(), "missing credentials default empty");
        assert!(!entries[1].powered_on);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let source = HttpInventorySource::new("http://inventory.local/", None).unwrap();
        assert_eq!(source.base_url, "http://inventory.local");
    }
}
