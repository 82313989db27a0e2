//! Configuration loading.
//!
//! A single JSON file (camelCase keys) with `SOLHUB_*` environment
//! overrides layered on top. Everything has a default so the daemon runs
//! with no config at all — it just supervises nothing until the inventory
//! source or static seeds name a server.

use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::inventory::ServerEntry;

/// Fallback IPMI credentials for servers whose inventory entry has none.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct IpmiConfig {
    pub username: String,
    pub password: String,
}

/// Inventory-source discovery.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Base URL of the inventory service; empty disables fetching.
    #[serde(default)]
    pub bmh_url: String,
    /// Scope filter passed through to the inventory source.
    #[serde(default)]
    pub namespace: String,
}

/// Log storage knobs.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct LogsConfig {
    /// Base directory for log files; defaults to `{dataDir}/logs`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Files older than this many days are pruned; 0 disables.
    #[serde(default)]
    pub retention_days: u32,
}

/// The external HTTP surface (not part of the core).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8090 }
    }
}

/// Extra reboot-detection patterns.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RebootDetectionConfig {
    /// Regex fragments appended to the built-in BIOS pattern set.
    #[serde(default)]
    pub sol_patterns: Vec<String>,
}

/// A statically-seeded server, joined with inventory data at reconcile.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StaticServer {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub macs: Vec<String>,
}

/// Top-level daemon configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Root for logs, analytics.json and bmh-cache.json.
    pub data_dir: PathBuf,
    pub ipmi: IpmiConfig,
    pub discovery: DiscoveryConfig,
    pub logs: LogsConfig,
    pub server: ServerConfig,
    pub reboot_detection: RebootDetectionConfig,
    pub servers: Vec<StaticServer>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("solhub"))
            .unwrap_or_else(|| PathBuf::from("solhub-data"));
        Self {
            data_dir,
            ipmi: IpmiConfig::default(),
            discovery: DiscoveryConfig::default(),
            logs: LogsConfig::default(),
            server: ServerConfig::default(),
            reboot_detection: RebootDetectionConfig::default(),
            servers: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `path` (or defaults when `None`), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var("SOLHUB_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = env::var("SOLHUB_BMH_URL") {
            self.discovery.bmh_url = url;
        }
        if let Ok(namespace) = env::var("SOLHUB_NAMESPACE") {
            self.discovery.namespace = namespace;
        }
        if let Ok(username) = env::var("SOLHUB_IPMI_USERNAME") {
            self.ipmi.username = username;
        }
        if let Ok(password) = env::var("SOLHUB_IPMI_PASSWORD") {
            self.ipmi.password = password;
        }
        if let Ok(path) = env::var("SOLHUB_LOGS_PATH") {
            self.logs.path = Some(PathBuf::from(path));
        }
        if let Ok(days) = env::var("SOLHUB_RETENTION_DAYS") {
            if let Ok(days) = days.parse() {
                self.logs.retention_days = days;
            }
        }
        if let Ok(port) = env::var("SOLHUB_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
    }

    /// Base directory for per-server log trees.
    pub fn logs_dir(&self) -> PathBuf {
        self.logs
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn analytics_path(&self) -> PathBuf {
        self.data_dir.join("analytics.json")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("bmh-cache.json")
    }

    /// Static `servers[]` seeds as inventory entries (credentials left
    /// empty so the IPMI fallbacks apply).
    pub fn static_seeds(&self) -> Vec<ServerEntry> {
        self.servers
            .iter()
            .map(|s| ServerEntry {
                name: s.name.clone(),
                bmc_address: s.host.clone(),
                boot_mac: s.macs.first().cloned(),
                username: String::new(),
                password: String::new(),
                powered_on: false,
            })
            .collect()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.logs.retention_days, 0);
        assert!(config.discovery.bmh_url.is_empty());
        assert_eq!(config.logs_dir(), config.data_dir.join("logs"));
        assert_eq!(config.analytics_path(), config.data_dir.join("analytics.json"));
    }

    #[test]
    fn test_full_config_file_parses() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "dataDir": "/var/lib/solhub",
                "ipmi": {"username": "ADMIN", "password": "ADMIN"},
                "discovery": {"bmhUrl": "http://inventory.local", "namespace": "racks"},
                "logs": {"path": "/var/log/consoles", "retentionDays": 14},
                "server": {"port": 9000},
                "rebootDetection": {"solPatterns": ["(?i)vendor boot agent"]},
                "servers": [{"name": "srvA", "host": "10.0.0.10", "macs": ["aa:bb:cc:dd:ee:ff"]}]
            }"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/solhub"));
        assert_eq!(config.ipmi.username, "ADMIN");
        assert_eq!(config.discovery.bmh_url, "http://inventory.local");
        assert_eq!(config.discovery.namespace, "racks");
        assert_eq!(config.logs_dir(), PathBuf::from("/var/log/consoles"));
        assert_eq!(config.logs.retention_days, 14);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.reboot_detection.sol_patterns.len(), 1);

        let seeds = config.static_seeds();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].name, "srvA");
        assert_eq!(seeds[0].boot_mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(seeds[0].username.is_empty());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{"logs": {"retentionDays": 3}}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.logs.retention_days, 3);
        assert_eq!(config.server.port, 8090);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/solhub.json"))).is_err());
    }
}
