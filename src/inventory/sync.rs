//! Inventory reconciliation actor.
//!
//! Consumes the [`InventorySource`] seam and drives the supervisor:
//! new servers start sessions, changed addresses/credentials restart
//! them, servers gone from an authoritative listing stop. Watch-style
//! DELETE events are deliberately ignored — the object store behind the
//! watch emits spurious deletes, so only list reconciliation removes.
//!
//! After every successful reconciliation the merged inventory is written
//! to `bmh-cache.json`; a cold start replays the cache so capture begins
//! before the inventory service is reachable.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::hub::SessionSupervisor;
use crate::inventory::source::InventorySource;
use crate::inventory::types::{InventoryEvent, ServerEntry};

/// Cadence of the authoritative list poll.
const LIST_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// The reconciliation actor. All mutation enters through
/// [`InventorySync::reconcile`] / [`InventorySync::apply_event`]; reads
/// are snapshot copies.
pub struct InventorySync {
    supervisor: Arc<SessionSupervisor>,
    cache_path: PathBuf,
    fallback_username: String,
    fallback_password: String,
    seeds: Vec<ServerEntry>,
    known: Mutex<HashMap<String, ServerEntry>>,
}

impl InventorySync {
    pub fn new(
        supervisor: Arc<SessionSupervisor>,
        cache_path: impl Into<PathBuf>,
        fallback_username: impl Into<String>,
        fallback_password: impl Into<String>,
        seeds: Vec<ServerEntry>,
    ) -> Self {
        Self {
            supervisor,
            cache_path: cache_path.into(),
            fallback_username: fallback_username.into(),
            fallback_password: fallback_password.into(),
            seeds,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Cold start: replay the cached inventory (plus static seeds) so
    /// sessions come up before the inventory service answers.
    pub async fn bootstrap(&self) {
        let cached = self.load_cache();
        if !cached.is_empty() {
            info!("bootstrapping {} server(s) from inventory cache", cached.len());
        }
        for entry in merge_by_name(&self.seeds, cached) {
            self.apply_entry(entry).await;
        }
    }

    /// Apply one advisory watch event.
    pub async fn apply_event(&self, event: InventoryEvent) {
        match event {
            InventoryEvent::Added(entry) | InventoryEvent::Modified(entry) => {
                self.apply_entry(entry).await;
            }
            InventoryEvent::Deleted(entry) => {
                // Advisory only; the next list reconcile is authoritative.
                debug!("ignoring inventory DELETE for {}", entry.name);
            }
        }
    }

    /// Authoritative reconciliation against a full listing: start new,
    /// restart changed, stop vanished, then persist the cache.
    pub async fn reconcile(&self, listing: Vec<ServerEntry>) {
        let merged = merge_by_name(&self.seeds, listing);

        for entry in &merged {
            self.apply_entry(entry.clone()).await;
        }

        let gone: Vec<String> = {
            let known = self.known.lock().unwrap();
            known
                .keys()
                .filter(|name| !merged.iter().any(|e| &e.name == *name))
                .cloned()
                .collect()
        };
        for name in gone {
            info!("[{name}] no longer in inventory, stopping");
            self.supervisor.stop(&name).await;
            self.known.lock().unwrap().remove(&name);
        }

        self.flush_cache();
    }

    /// Upsert one server: start when unknown, restart on address or
    /// credential changes, otherwise leave the session alone.
    async fn apply_entry(&self, entry: ServerEntry) {
        let host = normalize_address(&entry.bmc_address);
        let (username, password) = self.effective_credentials(&entry);

        let changed = {
            let known = self.known.lock().unwrap();
            match known.get(&entry.name) {
                Some(prev) => prev.requires_restart(&entry),
                None => false,
            }
        };
        let needs_start = !self.supervisor.contains(&entry.name)
            || changed
            || self.supervisor.credentials_changed(&entry.name, &username, &password);

        if needs_start {
            self.supervisor
                .start(&entry.name, &host, &username, &password)
                .await;
        }
        self.known.lock().unwrap().insert(entry.name.clone(), entry);
    }

    fn effective_credentials(&self, entry: &ServerEntry) -> (String, String) {
        let username = if entry.username.is_empty() {
            self.fallback_username.clone()
        } else {
            entry.username.clone()
        };
        let password = if entry.password.is_empty() {
            self.fallback_password.clone()
        } else {
            entry.password.clone()
        };
        (username, password)
    }

    /// Snapshot of the reconciled inventory.
    pub fn snapshot(&self) -> Vec<ServerEntry> {
        let mut entries: Vec<ServerEntry> = self.known.lock().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Atomic rewrite of `bmh-cache.json`. Failures are warnings.
    pub fn flush_cache(&self) {
        if let Err(e) = self.try_flush_cache() {
            warn!("inventory cache write failed: {e:#}");
        }
    }

    fn try_flush_cache(&self) -> Result<()> {
        let entries = self.snapshot();
        let json = serde_json::to_string_pretty(&entries).context("serialising inventory")?;
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let staging = self.cache_path.with_extension("json.tmp");
        fs::write(&staging, json)
            .with_context(|| format!("writing {}", staging.display()))?;
        fs::rename(&staging, &self.cache_path)
            .with_context(|| format!("publishing {}", self.cache_path.display()))?;
        Ok(())
    }

    fn load_cache(&self) -> Vec<ServerEntry> {
        match fs::read_to_string(&self.cache_path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("ignoring corrupt {}: {e}", self.cache_path.display());
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    /// The long-running loop: bootstrap from cache, then poll the source
    /// and fold in watch events until cancelled.
    pub async fn run(
        self: Arc<Self>,
        source: Option<Arc<dyn InventorySource>>,
        cancel: CancellationToken,
    ) {
        self.bootstrap().await;
        let Some(source) = source else {
            info!("no inventory source configured; running from cache and static seeds");
            return;
        };

        let mut events = source.events();
        let mut poll = tokio::time::interval(LIST_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = poll.tick() => {
                    match source.list().await {
                        Ok(listing) => self.reconcile(listing).await,
                        Err(e) => warn!("inventory list failed: {e:#}"),
                    }
                }
                event = recv_event(&mut events) => {
                    if let Some(event) = event {
                        self.apply_event(event).await;
                    }
                }
            }
        }
    }
}

/// Await the next watch event, or pend forever when the source has no
/// watch channel (keeps the select arm inert).
async fn recv_event(
    events: &mut Option<tokio::sync::mpsc::Receiver<InventoryEvent>>,
) -> Option<InventoryEvent> {
    let closed = match events {
        Some(rx) => match rx.recv().await {
            Some(event) => return Some(event),
            None => true,
        },
        None => false,
    };
    if closed {
        *events = None;
    }
    std::future::pending().await
}

/// Inventory listing joined with the static seeds; the listing wins on a
/// name collision.
fn merge_by_name(seeds: &[ServerEntry], listing: Vec<ServerEntry>) -> Vec<ServerEntry> {
    let mut merged: Vec<ServerEntry> = seeds
        .iter()
        .filter(|seed| !listing.iter().any(|e| e.name == seed.name))
        .cloned()
        .collect();
    merged.extend(listing);
    merged
}

/// Accept `ipmi://host`, `host:port` and bare addresses.
fn normalize_address(address: &str) -> String {
    address
        .trim_start_matches("ipmi://")
        .trim_start_matches("redfish+http://")
        .to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::{Analytics, LogWriter};
    use crate::hub::BroadcastHub;
    use tempfile::TempDir;

    fn entry(name: &str, addr: &str) -> ServerEntry {
        ServerEntry {
            name: name.into(),
            bmc_address: addr.into(),
            boot_mac: None,
            username: "ADMIN".into(),
            password: "ADMIN".into(),
            powered_on: true,
        }
    }

    fn make_sync(tmp: &TempDir, seeds: Vec<ServerEntry>) -> (Arc<SessionSupervisor>, InventorySync) {
        let log = Arc::new(LogWriter::new(tmp.path().join("logs"), 0));
        let analytics = Arc::new(Analytics::load(tmp.path().join("analytics.json"), &[]));
        let hub = Arc::new(BroadcastHub::new());
        let supervisor = Arc::new(SessionSupervisor::new(
            log,
            analytics,
            hub,
            Duration::from_secs(120),
        ));
        let sync = InventorySync::new(
            Arc::clone(&supervisor),
            tmp.path().join("bmh-cache.json"),
            "FALLBACK_USER",
            "FALLBACK_PASS",
            seeds,
        );
        (supervisor, sync)
    }

    #[tokio::test]
    async fn test_reconcile_starts_and_stops_sessions() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, sync) = make_sync(&tmp, Vec::new());

        sync.reconcile(vec![entry("srvA", "127.0.0.1"), entry("srvB", "127.0.0.1")])
            .await;
        assert!(supervisor.contains("srvA"));
        assert!(supervisor.contains("srvB"));

        sync.reconcile(vec![entry("srvA", "127.0.0.1")]).await;
        assert!(supervisor.contains("srvA"));
        assert!(!supervisor.contains("srvB"), "vanished server must stop");

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_delete_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, sync) = make_sync(&tmp, Vec::new());

        sync.reconcile(vec![entry("srvA", "127.0.0.1")]).await;
        sync.apply_event(InventoryEvent::Deleted(entry("srvA", "127.0.0.1")))
            .await;
        assert!(
            supervisor.contains("srvA"),
            "watch DELETEs are advisory; only list reconciliation removes"
        );

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_credential_change_triggers_restart_with_new_secret() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, sync) = make_sync(&tmp, Vec::new());

        sync.reconcile(vec![entry("srvA", "127.0.0.1")]).await;
        assert!(!supervisor.credentials_changed("srvA", "ADMIN", "ADMIN"));

        let mut changed = entry("srvA", "127.0.0.1");
        changed.password = "rotated".into();
        sync.reconcile(vec![changed]).await;
        assert!(!supervisor.credentials_changed("srvA", "ADMIN", "rotated"));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_fallback_credentials_applied() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, sync) = make_sync(&tmp, Vec::new());

        let mut anonymous = entry("srvA", "127.0.0.1");
        anonymous.username = String::new();
        anonymous.password = String::new();
        sync.reconcile(vec![anonymous]).await;

        assert!(!supervisor.credentials_changed("srvA", "FALLBACK_USER", "FALLBACK_PASS"));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_cache_round_trips_through_cold_start() {
        let tmp = TempDir::new().unwrap();
        {
            let (supervisor, sync) = make_sync(&tmp, Vec::new());
            sync.reconcile(vec![entry("srvA", "127.0.0.1")]).await;
            supervisor.shutdown().await;
        }
        assert!(tmp.path().join("bmh-cache.json").exists());

        // A fresh daemon bootstraps sessions from the cache alone.
        let (supervisor, sync) = make_sync(&tmp, Vec::new());
        sync.bootstrap().await;
        assert!(supervisor.contains("srvA"));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_static_seeds_join_inventory() {
        let tmp = TempDir::new().unwrap();
        let (supervisor, sync) = make_sync(&tmp, vec![entry("seeded", "127.0.0.1")]);

        sync.reconcile(vec![entry("srvA", "127.0.0.1")]).await;
        assert!(supervisor.contains("seeded"));
        assert!(supervisor.contains("srvA"));

        // Seeds survive listings that do not mention them.
        sync.reconcile(vec![]).await;
        assert!(supervisor.contains("seeded"));
        assert!(!supervisor.contains("srvA"));

        supervisor.shutdown().await;
    }

    #[test]
    fn test_normalize_address_strips_scheme() {
        assert_eq!(normalize_address("ipmi://10.0.0.10"), "10.0.0.10");
        assert_eq!(normalize_address("10.0.0.10:624"), "10.0.0.10:624");
    }
}
