//! Boot lifecycle analytics.
//!
//! A per-server state machine fed with cleaned console text. BIOS-phase
//! patterns open a [`BootEvent`], OS-up patterns close it; an ordered OS
//! table, a hostname regex and per-interface link tracking enrich it. The
//! whole map persists to `analytics.json` so reboot counts and history
//! survive daemon restarts.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{LazyLock, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::{BOOT_HISTORY_CAP, BOOT_SUPERSEDE_AGE};

/// Built-in BIOS/firmware-phase markers. Extended per deployment via
/// `rebootDetection.solPatterns`.
const BIOS_PATTERNS: &[&str] = &[
    r"(?i)american megatrends",
    r"(?i)pxe->",
    r"(?i)ipxe",
    r"(?i)client mac addr",
    r"(?i)press <del> or <f2>",
];

/// Markers that the OS finished booting.
static OS_UP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)login:",
        r"Welcome to",
        r"Started .+ Service",
        r"Reached target",
        r"(?i)systemd.*Startup finished",
        r"(?i)SSH.*port 22",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Ordered OS/image detection table; first match wins.
static OS_TABLE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)fedora", "Fedora"),
        (r"(?i)ubuntu", "Ubuntu"),
        (r"(?i)red hat enterprise linux|\bRHEL\b", "RHEL"),
        (r"(?i)coreos", "CoreOS"),
        (r"(?i)bare.?metal.?services", "Bare Metal Services"),
        (r"(?i)kubernetes", "Kubernetes"),
        (r"(?i)docker", "Docker"),
        (r"(?i)esxi|vmware", "ESXi"),
    ]
    .iter()
    .map(|(p, name)| (Regex::new(p).unwrap(), *name))
    .collect()
});

/// `hostname login:` at line start.
static HOSTNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([A-Za-z0-9][A-Za-z0-9._-]*) login:").unwrap());

/// Interface link transitions ("eth0 NIC Link is Up", "bond0: link down").
static LINK_EVENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b((?:eth|eno|ens|enp|em|bond|ib)[0-9][0-9a-z]*)\b[^\n]{0,60}?\blink\b[^\n]{0,20}?\b(up|down)\b",
    )
    .unwrap()
});

/// One observed interface transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkEvent {
    pub interface: String,
    pub up: bool,
    pub at: DateTime<Utc>,
}

/// Per-interface up/down totals within one boot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkCounters {
    pub up: u32,
    pub down: u32,
}

/// One boot, from first BIOS output to the OS coming up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootEvent {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// `end_time − start_time`, seconds.
    pub boot_duration_secs: Option<f64>,
    /// Log-rotation to first-console-byte delay, when a rotation preceded
    /// this boot.
    pub power_on_delay_secs: Option<f64>,
    pub rotation_time: Option<DateTime<Utc>>,
    pub complete: bool,
    pub detected_os: Option<String>,
    pub network_events: Vec<NetworkEvent>,
    pub interface_counters: HashMap<String, LinkCounters>,
}

impl BootEvent {
    fn begin(now: DateTime<Utc>) -> Self {
        Self {
            start_time: now,
            end_time: None,
            boot_duration_secs: None,
            power_on_delay_secs: None,
            rotation_time: None,
            complete: false,
            detected_os: None,
            network_events: Vec::new(),
            interface_counters: HashMap::new(),
        }
    }
}

/// Everything tracked for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAnalytics {
    pub name: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub current_boot: Option<BootEvent>,
    /// Most recent completed/superseded boots, oldest first, capped.
    pub boot_history: Vec<BootEvent>,
    pub os_up_since: Option<DateTime<Utc>>,
    pub total_reboots: u64,
    pub current_os: Option<String>,
    pub hostname: Option<String>,
    /// Set by the supervisor at rotation, consumed by the first byte.
    #[serde(skip)]
    pending_rotation: Option<(Instant, DateTime<Utc>)>,
    /// (rotation wall time, measured power-on delay) awaiting the next
    /// BIOS-phase detection.
    #[serde(skip)]
    rotation_mark: Option<(DateTime<Utc>, f64)>,
}

impl ServerAnalytics {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_seen: None,
            current_boot: None,
            boot_history: Vec::new(),
            os_up_since: None,
            total_reboots: 0,
            current_os: None,
            hostname: None,
            pending_rotation: None,
            rotation_mark: None,
        }
    }
}

/// The analytics engine: pattern tables plus the persisted server map.
pub struct Analytics {
    path: PathBuf,
    bios_patterns: Vec<Regex>,
    servers: RwLock<HashMap<String, ServerAnalytics>>,
}

impl Analytics {
    /// Load persisted state from `path` (missing or corrupt files start
    /// empty) and compile the BIOS pattern set with the configured extras.
    pub fn load(path: impl Into<PathBuf>, extra_patterns: &[String]) -> Self {
        let path = path.into();
        let servers = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!("ignoring corrupt {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        let mut bios_patterns: Vec<Regex> = BIOS_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("built-in pattern compiles"))
            .collect();
        for extra in extra_patterns {
            match Regex::new(extra) {
                Ok(re) => bios_patterns.push(re),
                Err(e) => warn!("skipping bad reboot-detection pattern {extra:?}: {e}"),
            }
        }

        Self {
            path,
            bios_patterns,
            servers: RwLock::new(servers),
        }
    }

    /// Note that `server`'s log was just rotated; the next console byte
    /// computes the power-on delay from this instant.
    pub fn record_rotation(&self, server: &str) {
        let mut servers = self.servers.write().unwrap();
        let entry = servers
            .entry(server.to_string())
            .or_insert_with(|| ServerAnalytics::new(server));
        entry.pending_rotation = Some((Instant::now(), Utc::now()));
        debug!("[{server}] rotation mark set");
    }

    /// Feed one cleaned-text chunk through the state machine.
    pub fn observe(&self, server: &str, text: &str) {
        let now = Utc::now();
        let mut changed = false;
        {
            let mut servers = self.servers.write().unwrap();
            let entry = servers
                .entry(server.to_string())
                .or_insert_with(|| ServerAnalytics::new(server));
            entry.last_seen = Some(now);

            // A rotation mark is consumed by the first bytes that follow it.
            if let Some((mono, wall)) = entry.pending_rotation.take() {
                entry.rotation_mark = Some((wall, mono.elapsed().as_secs_f64()));
                changed = true;
            }

            if self.bios_patterns.iter().any(|re| re.is_match(text)) {
                changed |= on_bios_phase(entry, now);
            }

            if OS_UP_PATTERNS.iter().any(|re| re.is_match(text)) {
                changed |= on_os_up(entry, now);
            }

            if let Some(os) = OS_TABLE
                .iter()
                .find(|(re, _)| re.is_match(text))
                .map(|(_, name)| *name)
            {
                if entry.current_os.as_deref() != Some(os) {
                    info!("[{server}] detected OS: {os}");
                    entry.current_os = Some(os.to_string());
                    changed = true;
                }
                if let Some(boot) = entry.current_boot.as_mut() {
                    if boot.detected_os.as_deref() != Some(os) {
                        boot.detected_os = Some(os.to_string());
                        changed = true;
                    }
                }
            }

            if let Some(caps) = HOSTNAME.captures(text) {
                let hostname = caps[1].to_string();
                if entry.hostname.as_deref() != Some(hostname.as_str()) {
                    entry.hostname = Some(hostname);
                    changed = true;
                }
            }

            for caps in LINK_EVENT.captures_iter(text) {
                let Some(boot) = entry.current_boot.as_mut() else { break };
                let interface = caps[1].to_lowercase();
                let up = caps[2].eq_ignore_ascii_case("up");
                let counters = boot.interface_counters.entry(interface.clone()).or_default();
                if up {
                    counters.up += 1;
                } else {
                    counters.down += 1;
                }
                boot.network_events.push(NetworkEvent { interface, up, at: now });
                changed = true;
            }
        }

        if changed {
            self.persist();
        }
    }

    /// Copy of one server's analytics.
    pub fn get(&self, server: &str) -> Option<ServerAnalytics> {
        self.servers.read().unwrap().get(server).cloned()
    }

    /// Copy of the whole map, for the status surface.
    pub fn snapshot(&self) -> HashMap<String, ServerAnalytics> {
        self.servers.read().unwrap().clone()
    }

    /// Atomic rewrite of `analytics.json`. Failures are warnings; the
    /// in-memory state stays authoritative.
    pub fn persist(&self) {
        if let Err(e) = self.try_persist() {
            warn!("analytics persistence failed: {e:#}");
        }
    }

    fn try_persist(&self) -> Result<()> {
        let json = {
            let servers = self.servers.read().unwrap();
            serde_json::to_string_pretty(&*servers).context("serialising analytics")?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json)
            .with_context(|| format!("writing {}", staging.display()))?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("publishing {}", self.path.display()))?;
        Ok(())
    }
}

/// A BIOS-phase marker: archive a stale boot, then open a fresh event
/// unless one is already in progress.
fn on_bios_phase(entry: &mut ServerAnalytics, now: DateTime<Utc>) -> bool {
    if let Some(boot) = entry.current_boot.as_ref() {
        let active_for = (now - boot.start_time).to_std().unwrap_or_default();
        if active_for > BOOT_SUPERSEDE_AGE {
            let boot = entry.current_boot.take().expect("checked above");
            entry.boot_history.push(boot);
            if entry.boot_history.len() > BOOT_HISTORY_CAP {
                entry.boot_history.remove(0);
            }
            entry.os_up_since = None;
        }
    }

    if entry.current_boot.is_none() {
        let mut boot = BootEvent::begin(now);
        if let Some((rotated_at, delay)) = entry.rotation_mark.take() {
            boot.rotation_time = Some(rotated_at);
            boot.power_on_delay_secs = Some(delay);
        }
        entry.current_boot = Some(boot);
        entry.total_reboots += 1;
        info!("[{}] boot #{} detected", entry.name, entry.total_reboots);
        return true;
    }
    false
}

/// An OS-up marker: close the in-flight boot, or just record liveness when
/// the daemon attached to an already-running server.
fn on_os_up(entry: &mut ServerAnalytics, now: DateTime<Utc>) -> bool {
    if let Some(boot) = entry.current_boot.as_mut() {
        if !boot.complete {
            boot.end_time = Some(now);
            boot.boot_duration_secs = Some(
                (now - boot.start_time).to_std().unwrap_or_default().as_secs_f64(),
            );
            boot.complete = true;
            entry.os_up_since = Some(now);
            info!(
                "[{}] boot complete in {:.1}s",
                entry.name,
                boot.boot_duration_secs.unwrap_or_default()
            );
            return true;
        }
    } else if entry.os_up_since.is_none() {
        entry.os_up_since = Some(now);
        return true;
    }
    false
}

// ─── Tests ──────────────────────────────────────────────────────────────────
