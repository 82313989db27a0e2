//! Per-server session supervision.
//!
//! One task per server runs the connect → pump → backoff loop and owns the
//! fan-out of received bytes: BroadcastHub first, then ScreenBuffer, then
//! LogWriter, then Analytics — fixed order, never interleaved for a chunk.
//!
//! The supervisor itself is a name-keyed map of session handles with the
//! lifecycle operations (start/stop/restart), command and subscription
//! entry points, and the staleness health check driven by the daemon tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::console::{Analytics, LogWriter, ScreenBuffer};
use crate::constants::{
    BACKOFF_INITIAL, BACKOFF_MAX, BACKOFF_RESET_UPTIME, HEALTH_STALENESS_THRESHOLD,
};
use crate::hub::broadcast::{BroadcastHub, Subscription};
use crate::ipmi::{SolConfig, SolError, SolTransport};
use crate::redfish;

/// Synthetic clear-screen published when a session (re)connects, so every
/// subscriber's emulator starts from a known state.
const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";

/// Point-in-time view of one supervised session, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub connected: bool,
    pub last_error: Option<String>,
    /// Seconds since the BMC last sent anything, while connected.
    pub last_recv_age_secs: Option<f64>,
}

/// Shared observable state of one session task.
struct SessionState {
    name: String,
    transport: Mutex<Option<Arc<SolTransport>>>,
    last_error: Mutex<Option<String>>,
    screen: Mutex<ScreenBuffer>,
}

impl SessionState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: Mutex::new(None),
            last_error: Mutex::new(None),
            screen: Mutex::new(ScreenBuffer::with_default_capacity()),
        }
    }

    fn transport(&self) -> Option<Arc<SolTransport>> {
        self.transport.lock().unwrap().clone()
    }

    fn set_error(&self, message: Option<String>) {
        *self.last_error.lock().unwrap() = message;
    }
}

struct SessionHandle {
    /// Credentials and address snapshot taken at Start time; Restart and
    /// reconnects use this, never later inventory updates.
    config: SolConfig,
    cancel: CancellationToken,
    state: Arc<SessionState>,
    task: JoinHandle<()>,
}

/// The supervisor: server name → session handle, plus the shared sinks.
pub struct SessionSupervisor {
    log: Arc<LogWriter>,
    analytics: Arc<Analytics>,
    hub: Arc<BroadcastHub>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    inactivity_timeout: Duration,
}

impl SessionSupervisor {
    pub fn new(
        log: Arc<LogWriter>,
        analytics: Arc<Analytics>,
        hub: Arc<BroadcastHub>,
        inactivity_timeout: Duration,
    ) -> Self {
        Self {
            log,
            analytics,
            hub,
            sessions: RwLock::new(HashMap::new()),
            inactivity_timeout,
        }
    }

    /// Start (or replace) the session for `name`. `host` may carry an
    /// explicit `:port`; the RMCP+ default of 623 applies otherwise.
    pub async fn start(&self, name: &str, host: &str, username: &str, password: &str) {
        self.stop(name).await;

        let (host, port) = match host.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                (h.to_string(), p.parse().unwrap_or(623))
            }
            _ => (host.to_string(), 623),
        };
        let config = SolConfig {
            server: name.to_string(),
            host,
            port,
            username: username.to_string(),
            password: password.to_string(),
            inactivity_timeout: self.inactivity_timeout,
        };

        // Courtesy cleanup of orphan BMC-side sessions; fire and forget.
        {
            let (host, user, pass) = (
                config.host.clone(),
                config.username.clone(),
                config.password.clone(),
            );
            let _ = tokio::spawn(async move { redfish::sweep_sessions(&host, &user, &pass).await });
        }

        let cancel = CancellationToken::new();
        let state = Arc::new(SessionState::new(name));
        let task = tokio::spawn(session_task(
            Arc::clone(&self.log),
            Arc::clone(&self.analytics),
            Arc::clone(&self.hub),
            Arc::clone(&state),
            config.clone(),
            cancel.clone(),
        ));

        info!(
            "[{name}] session supervisor started for {}:{}",
            config.host, config.port
        );
        self.sessions.write().unwrap().insert(
            name.to_string(),
            SessionHandle { config, cancel, state, task },
        );
    }

    /// Stop and remove the session for `name`. Returns false when there
    /// was none.
    pub async fn stop(&self, name: &str) -> bool {
        let Some(handle) = self.sessions.write().unwrap().remove(name) else {
            return false;
        };
        info!("[{name}] stopping session");
        handle.cancel.cancel();
        if let Some(transport) = handle.state.transport() {
            transport.close().await;
        }
        let _ = handle.task.await;

        let cfg = handle.config;
        let _ = tokio::spawn(async move {
            redfish::sweep_sessions(&cfg.host, &cfg.username, &cfg.password).await;
        });
        true
    }

    /// Stop then start with the credentials recorded at Start time.
    pub async fn restart(&self, name: &str) -> bool {
        let Some(config) = self
            .sessions
            .read()
            .unwrap()
            .get(name)
            .map(|h| h.config.clone())
        else {
            return false;
        };
        info!("[{name}] restarting session");
        self.start(name, &config.host, &config.username, &config.password)
            .await;
        true
    }

    /// True when the stored credential snapshot for `name` differs from
    /// the given pair (an inventory update changed them).
    pub fn credentials_changed(&self, name: &str, username: &str, password: &str) -> bool {
        self.sessions
            .read()
            .unwrap()
            .get(name)
            .is_some_and(|h| h.config.username != username || h.config.password != password)
    }

    /// True when a session (in any state) exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.sessions.read().unwrap().contains_key(name)
    }

    /// Names of all supervised servers.
    pub fn names(&self) -> Vec<String> {
        self.sessions.read().unwrap().keys().cloned().collect()
    }

    /// Forward console input to the server's SOL session.
    pub async fn send_command(&self, name: &str, bytes: Vec<u8>) -> Result<(), SolError> {
        let transport = self.connected_transport(name)?;
        transport.write(bytes).await
    }

    /// Send a serial break to the server.
    pub async fn send_break(&self, name: &str) -> Result<(), SolError> {
        let transport = self.connected_transport(name)?;
        transport.send_break().await
    }

    fn connected_transport(&self, name: &str) -> Result<Arc<SolTransport>, SolError> {
        let sessions = self.sessions.read().unwrap();
        let handle = sessions
            .get(name)
            .ok_or_else(|| SolError::SubscribeNotFound(name.to_string()))?;
        handle.state.transport().ok_or(SolError::WriteWhileClosed)
    }

    /// Subscribe to the raw console stream. Returns the screen-buffer
    /// catchup (replay it before reading the channel) and the live
    /// subscription. A server without an active transport — unknown, or
    /// registered but mid-backoff — yields `SubscribeNotFound`: the ring
    /// would only hold bytes from the dead connection.
    pub fn subscribe(&self, name: &str) -> Result<(Vec<u8>, Subscription), SolError> {
        let sessions = self.sessions.read().unwrap();
        let handle = sessions
            .get(name)
            .ok_or_else(|| SolError::SubscribeNotFound(name.to_string()))?;
        let live = handle.state.transport().is_some_and(|t| !t.is_closed());
        if !live {
            return Err(SolError::SubscribeNotFound(name.to_string()));
        }
        let catchup = handle.state.screen.lock().unwrap().bytes();
        Ok((catchup, self.hub.subscribe(name)))
    }

    /// Drop one subscription.
    pub fn unsubscribe(&self, name: &str, id: u64) {
        self.hub.unsubscribe(name, id);
    }

    /// Rotate the server's log (subject to the cooldown), mark the
    /// rotation for analytics, and restart the session so the new file
    /// starts with a provably fresh SOL stream.
    pub async fn rotate(&self, name: &str) -> anyhow::Result<()> {
        if !self.log.can_rotate(name) {
            anyhow::bail!("rotation for {name} is cooling down");
        }
        self.log.rotate(name, None)?;
        self.analytics.record_rotation(name);
        self.restart(name).await;
        Ok(())
    }

    /// Status snapshot across all sessions.
    pub fn status(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.read().unwrap();
        let mut out: Vec<SessionStatus> = sessions
            .values()
            .map(|handle| {
                let transport = handle.state.transport();
                SessionStatus {
                    name: handle.state.name.clone(),
                    connected: transport.as_ref().is_some_and(|t| !t.is_closed()),
                    last_error: handle.state.last_error.lock().unwrap().clone(),
                    last_recv_age_secs: transport.map(|t| t.last_recv_age().as_secs_f64()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// One health-check pass: restart every connected session whose last
    /// received datagram is older than the staleness threshold. Catches
    /// dead BMCs whose transport task is wedged enough to miss its own
    /// inactivity timer.
    pub async fn run_health_check(&self) {
        let stale: Vec<(String, Duration)> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .filter_map(|(name, handle)| {
                    let transport = handle.state.transport()?;
                    if transport.is_closed() {
                        return None;
                    }
                    let age = transport.last_recv_age();
                    (age > HEALTH_STALENESS_THRESHOLD).then(|| (name.clone(), age))
                })
                .collect()
        };
        for (name, age) in stale {
            warn!(
                "[{name}] health check: no BMC traffic for {:.0}s (threshold {:.0}s), restarting",
                age.as_secs_f64(),
                HEALTH_STALENESS_THRESHOLD.as_secs_f64()
            );
            self.restart(&name).await;
        }
    }

    /// Stop every session; used at daemon shutdown.
    pub async fn shutdown(&self) {
        for name in self.names() {
            self.stop(&name).await;
        }
    }
}

/// The per-server loop: connect, pump, tear down, back off, repeat.
async fn session_task(
    log: Arc<LogWriter>,
    analytics: Arc<Analytics>,
    hub: Arc<BroadcastHub>,
    state: Arc<SessionState>,
    config: SolConfig,
    cancel: CancellationToken,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let connect_result = tokio::select! {
            () = cancel.cancelled() => break,
            result = SolTransport::connect(&config) => result,
        };
        // Set once a session is actually established; a failed connect
        // attempt, however slowly it failed, never resets the backoff.
        let mut established_at: Option<Instant> = None;
        match connect_result {
            Err(e) => {
                warn!("[{}] connect failed: {e}", config.server);
                state.set_error(Some(e.to_string()));
            }
            Ok(mut transport) => {
                info!("[{}] SOL session established", config.server);
                established_at = Some(Instant::now());
                state.set_error(None);
                let mut output = transport.take_output().expect("fresh transport has output");
                let transport = Arc::new(transport);
                *state.transport.lock().unwrap() = Some(Arc::clone(&transport));

                // Fresh screen for everyone: the ring restarts and current
                // subscribers get a synthetic clear.
                state.screen.lock().unwrap().reset();
                hub.publish(&config.server, CLEAR_SCREEN);

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        chunk = output.recv() => {
                            let Some(chunk) = chunk else { break };
                            fan_out(&log, &analytics, &hub, &state, &config.server, &chunk);
                        }
                    }
                }

                transport.close().await;
                *state.transport.lock().unwrap() = None;
                if let Some(err) = transport.take_error() {
                    warn!("[{}] session ended: {err}", config.server);
                    state.set_error(Some(err.to_string()));
                }
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        if established_at.is_some_and(|at| at.elapsed() >= BACKOFF_RESET_UPTIME) {
            backoff = BACKOFF_INITIAL;
        }
        debug!("[{}] reconnecting in {backoff:?}", config.server);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
    debug!("[{}] session task exited", config.server);
}

/// Deliver one chunk to the four consumers in the fixed order.
fn fan_out(
    log: &LogWriter,
    analytics: &Analytics,
    hub: &BroadcastHub,
    state: &SessionState,
    server: &str,
    chunk: &[u8],
) {
    hub.publish(server, chunk);
    state.screen.lock().unwrap().push(chunk);
    let cleaned = log.write(server, chunk);
    if !cleaned.is_empty() {
        analytics.observe(server, &String::from_utf8_lossy(&cleaned));
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
