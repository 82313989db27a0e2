//! Application-wide timing constants.
//!
//! This module centralizes the protocol and supervision timeouts so the
//! relationships between them (keepalive cadence vs inactivity timeout vs
//! health-check staleness) stay visible in one place.

use std::time::Duration;

// ============================================================================
// SOL transport
// ============================================================================

/// UDP "dial" budget: resolving and binding the socket plus the first
/// GetChannelAuthenticationCapabilities exchange.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-step budget for each RMCP+ handshake exchange (open session, RAKP,
/// set privilege).
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for the SOL ActivatePayload exchange.
pub const ACTIVATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for DeactivatePayload. Shorter than activation: the response is
/// advisory and many BMCs simply don't answer for an inactive payload.
pub const DEACTIVATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Budget for a single UDP datagram send.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-pump receive deadline. This is a pump cadence, not a failure
/// threshold: every expiry is an opportunity to check the inactivity clock
/// and the cancellation flag.
pub const READ_DEADLINE: Duration = Duration::from_millis(100);

/// Default SOL inactivity timeout: with no datagram from the BMC for this
/// long the transport declares the session dead and exits.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Lower bound for the keepalive cadence (`inactivity / 3`, clamped).
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Total budget for the deactivate + close-session courtesy messages sent
/// during transport shutdown. Shutdown never blocks past this.
pub const CLOSE_BUDGET: Duration = Duration::from_secs(5);

/// Capacity of the internal queue between the read pump and the byte-stream
/// drainer. Sized for the burst a BIOS redraw produces at boot.
pub const READ_QUEUE_CAPACITY: usize = 10_000;

// ============================================================================
// Supervision
// ============================================================================

/// Initial reconnect backoff after a session failure.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Reconnect backoff ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// A session that survived at least this long resets the backoff to
/// [`BACKOFF_INITIAL`] on its next failure.
pub const BACKOFF_RESET_UPTIME: Duration = Duration::from_secs(30);

/// Cadence of the process-wide session health check.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// A connected session whose last received datagram is older than this is
/// restarted by the health check. Deliberately below the 2 min transport
/// inactivity timeout so a wedged transport task is also caught.
pub const HEALTH_STALENESS_THRESHOLD: Duration = Duration::from_secs(90);

/// Per-subscriber broadcast channel depth.
pub const SUBSCRIBER_BUFFER: usize = 64;

// ============================================================================
// Logs & analytics
// ============================================================================

/// Screen catchup ring capacity per session.
pub const SCREEN_BUFFER_CAPACITY: usize = 64 * 1024;

/// Minimum spacing between caller-requested log rotations for one server.
pub const ROTATION_COOLDOWN: Duration = Duration::from_secs(120);

/// Cadence of the retention sweep over old log files.
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL of the per-server recent-line map used for duplicate suppression.
pub const LINE_DEDUP_TTL: Duration = Duration::from_secs(10);

/// A boot event older than this is archived when a new BIOS phase begins.
pub const BOOT_SUPERSEDE_AGE: Duration = Duration::from_secs(30);

/// Bounded boot history per server.
pub const BOOT_HISTORY_CAP: usize = 10;

// ============================================================================
// Redfish
// ============================================================================

/// Budget for each request of the best-effort Redfish session sweep.
pub const REDFISH_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_fits_inside_inactivity_window() {
        // Three keepalives must fit in one inactivity window, otherwise a
        // healthy but quiet BMC would be declared dead.
        assert!(MIN_KEEPALIVE_INTERVAL * 3 <= DEFAULT_INACTIVITY_TIMEOUT);
    }

    #[test]
    fn test_health_threshold_exceeds_keepalive() {
        assert!(HEALTH_STALENESS_THRESHOLD > MIN_KEEPALIVE_INTERVAL * 2);
    }
}
