//! Per-server fan-out of raw console bytes.
//!
//! Every subscriber gets its own bounded channel. Publishing never blocks:
//! a subscriber that stopped draining loses chunks, not the producer. Dead
//! subscribers (dropped receivers) are pruned during publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::trace;
use tokio::sync::mpsc;

use crate::constants::SUBSCRIBER_BUFFER;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

/// A live subscription to one server's console stream.
pub struct Subscription {
    /// Token for [`BroadcastHub::unsubscribe`].
    pub id: u64,
    /// The byte stream; chunks arrive in publish order.
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// Fan-out hub keyed by server name.
#[derive(Default)]
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber for `server`.
    pub fn subscribe(&self, server: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap()
            .entry(server.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    /// Drop one subscriber.
    pub fn unsubscribe(&self, server: &str, id: u64) {
        let mut map = self.subscribers.lock().unwrap();
        if let Some(subs) = map.get_mut(server) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                map.remove(server);
            }
        }
    }

    /// Fan `bytes` out to every subscriber of `server`. Full channels drop
    /// the chunk; closed channels drop the subscriber.
    pub fn publish(&self, server: &str, bytes: &[u8]) {
        let mut map = self.subscribers.lock().unwrap();
        let Some(subs) = map.get_mut(server) else {
            return;
        };
        subs.retain(|sub| match sub.tx.try_send(bytes.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("[{server}] subscriber {} lagging, chunk dropped", sub.id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subs.is_empty() {
            map.remove(server);
        }
    }

    /// Number of live subscribers for `server`.
    pub fn subscriber_count(&self, server: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(server)
            .map_or(0, Vec::len)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
