//! Connected viewers and the outbound side of their streams
//!
//! Every viewer gets an unbounded tokio channel of encoded frames. Sends are
//! fire-and-forget: a viewer whose receiver is gone is simply skipped until
//! the session removes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use crate::game::state::EntityId;
use crate::net::latency::LatencyTracker;

pub type ViewerId = Uuid;

/// One encoded message, shared between all recipients
pub type Frame = Arc<[u8]>;

/// Where replication and batching deliver encoded frames
pub trait ViewerSink: Send + Sync {
    /// Send to every viewer; returns how many accepted the frame
    fn broadcast(&self, frame: Frame) -> usize;

    /// Send to one viewer; false if it is unknown or gone
    fn send_to(&self, viewer: ViewerId, frame: Frame) -> bool;
}

struct ViewerEntry {
    actor: EntityId,
    tx: UnboundedSender<Frame>,
    latency: Mutex<LatencyTracker>,
}

/// Registry of connected viewers
pub struct ViewerRegistry {
    viewers: RwLock<FxHashMap<ViewerId, ViewerEntry>>,
    rtt_window: usize,
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
}

impl ViewerRegistry {
    pub fn new(rtt_window: usize) -> Self {
        Self {
            viewers: RwLock::new(FxHashMap::default()),
            rtt_window,
            bytes_sent: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Add a viewer controlling `actor`; the receiver is the viewer's outbound stream
    pub fn register(&self, actor: EntityId) -> (ViewerId, UnboundedReceiver<Frame>) {
        let (tx, rx) = unbounded_channel();
        let id = Uuid::new_v4();
        self.viewers.write().insert(
            id,
            ViewerEntry {
                actor,
                tx,
                latency: Mutex::new(LatencyTracker::new(self.rtt_window)),
            },
        );
        (id, rx)
    }

    /// Drop a viewer and its latency state; returns its actor
    pub fn remove(&self, viewer: ViewerId) -> Option<EntityId> {
        self.viewers.write().remove(&viewer).map(|entry| entry.actor)
    }

    pub fn actor_of(&self, viewer: ViewerId) -> Option<EntityId> {
        self.viewers.read().get(&viewer).map(|entry| entry.actor)
    }

    pub fn contains(&self, viewer: ViewerId) -> bool {
        self.viewers.read().contains_key(&viewer)
    }

    pub fn ids(&self) -> Vec<ViewerId> {
        self.viewers.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.viewers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.read().is_empty()
    }

    /// Start a latency probe for every viewer
    pub fn start_probes(&self, now: Instant) -> Vec<(ViewerId, u64)> {
        self.viewers
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.latency.lock().start_probe(now)))
            .collect()
    }

    pub fn record_pong(&self, viewer: ViewerId, nonce: u64, now: Instant) -> Option<Duration> {
        let viewers = self.viewers.read();
        let rtt = viewers.get(&viewer)?.latency.lock().record_pong(nonce, now);
        if let Some(rtt) = rtt {
            debug!("viewer {} rtt {:?}", viewer, rtt);
        }
        rtt
    }

    /// Rolling average round trip in milliseconds
    pub fn average_rtt_ms(&self, viewer: ViewerId) -> Option<f32> {
        self.viewers.read().get(&viewer)?.latency.lock().average_ms()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    fn account(&self, frame: &Frame) {
        self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}

impl ViewerSink for ViewerRegistry {
    fn broadcast(&self, frame: Frame) -> usize {
        let viewers = self.viewers.read();
        let mut delivered = 0;
        for (id, entry) in viewers.iter() {
            if entry.tx.send(Arc::clone(&frame)).is_ok() {
                self.account(&frame);
                delivered += 1;
            } else {
                debug!("viewer {} stream closed, skipping", id);
            }
        }
        delivered
    }

    fn send_to(&self, viewer: ViewerId, frame: Frame) -> bool {
        let viewers = self.viewers.read();
        let Some(entry) = viewers.get(&viewer) else {
            return false;
        };
        let sent = entry.tx.send(Arc::clone(&frame)).is_ok();
        if sent {
            self.account(&frame);
        }
        sent
    }
}
