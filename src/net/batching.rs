//! Per-viewer batching of non-urgent notifications
//!
//! Events are queued per viewer and flushed together as one `{ events }`
//! message on a short fixed interval. Each queue has its own mutex so a flush
//! never blocks enqueues for other viewers.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::net::protocol::{EventBatch, GameEvent, ServerMessage, WireFormat};
use crate::net::viewers::{Frame, ViewerId, ViewerSink};

type Queue = Arc<Mutex<Vec<GameEvent>>>;

/// Outcome of one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub batches: usize,
    pub events: usize,
    pub bytes: usize,
}

pub struct EventBatcher {
    queues: RwLock<FxHashMap<ViewerId, Queue>>,
    format: WireFormat,
}

impl EventBatcher {
    pub fn new(format: WireFormat) -> Self {
        Self {
            queues: RwLock::new(FxHashMap::default()),
            format,
        }
    }

    pub fn register(&self, viewer: ViewerId) {
        self.queues.write().entry(viewer).or_default();
    }

    /// Drop a viewer's queue along with anything still pending
    pub fn remove(&self, viewer: ViewerId) -> usize {
        self.queues
            .write()
            .remove(&viewer)
            .map_or(0, |queue| queue.lock().len())
    }

    /// Queue an event for one viewer; false if the viewer is unknown
    pub fn enqueue(&self, viewer: ViewerId, event: GameEvent) -> bool {
        let Some(queue) = self.queue(viewer) else {
            return false;
        };
        queue.lock().push(event);
        true
    }

    /// Queue events for every registered viewer
    pub fn enqueue_all(&self, events: &[GameEvent]) {
        if events.is_empty() {
            return;
        }
        for queue in self.queues.read().values() {
            queue.lock().extend_from_slice(events);
        }
    }

    pub fn pending(&self, viewer: ViewerId) -> usize {
        self.queue(viewer).map_or(0, |queue| queue.lock().len())
    }

    /// Send every non-empty queue as a single batch message
    pub fn flush(&self, sink: &dyn ViewerSink) -> FlushStats {
        let queues: Vec<(ViewerId, Queue)> = self
            .queues
            .read()
            .iter()
            .map(|(id, queue)| (*id, Arc::clone(queue)))
            .collect();

        let mut stats = FlushStats::default();
        for (viewer, queue) in queues {
            let events = std::mem::take(&mut *queue.lock());
            if events.is_empty() {
                continue;
            }
            let count = events.len();
            let batch = EventBatch { events };
            match self.format.encode(&ServerMessage::Batch(&batch)) {
                Ok(bytes) => {
                    let len = bytes.len();
                    if sink.send_to(viewer, Frame::from(bytes)) {
                        stats.batches += 1;
                        stats.events += count;
                        stats.bytes += len;
                    }
                }
                Err(e) => warn!("Failed to encode batch for viewer {}: {}", viewer, e),
            }
        }
        stats
    }

    fn queue(&self, viewer: ViewerId) -> Option<Queue> {
        self.queues.read().get(&viewer).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::viewers::ViewerRegistry;

    #[test]
    fn test_flush_sends_one_message_per_viewer() {
        let registry = ViewerRegistry::new(10);
        let batcher = EventBatcher::new(WireFormat::Json);
        let (viewer, mut rx) = registry.register(1);
        batcher.register(viewer);

        batcher.enqueue(viewer, GameEvent::WaveStarted { wave: 1 });
        batcher.enqueue(viewer, GameEvent::ActorDown { actor_id: 1 });
        assert_eq!(batcher.pending(viewer), 2);

        let stats = batcher.flush(&registry);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.events, 2);
        assert_eq!(batcher.pending(viewer), 0);

        let frame = rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(json["events"].as_array().unwrap().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_queues_send_nothing() {
        let registry = ViewerRegistry::new(10);
        let batcher = EventBatcher::new(WireFormat::Json);
        let (viewer, mut rx) = registry.register(1);
        batcher.register(viewer);

        assert_eq!(batcher.flush(&registry), FlushStats::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_enqueue_all_and_remove() {
        let batcher = EventBatcher::new(WireFormat::Binary);
        let a = ViewerId::new_v4();
        let b = ViewerId::new_v4();
        batcher.register(a);
        batcher.register(b);

        batcher.enqueue_all(&[GameEvent::WaveStarted { wave: 3 }]);
        assert_eq!(batcher.pending(a), 1);
        assert_eq!(batcher.pending(b), 1);

        assert_eq!(batcher.remove(a), 1);
        assert!(!batcher.enqueue(a, GameEvent::WaveStarted { wave: 4 }));
        assert_eq!(batcher.pending(a), 0);
    }

    #[test]
    fn test_concurrent_enqueue_and_flush() {
        let registry = Arc::new(ViewerRegistry::new(10));
        let batcher = Arc::new(EventBatcher::new(WireFormat::Json));
        let (viewer, mut rx) = registry.register(1);
        batcher.register(viewer);

        let producer = {
            let batcher = Arc::clone(&batcher);
            std::thread::spawn(move || {
                for wave in 0..500 {
                    batcher.enqueue(viewer, GameEvent::WaveStarted { wave });
                }
            })
        };
        let mut flushed = 0;
        while !producer.is_finished() {
            flushed += batcher.flush(registry.as_ref()).events;
        }
        producer.join().unwrap();
        flushed += batcher.flush(registry.as_ref()).events;
        assert_eq!(flushed, 500);

        let mut received = 0;
        while let Ok(frame) = rx.try_recv() {
            let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();
            received += json["events"].as_array().unwrap().len();
        }
        assert_eq!(received, 500);
    }
}
