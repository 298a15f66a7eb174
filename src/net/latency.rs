//! Per-viewer round-trip sampling
//!
//! One probe is outstanding at a time. Sending a new probe discards the
//! previous one, so a lost probe or pong only costs a sample.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct LatencyTracker {
    samples: VecDeque<Duration>,
    window: usize,
    pending: Option<(u64, Instant)>,
    next_nonce: u64,
    discarded: u64,
}

impl LatencyTracker {
    pub fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window.max(1)),
            window: window.max(1),
            pending: None,
            next_nonce: 1,
            discarded: 0,
        }
    }

    /// Start a probe and return its nonce
    pub fn start_probe(&mut self, now: Instant) -> u64 {
        if self.pending.is_some() {
            self.discarded += 1;
        }
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        self.pending = Some((nonce, now));
        nonce
    }

    /// Match a pong to the outstanding probe and record the sample
    pub fn record_pong(&mut self, nonce: u64, now: Instant) -> Option<Duration> {
        match self.pending {
            Some((expected, sent)) if expected == nonce => {
                self.pending = None;
                let rtt = now.saturating_duration_since(sent);
                if self.samples.len() >= self.window {
                    self.samples.pop_front();
                }
                self.samples.push_back(rtt);
                Some(rtt)
            }
            _ => None,
        }
    }

    /// Rolling average of the recent samples
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: Duration = self.samples.iter().sum();
        Some(sum / self.samples.len() as u32)
    }

    pub fn average_ms(&self) -> Option<f32> {
        self.average().map(|d| d.as_secs_f32() * 1000.0)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Probes dropped without an answer
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(crate::game::constants::replication::RTT_WINDOW)
    }
}
