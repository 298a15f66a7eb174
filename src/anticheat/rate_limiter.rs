//! Inbound message rate limiting
//!
//! Counts messages per actor in one-second windows. Over-rate messages are
//! dropped before they reach validation or the tick.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::game::state::EntityId;

/// Violations from rate limiting
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitViolation {
    #[error("message rate exceeded: {0} messages this second")]
    MessageRateExceeded(u32),
}

/// Rate window for a single actor
#[derive(Debug, Clone)]
pub struct ActorRateLimits {
    /// Messages received in the current window
    pub messages_this_second: u32,
    /// When the current window started
    pub window_start: Instant,
    /// Total messages dropped for this actor
    pub dropped: u64,
}

impl ActorRateLimits {
    pub fn new(now: Instant) -> Self {
        Self {
            messages_this_second: 0,
            window_start: now,
            dropped: 0,
        }
    }

    /// Count one message and check it against `limit`
    pub fn check_at(&mut self, now: Instant, limit: u32) -> Result<(), RateLimitViolation> {
        // Reset counter if a new second has started
        if now.saturating_duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.messages_this_second = 0;
        }

        self.messages_this_second = self.messages_this_second.saturating_add(1);
        if self.messages_this_second > limit {
            self.dropped += 1;
            return Err(RateLimitViolation::MessageRateExceeded(self.messages_this_second));
        }
        Ok(())
    }
}

/// Rate limiter for all actors in a session
pub struct RateLimiterManager {
    actors: FxHashMap<EntityId, ActorRateLimits>,
    max_messages_per_second: u32,
}

impl RateLimiterManager {
    pub fn new(max_messages_per_second: u32) -> Self {
        Self {
            actors: FxHashMap::default(),
            max_messages_per_second,
        }
    }

    /// Check one inbound message; the window is created on first use
    pub fn check(&mut self, actor: EntityId) -> Result<(), RateLimitViolation> {
        self.check_at(actor, Instant::now())
    }

    pub fn check_at(&mut self, actor: EntityId, now: Instant) -> Result<(), RateLimitViolation> {
        let limit = self.max_messages_per_second;
        self.actors
            .entry(actor)
            .or_insert_with(|| ActorRateLimits::new(now))
            .check_at(now, limit)
    }

    /// Drop an actor's window (on disconnect)
    pub fn forget(&mut self, actor: EntityId) {
        self.actors.remove(&actor);
    }

    pub fn get(&self, actor: EntityId) -> Option<&ActorRateLimits> {
        self.actors.get(&actor)
    }

    /// Number of tracked actors
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_within_limit() {
        let mut limits = ActorRateLimits::new(Instant::now());
        let now = Instant::now();
        for _ in 0..30 {
            assert!(limits.check_at(now, 30).is_ok());
        }
    }

    #[test]
    fn test_rate_exceeded() {
        let start = Instant::now();
        let mut limits = ActorRateLimits::new(start);

        for i in 1..=11 {
            let result = limits.check_at(start, 10);
            if i <= 10 {
                assert!(result.is_ok());
            } else {
                assert_eq!(result, Err(RateLimitViolation::MessageRateExceeded(11)));
            }
        }
        assert_eq!(limits.dropped, 1);
    }

    #[test]
    fn test_window_resets_after_a_second() {
        let start = Instant::now();
        let mut limits = ActorRateLimits::new(start);
        for _ in 0..5 {
            let _ = limits.check_at(start, 5);
        }
        assert!(limits.check_at(start, 5).is_err());
        assert!(limits.check_at(start + Duration::from_millis(1001), 5).is_ok());
        assert_eq!(limits.messages_this_second, 1);
    }

    #[test]
    fn test_manager_tracks_and_forgets() {
        let mut manager = RateLimiterManager::new(2);
        let now = Instant::now();

        assert!(manager.check_at(1, now).is_ok());
        assert!(manager.check_at(1, now).is_ok());
        assert!(manager.check_at(1, now).is_err());
        // Windows are per actor
        assert!(manager.check_at(2, now).is_ok());
        assert_eq!(manager.len(), 2);

        manager.forget(1);
        assert!(manager.get(1).is_none());
        assert!(manager.check_at(1, now).is_ok());
    }
}
