//! Server-side movement budget
//!
//! Each actor accrues movement allowance with wall-clock time, capped at a few
//! seconds' worth, and spends it on the Euclidean length of every accepted
//! move. A claim that outruns the budget is rejected without debiting, and
//! the caller sends the actor back to its last accepted position.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::config::{MovementConfig, ServerConfig};
use crate::game::spatial::Rect;
use crate::game::state::EntityId;
use crate::util::vec2::Vec2;

/// Why a movement claim was rejected. Every variant carries the position the
/// actor must be corrected to.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MovementRejection {
    #[error("moved {distance:.1} units with {allowed:.1} allowed")]
    TooFar {
        distance: f32,
        allowed: f32,
        correction: Vec2,
    },
    #[error("NaN or Infinity in claimed position")]
    NonFinite { correction: Vec2 },
    #[error("claimed position ({x:.1}, {y:.1}) is outside the arena")]
    OutOfBounds { x: f32, y: f32, correction: Vec2 },
}

impl MovementRejection {
    /// Last accepted position to send back to the actor
    pub fn correction(&self) -> Vec2 {
        match self {
            MovementRejection::TooFar { correction, .. }
            | MovementRejection::NonFinite { correction }
            | MovementRejection::OutOfBounds { correction, .. } => *correction,
        }
    }
}

/// A move that passed validation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptedMove {
    pub from: Vec2,
    pub to: Vec2,
    pub distance: f32,
    pub budget_remaining: f32,
}

/// Per-call context supplied by the driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveContext {
    /// Actor's current speed multiplier (buffs/debuffs)
    pub speed_multiplier: f32,
    /// Authoritative position, used to seed a budget on first contact
    pub current_position: Vec2,
}

/// Derived constants for budget arithmetic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementSettings {
    pub config: MovementConfig,
    pub tick_interval_ms: f32,
    pub bounds: Rect,
}

impl MovementSettings {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            config: config.movement,
            tick_interval_ms: config.tick_interval_ms(),
            bounds: Rect::from_size(config.arena_width, config.arena_height),
        }
    }

    /// Effective tick rate after the interval floor; accrual and cap both use it
    pub fn ticks_per_second(&self) -> f32 {
        1000.0 / self.tick_interval_ms
    }

    /// Upper bound of a budget
    pub fn cap(&self) -> f32 {
        self.config.base_speed_per_tick * self.ticks_per_second() * self.config.buffer_seconds
    }

    /// One second of movement at 1x, the allowance a new budget starts with
    pub fn initial_budget(&self) -> f32 {
        let one_second =
            self.config.base_speed_per_tick * self.ticks_per_second() * self.config.tolerance;
        one_second.min(self.cap())
    }

    /// Non-finite multipliers count as 1; the rest are clamped to the allowed range
    pub fn clamp_multiplier(&self, multiplier: f32) -> f32 {
        if multiplier.is_finite() {
            multiplier.clamp(0.0, self.config.max_speed_multiplier)
        } else {
            1.0
        }
    }
}

/// One actor's movement allowance
#[derive(Debug, Clone, PartialEq)]
pub struct MovementBudget {
    /// Unspent allowance in world units
    pub budget: f32,
    pub last_update: Instant,
    pub last_position: Vec2,
}

impl MovementBudget {
    pub fn new(position: Vec2, budget: f32, now: Instant) -> Self {
        Self {
            budget,
            last_update: now,
            last_position: position,
        }
    }

    /// Add allowance for the time since the last update
    pub fn accrue(&mut self, now: Instant, multiplier: f32, settings: &MovementSettings) {
        let elapsed_ms = now.saturating_duration_since(self.last_update).as_secs_f32() * 1000.0;
        let accrued = elapsed_ms / settings.tick_interval_ms
            * settings.config.base_speed_per_tick
            * settings.clamp_multiplier(multiplier)
            * settings.config.tolerance;
        self.budget = (self.budget + accrued).min(settings.cap());
        if now > self.last_update {
            self.last_update = now;
        }
    }

    fn check(
        &mut self,
        claimed: Vec2,
        settings: &MovementSettings,
    ) -> Result<AcceptedMove, MovementRejection> {
        let correction = self.last_position;
        if !claimed.is_finite() {
            return Err(MovementRejection::NonFinite { correction });
        }
        if !settings.bounds.contains(claimed) {
            return Err(MovementRejection::OutOfBounds {
                x: claimed.x,
                y: claimed.y,
                correction,
            });
        }

        let distance = self.last_position.distance_to(claimed);
        let allowed = self.budget + settings.config.fixed_allowance;
        if distance > allowed {
            return Err(MovementRejection::TooFar {
                distance,
                allowed,
                correction,
            });
        }

        self.budget = (self.budget - distance).max(settings.config.budget_floor);
        let from = self.last_position;
        self.last_position = claimed;
        Ok(AcceptedMove {
            from,
            to: claimed,
            distance,
            budget_remaining: self.budget,
        })
    }
}

/// Validates client-claimed positions against per-actor budgets.
///
/// The map lock is only held to find or create an actor's entry; the budget
/// itself sits behind its own mutex so actors never contend with each other.
pub struct MovementValidator {
    settings: MovementSettings,
    budgets: RwLock<FxHashMap<EntityId, Arc<Mutex<MovementBudget>>>>,
}

impl MovementValidator {
    pub fn new(settings: MovementSettings) -> Self {
        Self {
            settings,
            budgets: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn settings(&self) -> &MovementSettings {
        &self.settings
    }

    pub fn validate(
        &self,
        actor: EntityId,
        claimed: Vec2,
        context: MoveContext,
    ) -> Result<AcceptedMove, MovementRejection> {
        self.validate_at(actor, claimed, context, Instant::now())
    }

    /// `validate` with an explicit clock
    pub fn validate_at(
        &self,
        actor: EntityId,
        claimed: Vec2,
        context: MoveContext,
        now: Instant,
    ) -> Result<AcceptedMove, MovementRejection> {
        let entry = self.entry(actor, context.current_position, now);
        let mut budget = entry.lock();
        budget.accrue(now, context.speed_multiplier, &self.settings);

        let result = budget.check(claimed, &self.settings);
        match &result {
            Ok(accepted) => debug!(
                "actor #{} moved {:.1} units, {:.1} left",
                actor, accepted.distance, accepted.budget_remaining
            ),
            Err(rejection) => warn!("actor #{} movement rejected: {}", actor, rejection),
        }
        result
    }

    fn entry(&self, actor: EntityId, seed: Vec2, now: Instant) -> Arc<Mutex<MovementBudget>> {
        if let Some(entry) = self.budgets.read().get(&actor) {
            return Arc::clone(entry);
        }
        let initial = self.settings.initial_budget();
        let mut budgets = self.budgets.write();
        Arc::clone(
            budgets
                .entry(actor)
                .or_insert_with(|| Arc::new(Mutex::new(MovementBudget::new(seed, initial, now)))),
        )
    }

    /// Drop an actor's budget (on disconnect)
    pub fn forget(&self, actor: EntityId) {
        self.budgets.write().remove(&actor);
    }

    /// Restart an actor's budget at `position` (on respawn or teleport)
    pub fn reset(&self, actor: EntityId, position: Vec2) {
        self.reset_at(actor, position, Instant::now());
    }

    pub fn reset_at(&self, actor: EntityId, position: Vec2, now: Instant) {
        let fresh = MovementBudget::new(position, self.settings.initial_budget(), now);
        self.budgets.write().insert(actor, Arc::new(Mutex::new(fresh)));
    }

    /// Current unspent allowance
    pub fn budget(&self, actor: EntityId) -> Option<f32> {
        self.budgets.read().get(&actor).map(|b| b.lock().budget)
    }

    pub fn last_position(&self, actor: EntityId) -> Option<Vec2> {
        self.budgets.read().get(&actor).map(|b| b.lock().last_position)
    }

    /// Number of tracked actors
    pub fn len(&self) -> usize {
        self.budgets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.budgets.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn settings() -> MovementSettings {
        MovementSettings::from_server_config(&ServerConfig::default())
    }

    fn context(x: f32, y: f32) -> MoveContext {
        MoveContext {
            speed_multiplier: 1.0,
            current_position: Vec2::new(x, y),
        }
    }

    #[test]
    fn test_one_second_accrual() {
        let settings = settings();
        let start = Instant::now();
        let mut budget = MovementBudget::new(Vec2::ZERO, 0.0, start);

        budget.accrue(start + Duration::from_millis(1000), 1.0, &settings);

        // 5 units/tick at 60 ticks/s with 10% tolerance
        let expected = 5.0 * 60.0 * 1.1;
        assert!((budget.budget - expected).abs() < 1.0, "budget was {}", budget.budget);
    }

    #[test]
    fn test_teleport_rejected_small_move_accepted() {
        let validator = MovementValidator::new(settings());
        let start = Instant::now();
        let ctx = context(100.0, 100.0);

        let rejected = validator
            .validate_at(1, Vec2::new(2900.0, 1100.0), ctx, start + Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(rejected, MovementRejection::TooFar { .. }));
        assert_eq!(rejected.correction(), Vec2::new(100.0, 100.0));

        let accepted = validator
            .validate_at(1, Vec2::new(110.0, 100.0), ctx, start + Duration::from_secs(1))
            .unwrap();
        assert!((accepted.distance - 10.0).abs() < 1e-4);
        assert_eq!(validator.last_position(1), Some(Vec2::new(110.0, 100.0)));
    }

    #[test]
    fn test_rejection_does_not_debit() {
        let validator = MovementValidator::new(settings());
        let now = Instant::now();
        let ctx = context(100.0, 100.0);

        validator.validate_at(1, Vec2::new(100.0, 100.0), ctx, now).unwrap();
        let before = validator.budget(1).unwrap();
        assert!(validator.validate_at(1, Vec2::new(1500.0, 100.0), ctx, now).is_err());
        assert_eq!(validator.budget(1), Some(before));
    }

    #[test]
    fn test_budget_capped() {
        let settings = settings();
        let start = Instant::now();
        let mut budget = MovementBudget::new(Vec2::ZERO, 0.0, start);
        budget.accrue(start + Duration::from_secs(60), 3.0, &settings);
        assert_eq!(budget.budget, settings.cap());
        assert_eq!(settings.cap(), 5.0 * 60.0 * 3.0);
    }

    #[test]
    fn test_cap_follows_floored_tick_rate() {
        let config = ServerConfig {
            tick_rate: 500,
            ..ServerConfig::default()
        };
        let settings = MovementSettings::from_server_config(&config);
        // 500 Hz is floored to a 5 ms interval, i.e. 200 ticks/s
        assert_eq!(settings.tick_interval_ms, 5.0);
        assert!((settings.cap() - 5.0 * 200.0 * 3.0).abs() < 1e-2);

        // Accrual for exactly `buffer_seconds` at 1x without tolerance reaches the cap
        let start = Instant::now();
        let mut budget = MovementBudget::new(Vec2::ZERO, 0.0, start);
        let mut exact = settings;
        exact.config.tolerance = 1.0;
        budget.accrue(start + Duration::from_secs(3), 1.0, &exact);
        assert!((budget.budget - exact.cap()).abs() < 1e-1, "budget was {}", budget.budget);
    }

    #[test]
    fn test_multiplier_clamping() {
        let settings = settings();
        assert_eq!(settings.clamp_multiplier(f32::NAN), 1.0);
        assert_eq!(settings.clamp_multiplier(f32::INFINITY), 1.0);
        assert_eq!(settings.clamp_multiplier(50.0), 3.0);
        assert_eq!(settings.clamp_multiplier(-2.0), 0.0);
    }

    #[test]
    fn test_invalid_claims_rejected() {
        let validator = MovementValidator::new(settings());
        let ctx = context(10.0, 10.0);

        let err = validator.validate(1, Vec2::new(f32::NAN, 10.0), ctx).unwrap_err();
        assert_eq!(err, MovementRejection::NonFinite { correction: Vec2::new(10.0, 10.0) });

        let err = validator.validate(1, Vec2::new(-5.0, 10.0), ctx).unwrap_err();
        assert!(matches!(err, MovementRejection::OutOfBounds { .. }));
    }

    #[test]
    fn test_forget_and_reset() {
        let validator = MovementValidator::new(settings());
        let now = Instant::now();
        validator.validate_at(7, Vec2::new(10.0, 10.0), context(10.0, 10.0), now).unwrap();
        assert_eq!(validator.len(), 1);

        validator.reset_at(7, Vec2::new(2000.0, 1000.0), now);
        assert_eq!(validator.last_position(7), Some(Vec2::new(2000.0, 1000.0)));
        // Teleport target is now the reference point
        assert!(validator
            .validate_at(7, Vec2::new(2005.0, 1000.0), context(0.0, 0.0), now)
            .is_ok());

        validator.forget(7);
        assert!(validator.is_empty());
        assert_eq!(validator.budget(7), None);
    }

    #[test]
    fn test_actors_validated_from_many_threads() {
        let validator = Arc::new(MovementValidator::new(settings()));
        let handles: Vec<_> = (0..4u32)
            .map(|actor| {
                let validator = Arc::clone(&validator);
                std::thread::spawn(move || {
                    let start = Vec2::new(100.0 + actor as f32 * 100.0, 100.0);
                    for step in 1..=20 {
                        let claimed = Vec2::new(start.x, 100.0 + step as f32);
                        let ctx = MoveContext { speed_multiplier: 1.0, current_position: start };
                        assert!(validator.validate(actor, claimed, ctx).is_ok());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(validator.len(), 4);
    }

    proptest! {
        #[test]
        fn prop_budget_stays_bounded(
            steps in proptest::collection::vec(
                (0u64..5000, -400.0f32..400.0, -400.0f32..400.0, -2.0f32..6.0),
                1..60,
            )
        ) {
            let settings = settings();
            let validator = MovementValidator::new(settings);
            let start = Instant::now();
            let mut now = start;
            let mut pos = Vec2::new(1500.0, 1000.0);

            for (elapsed, dx, dy, mult) in steps {
                now += Duration::from_millis(elapsed);
                let claimed = Vec2::new(pos.x + dx, pos.y + dy);
                let ctx = MoveContext { speed_multiplier: mult, current_position: pos };
                if let Ok(accepted) = validator.validate_at(1, claimed, ctx, now) {
                    pos = accepted.to;
                }
                let budget = validator.budget(1).unwrap();
                prop_assert!(budget >= settings.config.budget_floor);
                prop_assert!(budget <= settings.cap());
            }
        }
    }
}
