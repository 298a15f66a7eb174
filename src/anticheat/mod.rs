//! Inbound input checks: movement budgets and message rate limits

pub mod movement;
pub mod rate_limiter;

pub use movement::{AcceptedMove, MoveContext, MovementRejection, MovementSettings, MovementValidator};
pub use rate_limiter::{RateLimitViolation, RateLimiterManager};
