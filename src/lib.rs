//! Arena Core Server Library
//!
//! Authoritative simulation core for a real-time arena: a per-tick quadtree
//! for proximity queries, pooled high-churn entities, keyframe/diff state
//! replication and server-side movement budgets.
//!
//! # Modules
//!
//! - `game` - world state, spatial index, entity pools and the simulation driver
//! - `anticheat` - movement budget validation and inbound message rate limits
//! - `net` - wire protocol, replication, batching, latency probes and the session runtime
//! - `metrics` - atomic counters with a Prometheus text endpoint

pub mod config;
pub mod util;
pub mod game;
pub mod anticheat;
pub mod net;
pub mod metrics;
