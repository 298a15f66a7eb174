use std::str::FromStr;
use std::time::Duration;

use crate::game::constants::{arena, movement, pool, replication, spatial, tick};
use crate::net::protocol::WireFormat;

/// Configuration rejected by `ServerConfig::validate`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("tick_rate must be between 1 and 1000, got {0}")]
    TickRate(u32),
    #[error("arena dimensions must be positive and finite, got {width}x{height}")]
    ArenaSize { width: f32, height: f32 },
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
    #[error("{field} must be positive and finite, got {value}")]
    NotPositive { field: &'static str, value: f32 },
}

/// Quadtree shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialConfig {
    /// Records a node holds before it subdivides
    pub node_capacity: usize,
    /// Depth at which nodes stop subdividing
    pub max_depth: u8,
    /// Rebuild on a dedicated worker thread instead of inline on the tick
    pub offload_rebuild: bool,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            node_capacity: spatial::NODE_CAPACITY,
            max_depth: spatial::MAX_DEPTH,
            offload_rebuild: false,
        }
    }
}

/// Population caps and retention for pooled kinds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    pub projectile_cap: usize,
    pub particle_cap: usize,
    pub area_effect_cap: usize,
    pub burst_cap: usize,
    /// Released instances kept per pool
    pub max_retained: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            projectile_cap: pool::PROJECTILE_CAP,
            particle_cap: pool::PARTICLE_CAP,
            area_effect_cap: pool::AREA_EFFECT_CAP,
            burst_cap: pool::BURST_CAP,
            max_retained: pool::MAX_RETAINED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplicationConfig {
    /// Full snapshot every N emissions
    pub keyframe_interval: u32,
    /// Whether unchanged ticks may skip the diff entirely
    pub idle_fast_path: bool,
    /// Entities sampled per high-churn kind by the idle check
    pub idle_sample_width: usize,
    pub idle_move_epsilon: f32,
    pub batch_flush_ms: u64,
    pub ping_interval_ms: u64,
    pub rtt_window: usize,
    /// Encoding used for every outbound and inbound message
    pub wire_format: WireFormat,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            keyframe_interval: replication::KEYFRAME_INTERVAL,
            idle_fast_path: true,
            idle_sample_width: replication::IDLE_SAMPLE_WIDTH,
            idle_move_epsilon: replication::IDLE_MOVE_EPSILON,
            batch_flush_ms: replication::BATCH_FLUSH_MS,
            ping_interval_ms: replication::PING_INTERVAL_MS,
            rtt_window: replication::RTT_WINDOW,
            wire_format: WireFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementConfig {
    pub base_speed_per_tick: f32,
    pub buffer_seconds: f32,
    pub tolerance: f32,
    pub fixed_allowance: f32,
    pub max_speed_multiplier: f32,
    pub budget_floor: f32,
    pub max_messages_per_second: u32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            base_speed_per_tick: movement::BASE_SPEED_PER_TICK,
            buffer_seconds: movement::BUFFER_SECONDS,
            tolerance: movement::TOLERANCE,
            fixed_allowance: movement::FIXED_ALLOWANCE,
            max_speed_multiplier: movement::MAX_SPEED_MULTIPLIER,
            budget_floor: movement::BUDGET_FLOOR,
            max_messages_per_second: movement::MAX_MESSAGES_PER_SECOND,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    pub arena_width: f32,
    pub arena_height: f32,
    /// Hostiles seeded into the arena at startup
    pub hostile_count: usize,
    /// Port for the Prometheus text endpoint (disabled when unset)
    pub metrics_port: Option<u16>,
    pub spatial: SpatialConfig,
    pub pools: PoolConfig,
    pub replication: ReplicationConfig,
    pub movement: MovementConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: tick::RATE,
            arena_width: arena::WIDTH,
            arena_height: arena::HEIGHT,
            hostile_count: 50,
            metrics_port: None,
            spatial: SpatialConfig::default(),
            pools: PoolConfig::default(),
            replication: ReplicationConfig::default(),
            movement: MovementConfig::default(),
        }
    }
}

/// Parse `name` from the environment, keeping `current` when unset or invalid
fn env_or<T>(name: &str, current: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr,
{
    let Ok(raw) = std::env::var(name) else {
        return current;
    };
    match raw.parse::<T>() {
        Ok(parsed) if valid(&parsed) => parsed,
        Ok(_) => {
            tracing::warn!("{} '{}' out of range, using default", name, raw);
            current
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            current
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        config.tick_rate = env_or("TICK_RATE", config.tick_rate, |v| (1..=1000).contains(v));
        config.arena_width = env_or("ARENA_WIDTH", config.arena_width, |v| v.is_finite() && *v > 0.0);
        config.arena_height =
            env_or("ARENA_HEIGHT", config.arena_height, |v| v.is_finite() && *v > 0.0);
        config.hostile_count = env_or("HOSTILE_COUNT", config.hostile_count, |v| *v <= 10_000);

        if let Ok(port) = std::env::var("METRICS_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) if parsed > 0 => config.metrics_port = Some(parsed),
                _ => tracing::warn!("Invalid METRICS_PORT '{}', metrics endpoint disabled", port),
            }
        }

        config.spatial.node_capacity =
            env_or("SPATIAL_NODE_CAPACITY", config.spatial.node_capacity, |v| *v > 0);
        config.spatial.max_depth = env_or("SPATIAL_MAX_DEPTH", config.spatial.max_depth, |v| *v <= 16);
        config.spatial.offload_rebuild =
            env_or("SPATIAL_OFFLOAD_REBUILD", config.spatial.offload_rebuild, |_| true);

        config.pools.projectile_cap =
            env_or("PROJECTILE_CAP", config.pools.projectile_cap, |v| *v > 0);
        config.pools.particle_cap = env_or("PARTICLE_CAP", config.pools.particle_cap, |v| *v > 0);

        let r = &mut config.replication;
        r.keyframe_interval = env_or("KEYFRAME_INTERVAL", r.keyframe_interval, |v| *v > 0);
        r.idle_fast_path = env_or("IDLE_FAST_PATH", r.idle_fast_path, |_| true);
        r.idle_sample_width = env_or("IDLE_SAMPLE_WIDTH", r.idle_sample_width, |_| true);
        r.batch_flush_ms = env_or("BATCH_FLUSH_MS", r.batch_flush_ms, |v| *v > 0);
        r.ping_interval_ms = env_or("PING_INTERVAL_MS", r.ping_interval_ms, |v| *v > 0);
        r.wire_format = env_or("WIRE_FORMAT", r.wire_format, |_| true);

        let m = &mut config.movement;
        m.base_speed_per_tick =
            env_or("BASE_SPEED_PER_TICK", m.base_speed_per_tick, |v| v.is_finite() && *v > 0.0);
        m.buffer_seconds = env_or("BUFFER_SECONDS", m.buffer_seconds, |v| v.is_finite() && *v > 0.0);
        m.max_messages_per_second =
            env_or("MAX_MESSAGES_PER_SECOND", m.max_messages_per_second, |v| *v > 0);

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ConfigError::TickRate(self.tick_rate));
        }
        let dims_ok = |v: f32| v.is_finite() && v > 0.0;
        if !dims_ok(self.arena_width) || !dims_ok(self.arena_height) {
            return Err(ConfigError::ArenaSize {
                width: self.arena_width,
                height: self.arena_height,
            });
        }
        if self.spatial.node_capacity == 0 {
            return Err(ConfigError::Zero { field: "spatial.node_capacity" });
        }
        if self.replication.keyframe_interval == 0 {
            return Err(ConfigError::Zero { field: "replication.keyframe_interval" });
        }
        if self.replication.rtt_window == 0 {
            return Err(ConfigError::Zero { field: "replication.rtt_window" });
        }
        for (field, value) in [
            ("movement.base_speed_per_tick", self.movement.base_speed_per_tick),
            ("movement.buffer_seconds", self.movement.buffer_seconds),
            ("movement.tolerance", self.movement.tolerance),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::NotPositive { field, value });
            }
        }
        Ok(())
    }

    /// Tick interval, never shorter than the configured floor
    pub fn tick_interval(&self) -> Duration {
        let ms = 1000 / u64::from(self.tick_rate.max(1));
        Duration::from_millis(ms.max(tick::MIN_INTERVAL_MS))
    }

    /// Tick interval in (fractional) milliseconds, as used by movement accrual
    pub fn tick_interval_ms(&self) -> f32 {
        (1000.0 / self.tick_rate.max(1) as f32).max(tick::MIN_INTERVAL_MS as f32)
    }
}
