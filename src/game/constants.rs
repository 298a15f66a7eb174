//! Tunable defaults for the simulation core.
//!
//! Everything here is a default only: `ServerConfig` can override the values
//! that matter operationally through environment variables.

/// Tick timing
pub mod tick {
    /// Simulation tick rate in Hz
    pub const RATE: u32 = 60;
    /// Floor for the tick interval in milliseconds (caps runaway CPU at ~200 Hz)
    pub const MIN_INTERVAL_MS: u64 = 5;
    /// Seconds between periodic performance log lines
    pub const STATS_LOG_INTERVAL_SECS: u64 = 30;
}

/// Arena geometry
pub mod arena {
    /// Default arena width in world units
    pub const WIDTH: f32 = 3000.0;
    /// Default arena height in world units
    pub const HEIGHT: f32 = 2000.0;
}

/// Quadtree shape
pub mod spatial {
    /// Records a node holds before it subdivides
    pub const NODE_CAPACITY: usize = 8;
    /// Maximum subdivision depth; nodes at this depth never split
    pub const MAX_DEPTH: u8 = 8;
}

/// Entity sizes and speeds for the reference driver
pub mod entity {
    /// Actor collision radius
    pub const ACTOR_RADIUS: f32 = 20.0;
    /// Actor starting health
    pub const ACTOR_HEALTH: f32 = 100.0;
    /// Default hostile radius
    pub const HOSTILE_RADIUS: f32 = 18.0;
    /// Boss radius (largest entity in the arena)
    pub const BOSS_RADIUS: f32 = 90.0;
    /// Default hostile speed in world units per tick
    pub const HOSTILE_SPEED: f32 = 2.0;
    /// Projectile radius
    pub const PROJECTILE_RADIUS: f32 = 5.0;
    /// Projectile lifetime in seconds
    pub const PROJECTILE_LIFETIME: f32 = 2.0;
    /// Particle lifetime in seconds
    pub const PARTICLE_LIFETIME: f32 = 0.6;
    /// Ephemeral burst lifetime in seconds
    pub const BURST_LIFETIME: f32 = 0.25;
    /// Hostile search radius for closest-target queries
    pub const HOSTILE_SIGHT_RADIUS: f32 = 800.0;
}

/// Combat tuning for the reference driver
pub mod combat {
    /// Hostile health at wave 1
    pub const HOSTILE_HEALTH: f32 = 30.0;
    /// Extra hostile health per wave
    pub const HOSTILE_HEALTH_PER_WAVE: f32 = 5.0;
    /// Boss health multiplier over a regular hostile
    pub const BOSS_HEALTH_MULTIPLIER: f32 = 40.0;
    /// A boss joins every Nth wave
    pub const BOSS_WAVE_INTERVAL: u32 = 5;
    /// Damage per second a hostile deals while touching an actor
    pub const CONTACT_DAMAGE_PER_SECOND: f32 = 20.0;
    /// Seconds between actor auto-fire shots
    pub const ACTOR_FIRE_INTERVAL: f32 = 0.35;
    /// Seconds between boss shots
    pub const BOSS_FIRE_INTERVAL: f32 = 1.5;
    /// Auto-aim reach for actors
    pub const FIRE_RANGE: f32 = 600.0;
    /// Projectile speed in world units per second
    pub const PROJECTILE_SPEED: f32 = 600.0;
    pub const PROJECTILE_DAMAGE: f32 = 10.0;
    /// Every Nth kill by an actor leaves an area effect where the hostile fell
    pub const AREA_KILL_EVERY: u32 = 8;
    pub const AREA_EFFECT_RADIUS: f32 = 80.0;
    pub const AREA_EFFECT_DPS: f32 = 15.0;
    pub const AREA_EFFECT_LIFETIME: f32 = 3.0;
    /// Radius of the impact burst
    pub const BURST_RADIUS: f32 = 24.0;
    /// Particles spawned per impact when cosmetics are enabled
    pub const PARTICLES_PER_HIT: usize = 4;
    pub const PARTICLE_SPEED: f32 = 120.0;
    /// Radius of a dropped pickup
    pub const PICKUP_RADIUS: f32 = 10.0;
    /// Score value of a regular hostile's pickup
    pub const PICKUP_VALUE: u32 = 1;
}

/// Pool sizing
pub mod pool {
    /// Population cap for projectiles
    pub const PROJECTILE_CAP: usize = 512;
    /// Population cap for particles
    pub const PARTICLE_CAP: usize = 1024;
    /// Population cap for area effects
    pub const AREA_EFFECT_CAP: usize = 64;
    /// Population cap for ephemeral bursts
    pub const BURST_CAP: usize = 256;
    /// Released instances kept per pool; extra instances are dropped
    pub const MAX_RETAINED: usize = 1024;
    /// Ids wrap back to 1 after this value
    pub const ID_WRAP: u32 = 1 << 30;
}

/// Movement budget defaults
pub mod movement {
    /// Base actor speed in world units per tick
    pub const BASE_SPEED_PER_TICK: f32 = 5.0;
    /// Seconds of unused movement an actor may bank
    pub const BUFFER_SECONDS: f32 = 3.0;
    /// Multiplier absorbing clock jitter and diagonal approximation
    pub const TOLERANCE: f32 = 1.1;
    /// Fixed slack added to the budget before rejecting
    pub const FIXED_ALLOWANCE: f32 = 5.0;
    /// Hard clamp for reported speed multipliers
    pub const MAX_SPEED_MULTIPLIER: f32 = 3.0;
    /// Lowest the budget may fall
    pub const BUDGET_FLOOR: f32 = -50.0;
    /// Inbound movement messages allowed per actor per second
    pub const MAX_MESSAGES_PER_SECOND: u32 = 120;
}

/// Replication defaults
pub mod replication {
    /// Full snapshot every N emissions
    pub const KEYFRAME_INTERVAL: u32 = 60;
    /// Entities sampled per kind by the idle fast path
    pub const IDLE_SAMPLE_WIDTH: usize = 5;
    /// Movement below this is treated as "nothing moved" by the idle fast path
    pub const IDLE_MOVE_EPSILON: f32 = 0.01;
    /// Delay between batch flushes in milliseconds
    pub const BATCH_FLUSH_MS: u64 = 10;
    /// Interval between latency probes in milliseconds
    pub const PING_INTERVAL_MS: u64 = 2000;
    /// RTT samples kept for the rolling average
    pub const RTT_WINDOW: usize = 10;
}
