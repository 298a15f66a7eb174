//! Reference simulation driver
//!
//! `SimulationContext` owns the world and everything a tick needs: the
//! spatial index (and its optional worker), the replication channel, the
//! validated-move queue and the RNG. One call to `tick` runs one fixed step
//! and ends with exactly one replication emission.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::anticheat::movement::MoveContext;
use crate::config::{ServerConfig, SpatialConfig};
use crate::game::constants::{combat, entity};
use crate::game::input_buffer::{InputBuffer, InputSender};
use crate::game::spatial::{RebuildWorker, Rect, SpatialIndex, SpatialRecord};
use crate::game::state::{
    Actor, AreaEffect, Burst, EntityId, EntityKind, EntityRef, Hostile, Particle, Pickup,
    Projectile, Wall, WorldState,
};
use crate::net::protocol::{GameEvent, ProtocolError};
use crate::net::replication::{Emission, ReplicationChannel};
use crate::net::viewers::ViewerSink;
use crate::util::vec2::Vec2;

/// Something went wrong for one entity (or one subsystem) during a tick.
/// The tick always completes; faults are reported alongside its output.
#[derive(Debug, thiserror::Error)]
pub enum TickFault {
    #[error("{kind} #{id} had non-finite state, repaired")]
    Repaired { kind: EntityKind, id: EntityId, position: Vec2 },
    #[error("{kind} #{id} had non-finite state, removed")]
    Removed { kind: EntityKind, id: EntityId },
    #[error("spatial rebuild worker stopped, rebuilding inline")]
    RebuildWorker,
    #[error("replication emit failed: {0}")]
    Replication(#[from] ProtocolError),
}

/// Output of one tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    pub moves_applied: usize,
    pub events: Vec<GameEvent>,
    pub faults: Vec<TickFault>,
    /// None only when the emission failed
    pub emission: Option<Emission>,
}

/// Who dealt the final blow to a hostile this tick
type Killers = FxHashMap<EntityId, Option<EntityRef>>;

pub struct SimulationContext {
    world: WorldState,
    spatial: SpatialIndex,
    spatial_config: SpatialConfig,
    worker: Option<RebuildWorker>,
    replication: ReplicationChannel,
    inputs: InputBuffer,
    rng: StdRng,
    cooldowns: FxHashMap<EntityRef, f32>,
    kill_streaks: FxHashMap<EntityId, u32>,
    tick_rate: f32,
    hostile_count: usize,
    auto_waves: bool,
    cosmetics: bool,
}

impl SimulationContext {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic spawns for tests and replays
    pub fn with_seed(config: &ServerConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ServerConfig, rng: StdRng) -> Self {
        let bounds = Rect::from_size(config.arena_width, config.arena_height);
        let worker = if config.spatial.offload_rebuild {
            match RebuildWorker::spawn() {
                Ok(worker) => Some(worker),
                Err(e) => {
                    warn!("Failed to start spatial rebuild worker, rebuilding inline: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            world: WorldState::new(bounds, &config.pools),
            spatial: SpatialIndex::new(&config.spatial),
            spatial_config: config.spatial,
            worker,
            replication: ReplicationChannel::new(config.replication, config.replication.wire_format),
            inputs: InputBuffer::default(),
            rng,
            cooldowns: FxHashMap::default(),
            kill_streaks: FxHashMap::default(),
            tick_rate: config.tick_rate.max(1) as f32,
            hostile_count: config.hostile_count,
            auto_waves: true,
            cosmetics: true,
        }
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut WorldState {
        &mut self.world
    }

    pub fn spatial(&self) -> &SpatialIndex {
        &self.spatial
    }

    pub fn replication(&self) -> &ReplicationChannel {
        &self.replication
    }

    pub fn replication_mut(&mut self) -> &mut ReplicationChannel {
        &mut self.replication
    }

    /// Handle for inbound handlers to queue validated moves
    pub fn input_sender(&self) -> InputSender {
        self.inputs.sender()
    }

    /// Start a new wave whenever the arena is cleared
    pub fn set_auto_waves(&mut self, enabled: bool) {
        self.auto_waves = enabled;
    }

    /// Particles are skipped while the server is overloaded
    pub fn set_cosmetics(&mut self, enabled: bool) {
        self.cosmetics = enabled;
    }

    pub fn set_walls(&mut self, walls: Vec<Wall>) {
        self.world.meta.walls = walls;
    }

    /// Place a new actor at a random point in the arena
    pub fn spawn_actor(&mut self) -> (EntityId, Vec2) {
        let position = self.random_point(entity::ACTOR_RADIUS);
        let id = self.world.add_actor(Actor::new(position));
        debug!("actor #{} spawned at ({:.0}, {:.0})", id, position.x, position.y);
        (id, position)
    }

    /// Remove an actor and every per-actor structure the driver holds
    pub fn remove_actor(&mut self, id: EntityId) -> Option<Actor> {
        self.cooldowns.remove(&EntityRef::new(EntityKind::Actor, id));
        self.kill_streaks.remove(&id);
        for hostile in self.world.hostiles.values_mut() {
            if hostile.target == Some(id) {
                hostile.target = None;
                hostile.velocity = Vec2::ZERO;
            }
        }
        self.world.remove_actor(id)
    }

    /// What the movement validator needs to know about an actor; None once
    /// the actor is gone or down, since its moves would never be applied
    pub fn move_context(&self, id: EntityId) -> Option<MoveContext> {
        self.world.actors.get(&id).filter(|actor| actor.alive).map(|actor| MoveContext {
            speed_multiplier: actor.speed_multiplier,
            current_position: actor.position,
        })
    }

    /// Run one fixed step and replicate the result
    pub fn tick(&mut self, dt: Duration, sink: &dyn ViewerSink) -> TickReport {
        let dt = dt.as_secs_f32();
        self.world.tick += 1;
        let mut report = TickReport {
            tick: self.world.tick,
            ..TickReport::default()
        };
        let mut killers = Killers::default();

        report.moves_applied = self.apply_moves();
        self.sanitize(&mut report.faults);
        self.integrate(dt);
        self.rebuild_spatial(dt, &mut report.faults);
        self.seek_targets(dt, &mut report.events);
        self.fire(dt);
        self.resolve_impacts(&mut killers, &mut report.events);
        self.apply_area_effects(dt, &mut killers);
        self.collect_pickups(&mut report.events);
        self.remove_dead_hostiles(&killers, &mut report.events);
        if self.auto_waves && self.world.hostiles.is_empty() {
            self.start_wave(&mut report.events);
        }

        match self.replication.emit(&self.world, sink) {
            Ok(emission) => report.emission = Some(emission),
            Err(e) => {
                warn!("tick {}: replication failed: {}", self.world.tick, e);
                report.faults.push(TickFault::Replication(e));
            }
        }
        report
    }

    fn apply_moves(&mut self) -> usize {
        let mut applied = 0;
        for validated in self.inputs.drain() {
            // Actor may have left between validation and this tick
            if let Some(actor) = self.world.actors.get_mut(&validated.actor) {
                if actor.alive {
                    actor.position = validated.position;
                    applied += 1;
                }
            }
        }
        applied
    }

    /// Repair or remove entities whose state went non-finite
    fn sanitize(&mut self, faults: &mut Vec<TickFault>) {
        let center = self.world.bounds.center();
        for (id, actor) in self.world.actors.iter_mut() {
            if !actor.position.is_finite() || !actor.health.is_finite() {
                warn!("actor #{} had non-finite state, moved to arena center", id);
                actor.position = center;
                if !actor.health.is_finite() {
                    actor.health = actor.max_health;
                }
                faults.push(TickFault::Repaired { kind: EntityKind::Actor, id: *id, position: center });
            }
        }

        let broken: Vec<EntityId> = self
            .world
            .hostiles
            .iter()
            .filter(|(_, h)| !h.position.is_finite() || !h.velocity.is_finite() || !h.health.is_finite())
            .map(|(id, _)| *id)
            .collect();
        for id in broken {
            warn!("hostile #{} had non-finite state, removed", id);
            self.world.hostiles.remove(&id);
            faults.push(TickFault::Removed { kind: EntityKind::Hostile, id });
        }

        let mut removed = Vec::new();
        self.world.projectiles.despawn_where(|id, p| {
            let bad = !p.position.is_finite() || !p.velocity.is_finite();
            if bad {
                removed.push((EntityKind::Projectile, id));
            }
            bad
        });
        self.world.particles.despawn_where(|id, p| {
            let bad = !p.position.is_finite() || !p.velocity.is_finite();
            if bad {
                removed.push((EntityKind::Particle, id));
            }
            bad
        });
        self.world.area_effects.despawn_where(|id, a| {
            let bad = !a.position.is_finite() || !a.radius.is_finite();
            if bad {
                removed.push((EntityKind::AreaEffect, id));
            }
            bad
        });
        for (kind, id) in removed {
            warn!("{} #{} had non-finite state, removed", kind, id);
            faults.push(TickFault::Removed { kind, id });
        }
    }

    /// Advance hostiles and projectiles, expire projectiles and area effects
    fn integrate(&mut self, dt: f32) {
        let ticks = dt * self.tick_rate;
        let bounds = self.world.bounds;
        let walls = &self.world.meta.walls;

        for hostile in self.world.hostiles.values_mut() {
            let next = bounds.clamp(hostile.position + hostile.velocity * ticks);
            if !walls.iter().any(|w| w.intersects_circle(next, hostile.radius)) {
                hostile.position = next;
            }
        }

        for (_, projectile) in self.world.projectiles.iter_mut() {
            projectile.position += projectile.velocity * dt;
            projectile.ttl -= dt;
        }
        self.world.projectiles.despawn_where(|_, p| {
            p.ttl <= 0.0
                || !bounds.contains(p.position)
                || walls.iter().any(|w| w.intersects_circle(p.position, p.radius))
        });

        for (_, effect) in self.world.area_effects.iter_mut() {
            effect.ttl -= dt;
        }
        self.world.area_effects.despawn_where(|_, a| a.ttl <= 0.0);
    }

    /// Particles and bursts never enter the index, so they age while a worker
    /// rebuild is in flight
    fn age_cosmetics(&mut self, dt: f32) {
        for (_, particle) in self.world.particles.iter_mut() {
            particle.position += particle.velocity * dt;
            particle.ttl -= dt;
        }
        self.world.particles.despawn_where(|_, p| p.ttl <= 0.0);

        for (_, burst) in self.world.bursts.iter_mut() {
            burst.ttl -= dt;
        }
        self.world.bursts.despawn_where(|_, b| b.ttl <= 0.0);
    }

    fn rebuild_spatial(&mut self, dt: f32, faults: &mut Vec<TickFault>) {
        let records = self.world.spatial_records();
        let bounds = self.world.bounds;

        let Some(worker) = self.worker.take() else {
            self.age_cosmetics(dt);
            self.spatial.rebuild(records, bounds);
            return;
        };

        let index = std::mem::take(&mut self.spatial);
        let submitted = worker.submit(index, records, bounds);
        self.age_cosmetics(dt);
        match submitted.and_then(|()| worker.wait()) {
            Ok(index) => {
                self.spatial = index;
                self.worker = Some(worker);
            }
            Err(e) => {
                warn!("{}", e);
                faults.push(TickFault::RebuildWorker);
                self.spatial = SpatialIndex::new(&self.spatial_config);
                self.spatial.rebuild(self.world.spatial_records(), bounds);
            }
        }
    }

    /// Point every hostile at its closest living actor and apply contact damage
    fn seek_targets(&mut self, dt: f32, events: &mut Vec<GameEvent>) {
        let mut contacts: Vec<EntityId> = Vec::new();
        for hostile in self.world.hostiles.values_mut() {
            let target = self.spatial.closest(
                hostile.position.x,
                hostile.position.y,
                entity::HOSTILE_SIGHT_RADIUS,
                |r| r.entity.kind == EntityKind::Actor,
            );
            match target {
                Some(record) => {
                    hostile.target = Some(record.entity.id);
                    hostile.velocity = (record.position - hostile.position).normalize() * hostile.speed;
                    let reach = hostile.radius + record.radius;
                    if record.position.distance_sq_to(hostile.position) <= reach * reach {
                        contacts.push(record.entity.id);
                    }
                }
                None => {
                    hostile.target = None;
                    hostile.velocity = Vec2::ZERO;
                }
            }
        }

        let damage = combat::CONTACT_DAMAGE_PER_SECOND * dt;
        for id in contacts {
            if let Some(actor) = self.world.actors.get_mut(&id) {
                hurt_actor(id, actor, damage, events);
            }
        }
    }

    /// Actors auto-fire at the closest hostile; bosses fire at their target
    fn fire(&mut self, dt: f32) {
        let shooters: Vec<(EntityId, Vec2)> = self
            .world
            .actors
            .iter()
            .filter(|(_, a)| a.alive)
            .map(|(id, a)| (*id, a.position))
            .collect();

        for (id, position) in shooters {
            let owner = EntityRef::new(EntityKind::Actor, id);
            if !self.cooldown_ready(owner, dt) {
                continue;
            }
            let Some(target) = self.spatial.closest(position.x, position.y, combat::FIRE_RANGE, |r| {
                r.entity.kind == EntityKind::Hostile
            }) else {
                continue;
            };
            self.cooldowns.insert(owner, combat::ACTOR_FIRE_INTERVAL);
            let direction = (target.position - position).normalize();
            self.world.spawn::<Projectile>(|p| {
                p.position = position;
                p.velocity = direction * combat::PROJECTILE_SPEED;
                p.radius = entity::PROJECTILE_RADIUS;
                p.damage = combat::PROJECTILE_DAMAGE;
                p.owner = Some(owner);
                p.ttl = entity::PROJECTILE_LIFETIME;
            });
        }

        let bosses: Vec<(EntityId, Vec2, EntityId)> = self
            .world
            .hostiles
            .iter()
            .filter(|(_, h)| h.is_boss)
            .filter_map(|(id, h)| h.target.map(|t| (*id, h.position, t)))
            .collect();
        for (id, position, target) in bosses {
            let owner = EntityRef::new(EntityKind::Hostile, id);
            if !self.cooldown_ready(owner, dt) {
                continue;
            }
            let Some(aim) = self.world.actors.get(&target).map(|a| a.position) else {
                continue;
            };
            self.cooldowns.insert(owner, combat::BOSS_FIRE_INTERVAL);
            let direction = (aim - position).normalize();
            self.world.spawn::<Projectile>(|p| {
                p.position = position;
                p.velocity = direction * combat::PROJECTILE_SPEED * 0.5;
                p.radius = entity::PROJECTILE_RADIUS * 2.0;
                p.damage = combat::PROJECTILE_DAMAGE;
                p.owner = Some(owner);
                p.ttl = entity::PROJECTILE_LIFETIME * 2.0;
                p.hostile = true;
            });
        }
    }

    fn cooldown_ready(&mut self, shooter: EntityRef, dt: f32) -> bool {
        let remaining = self.cooldowns.entry(shooter).or_insert(0.0);
        *remaining -= dt;
        *remaining <= 0.0
    }

    fn resolve_impacts(&mut self, killers: &mut Killers, events: &mut Vec<GameEvent>) {
        let shots: Vec<(EntityId, Projectile)> = self
            .world
            .projectiles
            .iter()
            .map(|(id, p)| (id, p.clone()))
            .collect();

        let mut spent = Vec::new();
        let mut impacts = Vec::new();
        for (id, shot) in shots {
            let victim_kind = if shot.hostile { EntityKind::Actor } else { EntityKind::Hostile };
            let world = &self.world;
            let victim = self
                .spatial
                .query_overlapping(shot.position.x, shot.position.y, shot.radius)
                .into_iter()
                .filter(|r| r.entity.kind == victim_kind && is_standing(world, r))
                .min_by(|a, b| {
                    a.position
                        .distance_sq_to(shot.position)
                        .total_cmp(&b.position.distance_sq_to(shot.position))
                });
            let Some(victim) = victim else {
                continue;
            };

            match victim_kind {
                EntityKind::Actor => {
                    if let Some(actor) = self.world.actors.get_mut(&victim.entity.id) {
                        hurt_actor(victim.entity.id, actor, shot.damage, events);
                    }
                }
                _ => {
                    if let Some(hostile) = self.world.hostiles.get_mut(&victim.entity.id) {
                        hostile.health -= shot.damage;
                        if hostile.health <= 0.0 {
                            killers.entry(victim.entity.id).or_insert(shot.owner);
                        }
                    }
                }
            }

            match self.world.projectiles.get_mut(id) {
                Some(p) if p.pierce > 0 => p.pierce -= 1,
                _ => spent.push(id),
            }
            impacts.push(shot.position);
        }

        for id in spent {
            if let Err(e) = self.world.despawn::<Projectile>(id) {
                warn!("impact cleanup: {}", e);
            }
        }
        for point in impacts {
            self.spawn_impact(point);
        }
    }

    /// Burst plus (when cosmetics are on) a few particles at an impact point
    fn spawn_impact(&mut self, point: Vec2) {
        let struck: Vec<EntityId> = self
            .spatial
            .query_overlapping(point.x, point.y, combat::BURST_RADIUS)
            .into_iter()
            .filter(|r| r.entity.kind == EntityKind::Hostile)
            .map(|r| r.entity.id)
            .collect();
        self.world.spawn::<Burst>(|b| {
            b.position = point;
            b.radius = combat::BURST_RADIUS;
            b.ttl = entity::BURST_LIFETIME;
            b.hits.extend_from_slice(&struck);
        });

        if !self.cosmetics {
            return;
        }
        for _ in 0..combat::PARTICLES_PER_HIT {
            let angle = self.rng.gen::<f32>() * std::f32::consts::TAU;
            let speed = combat::PARTICLE_SPEED * (0.5 + self.rng.gen::<f32>());
            let color = self.rng.gen::<u8>();
            self.world.spawn::<Particle>(|p| {
                p.position = point;
                p.velocity = Vec2::from_angle(angle) * speed;
                p.ttl = entity::PARTICLE_LIFETIME;
                p.color = color;
            });
        }
    }

    fn apply_area_effects(&mut self, dt: f32, killers: &mut Killers) {
        let ids: Vec<EntityId> = self.world.area_effects.iter().map(|(id, _)| id).collect();
        for id in ids {
            let Some(effect) = self.world.area_effects.get_mut(id) else {
                continue;
            };
            let (center, radius) = (effect.position, effect.radius);
            let damage = effect.damage_per_second * dt;
            let owner = effect.owner;

            effect.affected.clear();
            for record in self.spatial.query_overlapping(center.x, center.y, radius) {
                if record.entity.kind != EntityKind::Hostile {
                    continue;
                }
                let Some(hostile) = self.world.hostiles.get_mut(&record.entity.id) else {
                    continue;
                };
                if hostile.health <= 0.0 {
                    continue;
                }
                hostile.health -= damage;
                effect.affected.push(record.entity.id);
                if hostile.health <= 0.0 {
                    killers.entry(record.entity.id).or_insert(owner);
                }
            }
        }
    }

    fn collect_pickups(&mut self, events: &mut Vec<GameEvent>) {
        let collectors: Vec<(EntityId, Vec2, f32)> = self
            .world
            .actors
            .iter()
            .filter(|(_, a)| a.alive)
            .map(|(id, a)| (*id, a.position, a.radius))
            .collect();

        for (actor_id, position, radius) in collectors {
            for record in self.spatial.query_overlapping(position.x, position.y, radius) {
                if record.entity.kind != EntityKind::Pickup {
                    continue;
                }
                let Some(pickup) = self.world.pickups.remove(&record.entity.id) else {
                    continue;
                };
                if let Some(actor) = self.world.actors.get_mut(&actor_id) {
                    actor.score += pickup.value;
                }
                events.push(GameEvent::PickupCollected {
                    pickup_id: record.entity.id,
                    actor_id,
                    value: pickup.value,
                });
            }
        }
    }

    fn remove_dead_hostiles(&mut self, killers: &Killers, events: &mut Vec<GameEvent>) {
        let dead: Vec<EntityId> = self
            .world
            .hostiles
            .iter()
            .filter(|(_, h)| h.health <= 0.0)
            .map(|(id, _)| *id)
            .collect();

        for id in dead {
            let Some(hostile) = self.world.hostiles.remove(&id) else {
                continue;
            };
            let by = killers.get(&id).copied().flatten();
            events.push(GameEvent::HostileKilled { hostile_id: id, by });

            let value = if hostile.is_boss {
                combat::PICKUP_VALUE * 10
            } else {
                combat::PICKUP_VALUE
            };
            self.world.add_pickup(Pickup {
                position: hostile.position,
                radius: combat::PICKUP_RADIUS,
                value,
            });

            if let Some(EntityRef { kind: EntityKind::Actor, id: actor_id }) = by {
                let streak = self.kill_streaks.entry(actor_id).or_insert(0);
                *streak += 1;
                if *streak % combat::AREA_KILL_EVERY == 0 {
                    self.world.spawn::<AreaEffect>(|a| {
                        a.position = hostile.position;
                        a.radius = combat::AREA_EFFECT_RADIUS;
                        a.damage_per_second = combat::AREA_EFFECT_DPS;
                        a.ttl = combat::AREA_EFFECT_LIFETIME;
                        a.owner = by;
                    });
                }
            }
            self.cooldowns.remove(&EntityRef::new(EntityKind::Hostile, id));
        }
    }

    fn start_wave(&mut self, events: &mut Vec<GameEvent>) {
        self.world.meta.wave += 1;
        let wave = self.world.meta.wave;
        let health = combat::HOSTILE_HEALTH + combat::HOSTILE_HEALTH_PER_WAVE * (wave - 1) as f32;

        for _ in 0..self.hostile_count {
            let position = self.random_point(entity::HOSTILE_RADIUS);
            let mut hostile = Hostile::new(position, health);
            hostile.variant = self.rng.gen_range(0..4);
            self.world.add_hostile(hostile);
        }
        if wave % combat::BOSS_WAVE_INTERVAL == 0 {
            let center = self.world.bounds.center();
            self.world
                .add_hostile(Hostile::boss(center, health * combat::BOSS_HEALTH_MULTIPLIER));
        }

        info!("Wave {} started: {} hostiles", wave, self.world.hostiles.len());
        events.push(GameEvent::WaveStarted { wave });
    }

    /// Uniform point inside the arena, kept `margin` away from the edges
    /// when the arena is large enough
    fn random_point(&mut self, margin: f32) -> Vec2 {
        let bounds = self.world.bounds;
        let span = bounds.max - bounds.min;
        let inset = Vec2::new(margin.min(span.x / 2.0), margin.min(span.y / 2.0));
        let usable = span - inset * 2.0;
        bounds.min
            + inset
            + Vec2::new(usable.x * self.rng.gen::<f32>(), usable.y * self.rng.gen::<f32>())
    }
}

fn is_standing(world: &WorldState, record: &SpatialRecord) -> bool {
    match record.entity.kind {
        EntityKind::Actor => world.actors.get(&record.entity.id).is_some_and(|a| a.alive),
        EntityKind::Hostile => world.hostiles.get(&record.entity.id).is_some_and(|h| h.health > 0.0),
        _ => false,
    }
}

fn hurt_actor(id: EntityId, actor: &mut Actor, damage: f32, events: &mut Vec<GameEvent>) {
    if !actor.alive {
        return;
    }
    actor.health -= damage;
    if actor.health <= 0.0 {
        actor.health = 0.0;
        actor.alive = false;
        events.push(GameEvent::ActorDown { actor_id: id });
    }
}
