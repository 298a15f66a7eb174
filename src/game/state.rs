//! World state: typed per-kind entity records and the mappings that own them
//!
//! Every kind has its own record struct so optional fields are known
//! statically; `EntityRecord` is the tagged union used wherever kinds are
//! handled uniformly (replication, diffing).

use std::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;
use crate::game::constants::{entity, pool};
use crate::game::pool::{PoolError, Poolable, PooledStore, Spawned};
use crate::game::spatial::{Rect, SpatialRecord};
use crate::util::vec2::Vec2;

/// Identity of an entity within its kind's namespace
pub type EntityId = u32;

/// Every entity kind the core tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Actor,
    Hostile,
    Projectile,
    Particle,
    AreaEffect,
    Burst,
    Pickup,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Actor,
        EntityKind::Hostile,
        EntityKind::Projectile,
        EntityKind::Particle,
        EntityKind::AreaEffect,
        EntityKind::Burst,
        EntityKind::Pickup,
    ];

    /// Kinds whose positions change nearly every tick (sampled by the idle check)
    pub const HIGH_CHURN: [EntityKind; 3] =
        [EntityKind::Actor, EntityKind::Hostile, EntityKind::Projectile];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Actor => "actor",
            EntityKind::Hostile => "hostile",
            EntityKind::Projectile => "projectile",
            EntityKind::Particle => "particle",
            EntityKind::AreaEffect => "areaEffect",
            EntityKind::Burst => "burst",
            EntityKind::Pickup => "pickup",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Back-reference from an index or message to an authoritative entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

/// Monotonic id allocator that wraps before exhausting the range and never
/// hands out an id that is still live
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: EntityId,
    wrap: EntityId,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::with_wrap(pool::ID_WRAP)
    }
}

impl IdAllocator {
    pub fn with_wrap(wrap: EntityId) -> Self {
        Self {
            next: 1,
            wrap: wrap.max(1),
        }
    }

    /// Next id for which `in_use` is false.
    ///
    /// Terminates as long as fewer than `wrap` ids are live, which population
    /// caps guarantee by a wide margin.
    pub fn allocate(&mut self, in_use: impl Fn(EntityId) -> bool) -> EntityId {
        loop {
            let id = self.next;
            self.next = if self.next >= self.wrap { 1 } else { self.next + 1 };
            if !in_use(id) {
                return id;
            }
        }
    }
}

// ============================================================================
// Entity records
// ============================================================================

/// A connected player's avatar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub position: Vec2,
    pub health: f32,
    pub max_health: f32,
    pub radius: f32,
    /// Current speed multiplier from upgrades/effects (read by the movement validator)
    pub speed_multiplier: f32,
    pub alive: bool,
    pub score: u32,
}

impl Actor {
    pub fn new(position: Vec2) -> Self {
        Self {
            position,
            health: entity::ACTOR_HEALTH,
            max_health: entity::ACTOR_HEALTH,
            radius: entity::ACTOR_RADIUS,
            speed_multiplier: 1.0,
            alive: true,
            score: 0,
        }
    }
}

/// Enemy controlled by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hostile {
    pub position: Vec2,
    pub velocity: Vec2,
    pub health: f32,
    pub max_health: f32,
    pub radius: f32,
    /// Movement per tick
    pub speed: f32,
    /// Index into the external content table
    pub variant: u16,
    pub is_boss: bool,
    pub target: Option<EntityId>,
}

impl Hostile {
    pub fn new(position: Vec2, health: f32) -> Self {
        Self {
            position,
            velocity: Vec2::ZERO,
            health,
            max_health: health,
            radius: entity::HOSTILE_RADIUS,
            speed: entity::HOSTILE_SPEED,
            variant: 0,
            is_boss: false,
            target: None,
        }
    }

    pub fn boss(position: Vec2, health: f32) -> Self {
        Self {
            radius: entity::BOSS_RADIUS,
            is_boss: true,
            ..Self::new(position, health)
        }
    }
}

/// Pooled: fired by actors or hostiles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projectile {
    pub position: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
    pub damage: f32,
    pub owner: Option<EntityRef>,
    /// Seconds left before expiry
    pub ttl: f32,
    /// Whether the projectile hurts actors (fired by a hostile) or hostiles
    pub hostile: bool,
    pub pierce: u8,
}

impl Poolable for Projectile {
    fn reset(&mut self) {
        self.position = Vec2::ZERO;
        self.velocity = Vec2::ZERO;
        self.radius = 0.0;
        self.damage = 0.0;
        self.owner = None;
        self.ttl = 0.0;
        self.hostile = false;
        self.pierce = 0;
    }
}

/// Pooled: short-lived visual particle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Particle {
    pub position: Vec2,
    pub velocity: Vec2,
    pub ttl: f32,
    pub color: u8,
}

impl Poolable for Particle {
    fn reset(&mut self) {
        self.position = Vec2::ZERO;
        self.velocity = Vec2::ZERO;
        self.ttl = 0.0;
        self.color = 0;
    }
}

/// Pooled: lingering damage zone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaEffect {
    pub position: Vec2,
    pub radius: f32,
    pub damage_per_second: f32,
    pub ttl: f32,
    pub owner: Option<EntityRef>,
    /// Hostiles already damaged this pulse
    pub affected: Vec<EntityId>,
}

impl Poolable for AreaEffect {
    fn reset(&mut self) {
        self.position = Vec2::ZERO;
        self.radius = 0.0;
        self.damage_per_second = 0.0;
        self.ttl = 0.0;
        self.owner = None;
        self.affected.clear();
    }
}

/// Pooled: one-shot explosion/impact burst
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Burst {
    pub position: Vec2,
    pub radius: f32,
    pub ttl: f32,
    /// Entities struck by the burst
    pub hits: Vec<EntityId>,
}

impl Poolable for Burst {
    fn reset(&mut self) {
        self.position = Vec2::ZERO;
        self.radius = 0.0;
        self.ttl = 0.0;
        self.hits.clear();
    }
}

/// Collectible dropped by hostiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pickup {
    pub position: Vec2,
    pub radius: f32,
    pub value: u32,
}

/// Tagged union over every record type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityRecord {
    Actor(Actor),
    Hostile(Hostile),
    Projectile(Projectile),
    Particle(Particle),
    AreaEffect(AreaEffect),
    Burst(Burst),
    Pickup(Pickup),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Actor(_) => EntityKind::Actor,
            EntityRecord::Hostile(_) => EntityKind::Hostile,
            EntityRecord::Projectile(_) => EntityKind::Projectile,
            EntityRecord::Particle(_) => EntityKind::Particle,
            EntityRecord::AreaEffect(_) => EntityKind::AreaEffect,
            EntityRecord::Burst(_) => EntityKind::Burst,
            EntityRecord::Pickup(_) => EntityKind::Pickup,
        }
    }

    pub fn position(&self) -> Vec2 {
        match self {
            EntityRecord::Actor(r) => r.position,
            EntityRecord::Hostile(r) => r.position,
            EntityRecord::Projectile(r) => r.position,
            EntityRecord::Particle(r) => r.position,
            EntityRecord::AreaEffect(r) => r.position,
            EntityRecord::Burst(r) => r.position,
            EntityRecord::Pickup(r) => r.position,
        }
    }

    /// Health for kinds that have it
    pub fn health(&self) -> Option<f32> {
        match self {
            EntityRecord::Actor(r) => Some(r.health),
            EntityRecord::Hostile(r) => Some(r.health),
            _ => None,
        }
    }
}

// ============================================================================
// Arena metadata
// ============================================================================

/// Axis-aligned static wall
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wall {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Wall {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Circle-vs-rectangle overlap
    pub fn intersects_circle(&self, center: Vec2, radius: f32) -> bool {
        let nearest = Vec2::new(
            center.x.clamp(self.x, self.x + self.width),
            center.y.clamp(self.y, self.y + self.height),
        );
        nearest.distance_sq_to(center) <= radius * radius
    }
}

/// Session-wide flags replicated with every message
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArenaFlags {
    pub boss_spawned: bool,
}

/// Session-wide fields always included in replication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArenaMeta {
    pub wave: u32,
    pub walls: Vec<Wall>,
    pub arena_flags: ArenaFlags,
}

// ============================================================================
// World state
// ============================================================================

/// Authoritative entity mappings for one arena. Mutated only by the simulation
/// driver; replication and spatial indexing read it.
pub struct WorldState {
    pub tick: u64,
    pub bounds: Rect,
    pub meta: ArenaMeta,
    pub actors: HashMap<EntityId, Actor>,
    pub hostiles: HashMap<EntityId, Hostile>,
    pub pickups: HashMap<EntityId, Pickup>,
    pub projectiles: PooledStore<Projectile>,
    pub particles: PooledStore<Particle>,
    pub area_effects: PooledStore<AreaEffect>,
    pub bursts: PooledStore<Burst>,
    actor_ids: IdAllocator,
    hostile_ids: IdAllocator,
    pickup_ids: IdAllocator,
}

impl WorldState {
    pub fn new(bounds: Rect, pools: &PoolConfig) -> Self {
        Self {
            tick: 0,
            bounds,
            meta: ArenaMeta::default(),
            actors: HashMap::new(),
            hostiles: HashMap::new(),
            pickups: HashMap::new(),
            projectiles: PooledStore::new(
                EntityKind::Projectile,
                pools.projectile_cap,
                pools.max_retained,
            ),
            particles: PooledStore::new(
                EntityKind::Particle,
                pools.particle_cap,
                pools.max_retained,
            ),
            area_effects: PooledStore::new(
                EntityKind::AreaEffect,
                pools.area_effect_cap,
                pools.max_retained,
            ),
            bursts: PooledStore::new(EntityKind::Burst, pools.burst_cap, pools.max_retained),
            actor_ids: IdAllocator::default(),
            hostile_ids: IdAllocator::default(),
            pickup_ids: IdAllocator::default(),
        }
    }

    pub fn add_actor(&mut self, actor: Actor) -> EntityId {
        let actors = &self.actors;
        let id = self.actor_ids.allocate(|c| actors.contains_key(&c));
        self.actors.insert(id, actor);
        id
    }

    pub fn remove_actor(&mut self, id: EntityId) -> Option<Actor> {
        self.actors.remove(&id)
    }

    pub fn add_hostile(&mut self, hostile: Hostile) -> EntityId {
        if hostile.is_boss {
            self.meta.arena_flags.boss_spawned = true;
        }
        let hostiles = &self.hostiles;
        let id = self.hostile_ids.allocate(|c| hostiles.contains_key(&c));
        self.hostiles.insert(id, hostile);
        id
    }

    pub fn add_pickup(&mut self, pickup: Pickup) -> EntityId {
        let pickups = &self.pickups;
        let id = self.pickup_ids.allocate(|c| pickups.contains_key(&c));
        self.pickups.insert(id, pickup);
        id
    }

    /// Number of live entities of a kind
    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Actor => self.actors.len(),
            EntityKind::Hostile => self.hostiles.len(),
            EntityKind::Projectile => self.projectiles.len(),
            EntityKind::Particle => self.particles.len(),
            EntityKind::AreaEffect => self.area_effects.len(),
            EntityKind::Burst => self.bursts.len(),
            EntityKind::Pickup => self.pickups.len(),
        }
    }

    pub fn total_entities(&self) -> usize {
        EntityKind::ALL.iter().map(|k| self.count(*k)).sum()
    }

    /// Look up one entity as a record
    pub fn record(&self, entity: EntityRef) -> Option<EntityRecord> {
        let id = entity.id;
        match entity.kind {
            EntityKind::Actor => self.actors.get(&id).cloned().map(EntityRecord::Actor),
            EntityKind::Hostile => self.hostiles.get(&id).cloned().map(EntityRecord::Hostile),
            EntityKind::Projectile => self.projectiles.get(id).cloned().map(EntityRecord::Projectile),
            EntityKind::Particle => self.particles.get(id).cloned().map(EntityRecord::Particle),
            EntityKind::AreaEffect => {
                self.area_effects.get(id).cloned().map(EntityRecord::AreaEffect)
            }
            EntityKind::Burst => self.bursts.get(id).cloned().map(EntityRecord::Burst),
            EntityKind::Pickup => self.pickups.get(&id).cloned().map(EntityRecord::Pickup),
        }
    }

    /// Clone every record of a kind (flat records, so this is a shallow copy)
    pub fn records(&self, kind: EntityKind) -> HashMap<EntityId, EntityRecord> {
        match kind {
            EntityKind::Actor => clone_map(self.actors.iter(), EntityRecord::Actor),
            EntityKind::Hostile => clone_map(self.hostiles.iter(), EntityRecord::Hostile),
            EntityKind::Pickup => clone_map(self.pickups.iter(), EntityRecord::Pickup),
            EntityKind::Projectile => {
                clone_store(self.projectiles.iter(), EntityRecord::Projectile)
            }
            EntityKind::Particle => clone_store(self.particles.iter(), EntityRecord::Particle),
            EntityKind::AreaEffect => {
                clone_store(self.area_effects.iter(), EntityRecord::AreaEffect)
            }
            EntityKind::Burst => clone_store(self.bursts.iter(), EntityRecord::Burst),
        }
    }

    /// Records fed to the spatial index each tick. Purely visual kinds
    /// (particles, bursts) are left out.
    pub fn spatial_records(&self) -> Vec<SpatialRecord> {
        let mut out = Vec::with_capacity(
            self.actors.len() + self.hostiles.len() + self.projectiles.len() + self.pickups.len(),
        );
        out.extend(
            self.actors
                .iter()
                .filter(|(_, a)| a.alive)
                .map(|(id, a)| SpatialRecord::new(EntityKind::Actor, *id, a.position, a.radius)),
        );
        out.extend(self.hostiles.iter().map(|(id, h)| {
            SpatialRecord::new(EntityKind::Hostile, *id, h.position, h.radius)
        }));
        out.extend(self.projectiles.iter().map(|(id, p)| {
            SpatialRecord::new(EntityKind::Projectile, id, p.position, p.radius)
        }));
        out.extend(self.pickups.iter().map(|(id, p)| {
            SpatialRecord::new(EntityKind::Pickup, *id, p.position, p.radius)
        }));
        out
    }
}

/// Pooled record types, each owned by one `PooledStore` in `WorldState`
pub trait PooledEntity: Poolable + Sized {
    const KIND: EntityKind;

    fn store(world: &WorldState) -> &PooledStore<Self>;
    fn store_mut(world: &mut WorldState) -> &mut PooledStore<Self>;
}

macro_rules! pooled_entity {
    ($ty:ty, $kind:expr, $field:ident) => {
        impl PooledEntity for $ty {
            const KIND: EntityKind = $kind;

            fn store(world: &WorldState) -> &PooledStore<Self> {
                &world.$field
            }

            fn store_mut(world: &mut WorldState) -> &mut PooledStore<Self> {
                &mut world.$field
            }
        }
    };
}

pooled_entity!(Projectile, EntityKind::Projectile, projectiles);
pooled_entity!(Particle, EntityKind::Particle, particles);
pooled_entity!(AreaEffect, EntityKind::AreaEffect, area_effects);
pooled_entity!(Burst, EntityKind::Burst, bursts);

impl WorldState {
    pub fn pooled<T: PooledEntity>(&self) -> &PooledStore<T> {
        T::store(self)
    }

    /// Acquire from the kind's pool and insert into its mapping, evicting the
    /// oldest live instance at the population cap
    pub fn spawn<T: PooledEntity>(&mut self, init: impl FnOnce(&mut T)) -> Spawned {
        T::store_mut(self).spawn(init)
    }

    /// Remove from the kind's mapping and release to its pool
    pub fn despawn<T: PooledEntity>(&mut self, id: EntityId) -> Result<(), PoolError> {
        T::store_mut(self).despawn(id)
    }
}

fn clone_map<'a, T: Clone + 'a>(
    iter: impl Iterator<Item = (&'a EntityId, &'a T)>,
    wrap: fn(T) -> EntityRecord,
) -> HashMap<EntityId, EntityRecord> {
    iter.map(|(id, r)| (*id, wrap(r.clone()))).collect()
}

fn clone_store<'a, T: Clone + 'a>(
    iter: impl Iterator<Item = (EntityId, &'a T)>,
    wrap: fn(T) -> EntityRecord,
) -> HashMap<EntityId, EntityRecord> {
    iter.map(|(id, r)| (id, wrap(r.clone()))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> WorldState {
        WorldState::new(
            Rect::new(Vec2::ZERO, Vec2::new(1000.0, 1000.0)),
            &PoolConfig::default(),
        )
    }

    #[test]
    fn test_id_allocator_wraps_and_skips_live() {
        let mut ids = IdAllocator::with_wrap(3);
        assert_eq!(ids.allocate(|_| false), 1);
        assert_eq!(ids.allocate(|_| false), 2);
        assert_eq!(ids.allocate(|_| false), 3);
        // wraps to 1, which is still live, so 2 is next
        assert_eq!(ids.allocate(|id| id == 1), 2);
    }

    #[test]
    fn test_ids_unique_within_kind() {
        let mut world = world();
        let a = world.add_actor(Actor::new(Vec2::new(10.0, 10.0)));
        let b = world.add_actor(Actor::new(Vec2::new(20.0, 10.0)));
        let h = world.add_hostile(Hostile::new(Vec2::new(30.0, 10.0), 50.0));
        assert_ne!(a, b);
        // Namespaces are per kind
        assert_eq!(a, h);
        assert_eq!(world.count(EntityKind::Actor), 2);
        assert_eq!(world.count(EntityKind::Hostile), 1);
    }

    #[test]
    fn test_boss_sets_flag() {
        let mut world = world();
        assert!(!world.meta.arena_flags.boss_spawned);
        world.add_hostile(Hostile::boss(Vec2::new(500.0, 500.0), 5000.0));
        assert!(world.meta.arena_flags.boss_spawned);
    }

    #[test]
    fn test_records_and_lookup() {
        let mut world = world();
        let id = world.add_hostile(Hostile::new(Vec2::new(1.0, 2.0), 10.0));
        let spawned = world.projectiles.spawn(|p| p.damage = 4.0);

        let hostiles = world.records(EntityKind::Hostile);
        assert_eq!(hostiles.len(), 1);
        assert_eq!(hostiles[&id].position(), Vec2::new(1.0, 2.0));
        assert_eq!(hostiles[&id].health(), Some(10.0));

        let record = world.record(EntityRef::new(EntityKind::Projectile, spawned.id)).unwrap();
        assert_eq!(record.kind(), EntityKind::Projectile);
        assert!(record.health().is_none());
    }

    #[test]
    fn test_spatial_records_skip_dead_and_visual() {
        let mut world = world();
        let dead = world.add_actor(Actor::new(Vec2::new(1.0, 1.0)));
        world.actors.get_mut(&dead).unwrap().alive = false;
        world.add_actor(Actor::new(Vec2::new(2.0, 2.0)));
        world.particles.spawn(|p| p.ttl = 1.0);
        world.bursts.spawn(|b| b.ttl = 1.0);

        let records = world.spatial_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity.kind, EntityKind::Actor);
    }

    #[test]
    fn test_wall_circle_intersection() {
        let wall = Wall::new(100.0, 100.0, 50.0, 20.0);
        assert!(wall.intersects_circle(Vec2::new(125.0, 110.0), 1.0));
        assert!(wall.intersects_circle(Vec2::new(95.0, 110.0), 6.0));
        assert!(!wall.intersects_circle(Vec2::new(95.0, 110.0), 4.0));
        // Corner distance is sqrt(50) ~ 7.07
        assert!(!wall.intersects_circle(Vec2::new(95.0, 95.0), 7.0));
        assert!(wall.intersects_circle(Vec2::new(95.0, 95.0), 7.1));
    }

    #[test]
    fn test_record_wire_shape_is_flat() {
        let record = EntityRecord::Pickup(Pickup {
            position: Vec2::new(1.0, 2.0),
            radius: 3.0,
            value: 7,
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["value"], 7);
        assert_eq!(json["position"]["x"], 1.0);
        assert!(json.get("Pickup").is_none());
    }

    #[test]
    fn test_kind_names() {
        let json = serde_json::to_string(&EntityKind::AreaEffect).unwrap();
        assert_eq!(json, "\"areaEffect\"");
        assert_eq!(EntityKind::AreaEffect.to_string(), "areaEffect");
    }

    #[test]
    fn test_typed_spawn_routes_to_kind_store() {
        let mut world = world();
        let spawned = world.spawn::<Burst>(|b| b.radius = 30.0);
        assert_eq!(<Burst as PooledEntity>::KIND, EntityKind::Burst);
        assert_eq!(world.count(EntityKind::Burst), 1);
        assert_eq!(world.pooled::<Burst>().get(spawned.id).unwrap().radius, 30.0);

        world.despawn::<Burst>(spawned.id).unwrap();
        assert!(world.despawn::<Burst>(spawned.id).is_err());
        assert_eq!(world.pooled::<Burst>().pool().free_len(), 1);
    }
}
