//! Object reuse for high-churn entity kinds
//!
//! Projectiles, particles, area effects and bursts are created and destroyed
//! several times per tick under heavy combat. `EntityPool` keeps released
//! instances on a free list so the next spawn reuses the allocation (including
//! any capacity held by nested collections) instead of hitting the allocator.
//!
//! `PooledStore` pairs a pool with the kind's live mapping so that releasing an
//! instance always coincides with removing it from the mapping, and enforces the
//! per-kind population cap by evicting the oldest live instance.

use std::collections::VecDeque;

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::game::state::{EntityId, EntityKind, IdAllocator};

/// Contract for pooled entity types
///
/// `Default` is the factory. `reset` must return every per-use field to its
/// default while keeping allocations: clear nested collections, don't replace them.
pub trait Poolable: Default {
    fn reset(&mut self);
}

/// Pool contract violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("release of {kind} #{id} which is not live (double release?)")]
    NotLive { kind: EntityKind, id: EntityId },
    #[error("release into {kind} pool with no outstanding instances")]
    NothingOutstanding { kind: EntityKind },
}

/// Counters for one pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances handed out and not yet released
    pub outstanding: usize,
    /// Instances waiting on the free list
    pub free: usize,
    /// Instances newly allocated (free list was empty)
    pub created: u64,
    /// Acquires served from the free list
    pub reused: u64,
    /// Released instances dropped because the free list was full
    pub dropped: u64,
    /// Instances force-released by the population cap
    pub evictions: u64,
    /// Detected contract violations
    pub misuse: u64,
}

/// Free-list pool for one entity kind
pub struct EntityPool<T> {
    kind: EntityKind,
    free: Vec<T>,
    max_retained: usize,
    stats: PoolStats,
}

impl<T: Poolable> EntityPool<T> {
    pub fn new(kind: EntityKind, max_retained: usize) -> Self {
        Self {
            kind,
            free: Vec::with_capacity(max_retained.min(64)),
            max_retained,
            stats: PoolStats::default(),
        }
    }

    /// Hand out an instance. Never fails: allocates when the free list is empty.
    pub fn acquire(&mut self) -> T {
        self.stats.outstanding += 1;
        match self.free.pop() {
            Some(instance) => {
                self.stats.reused += 1;
                instance
            }
            None => {
                self.stats.created += 1;
                T::default()
            }
        }
    }

    /// Reset an instance and return it to the free list.
    ///
    /// Releasing more instances than were acquired is a contract violation: it is
    /// logged, counted, and the instance is dropped rather than pushed.
    pub fn release(&mut self, mut instance: T) -> Result<(), PoolError> {
        if self.stats.outstanding == 0 {
            self.stats.misuse += 1;
            warn!("{} pool: release with nothing outstanding, dropping instance", self.kind);
            return Err(PoolError::NothingOutstanding { kind: self.kind });
        }
        self.stats.outstanding -= 1;

        if self.free.len() >= self.max_retained {
            self.stats.dropped += 1;
            return Ok(());
        }
        instance.reset();
        self.free.push(instance);
        Ok(())
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn outstanding(&self) -> usize {
        self.stats.outstanding
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            free: self.free.len(),
            ..self.stats
        }
    }

    fn record_misuse(&mut self) {
        self.stats.misuse += 1;
    }

    fn record_eviction(&mut self) {
        self.stats.evictions += 1;
    }
}

/// Live entity plus the spawn serial used to order evictions
struct Slot<T> {
    serial: u64,
    value: T,
}

/// Result of a spawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawned {
    pub id: EntityId,
    /// Oldest live entity removed to make room under the population cap
    pub evicted: Option<EntityId>,
}

/// Live mapping of one pooled kind, backed by its pool
pub struct PooledStore<T> {
    live: HashMap<EntityId, Slot<T>>,
    pool: EntityPool<T>,
    /// Spawn order for oldest-first eviction. Entries whose serial no longer
    /// matches the live slot are stale and skipped.
    spawn_order: VecDeque<(EntityId, u64)>,
    ids: IdAllocator,
    next_serial: u64,
    population_cap: usize,
}

impl<T: Poolable> PooledStore<T> {
    pub fn new(kind: EntityKind, population_cap: usize, max_retained: usize) -> Self {
        Self {
            live: HashMap::with_capacity(population_cap.min(256)),
            pool: EntityPool::new(kind, max_retained),
            spawn_order: VecDeque::with_capacity(population_cap.min(256)),
            ids: IdAllocator::default(),
            next_serial: 0,
            population_cap: population_cap.max(1),
        }
    }

    /// Use a smaller id range (tests exercise wrap-around with this)
    pub fn with_id_wrap(mut self, wrap: EntityId) -> Self {
        self.ids = IdAllocator::with_wrap(wrap);
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.pool.kind()
    }

    /// Acquire an instance, let `init` fill it in, and insert it as live.
    ///
    /// At the population cap the oldest live instance is force-released first.
    pub fn spawn(&mut self, init: impl FnOnce(&mut T)) -> Spawned {
        let evicted = if self.live.len() >= self.population_cap {
            self.evict_oldest()
        } else {
            None
        };

        let live = &self.live;
        let id = self.ids.allocate(|candidate| live.contains_key(&candidate));

        let mut value = self.pool.acquire();
        init(&mut value);

        let serial = self.next_serial;
        self.next_serial += 1;
        self.live.insert(id, Slot { serial, value });
        self.spawn_order.push_back((id, serial));

        Spawned { id, evicted }
    }

    /// Remove a live entity and release it to the pool
    pub fn despawn(&mut self, id: EntityId) -> Result<(), PoolError> {
        let Some(slot) = self.live.remove(&id) else {
            self.pool.record_misuse();
            warn!("{} store: despawn of #{} which is not live", self.kind(), id);
            return Err(PoolError::NotLive { kind: self.kind(), id });
        };
        self.pool.release(slot.value)?;
        self.compact_spawn_order();
        Ok(())
    }

    /// Despawn every entity matching `predicate`; returns how many were removed
    pub fn despawn_where(&mut self, mut predicate: impl FnMut(EntityId, &T) -> bool) -> usize {
        let doomed: Vec<EntityId> = self
            .live
            .iter()
            .filter(|(id, slot)| predicate(**id, &slot.value))
            .map(|(id, _)| *id)
            .collect();
        let count = doomed.len();
        for id in doomed {
            // ids come straight from the live map, so this cannot be a double release
            let _ = self.despawn(id);
        }
        count
    }

    fn evict_oldest(&mut self) -> Option<EntityId> {
        while let Some((id, serial)) = self.spawn_order.pop_front() {
            let is_current = self.live.get(&id).is_some_and(|slot| slot.serial == serial);
            if !is_current {
                continue;
            }
            if let Some(slot) = self.live.remove(&id) {
                self.pool.record_eviction();
                // The slot was live, so outstanding > 0 and release cannot fail
                let _ = self.pool.release(slot.value);
                debug!("{} store: evicted #{} at population cap", self.kind(), id);
                return Some(id);
            }
        }
        None
    }

    fn compact_spawn_order(&mut self) {
        if self.spawn_order.len() > self.live.len() * 2 + 64 {
            let live = &self.live;
            self.spawn_order
                .retain(|(id, serial)| live.get(id).is_some_and(|slot| slot.serial == *serial));
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.live.get(&id).map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        self.live.get_mut(&id).map(|slot| &mut slot.value)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.live.iter().map(|(id, slot)| (*id, &slot.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> {
        self.live.iter_mut().map(|(id, slot)| (*id, &mut slot.value))
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn population_cap(&self) -> usize {
        self.population_cap
    }

    pub fn pool(&self) -> &EntityPool<T> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut EntityPool<T> {
        &mut self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
