//! Snapshot capture, diffing, and client-side reconstruction
//!
//! The baseline is a deep clone of flat records, so nothing the simulation
//! mutates afterwards can alias it. Diffs compare records exactly; the
//! epsilon comparison lives only in the idle check, which never changes what
//! a diff contains.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::game::state::{ArenaMeta, EntityId, EntityKind, EntityRecord, EntityRef, WorldState};
use crate::net::protocol::{DiffMessage, FullSnapshot};

/// Records of one kind keyed by id
pub type KindRecords = HashMap<EntityId, EntityRecord>;

/// Everything a viewer holds: all entity mappings plus session fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationSnapshot {
    pub entities: BTreeMap<EntityKind, KindRecords>,
    pub meta: ArenaMeta,
}

impl ReplicationSnapshot {
    /// Deep copy of the world's replicated state
    pub fn capture(world: &WorldState) -> Self {
        let entities = EntityKind::ALL
            .iter()
            .map(|kind| (*kind, world.records(*kind)))
            .collect();
        Self {
            entities,
            meta: world.meta.clone(),
        }
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.entities.get(&kind).map_or(0, |records| records.len())
    }

    pub fn get(&self, entity: EntityRef) -> Option<&EntityRecord> {
        self.entities.get(&entity.kind)?.get(&entity.id)
    }

    pub fn total_entities(&self) -> usize {
        self.entities.values().map(|records| records.len()).sum()
    }
}

/// Changes that turn `base` into `current`.
///
/// Kinds with nothing updated and nothing removed are omitted; session fields
/// are always included.
pub fn compute_diff(
    base: &ReplicationSnapshot,
    current: &ReplicationSnapshot,
    server_time: u64,
) -> DiffMessage {
    let mut diff = DiffMessage {
        meta: current.meta.clone(),
        server_time,
        ..Default::default()
    };
    let empty = KindRecords::new();

    for kind in EntityKind::ALL {
        let before = base.entities.get(&kind).unwrap_or(&empty);
        let now = current.entities.get(&kind).unwrap_or(&empty);

        let updated: KindRecords = now
            .iter()
            .filter(|(id, record)| before.get(*id) != Some(*record))
            .map(|(id, record)| (*id, record.clone()))
            .collect();

        let mut removed: Vec<EntityId> = before
            .keys()
            .filter(|id| !now.contains_key(*id))
            .copied()
            .collect();
        removed.sort_unstable();

        if !updated.is_empty() {
            diff.updated.insert(kind, updated);
        }
        if !removed.is_empty() {
            diff.removed.insert(kind, removed);
        }
    }

    diff
}

/// Reconstruct viewer state from a full snapshot
pub fn apply_full(full: &FullSnapshot<'_>) -> ReplicationSnapshot {
    full.snapshot.clone()
}

/// Apply a diff to viewer state: removals first, then updates
pub fn apply_diff(state: &mut ReplicationSnapshot, diff: &DiffMessage) {
    for (kind, ids) in &diff.removed {
        if let Some(records) = state.entities.get_mut(kind) {
            for id in ids {
                records.remove(id);
            }
        }
    }
    for (kind, updated) in &diff.updated {
        let records = state.entities.entry(*kind).or_default();
        for (id, record) in updated {
            records.insert(*id, record.clone());
        }
    }
    state.meta = diff.meta.clone();
}

/// Cheap "did anything visibly change" check against the baseline.
///
/// Compares per-kind counts, session fields, and the first `sample_width`
/// entities of each high-churn kind. Anything it misses stays in the world
/// and goes out with the next emission, because a skipped tick leaves the
/// baseline untouched.
pub fn looks_idle(
    base: &ReplicationSnapshot,
    world: &WorldState,
    sample_width: usize,
    epsilon: f32,
) -> bool {
    if EntityKind::ALL.iter().any(|kind| base.count(*kind) != world.count(*kind)) {
        return false;
    }
    if base.meta != world.meta {
        return false;
    }

    for kind in EntityKind::HIGH_CHURN {
        let Some(records) = base.entities.get(&kind) else {
            continue;
        };
        for (id, before) in records.iter().take(sample_width) {
            let Some(now) = world.record(EntityRef::new(kind, *id)) else {
                return false;
            };
            if before.position().max_axis_delta(now.position()) > epsilon {
                return false;
            }
            let health_changed = match (before.health(), now.health()) {
                (Some(a), Some(b)) => (a - b).abs() > epsilon,
                (a, b) => a.is_some() != b.is_some(),
            };
            if health_changed {
                return false;
            }
        }
    }
    true
}
