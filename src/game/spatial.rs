//! Quadtree spatial index for proximity queries
//!
//! Rebuilt from scratch every tick from the current entity positions and
//! never patched, so a query can't observe a stale position. Nodes live in a
//! flat `Vec` whose allocation is reused between rebuilds.
//!
//! Records are stored by centre point. Queries against entity *extents* widen
//! the tree search by the largest radius seen during the rebuild, then filter
//! exactly, so large entities (bosses) near a query boundary are never missed.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::SpatialConfig;
use crate::game::constants::spatial::NODE_CAPACITY;
use crate::game::state::{EntityId, EntityKind, EntityRef};
use crate::util::vec2::Vec2;

/// Axis-aligned rectangle, inclusive on all edges
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Rect {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    pub fn from_size(width: f32, height: f32) -> Self {
        Self::new(Vec2::ZERO, Vec2::new(width, height))
    }

    #[inline]
    pub fn center(&self) -> Vec2 {
        Vec2::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
        )
    }

    #[inline]
    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// Squared distance from `p` to the closest point of the rectangle (0 inside)
    #[inline]
    pub fn distance_sq_to(&self, p: Vec2) -> f32 {
        let dx = (self.min.x - p.x).max(0.0).max(p.x - self.max.x);
        let dy = (self.min.y - p.y).max(0.0).max(p.y - self.max.y);
        dx * dx + dy * dy
    }

    pub fn clamp(&self, p: Vec2) -> Vec2 {
        Vec2::new(
            p.x.clamp(self.min.x, self.max.x),
            p.y.clamp(self.min.y, self.max.y),
        )
    }

    /// Quadrant `q` (0 = top-left, 1 = top-right, 2 = bottom-left, 3 = bottom-right)
    fn quadrant(&self, q: usize) -> Rect {
        let c = self.center();
        let (min_x, max_x) = if q & 1 == 0 { (self.min.x, c.x) } else { (c.x, self.max.x) };
        let (min_y, max_y) = if q & 2 == 0 { (self.min.y, c.y) } else { (c.y, self.max.y) };
        Rect::new(Vec2::new(min_x, min_y), Vec2::new(max_x, max_y))
    }

    #[inline]
    fn quadrant_of(&self, p: Vec2) -> usize {
        let c = self.center();
        (p.x >= c.x) as usize | (((p.y >= c.y) as usize) << 1)
    }
}

/// One indexed entity: back-reference plus the geometry needed to answer queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialRecord {
    pub entity: EntityRef,
    pub position: Vec2,
    pub radius: f32,
}

impl SpatialRecord {
    pub fn new(kind: EntityKind, id: EntityId, position: Vec2, radius: f32) -> Self {
        Self {
            entity: EntityRef::new(kind, id),
            position,
            radius,
        }
    }
}

struct Node {
    bounds: Rect,
    depth: u8,
    /// Indices into `SpatialIndex::records`
    items: SmallVec<[u32; NODE_CAPACITY]>,
    /// Index of the first of four consecutive children
    children: Option<u32>,
}

impl Node {
    fn leaf(bounds: Rect, depth: u8) -> Self {
        Self {
            bounds,
            depth,
            items: SmallVec::new(),
            children: None,
        }
    }
}

/// Statistics about the last rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpatialIndexStats {
    pub records: usize,
    pub nodes: usize,
    pub max_depth: u8,
    /// Records outside the rebuild bounds (kept in a flat list)
    pub out_of_bounds: usize,
}

/// Region-subdivision tree over entity centres
pub struct SpatialIndex {
    nodes: Vec<Node>,
    records: Vec<SpatialRecord>,
    out_of_bounds: Vec<u32>,
    max_radius: f32,
    node_capacity: usize,
    max_depth: u8,
}

impl SpatialIndex {
    pub fn new(config: &SpatialConfig) -> Self {
        Self {
            nodes: Vec::new(),
            records: Vec::new(),
            out_of_bounds: Vec::new(),
            max_radius: 0.0,
            node_capacity: config.node_capacity.max(1),
            max_depth: config.max_depth,
        }
    }

    /// Discard the previous tree and index `records` within `bounds`
    pub fn rebuild(&mut self, records: impl IntoIterator<Item = SpatialRecord>, bounds: Rect) {
        self.nodes.clear();
        self.records.clear();
        self.out_of_bounds.clear();
        self.max_radius = 0.0;

        self.nodes.push(Node::leaf(bounds, 0));
        for record in records {
            if !record.position.is_finite() {
                warn!("spatial index: skipping {:?} with non-finite position", record.entity);
                continue;
            }
            let index = self.records.len() as u32;
            self.max_radius = self.max_radius.max(record.radius);
            self.records.push(record);
            if bounds.contains(record.position) {
                self.insert(index);
            } else {
                self.out_of_bounds.push(index);
            }
        }
    }

    fn insert(&mut self, record_index: u32) {
        let position = self.records[record_index as usize].position;
        let mut node_index = 0usize;

        loop {
            if let Some(first_child) = self.nodes[node_index].children {
                let q = self.nodes[node_index].bounds.quadrant_of(position);
                node_index = first_child as usize + q;
                continue;
            }

            let node = &mut self.nodes[node_index];
            if node.items.len() < self.node_capacity || node.depth >= self.max_depth {
                node.items.push(record_index);
                return;
            }

            self.split(node_index);
        }
    }

    fn split(&mut self, node_index: usize) {
        let first_child = self.nodes.len() as u32;
        let bounds = self.nodes[node_index].bounds;
        let depth = self.nodes[node_index].depth + 1;
        for q in 0..4 {
            self.nodes.push(Node::leaf(bounds.quadrant(q), depth));
        }

        let items = std::mem::take(&mut self.nodes[node_index].items);
        self.nodes[node_index].children = Some(first_child);
        for item in items {
            let q = bounds.quadrant_of(self.records[item as usize].position);
            self.nodes[first_child as usize + q].items.push(item);
        }
    }

    /// Visit every record whose centre is within `radius` of `center`
    pub fn for_each_in_radius<F>(&self, center: Vec2, radius: f32, mut visit: F)
    where
        F: FnMut(&SpatialRecord),
    {
        if self.nodes.is_empty() || !center.is_finite() || !(radius >= 0.0) {
            return;
        }
        let radius_sq = radius * radius;

        let mut stack: SmallVec<[u32; 32]> = SmallVec::new();
        stack.push(0);
        while let Some(node_index) = stack.pop() {
            let node = &self.nodes[node_index as usize];
            if node.bounds.distance_sq_to(center) > radius_sq {
                continue;
            }
            for &item in &node.items {
                let record = &self.records[item as usize];
                if record.position.distance_sq_to(center) <= radius_sq {
                    visit(record);
                }
            }
            if let Some(first_child) = node.children {
                stack.extend(first_child..first_child + 4);
            }
        }

        for &item in &self.out_of_bounds {
            let record = &self.records[item as usize];
            if record.position.distance_sq_to(center) <= radius_sq {
                visit(record);
            }
        }
    }

    /// Every record whose centre lies within `r` of (x, y)
    pub fn query_radius(&self, x: f32, y: f32, r: f32) -> Vec<SpatialRecord> {
        let mut out = Vec::new();
        self.for_each_in_radius(Vec2::new(x, y), r, |record| out.push(*record));
        out
    }

    /// Every record whose circle intersects the query circle
    pub fn query_overlapping(&self, x: f32, y: f32, r: f32) -> Vec<SpatialRecord> {
        let center = Vec2::new(x, y);
        let mut out = Vec::new();
        self.for_each_in_radius(center, r + self.max_radius, |record| {
            let reach = r + record.radius;
            if record.position.distance_sq_to(center) <= reach * reach {
                out.push(*record);
            }
        });
        out
    }

    /// Nearest record within `max_radius` accepted by `filter`
    pub fn closest<F>(&self, x: f32, y: f32, max_radius: f32, mut filter: F) -> Option<SpatialRecord>
    where
        F: FnMut(&SpatialRecord) -> bool,
    {
        let center = Vec2::new(x, y);
        let mut best: Option<(f32, SpatialRecord)> = None;
        self.for_each_in_radius(center, max_radius, |record| {
            if !filter(record) {
                return;
            }
            let d = record.position.distance_sq_to(center);
            if best.map_or(true, |(best_d, _)| d < best_d) {
                best = Some((d, *record));
            }
        });
        best.map(|(_, record)| record)
    }

    /// Largest radius among indexed records
    pub fn max_radius(&self) -> f32 {
        self.max_radius
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stats(&self) -> SpatialIndexStats {
        SpatialIndexStats {
            records: self.records.len(),
            nodes: self.nodes.len(),
            max_depth: self.nodes.iter().map(|n| n.depth).max().unwrap_or(0),
            out_of_bounds: self.out_of_bounds.len(),
        }
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(&SpatialConfig::default())
    }
}

// ============================================================================
// Off-thread rebuild
// ============================================================================

/// The rebuild worker thread has stopped
#[derive(Debug, Clone, thiserror::Error)]
#[error("spatial rebuild worker is not running")]
pub struct WorkerGone;

struct RebuildJob {
    index: SpatialIndex,
    records: Vec<SpatialRecord>,
    bounds: Rect,
}

/// Builds the index on a dedicated thread while the tick does unrelated work.
///
/// The index itself travels to the worker and back, so its allocations are
/// reused and the tick cannot query it while the rebuild is in flight.
pub struct RebuildWorker {
    jobs: Option<Sender<RebuildJob>>,
    done: Receiver<SpatialIndex>,
    handle: Option<JoinHandle<()>>,
}

impl RebuildWorker {
    pub fn spawn() -> std::io::Result<Self> {
        let (job_tx, job_rx) = bounded::<RebuildJob>(1);
        let (done_tx, done_rx) = bounded::<SpatialIndex>(1);

        let handle = std::thread::Builder::new()
            .name("spatial-rebuild".into())
            .spawn(move || {
                for job in job_rx {
                    let RebuildJob { mut index, records, bounds } = job;
                    index.rebuild(records, bounds);
                    if done_tx.send(index).is_err() {
                        break;
                    }
                }
                debug!("spatial rebuild worker exiting");
            })?;

        Ok(Self {
            jobs: Some(job_tx),
            done: done_rx,
            handle: Some(handle),
        })
    }

    /// Hand the index and a positional snapshot to the worker
    pub fn submit(
        &self,
        index: SpatialIndex,
        records: Vec<SpatialRecord>,
        bounds: Rect,
    ) -> Result<(), WorkerGone> {
        let jobs = self.jobs.as_ref().ok_or(WorkerGone)?;
        jobs.send(RebuildJob { index, records, bounds }).map_err(|_| WorkerGone)
    }

    /// Block until the submitted rebuild completes
    pub fn wait(&self) -> Result<SpatialIndex, WorkerGone> {
        self.done.recv().map_err(|_| WorkerGone)
    }
}

impl Drop for RebuildWorker {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(id: EntityId, x: f32, y: f32, radius: f32) -> SpatialRecord {
        SpatialRecord::new(EntityKind::Hostile, id, Vec2::new(x, y), radius)
    }

    fn arena() -> Rect {
        Rect::from_size(1000.0, 1000.0)
    }

    fn ids(records: &[SpatialRecord]) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = records.iter().map(|r| r.entity.id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_query_before_rebuild_is_empty() {
        let index = SpatialIndex::default();
        assert!(index.query_radius(10.0, 10.0, 100.0).is_empty());
        assert!(index.query_overlapping(10.0, 10.0, 100.0).is_empty());
        assert!(index.closest(10.0, 10.0, 100.0, |_| true).is_none());
    }

    #[test]
    fn test_query_radius_exact() {
        let mut index = SpatialIndex::default();
        index.rebuild(
            vec![
                record(1, 100.0, 100.0, 5.0),
                record(2, 130.0, 100.0, 5.0),
                record(3, 400.0, 400.0, 5.0),
            ],
            arena(),
        );

        assert_eq!(ids(&index.query_radius(100.0, 100.0, 30.0)), vec![1, 2]);
        assert_eq!(ids(&index.query_radius(100.0, 100.0, 29.9)), vec![1]);
        assert!(index.query_radius(700.0, 700.0, 50.0).is_empty());
    }

    #[test]
    fn test_rebuild_discards_previous_tree() {
        let mut index = SpatialIndex::default();
        index.rebuild(vec![record(1, 10.0, 10.0, 1.0)], arena());
        index.rebuild(vec![record(2, 900.0, 900.0, 1.0)], arena());

        assert!(index.query_radius(10.0, 10.0, 5.0).is_empty());
        assert_eq!(ids(&index.query_radius(900.0, 900.0, 5.0)), vec![2]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_large_radius_found_by_overlap_query() {
        let mut index = SpatialIndex::default();
        let mut records: Vec<SpatialRecord> =
            (0..100).map(|i| record(i, (i % 10) as f32 * 10.0, (i / 10) as f32 * 10.0, 2.0)).collect();
        // Boss centred 120 units away with a 90 unit radius
        records.push(record(999, 620.0, 500.0, 90.0));
        index.rebuild(records, arena());

        let hits = index.query_overlapping(500.0, 500.0, 40.0);
        assert_eq!(ids(&hits), vec![999]);
        // A centre-only query with the same radius misses it
        assert!(index.query_radius(500.0, 500.0, 40.0).is_empty());
        assert_eq!(index.max_radius(), 90.0);
    }

    #[test]
    fn test_out_of_bounds_records_still_found() {
        let mut index = SpatialIndex::default();
        index.rebuild(vec![record(1, -50.0, 20.0, 1.0), record(2, 20.0, 20.0, 1.0)], arena());

        assert_eq!(ids(&index.query_radius(0.0, 20.0, 60.0)), vec![1, 2]);
        assert_eq!(index.stats().out_of_bounds, 1);
    }

    #[test]
    fn test_dense_cluster_respects_depth_cap() {
        let config = SpatialConfig { node_capacity: 2, max_depth: 3, ..SpatialConfig::default() };
        let mut index = SpatialIndex::new(&config);
        let records: Vec<SpatialRecord> = (0..50).map(|i| record(i, 10.0, 10.0, 1.0)).collect();
        index.rebuild(records, arena());

        let stats = index.stats();
        assert_eq!(stats.records, 50);
        assert!(stats.max_depth <= 3);
        assert_eq!(index.query_radius(10.0, 10.0, 0.0).len(), 50);
    }

    #[test]
    fn test_closest_with_filter() {
        let mut index = SpatialIndex::default();
        index.rebuild(
            vec![
                record(1, 110.0, 100.0, 1.0),
                SpatialRecord::new(EntityKind::Actor, 2, Vec2::new(150.0, 100.0), 1.0),
                SpatialRecord::new(EntityKind::Actor, 3, Vec2::new(300.0, 100.0), 1.0),
            ],
            arena(),
        );

        let nearest_actor = index
            .closest(100.0, 100.0, 500.0, |r| r.entity.kind == EntityKind::Actor)
            .unwrap();
        assert_eq!(nearest_actor.entity.id, 2);

        let nearest_any = index.closest(100.0, 100.0, 500.0, |_| true).unwrap();
        assert_eq!(nearest_any.entity.id, 1);
        assert!(index.closest(100.0, 100.0, 5.0, |_| true).is_none());
    }

    #[test]
    fn test_non_finite_query_is_empty() {
        let mut index = SpatialIndex::default();
        index.rebuild(vec![record(1, 10.0, 10.0, 1.0)], arena());
        assert!(index.query_radius(f32::NAN, 10.0, 5.0).is_empty());
        assert!(index.query_radius(10.0, 10.0, f32::NAN).is_empty());
    }

    #[test]
    fn test_rebuild_worker_round_trip() {
        let worker = RebuildWorker::spawn().unwrap();
        let index = SpatialIndex::default();
        worker
            .submit(index, vec![record(7, 250.0, 250.0, 3.0)], arena())
            .unwrap();
        let index = worker.wait().unwrap();
        assert_eq!(ids(&index.query_radius(250.0, 250.0, 1.0)), vec![7]);

        // Reuse the same index for a second tick
        worker.submit(index, vec![record(8, 10.0, 10.0, 3.0)], arena()).unwrap();
        let index = worker.wait().unwrap();
        assert!(index.query_radius(250.0, 250.0, 1.0).is_empty());
        assert_eq!(index.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_query_radius_matches_brute_force(
            points in proptest::collection::vec((-100.0f32..1100.0, -100.0f32..1100.0), 0..300),
            qx in -100.0f32..1100.0,
            qy in -100.0f32..1100.0,
            r in 0.0f32..400.0,
        ) {
            let records: Vec<SpatialRecord> = points
                .iter()
                .enumerate()
                .map(|(i, (x, y))| record(i as EntityId, *x, *y, 1.0))
                .collect();
            let mut index = SpatialIndex::new(&SpatialConfig { node_capacity: 4, max_depth: 6, ..SpatialConfig::default() });
            index.rebuild(records.clone(), arena());

            let center = Vec2::new(qx, qy);
            let mut expected: Vec<EntityId> = records
                .iter()
                .filter(|rec| rec.position.distance_sq_to(center) <= r * r)
                .map(|rec| rec.entity.id)
                .collect();
            expected.sort_unstable();

            prop_assert_eq!(ids(&index.query_radius(qx, qy, r)), expected);
        }
    }
}
