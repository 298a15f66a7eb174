//! Prometheus-compatible metrics endpoint
//!
//! Counters are plain atomics updated from the tick loop and inbound
//! handlers. Default endpoint: http://localhost:<METRICS_PORT>/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::game::performance::PerformanceStatus;
use crate::game::pool::PoolStats;
use crate::game::state::{EntityKind, WorldState};

const TICK_HISTORY: usize = 1000;

/// Metrics registry for the arena server
#[derive(Debug)]
pub struct Metrics {
    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,
    pub tick_faults: AtomicU64,

    // 0=Excellent .. 4=Catastrophic
    pub performance_status: AtomicU64,
    pub budget_usage_percent: AtomicU64,

    // Entity counts, indexed like `EntityKind::ALL`
    entity_counts: [AtomicU64; EntityKind::ALL.len()],

    // Replication
    pub keyframes_sent: AtomicU64,
    pub diffs_sent: AtomicU64,
    pub emissions_skipped: AtomicU64,
    pub batches_sent: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Inbound
    pub viewers_active: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub moves_accepted: AtomicU64,
    pub moves_rejected: AtomicU64,

    // Pools
    pub pool_evictions: AtomicU64,
    pub pool_misuse: AtomicU64,

    start_time: Instant,
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            tick_faults: AtomicU64::new(0),
            performance_status: AtomicU64::new(0),
            budget_usage_percent: AtomicU64::new(0),
            entity_counts: Default::default(),
            keyframes_sent: AtomicU64::new(0),
            diffs_sent: AtomicU64::new(0),
            emissions_skipped: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            viewers_active: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            moves_accepted: AtomicU64::new(0),
            moves_rejected: AtomicU64::new(0),
            pool_evictions: AtomicU64::new(0),
            pool_misuse: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            self.tick_time_p95_us
                .store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn record_performance(&self, status: PerformanceStatus, budget_percent: f32) {
        let level = match status {
            PerformanceStatus::Excellent => 0,
            PerformanceStatus::Good => 1,
            PerformanceStatus::Warning => 2,
            PerformanceStatus::Critical => 3,
            PerformanceStatus::Catastrophic => 4,
        };
        self.performance_status.store(level, Ordering::Relaxed);
        self.budget_usage_percent
            .store(budget_percent.max(0.0) as u64, Ordering::Relaxed);
    }

    /// Copy live entity counts and cumulative pool counters from the world
    pub fn record_world(&self, world: &WorldState) {
        for (slot, kind) in self.entity_counts.iter().zip(EntityKind::ALL) {
            slot.store(world.count(kind) as u64, Ordering::Relaxed);
        }
        let pools: [PoolStats; 4] = [
            world.projectiles.stats(),
            world.particles.stats(),
            world.area_effects.stats(),
            world.bursts.stats(),
        ];
        let evictions: u64 = pools.iter().map(|p| p.evictions).sum();
        let misuse: u64 = pools.iter().map(|p| p.misuse).sum();
        self.pool_evictions.store(evictions, Ordering::Relaxed);
        self.pool_misuse.store(misuse, Ordering::Relaxed);
    }

    pub fn entity_count(&self, kind: EntityKind) -> u64 {
        let index = EntityKind::ALL.iter().position(|k| *k == kind).unwrap_or(0);
        self.entity_counts[index].load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("arena_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("arena_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("arena_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("arena_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("arena_tick_faults_total", "Per-entity faults isolated during ticks", "counter",
            self.tick_faults.load(Ordering::Relaxed));
        metric!("arena_performance_status", "Performance status (0=Excellent, 4=Catastrophic)", "gauge",
            self.performance_status.load(Ordering::Relaxed));
        metric!("arena_budget_usage_percent", "Tick budget usage percentage", "gauge",
            self.budget_usage_percent.load(Ordering::Relaxed));

        output.push_str("# HELP arena_entities Live entities by kind\n# TYPE arena_entities gauge\n");
        for (slot, kind) in self.entity_counts.iter().zip(EntityKind::ALL) {
            output.push_str(&format!(
                "arena_entities{{kind=\"{}\"}} {}\n",
                kind,
                slot.load(Ordering::Relaxed)
            ));
        }

        metric!("arena_keyframes_sent_total", "Full snapshots broadcast", "counter",
            self.keyframes_sent.load(Ordering::Relaxed));
        metric!("arena_diffs_sent_total", "Diffs broadcast", "counter",
            self.diffs_sent.load(Ordering::Relaxed));
        metric!("arena_emissions_skipped_total", "Emissions skipped by the idle check", "counter",
            self.emissions_skipped.load(Ordering::Relaxed));
        metric!("arena_batches_sent_total", "Batched notification messages sent", "counter",
            self.batches_sent.load(Ordering::Relaxed));
        metric!("arena_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));

        metric!("arena_viewers_active", "Connected viewers", "gauge",
            self.viewers_active.load(Ordering::Relaxed));
        metric!("arena_messages_received_total", "Inbound messages", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("arena_messages_dropped_total", "Inbound messages dropped (malformed or over rate)", "counter",
            self.messages_dropped.load(Ordering::Relaxed));
        metric!("arena_moves_accepted_total", "Movement claims accepted", "counter",
            self.moves_accepted.load(Ordering::Relaxed));
        metric!("arena_moves_rejected_total", "Movement claims rejected", "counter",
            self.moves_rejected.load(Ordering::Relaxed));

        metric!("arena_pool_evictions_total", "Oldest-first evictions under population caps", "counter",
            self.pool_evictions.load(Ordering::Relaxed));
        metric!("arena_pool_misuse_total", "Detected pool contract violations", "counter",
            self.pool_misuse.load(Ordering::Relaxed));
        metric!("arena_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON rendering of the headline numbers
    pub fn to_json(&self) -> String {
        let summary = MetricsSummary {
            tick_count: self.tick_count.load(Ordering::Relaxed),
            tick_time_us: self.tick_time_us.load(Ordering::Relaxed),
            tick_time_p95_us: self.tick_time_p95_us.load(Ordering::Relaxed),
            viewers: self.viewers_active.load(Ordering::Relaxed),
            keyframes_sent: self.keyframes_sent.load(Ordering::Relaxed),
            diffs_sent: self.diffs_sent.load(Ordering::Relaxed),
            emissions_skipped: self.emissions_skipped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            moves_rejected: self.moves_rejected.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        };
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsSummary {
    tick_count: u64,
    tick_time_us: u64,
    tick_time_p95_us: u64,
    viewers: u64,
    keyframes_sent: u64,
    diffs_sent: u64,
    emissions_skipped: u64,
    bytes_sent: u64,
    moves_rejected: u64,
    uptime_seconds: u64,
}

/// Serve `/metrics`, `/metrics/json` and `/health` until the task is aborted
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn route(metrics: &Metrics, request: &str) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics/json") {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::game::spatial::Rect;
    use crate::game::state::Hostile;
    use crate::util::vec2::Vec2;

    #[test]
    fn test_record_tick_time() {
        let metrics = Metrics::new();
        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_record_world_counts() {
        let metrics = Metrics::new();
        let mut world = WorldState::new(Rect::from_size(100.0, 100.0), &PoolConfig::default());
        world.add_hostile(Hostile::new(Vec2::new(1.0, 1.0), 10.0));
        world.add_hostile(Hostile::new(Vec2::new(2.0, 1.0), 10.0));
        world.projectiles.spawn(|_| {});

        metrics.record_world(&world);
        assert_eq!(metrics.entity_count(EntityKind::Hostile), 2);
        assert_eq!(metrics.entity_count(EntityKind::Projectile), 1);
        assert_eq!(metrics.entity_count(EntityKind::Burst), 0);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.keyframes_sent.store(3, Ordering::Relaxed);
        metrics.moves_rejected.store(2, Ordering::Relaxed);

        let output = metrics.to_prometheus();
        assert!(output.contains("arena_keyframes_sent_total 3"));
        assert!(output.contains("arena_moves_rejected_total 2"));
        assert!(output.contains("arena_entities{kind=\"hostile\"} 0"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.viewers_active.store(4, Ordering::Relaxed);
        let json: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(json["viewers"], 4);
    }

    #[test]
    fn test_routes() {
        let metrics = Metrics::new();
        assert!(route(&metrics, "GET /health HTTP/1.1").ends_with("OK"));
        assert!(route(&metrics, "GET /metrics HTTP/1.1").contains("arena_tick_count"));
        assert!(route(&metrics, "GET /metrics/json HTTP/1.1").contains("application/json"));
        assert!(route(&metrics, "GET /nope HTTP/1.1").starts_with("HTTP/1.1 404"));
    }
}
