//! Arena session runtime
//!
//! Glues the simulation to its viewers: join and leave, inbound message
//! handling, and the background loops (tick, batch flush, latency probes,
//! metrics endpoint). The session owns every task it spawns and aborts them
//! in `shutdown`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::anticheat::{
    AcceptedMove, MoveContext, MovementRejection, MovementSettings, MovementValidator,
    RateLimiterManager,
};
use crate::config::ServerConfig;
use crate::game::constants::tick;
use crate::game::input_buffer::InputSender;
use crate::game::performance::PerformanceMonitor;
use crate::game::simulation::{SimulationContext, TickFault, TickReport};
use crate::game::state::{EntityId, EntityKind};
use crate::metrics::{self, Metrics};
use crate::net::batching::EventBatcher;
use crate::net::protocol::{
    server_time_ms, ClientMessage, GameEvent, MovementCorrection, Probe, ProtocolError,
    ServerMessage, Welcome, WireFormat,
};
use crate::net::replication::Emission;
use crate::net::viewers::{Frame, ViewerId, ViewerRegistry, ViewerSink};
use crate::util::vec2::Vec2;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("server is overloaded, not accepting viewers")]
    Overloaded,
    #[error("unknown viewer {0}")]
    UnknownViewer(ViewerId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A joined viewer: its ids and the stream of frames addressed to it
pub struct ViewerHandle {
    pub viewer: ViewerId,
    pub actor: EntityId,
    pub frames: UnboundedReceiver<Frame>,
}

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Accepted(AcceptedMove),
    /// Correction was sent to the originating viewer
    Rejected(MovementRejection),
    RateLimited,
    /// Actor gone or down, or the input queue refused the move (in which
    /// case a correction was sent)
    Discarded,
    Pong(Option<Duration>),
}

pub struct ArenaSession {
    config: ServerConfig,
    format: WireFormat,
    sim: Mutex<SimulationContext>,
    viewers: Arc<ViewerRegistry>,
    batcher: EventBatcher,
    movement: MovementValidator,
    rate_limits: Mutex<RateLimiterManager>,
    inputs: InputSender,
    metrics: Arc<Metrics>,
    performance: Mutex<PerformanceMonitor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ArenaSession {
    pub fn new(config: ServerConfig, metrics: Arc<Metrics>) -> Self {
        Self::with_simulation(SimulationContext::new(&config), config, metrics)
    }

    pub fn with_simulation(sim: SimulationContext, config: ServerConfig, metrics: Arc<Metrics>) -> Self {
        let format = config.replication.wire_format;
        Self {
            format,
            inputs: sim.input_sender(),
            sim: Mutex::new(sim),
            viewers: Arc::new(ViewerRegistry::new(config.replication.rtt_window)),
            batcher: EventBatcher::new(format),
            movement: MovementValidator::new(MovementSettings::from_server_config(&config)),
            rate_limits: Mutex::new(RateLimiterManager::new(config.movement.max_messages_per_second)),
            metrics,
            performance: Mutex::new(PerformanceMonitor::new(config.tick_interval())),
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn viewers(&self) -> &ViewerRegistry {
        &self.viewers
    }

    pub fn movement(&self) -> &MovementValidator {
        &self.movement
    }

    pub fn batcher(&self) -> &EventBatcher {
        &self.batcher
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run `f` against the simulation under its lock
    pub fn with_simulation_mut<R>(&self, f: impl FnOnce(&mut SimulationContext) -> R) -> R {
        f(&mut self.sim.lock())
    }

    /// Add a viewer with a freshly spawned actor.
    ///
    /// The welcome and the current baseline are queued before the viewer can
    /// see any emission, so the first diff it receives applies cleanly.
    pub fn join(&self) -> Result<ViewerHandle, SessionError> {
        if !self.performance.lock().status().can_accept_viewers() {
            warn!("Rejecting viewer: {}", self.performance.lock().status_message());
            return Err(SessionError::Overloaded);
        }

        let (viewer, actor, frames) = {
            let mut sim = self.sim.lock();
            let (actor, position) = sim.spawn_actor();
            let welcome = Welcome { actor_id: actor, tick_rate: self.config.tick_rate };
            let welcome = match self.format.encode(&ServerMessage::Welcome(welcome)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    sim.remove_actor(actor);
                    return Err(e.into());
                }
            };
            self.movement.reset(actor, position);
            let (viewer, frames) = self.viewers.register(actor);
            self.batcher.register(viewer);
            self.viewers.send_to(viewer, Frame::from(welcome));
            if let Err(e) = sim.replication().send_baseline_to(viewer, self.viewers.as_ref()) {
                // Without a baseline the viewer cannot apply diffs until the next keyframe
                warn!("Failed to send baseline to viewer {}: {}", viewer, e);
                sim.replication_mut().request_keyframe();
            }
            (viewer, actor, frames)
        };

        self.batcher.enqueue_all(&[GameEvent::ActorJoined { actor_id: actor }]);
        self.metrics
            .viewers_active
            .store(self.viewers.len() as u64, Ordering::Relaxed);
        info!("Viewer {} joined as actor #{} ({} viewers)", viewer, actor, self.viewers.len());
        Ok(ViewerHandle { viewer, actor, frames })
    }

    /// Remove a viewer and every per-viewer structure; returns its actor
    pub fn leave(&self, viewer: ViewerId) -> Option<EntityId> {
        let actor = self.viewers.remove(viewer)?;
        let dropped = self.batcher.remove(viewer);
        self.movement.forget(actor);
        self.rate_limits.lock().forget(actor);
        self.sim.lock().remove_actor(actor);

        self.batcher.enqueue_all(&[GameEvent::ActorLeft { actor_id: actor }]);
        self.metrics
            .viewers_active
            .store(self.viewers.len() as u64, Ordering::Relaxed);
        info!(
            "Viewer {} left (actor #{}, {} undelivered events dropped)",
            viewer, actor, dropped
        );
        Some(actor)
    }

    /// Handle one inbound frame from a viewer.
    ///
    /// Over-rate and malformed messages are dropped here; nothing from this
    /// path reaches the tick except validated moves.
    pub fn handle_client_message(&self, viewer: ViewerId, data: &[u8]) -> Result<Inbound, SessionError> {
        let actor = self
            .viewers
            .actor_of(viewer)
            .ok_or(SessionError::UnknownViewer(viewer))?;
        self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);

        if let Err(violation) = self.rate_limits.lock().check(actor) {
            self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("actor #{}: {}", actor, violation);
            return Ok(Inbound::RateLimited);
        }

        let message: ClientMessage = match self.format.decode(data) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Malformed message from viewer {}: {}", viewer, e);
                return Err(e.into());
            }
        };

        match message {
            ClientMessage::Move { x, y } => self.handle_move(viewer, actor, Vec2::new(x, y)),
            ClientMessage::Pong { nonce } => {
                Ok(Inbound::Pong(self.viewers.record_pong(viewer, nonce, Instant::now())))
            }
        }
    }

    fn handle_move(&self, viewer: ViewerId, actor: EntityId, claimed: Vec2) -> Result<Inbound, SessionError> {
        // Brief lock: only the actor's current multiplier and position are read
        let Some(context) = self.sim.lock().move_context(actor) else {
            return Ok(Inbound::Discarded);
        };
        self.apply_claim(viewer, actor, claimed, context)
    }

    /// Validate a claim against a context read earlier and queue it for the tick
    fn apply_claim(
        &self,
        viewer: ViewerId,
        actor: EntityId,
        claimed: Vec2,
        context: MoveContext,
    ) -> Result<Inbound, SessionError> {
        let outcome = self.validate_and_queue(viewer, actor, claimed, context);

        // A concurrent `leave` may have forgotten the budget before validation
        // re-created it; `leave` removes the viewer first, so this catches it
        if !self.viewers.contains(viewer) {
            self.movement.forget(actor);
        }
        outcome
    }

    fn validate_and_queue(
        &self,
        viewer: ViewerId,
        actor: EntityId,
        claimed: Vec2,
        context: MoveContext,
    ) -> Result<Inbound, SessionError> {
        match self.movement.validate(actor, claimed, context) {
            Ok(accepted) => match self.inputs.try_send(actor, accepted.to) {
                Ok(()) => {
                    self.metrics.moves_accepted.fetch_add(1, Ordering::Relaxed);
                    Ok(Inbound::Accepted(accepted))
                }
                Err(e) => {
                    // The world never sees this move: roll the budget back to
                    // the authoritative position and tell the client
                    warn!("Dropping move from actor #{}: {}", actor, e);
                    self.movement.reset(actor, context.current_position);
                    self.send_correction(viewer, context.current_position)?;
                    Ok(Inbound::Discarded)
                }
            },
            Err(rejection) => {
                self.metrics.moves_rejected.fetch_add(1, Ordering::Relaxed);
                self.send_correction(viewer, rejection.correction())?;
                Ok(Inbound::Rejected(rejection))
            }
        }
    }

    fn send_correction(&self, viewer: ViewerId, position: Vec2) -> Result<(), SessionError> {
        let correction = MovementCorrection::from(position);
        let bytes = self.format.encode(&ServerMessage::Correction(correction))?;
        self.viewers.send_to(viewer, Frame::from(bytes));
        Ok(())
    }

    /// Run one simulation tick and fan its output out
    pub fn run_tick(&self, dt: Duration) -> TickReport {
        let cosmetics = {
            let mut performance = self.performance.lock();
            performance.tick_start();
            performance.status().can_spawn_cosmetics()
        };

        let (report, entity_count) = {
            let mut sim = self.sim.lock();
            sim.set_cosmetics(cosmetics);
            let report = sim.tick(dt, self.viewers.as_ref());
            self.metrics.record_world(sim.world());
            (report, sim.world().total_entities())
        };

        {
            let mut performance = self.performance.lock();
            if let Some(duration) = performance.tick_end(entity_count) {
                self.metrics.record_tick_time(duration);
            }
            self.metrics
                .record_performance(performance.status(), performance.budget_usage_percent());
        }

        for fault in &report.faults {
            self.metrics.tick_faults.fetch_add(1, Ordering::Relaxed);
            // A repaired actor was moved by the server; its budget restarts there
            if let TickFault::Repaired { kind: EntityKind::Actor, id, position } = fault {
                self.movement.reset(*id, *position);
            }
        }
        match report.emission {
            Some(Emission::Keyframe { .. }) => {
                self.metrics.keyframes_sent.fetch_add(1, Ordering::Relaxed);
            }
            Some(Emission::Diff { .. }) => {
                self.metrics.diffs_sent.fetch_add(1, Ordering::Relaxed);
            }
            Some(Emission::Skipped) => {
                self.metrics.emissions_skipped.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
        self.metrics.bytes_sent.store(self.viewers.bytes_sent(), Ordering::Relaxed);
        self.batcher.enqueue_all(&report.events);
        report
    }

    /// Send every viewer's pending events as one batch each
    pub fn flush_batches(&self) {
        let stats = self.batcher.flush(self.viewers.as_ref());
        if stats.batches > 0 {
            self.metrics
                .batches_sent
                .fetch_add(stats.batches as u64, Ordering::Relaxed);
        }
    }

    /// Probe every viewer's round-trip time
    pub fn send_probes(&self) {
        let server_time = server_time_ms();
        for (viewer, nonce) in self.viewers.start_probes(Instant::now()) {
            match self.format.encode(&ServerMessage::Probe(Probe { nonce, server_time })) {
                Ok(bytes) => {
                    self.viewers.send_to(viewer, Frame::from(bytes));
                }
                Err(e) => warn!("Failed to encode probe: {}", e),
            }
        }
    }

    /// Spawn the tick, flush and probe loops (plus the metrics endpoint when
    /// configured). Handles are kept until `shutdown`.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Arena session already started");
            return;
        }

        let tick_interval = self.config.tick_interval();
        let session = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Tick loop started at {} Hz", session.config.tick_rate);

            let stats_every = u64::from(session.config.tick_rate) * tick::STATS_LOG_INTERVAL_SECS;
            let mut last = Instant::now();
            let mut ticks: u64 = 0;
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let dt = now.saturating_duration_since(last).min(tick_interval * 4);
                last = now;

                session.run_tick(dt);
                ticks += 1;
                if stats_every > 0 && ticks % stats_every == 0 {
                    session.log_stats();
                }
            }
        }));

        let flush_interval = Duration::from_millis(self.config.replication.batch_flush_ms.max(1));
        let session = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                session.flush_batches();
            }
        }));

        let probe_interval = Duration::from_millis(self.config.replication.ping_interval_ms.max(1));
        let session = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                session.send_probes();
            }
        }));

        if let Some(port) = self.config.metrics_port {
            let metrics = Arc::clone(&self.metrics);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = metrics::start_metrics_server(metrics, port).await {
                    error!("Metrics server error: {}", e);
                }
            }));
        }
        info!("Arena session started with {} background tasks", tasks.len());
    }

    /// Number of background tasks currently owned
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Abort every background task. Viewers stay registered; their streams
    /// simply stop receiving frames.
    pub fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        info!("Arena session stopped ({} tasks aborted)", tasks.len());
    }

    fn log_stats(&self) {
        let (tick, entities, wave) = {
            let sim = self.sim.lock();
            let world = sim.world();
            (world.tick, world.total_entities(), world.meta.wave)
        };
        let performance = self.performance.lock();
        info!(
            "Arena: tick {}, wave {}, {} viewers, {} entities | {}",
            tick,
            wave,
            self.viewers.len(),
            entities,
            performance.status_message()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::encode_json;
    use serde_json::Value;
    use tokio_test::{assert_err, assert_ok};

    fn session_with(config: ServerConfig) -> Arc<ArenaSession> {
        let mut sim = SimulationContext::with_seed(&config, 11);
        sim.set_auto_waves(false);
        Arc::new(ArenaSession::with_simulation(sim, config, Arc::new(Metrics::new())))
    }

    fn session() -> Arc<ArenaSession> {
        session_with(ServerConfig::default())
    }

    fn drain_json(frames: &mut UnboundedReceiver<Frame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            out.push(serde_json::from_slice(&frame).unwrap());
        }
        out
    }

    fn move_message(to: Vec2) -> Vec<u8> {
        encode_json(&ClientMessage::Move { x: to.x, y: to.y }).unwrap()
    }

    fn actor_position(session: &ArenaSession, actor: EntityId) -> Vec2 {
        session.with_simulation_mut(|sim| sim.world().actors[&actor].position)
    }

    const DT: Duration = Duration::from_millis(16);

    #[tokio::test]
    async fn test_join_sends_welcome_then_replication() {
        let session = session();
        let mut handle = session.join().unwrap();

        let frames = drain_json(&mut handle.frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["actorId"], handle.actor);
        assert_eq!(frames[0]["tickRate"], 60);

        session.run_tick(DT);
        let frames = drain_json(&mut handle.frames);
        assert_eq!(frames[0]["full"], true);
        assert!(frames[0]["actor"][handle.actor.to_string()].is_object());
    }

    #[tokio::test]
    async fn test_late_joiner_receives_baseline() {
        let session = session();
        let _first = session.join().unwrap();
        session.run_tick(DT);

        let mut late = session.join().unwrap();
        let frames = drain_json(&mut late.frames);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["full"], true);
    }

    #[tokio::test]
    async fn test_accepted_move_applied_next_tick() {
        let session = session();
        let handle = session.join().unwrap();
        let start = actor_position(&session, handle.actor);
        let center = Vec2::new(1500.0, 1000.0);
        let target = start + (center - start).normalize() * 10.0;

        let outcome = assert_ok!(session.handle_client_message(handle.viewer, &move_message(target)));
        assert!(matches!(outcome, Inbound::Accepted(_)));
        assert_eq!(actor_position(&session, handle.actor), start);

        session.run_tick(DT);
        assert_eq!(actor_position(&session, handle.actor), target);
    }

    #[tokio::test]
    async fn test_teleport_corrected_for_sender_only() {
        let session = session();
        let mut cheater = session.join().unwrap();
        let mut bystander = session.join().unwrap();
        drain_json(&mut cheater.frames);
        drain_json(&mut bystander.frames);
        let start = actor_position(&session, cheater.actor);
        // Opposite corner: always well over a thousand units away
        let corner = Vec2::new(
            if start.x < 1500.0 { 2990.0 } else { 10.0 },
            if start.y < 1000.0 { 1990.0 } else { 10.0 },
        );

        let outcome = session.handle_client_message(cheater.viewer, &move_message(corner)).unwrap();
        assert!(matches!(outcome, Inbound::Rejected(MovementRejection::TooFar { .. })));

        let frames = drain_json(&mut cheater.frames);
        assert_eq!(frames.len(), 1);
        assert!((frames[0]["x"].as_f64().unwrap() as f32 - start.x).abs() < 1e-3);
        assert!((frames[0]["y"].as_f64().unwrap() as f32 - start.y).abs() < 1e-3);
        assert!(drain_json(&mut bystander.frames).is_empty());
        assert_eq!(session.metrics().moves_rejected.load(Ordering::Relaxed), 1);

        // Nothing was debited, so an honest move still goes through
        let step = start + (Vec2::new(1500.0, 1000.0) - start).normalize() * 5.0;
        let outcome = session.handle_client_message(cheater.viewer, &move_message(step)).unwrap();
        assert!(matches!(outcome, Inbound::Accepted(_)));
    }

    #[tokio::test]
    async fn test_move_dropped_by_full_queue_is_rolled_back() {
        let session = session();
        let mut handle = session.join().unwrap();
        drain_json(&mut handle.frames);
        let start = actor_position(&session, handle.actor);

        let sender = session.with_simulation_mut(|sim| sim.input_sender());
        while sender.try_send(handle.actor, start).is_ok() {}

        let target = start + (Vec2::new(1500.0, 1000.0) - start).normalize() * 10.0;
        let outcome = assert_ok!(session.handle_client_message(handle.viewer, &move_message(target)));
        assert_eq!(outcome, Inbound::Discarded);

        // Validator and world agree, and the client was sent back
        assert_eq!(session.movement().last_position(handle.actor), Some(start));
        let frames = drain_json(&mut handle.frames);
        assert_eq!(frames.len(), 1);
        assert!((frames[0]["x"].as_f64().unwrap() as f32 - start.x).abs() < 1e-3);
        assert!((frames[0]["y"].as_f64().unwrap() as f32 - start.y).abs() < 1e-3);

        session.run_tick(DT);
        assert_eq!(actor_position(&session, handle.actor), start);

        // Once drained, the same move goes through
        let outcome = assert_ok!(session.handle_client_message(handle.viewer, &move_message(target)));
        assert!(matches!(outcome, Inbound::Accepted(_)));
    }

    #[tokio::test]
    async fn test_claim_racing_leave_leaves_no_budget() {
        let session = session();
        let handle = session.join().unwrap();
        let context = session
            .with_simulation_mut(|sim| sim.move_context(handle.actor))
            .unwrap();

        // Context was read, then the viewer left before validation ran
        session.leave(handle.viewer);
        assert!(session.movement().is_empty());

        let step = context.current_position + Vec2::new(1.0, 0.0);
        session.apply_claim(handle.viewer, handle.actor, step, context).unwrap();
        assert!(session.movement().is_empty());
    }

    #[tokio::test]
    async fn test_downed_actor_moves_discarded() {
        let session = session();
        let mut handle = session.join().unwrap();
        drain_json(&mut handle.frames);
        let start = actor_position(&session, handle.actor);
        session.with_simulation_mut(|sim| {
            if let Some(actor) = sim.world_mut().actors.get_mut(&handle.actor) {
                actor.alive = false;
            }
        });
        let budget = session.movement().budget(handle.actor);

        let target = start + (Vec2::new(1500.0, 1000.0) - start).normalize() * 10.0;
        let outcome = assert_ok!(session.handle_client_message(handle.viewer, &move_message(target)));
        assert_eq!(outcome, Inbound::Discarded);
        assert_eq!(session.movement().budget(handle.actor), budget);
        assert_eq!(session.movement().last_position(handle.actor), Some(start));
        assert!(drain_json(&mut handle.frames).is_empty());
    }

    #[tokio::test]
    async fn test_out_of_arena_claim_rejected() {
        let session = session();
        let mut handle = session.join().unwrap();
        drain_json(&mut handle.frames);

        let outcome = session
            .handle_client_message(handle.viewer, &move_message(Vec2::new(-500.0, 10.0)))
            .unwrap();
        assert!(matches!(outcome, Inbound::Rejected(MovementRejection::OutOfBounds { .. })));
        assert_eq!(drain_json(&mut handle.frames).len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_messages_dropped() {
        let mut config = ServerConfig::default();
        config.movement.max_messages_per_second = 3;
        let session = session_with(config);
        let handle = session.join().unwrap();
        let pong = encode_json(&ClientMessage::Pong { nonce: 1 }).unwrap();

        let outcomes: Vec<Inbound> = (0..5)
            .map(|_| session.handle_client_message(handle.viewer, &pong).unwrap())
            .collect();
        assert_eq!(outcomes.iter().filter(|o| **o == Inbound::RateLimited).count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_viewer() {
        let session = session();
        let handle = session.join().unwrap();

        let err = assert_err!(session.handle_client_message(handle.viewer, b"{not json"));
        assert!(matches!(err, SessionError::Protocol(_)));

        let stranger = ViewerId::new_v4();
        let err = assert_err!(session.handle_client_message(stranger, b"{}"));
        assert!(matches!(err, SessionError::UnknownViewer(id) if id == stranger));
    }

    #[tokio::test]
    async fn test_probe_and_pong() {
        let session = session();
        let mut handle = session.join().unwrap();
        drain_json(&mut handle.frames);

        session.send_probes();
        let frames = drain_json(&mut handle.frames);
        let nonce = frames[0]["nonce"].as_u64().unwrap();

        let pong = encode_json(&ClientMessage::Pong { nonce }).unwrap();
        let outcome = session.handle_client_message(handle.viewer, &pong).unwrap();
        assert!(matches!(outcome, Inbound::Pong(Some(_))));
        assert!(session.viewers().average_rtt_ms(handle.viewer).is_some());
    }

    #[tokio::test]
    async fn test_events_batched_per_viewer() {
        let session = session();
        let mut first = session.join().unwrap();
        let mut second = session.join().unwrap();
        drain_json(&mut first.frames);
        drain_json(&mut second.frames);

        session.flush_batches();
        let batch = drain_json(&mut first.frames);
        assert_eq!(batch.len(), 1);
        let events = batch[0]["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["actorJoined"]["actorId"], first.actor);
        // Second viewer's join, announced to both
        assert_eq!(events[1]["actorJoined"]["actorId"], second.actor);
        assert_eq!(drain_json(&mut second.frames).len(), 1);
    }

    #[tokio::test]
    async fn test_leave_cleans_up_everything() {
        let session = session();
        let handle = session.join().unwrap();
        let pong = encode_json(&ClientMessage::Pong { nonce: 1 }).unwrap();
        session.handle_client_message(handle.viewer, &pong).unwrap();

        assert_eq!(session.leave(handle.viewer), Some(handle.actor));
        assert!(session.viewers().is_empty());
        assert!(session.movement().is_empty());
        assert!(session.rate_limits.lock().is_empty());
        assert_eq!(session.batcher().pending(handle.viewer), 0);
        assert!(session.with_simulation_mut(|sim| sim.world().actors.is_empty()));
        assert_eq!(session.leave(handle.viewer), None);
    }

    #[tokio::test]
    async fn test_start_and_shutdown_own_tasks() {
        let session = session();
        let mut handle = session.join().unwrap();
        session.start();
        assert_eq!(session.task_count(), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        session.shutdown();
        assert_eq!(session.task_count(), 0);

        let frames = drain_json(&mut handle.frames);
        assert!(frames.iter().any(|f| f["full"] == true));
        assert!(session.with_simulation_mut(|sim| sim.world().tick) > 0);
    }
}
