//! State replication: keyframes, diffs, and the idle fast path
//!
//! `emit` runs once per tick. The first emission and every Nth one send the
//! full state; the rest send a diff against the baseline, which is then
//! replaced by the current state. After every emission the baseline equals
//! exactly what viewers hold.

use tracing::{debug, trace};

use crate::config::ReplicationConfig;
use crate::game::state::WorldState;
use crate::net::delta::{compute_diff, looks_idle, ReplicationSnapshot};
use crate::net::protocol::{server_time_ms, FullSnapshot, ProtocolError, ServerMessage, WireFormat};
use crate::net::viewers::{Frame, ViewerId, ViewerSink};

/// What a call to `emit` sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    Keyframe { bytes: usize, viewers: usize },
    Diff { bytes: usize, viewers: usize },
    /// Idle check found nothing to send
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub keyframes: u64,
    pub diffs: u64,
    pub skipped: u64,
    pub bytes: u64,
    pub last_keyframe_bytes: usize,
    pub last_diff_bytes: usize,
}

pub struct ReplicationChannel {
    config: ReplicationConfig,
    format: WireFormat,
    baseline: Option<ReplicationSnapshot>,
    tick_counter: u64,
    force_keyframe: bool,
    stats: ReplicationStats,
}

impl ReplicationChannel {
    pub fn new(config: ReplicationConfig, format: WireFormat) -> Self {
        Self {
            config,
            format,
            baseline: None,
            tick_counter: 0,
            force_keyframe: false,
            stats: ReplicationStats::default(),
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// What every viewer currently holds
    pub fn baseline(&self) -> Option<&ReplicationSnapshot> {
        self.baseline.as_ref()
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats
    }

    /// Make the next emission a keyframe
    pub fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    fn is_keyframe_tick(&self) -> bool {
        let interval = u64::from(self.config.keyframe_interval.max(1));
        self.baseline.is_none() || self.force_keyframe || self.tick_counter % interval == 0
    }

    /// Replicate the world to every viewer
    pub fn emit(
        &mut self,
        world: &WorldState,
        sink: &dyn ViewerSink,
    ) -> Result<Emission, ProtocolError> {
        let keyframe = self.is_keyframe_tick();
        self.tick_counter += 1;

        if !keyframe && self.config.idle_fast_path {
            if let Some(base) = &self.baseline {
                if looks_idle(base, world, self.config.idle_sample_width, self.config.idle_move_epsilon) {
                    self.stats.skipped += 1;
                    trace!("tick {}: idle, emission skipped", world.tick);
                    return Ok(Emission::Skipped);
                }
            }
        }

        let current = ReplicationSnapshot::capture(world);
        let server_time = server_time_ms();

        let emission = match (&self.baseline, keyframe) {
            (Some(base), false) => {
                let diff = compute_diff(base, &current, server_time);
                let bytes = self.format.encode(&ServerMessage::Diff(&diff))?;
                let len = bytes.len();
                let viewers = sink.broadcast(Frame::from(bytes));
                self.stats.diffs += 1;
                self.stats.last_diff_bytes = len;
                Emission::Diff { bytes: len, viewers }
            }
            _ => {
                let full = FullSnapshot { snapshot: &current, server_time };
                let bytes = self.format.encode(&ServerMessage::Full(full))?;
                let len = bytes.len();
                let viewers = sink.broadcast(Frame::from(bytes));
                self.stats.keyframes += 1;
                self.stats.last_keyframe_bytes = len;
                self.force_keyframe = false;
                debug!(
                    "tick {}: keyframe {} bytes, {} entities",
                    world.tick,
                    len,
                    current.total_entities()
                );
                Emission::Keyframe { bytes: len, viewers }
            }
        };

        if let Emission::Keyframe { bytes, .. } | Emission::Diff { bytes, .. } = emission {
            self.stats.bytes += bytes as u64;
        }
        self.baseline = Some(current);
        Ok(emission)
    }

    /// Send the baseline as a full snapshot to one viewer, so a late joiner
    /// can apply the next diff. Returns false before the first emission.
    pub fn send_baseline_to(
        &self,
        viewer: ViewerId,
        sink: &dyn ViewerSink,
    ) -> Result<bool, ProtocolError> {
        let Some(baseline) = &self.baseline else {
            return Ok(false);
        };
        let full = FullSnapshot { snapshot: baseline, server_time: server_time_ms() };
        let bytes = self.format.encode(&ServerMessage::Full(full))?;
        Ok(sink.send_to(viewer, Frame::from(bytes)))
    }
}
