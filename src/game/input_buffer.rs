//! Lock-free hand-off of validated moves to the tick
//!
//! Inbound handlers validate movement off the tick and push accepted moves
//! through a bounded crossbeam channel; the tick drains it at the start of
//! the next iteration so the simulation stays the single writer of entity
//! mappings.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::game::state::EntityId;
use crate::util::vec2::Vec2;

/// A move that passed the movement budget check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatedMove {
    pub actor: EntityId,
    pub position: Vec2,
}

/// Bounded MPSC queue of validated moves
pub struct InputBuffer {
    sender: Sender<ValidatedMove>,
    receiver: Receiver<ValidatedMove>,
    capacity: usize,
}

impl InputBuffer {
    /// Capacity should cover every move that can arrive between two ticks
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// New sender handle for an inbound handler
    pub fn sender(&self) -> InputSender {
        InputSender {
            sender: self.sender.clone(),
        }
    }

    /// Drain all pending moves for this tick
    pub fn drain(&self) -> Vec<ValidatedMove> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Clonable sender handle
#[derive(Clone)]
pub struct InputSender {
    sender: Sender<ValidatedMove>,
}

impl InputSender {
    /// Submit a move without blocking
    #[inline]
    pub fn try_send(&self, actor: EntityId, position: Vec2) -> Result<(), InputBufferError> {
        self.sender
            .try_send(ValidatedMove { actor, position })
            .map_err(|e| match e {
                TrySendError::Full(_) => InputBufferError::Full,
                TrySendError::Disconnected(_) => InputBufferError::Disconnected,
            })
    }
}

/// Input buffer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InputBufferError {
    #[error("input buffer is full")]
    Full,
    #[error("simulation is no longer draining inputs")]
    Disconnected,
}
