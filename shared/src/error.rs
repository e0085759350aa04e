use thiserror::Error;

use crate::level::ActorId;

/// Faults raised while stepping the simulation.
///
/// Any of these returned from a frame tick stops the whole simulation: a
/// half-stepped world is worse than a stopped one.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("actor {actor} reached a non-finite state ({x}, {y})")]
    NonFiniteState { actor: ActorId, x: f32, y: f32 },

    #[error("unknown actor {0}")]
    UnknownActor(ActorId),

    #[error("simulation is not running")]
    Halted,
}

/// Failures writing to the scene document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("scene store is offline")]
    Offline,

    #[error("scene store rejected the write: {0}")]
    Rejected(String),
}

/// Failures on the pub/sub relay link.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not connected to a relay")]
    NotConnected,

    #[error("packet codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures loading a level document from disk.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read level document: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed level document: {0}")]
    Parse(#[from] serde_json::Error),
}
