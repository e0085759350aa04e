//! Simulation core for a multi-participant 2D platformer.
//!
//! Participants never talk to each other directly. Everything goes through
//! a relay that offers pub/sub delivery, authority-only routing and a shared
//! scene document. This crate holds the parts every participant runs: the
//! physics engine, actor controllers, the authority decision, the network
//! coordinator, and the wire types exchanged with the relay.

pub mod actor;
pub mod authority;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod level;
pub mod physics;
pub mod simulation;
pub mod snapshot;
pub mod sync;

pub use authority::{decide_authority, ParticipantInfo};
pub use error::{RelayError, SimulationError, StoreError};
pub use level::{ActorId, ElementId, ParticipantId, SceneDocument, StoreWrite};

use events::TriggerEvent;
use serde::{Deserialize, Serialize};
use snapshot::NetworkSnapshot;

pub const PROTOCOL_VERSION: u32 = 1;

/// Payload published to every participant in the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Topic {
    ActorState(NetworkSnapshot),
    Trigger(TriggerEvent),
}

/// Side effect a participant may not apply itself; the elevated
/// participant performs it on everyone's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuthorityRequest {
    ConsumePickup { id: ElementId },
    StartCrumble { id: ElementId, started_at: u64 },
    ResetCrumble { id: ElementId },
    OpenGate { id: ElementId, duration_ms: u64 },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Join {
        client_version: u32,
        name: String,
        elevated: bool,
    },
    Publish {
        topic: Topic,
    },
    ToAuthority {
        request: AuthorityRequest,
    },
    StoreWrite {
        write: StoreWrite,
    },
    Ping {
        sent_at: u64,
    },
    Leave,

    Joined {
        participant_id: ParticipantId,
        server_time: u64,
        document: SceneDocument,
    },
    Membership {
        participants: Vec<ParticipantInfo>,
    },
    Delivered {
        from: ParticipantId,
        topic: Topic,
    },
    AuthorityRequest {
        from: ParticipantId,
        request: AuthorityRequest,
    },
    StoreChanged {
        revision: u64,
        write: StoreWrite,
    },
    Pong {
        sent_at: u64,
        server_time: u64,
    },
    Rejected {
        reason: String,
    },
}
