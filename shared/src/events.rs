use crate::level::{ActorId, ElementId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WallSide {
    Left,
    Right,
}

/// Outward-facing trigger fired by the simulation for automation tooling.
/// The simulation never waits on a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub actor: ActorId,
    pub kind: TriggerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TriggerKind {
    Death,
    HealthChanged { health: u32, max: u32, delta: i32 },
    CheckpointReached { element: ElementId },
    ItemCollected { element: ElementId, item: String },
    PortalUsed { from: ElementId, to: ElementId },
    WallJump { side: WallSide },
}

impl TriggerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerKind::Death => "death",
            TriggerKind::HealthChanged { .. } => "health_changed",
            TriggerKind::CheckpointReached { .. } => "checkpoint_reached",
            TriggerKind::ItemCollected { .. } => "item_collected",
            TriggerKind::PortalUsed { .. } => "portal_used",
            TriggerKind::WallJump { .. } => "wall_jump",
        }
    }
}
