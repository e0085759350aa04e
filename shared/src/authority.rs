//! Who simulates which actor.

use crate::actor::Authority;
use crate::level::ParticipantId;
use serde::{Deserialize, Serialize};

/// A participant currently connected to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub name: String,
    /// Elevated participants own every actor and apply side effects for
    /// the others.
    pub elevated: bool,
}

impl ParticipantInfo {
    pub fn new(id: ParticipantId, name: impl Into<String>, elevated: bool) -> Self {
        Self {
            id,
            name: name.into(),
            elevated,
        }
    }
}

/// Picks the participant that simulates an actor.
///
/// A connected regular owner always wins, lowest id first. Failing that the
/// lowest-id connected elevated participant takes over. With neither
/// connected nobody simulates the actor.
pub fn decide_authority(owners: &[String], connected: &[ParticipantInfo]) -> Option<ParticipantId> {
    let owner = connected
        .iter()
        .filter(|p| !p.elevated && owners.iter().any(|o| o == &p.name))
        .map(|p| p.id)
        .min();

    owner.or_else(|| connected.iter().filter(|p| p.elevated).map(|p| p.id).min())
}

/// The role `local` plays for an actor with the given owners.
pub fn authority_for(owners: &[String], connected: &[ParticipantInfo], local: ParticipantId) -> Authority {
    if decide_authority(owners, connected) == Some(local) {
        Authority::Master
    } else {
        Authority::Replica
    }
}
