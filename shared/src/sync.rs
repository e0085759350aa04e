//! Network coordination for mastered actors.
//!
//! Decides when a master broadcasts its actor, when it commits the actor's
//! position to the scene document, and where side effects requested by the
//! physics engine go: straight into the store on the elevated participant,
//! through the relay to the elevated participant everywhere else.

use crate::actor::ActorController;
use crate::config::Tuning;
use crate::error::{RelayError, StoreError};
use crate::level::{ActorId, ElementKind, SceneStore, StoreWrite};
use crate::{AuthorityRequest, Topic};
use log::{debug, info, warn};
use std::collections::HashMap;

/// Outbound side of the pub/sub relay.
pub trait Relay {
    /// Publishes to every participant, the sender included.
    fn broadcast(&mut self, topic: Topic) -> Result<(), RelayError>;

    /// Delivers a side-effect request to the elevated participant only.
    fn send_to_authority(&mut self, request: AuthorityRequest) -> Result<(), RelayError>;
}

/// Relay used when running without a connection. Every send fails, which
/// the coordinator reports once.
#[derive(Debug, Default)]
pub struct OfflineRelay;

impl Relay for OfflineRelay {
    fn broadcast(&mut self, _topic: Topic) -> Result<(), RelayError> {
        Err(RelayError::NotConnected)
    }

    fn send_to_authority(&mut self, _request: AuthorityRequest) -> Result<(), RelayError> {
        Err(RelayError::NotConnected)
    }
}

/// Applies a side-effect request to the store. Only the elevated
/// participant calls this.
pub fn apply_authority_request<S: SceneStore + ?Sized>(
    store: &mut S,
    request: &AuthorityRequest,
    now: u64,
) -> Result<(), StoreError> {
    match request {
        AuthorityRequest::ConsumePickup { id } => {
            let elements = store.elements();
            if !elements.iter().any(|e| &e.id == id) {
                return Ok(());
            }
            let remaining = elements.iter().filter(|e| &e.id != id).cloned().collect();
            info!("Pickup {} consumed", id);
            store.set_elements(remaining)
        }
        AuthorityRequest::StartCrumble { id, started_at } => {
            if store.document().active_crumbles.contains_key(id) {
                return Ok(());
            }
            store.write(StoreWrite::CrumbleStart {
                id: id.clone(),
                started_at: *started_at,
            })
        }
        AuthorityRequest::ResetCrumble { id } => {
            if !store.document().active_crumbles.contains_key(id) {
                return Ok(());
            }
            store.write(StoreWrite::ClearCrumble { id: id.clone() })
        }
        AuthorityRequest::OpenGate { id, duration_ms } => {
            let is_gate = store
                .document()
                .element(id)
                .is_some_and(|e| matches!(e.kind, ElementKind::Gate));
            if !is_gate {
                debug!("Ignoring open request for unknown gate {}", id);
                return Ok(());
            }
            store.write(StoreWrite::GateExpiry {
                id: id.clone(),
                expires_at: now + duration_ms,
            })
        }
    }
}

#[derive(Debug, Clone)]
struct PersistTrack {
    last: (f32, f32),
    moved_at: u64,
    committed: (f32, f32),
    committed_at: u64,
}

pub struct NetworkCoordinator {
    elevated: bool,
    tuning: Tuning,
    last_broadcast: HashMap<ActorId, u64>,
    on_ladder: HashMap<ActorId, bool>,
    persistence: HashMap<ActorId, PersistTrack>,
    store_failing: bool,
    relay_failing: bool,
}

impl NetworkCoordinator {
    pub fn new(elevated: bool, tuning: Tuning) -> Self {
        Self {
            elevated,
            tuning,
            last_broadcast: HashMap::new(),
            on_ladder: HashMap::new(),
            persistence: HashMap::new(),
            store_failing: false,
            relay_failing: false,
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Drops cadence bookkeeping for an actor, e.g. after an authority change.
    pub fn forget(&mut self, actor: &str) {
        self.last_broadcast.remove(actor);
        self.on_ladder.remove(actor);
        self.persistence.remove(actor);
    }

    /// Whether a master should broadcast now: on the regular cadence, or
    /// immediately when its ladder state flips.
    pub fn broadcast_due(&mut self, actor: &ActorController, now: u64) -> bool {
        if !actor.is_master() {
            return false;
        }

        let ladder = actor.state.on_ladder;
        let flipped = self
            .on_ladder
            .insert(actor.id().clone(), ladder)
            .is_some_and(|previous| previous != ladder);
        let due = self
            .last_broadcast
            .get(actor.id())
            .map_or(true, |&at| now.saturating_sub(at) >= self.tuning.broadcast_interval_ms);

        if flipped || due {
            self.last_broadcast.insert(actor.id().clone(), now);
            return true;
        }
        false
    }

    /// Position write for a master if one is due: once it has stood still
    /// long enough, on a fixed maximum interval, or right after a respawn.
    pub fn persist_due(&mut self, actor: &mut ActorController, now: u64) -> Option<StoreWrite> {
        if !actor.is_master() {
            return None;
        }

        let forced = actor.take_persist_request();
        let position = (actor.state.x, actor.state.y);
        let track = self
            .persistence
            .entry(actor.id().clone())
            .or_insert_with(|| PersistTrack {
                last: position,
                moved_at: now,
                committed: position,
                committed_at: now,
            });

        if track.last != position {
            track.last = position;
            track.moved_at = now;
        }

        let idle = now.saturating_sub(track.moved_at) >= self.tuning.persist_idle_ms
            && track.committed != position;
        let overdue = now.saturating_sub(track.committed_at) >= self.tuning.persist_max_ms;

        if !(forced || idle || overdue) {
            return None;
        }

        track.committed = position;
        track.committed_at = now;
        Some(StoreWrite::ActorPosition {
            actor: actor.id().clone(),
            x: position.0,
            y: position.1,
        })
    }

    /// Writes to the store, warning once per failure streak.
    pub fn commit<S: SceneStore + ?Sized>(&mut self, store: &mut S, write: StoreWrite) {
        match store.write(write) {
            Ok(()) => self.store_failing = false,
            Err(e) => self.store_failed(e),
        }
    }

    fn store_failed(&mut self, error: StoreError) {
        if !self.store_failing {
            warn!("Scene store write failed, continuing without persistence: {}", error);
            self.store_failing = true;
        }
    }

    pub fn publish<R: Relay + ?Sized>(&mut self, relay: &mut R, topic: Topic) {
        match relay.broadcast(topic) {
            Ok(()) => self.relay_failing = false,
            Err(e) => self.relay_failed(e),
        }
    }

    fn relay_failed(&mut self, error: RelayError) {
        if !self.relay_failing {
            warn!("Relay unavailable, multiplayer sync suspended: {}", error);
            self.relay_failing = true;
        }
    }

    /// Sends each request where it can be applied.
    pub fn route_requests<S, R>(&mut self, store: &mut S, relay: &mut R, requests: Vec<AuthorityRequest>, now: u64)
    where
        S: SceneStore + ?Sized,
        R: Relay + ?Sized,
    {
        for request in requests {
            if self.elevated {
                debug!("Applying {:?} locally", request);
                if let Err(e) = apply_authority_request(store, &request, now) {
                    self.store_failed(e);
                }
            } else {
                debug!("Forwarding {:?} to the authority", request);
                if let Err(e) = relay.send_to_authority(request) {
                    self.relay_failed(e);
                }
            }
        }
    }

    pub fn store_failing(&self) -> bool {
        self.store_failing
    }

    pub fn relay_failing(&self) -> bool {
        self.relay_failing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Authority;
    use crate::config::SceneSettings;
    use crate::level::{LevelElement, MemoryStore, PersistedActor, Rect, SceneDocument};

    #[derive(Default)]
    struct RecordingRelay {
        topics: Vec<Topic>,
        requests: Vec<AuthorityRequest>,
    }

    impl Relay for RecordingRelay {
        fn broadcast(&mut self, topic: Topic) -> Result<(), RelayError> {
            self.topics.push(topic);
            Ok(())
        }

        fn send_to_authority(&mut self, request: AuthorityRequest) -> Result<(), RelayError> {
            self.requests.push(request);
            Ok(())
        }
    }

    fn master() -> ActorController {
        ActorController::new(
            "hero",
            &PersistedActor::new(0.0, 0.0, vec!["alice".into()]),
            &SceneSettings::default(),
            Tuning::default(),
            Authority::Master,
        )
    }

    fn store_with(elements: Vec<LevelElement>) -> MemoryStore {
        let mut document = SceneDocument {
            elements,
            ..Default::default()
        };
        document
            .actors
            .insert("hero".into(), PersistedActor::new(0.0, 0.0, vec!["alice".into()]));
        MemoryStore::new(document)
    }

    #[test]
    fn test_broadcast_cadence() {
        let mut coordinator = NetworkCoordinator::new(false, Tuning::default());
        let actor = master();

        assert!(coordinator.broadcast_due(&actor, 1000));
        assert!(!coordinator.broadcast_due(&actor, 1010));
        assert!(!coordinator.broadcast_due(&actor, 1029));
        assert!(coordinator.broadcast_due(&actor, 1030));
    }

    #[test]
    fn test_ladder_flip_broadcasts_immediately() {
        let mut coordinator = NetworkCoordinator::new(false, Tuning::default());
        let mut actor = master();

        assert!(coordinator.broadcast_due(&actor, 1000));
        actor.state.on_ladder = true;
        assert!(coordinator.broadcast_due(&actor, 1005));
        assert!(!coordinator.broadcast_due(&actor, 1010));
    }

    #[test]
    fn test_replica_never_broadcasts_or_persists() {
        let mut coordinator = NetworkCoordinator::new(false, Tuning::default());
        let mut actor = master();
        actor.set_authority(Authority::Replica);

        assert!(!coordinator.broadcast_due(&actor, 0));
        assert!(coordinator.persist_due(&mut actor, 100_000).is_none());
    }

    #[test]
    fn test_persist_after_standing_still() {
        let mut coordinator = NetworkCoordinator::new(false, Tuning::default());
        let mut actor = master();

        assert!(coordinator.persist_due(&mut actor, 0).is_none());
        actor.state.x = 50.0;
        assert!(coordinator.persist_due(&mut actor, 100).is_none());
        assert!(coordinator.persist_due(&mut actor, 2000).is_none());

        let write = coordinator.persist_due(&mut actor, 2100);
        assert_eq!(
            write,
            Some(StoreWrite::ActorPosition {
                actor: "hero".into(),
                x: 50.0,
                y: 0.0
            })
        );
        // Nothing new to commit while still standing there.
        assert!(coordinator.persist_due(&mut actor, 3000).is_none());
    }

    #[test]
    fn test_persist_while_moving_on_max_interval() {
        let mut coordinator = NetworkCoordinator::new(false, Tuning::default());
        let mut actor = master();
        coordinator.persist_due(&mut actor, 0);

        let mut writes = 0;
        for step in 1..=100 {
            actor.state.x = step as f32;
            if coordinator.persist_due(&mut actor, step * 100).is_some() {
                writes += 1;
            }
        }
        assert_eq!(writes, 2);
    }

    #[test]
    fn test_respawn_forces_persist() {
        let mut coordinator = NetworkCoordinator::new(false, Tuning::default());
        let mut actor = master();
        coordinator.persist_due(&mut actor, 0);

        actor.die(10);
        actor.respawn(&SceneDocument::default(), false);
        // No start point: nothing to move to, nothing forced.
        assert!(coordinator.persist_due(&mut actor, 20).is_none());

        let mut document = SceneDocument::default();
        document.elements.push(LevelElement::new(
            "start",
            ElementKind::Start,
            Rect::new(300.0, 100.0, 10.0, 10.0),
        ));
        actor.die(30);
        actor.respawn(&document, false);
        assert!(coordinator.persist_due(&mut actor, 40).is_some());
    }

    #[test]
    fn test_elevated_applies_requests_to_store() {
        let mut coordinator = NetworkCoordinator::new(true, Tuning::default());
        let mut store = store_with(vec![
            LevelElement::new("potion", ElementKind::Pickup { heal: 1 }, Rect::new(0.0, 0.0, 10.0, 10.0)),
            LevelElement::new("door", ElementKind::Gate, Rect::new(0.0, 0.0, 10.0, 10.0)),
        ]);
        let mut relay = RecordingRelay::default();

        coordinator.route_requests(
            &mut store,
            &mut relay,
            vec![
                AuthorityRequest::ConsumePickup { id: "potion".into() },
                AuthorityRequest::OpenGate {
                    id: "door".into(),
                    duration_ms: 1000,
                },
                AuthorityRequest::StartCrumble {
                    id: "tile".into(),
                    started_at: 40,
                },
            ],
            500,
        );

        assert!(relay.requests.is_empty());
        let doc = store.document();
        assert!(doc.element("potion").is_none());
        assert_eq!(doc.active_gates.get("door"), Some(&1500));
        assert_eq!(doc.active_crumbles.get("tile"), Some(&40));
    }

    #[test]
    fn test_regular_participant_forwards_requests() {
        let mut coordinator = NetworkCoordinator::new(false, Tuning::default());
        let mut store = store_with(vec![LevelElement::new(
            "potion",
            ElementKind::Pickup { heal: 1 },
            Rect::new(0.0, 0.0, 10.0, 10.0),
        )]);
        let mut relay = RecordingRelay::default();

        coordinator.route_requests(
            &mut store,
            &mut relay,
            vec![AuthorityRequest::ConsumePickup { id: "potion".into() }],
            0,
        );

        assert_eq!(relay.requests.len(), 1);
        assert!(store.document().element("potion").is_some());
    }

    #[test]
    fn test_crumble_start_keeps_existing_timestamp() {
        let mut store = store_with(vec![]);
        apply_authority_request(
            &mut store,
            &AuthorityRequest::StartCrumble {
                id: "tile".into(),
                started_at: 10,
            },
            0,
        )
        .unwrap();
        apply_authority_request(
            &mut store,
            &AuthorityRequest::StartCrumble {
                id: "tile".into(),
                started_at: 99,
            },
            0,
        )
        .unwrap();
        assert_eq!(store.document().active_crumbles.get("tile"), Some(&10));

        apply_authority_request(&mut store, &AuthorityRequest::ResetCrumble { id: "tile".into() }, 0).unwrap();
        assert!(store.document().active_crumbles.is_empty());
    }

    #[test]
    fn test_store_failure_is_reported_once_per_streak() {
        let mut coordinator = NetworkCoordinator::new(false, Tuning::default());
        let mut store = store_with(vec![]);
        store.set_offline(true);

        coordinator.commit(&mut store, StoreWrite::ClearTransient);
        assert!(coordinator.store_failing());
        coordinator.commit(&mut store, StoreWrite::ClearTransient);
        assert!(coordinator.store_failing());

        store.set_offline(false);
        coordinator.commit(&mut store, StoreWrite::ClearTransient);
        assert!(!coordinator.store_failing());
    }

    #[test]
    fn test_offline_relay_marks_sync_suspended() {
        let mut coordinator = NetworkCoordinator::new(false, Tuning::default());
        let mut relay = OfflineRelay;
        let snapshot = master().snapshot(0, "scene", |_| None);

        coordinator.publish(&mut relay, Topic::ActorState(snapshot));
        assert!(coordinator.relay_failing());
    }
}
