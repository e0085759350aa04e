//! Participant session: the relay-backed store, the outgoing packet queue and
//! the simulation driver, without any sockets.

use crate::input::InputSource;
use log::{debug, info, warn};
use serde_json::json;
use shared::actor::Presentation;
use shared::clock::SyncedClock;
use shared::events::TriggerEvent;
use shared::level::{MemoryStore, PersistedActor, SceneStore};
use shared::physics::MS_PER_TICK;
use shared::simulation::Simulation;
use shared::sync::Relay;
use shared::{
    ActorId, AuthorityRequest, Packet, ParticipantInfo, RelayError, SceneDocument, SimulationError,
    StoreError, StoreWrite, Topic, PROTOCOL_VERSION,
};

/// Local mirror of the relay's scene document.
///
/// Writes apply to the mirror immediately and queue up for the relay.
/// Changes made by others arrive through [`RemoteStore::apply_remote`] and
/// surface through `take_changes`.
#[derive(Debug, Default)]
pub struct RemoteStore {
    mirror: MemoryStore,
    outgoing: Vec<StoreWrite>,
    online: bool,
}

impl RemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, document: SceneDocument) {
        self.mirror.replace(document);
    }

    pub fn apply_remote(&mut self, write: StoreWrite) {
        self.mirror.apply_remote(write);
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn take_outgoing(&mut self) -> Vec<StoreWrite> {
        std::mem::take(&mut self.outgoing)
    }
}

impl SceneStore for RemoteStore {
    fn document(&self) -> &SceneDocument {
        self.mirror.document()
    }

    fn write(&mut self, write: StoreWrite) -> Result<(), StoreError> {
        if !self.online {
            return Err(StoreError::Offline);
        }
        self.mirror.write(write.clone())?;
        self.outgoing.push(write);
        Ok(())
    }

    fn take_changes(&mut self) -> Vec<StoreWrite> {
        self.mirror.take_changes()
    }
}

/// Pub/sub and authority messages waiting to go out to the relay.
#[derive(Debug, Default)]
pub struct RelayLink {
    outbox: Vec<Packet>,
    joined: bool,
}

impl RelayLink {
    pub fn take_outbox(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }
}

impl Relay for RelayLink {
    fn broadcast(&mut self, topic: Topic) -> Result<(), RelayError> {
        if !self.joined {
            return Err(RelayError::NotConnected);
        }
        self.outbox.push(Packet::Publish { topic });
        Ok(())
    }

    fn send_to_authority(&mut self, request: AuthorityRequest) -> Result<(), RelayError> {
        if !self.joined {
            return Err(RelayError::NotConnected);
        }
        self.outbox.push(Packet::ToAuthority { request });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub elevated: bool,
    /// Actor driven by the input source. Created at the start point on join
    /// if the scene does not have it yet.
    pub actor: Option<ActorId>,
}

/// One participant's view of a scene.
pub struct Session {
    config: SessionConfig,
    simulation: Simulation,
    store: RemoteStore,
    link: RelayLink,
    clock: SyncedClock,
    input: Box<dyn InputSource>,
    join_sent_at: u64,
    joined_at: Option<u64>,
    last_frame: Option<u64>,
    rejection: Option<String>,
}

impl Session {
    pub fn new(config: SessionConfig, input: Box<dyn InputSource>) -> Self {
        let local = ParticipantInfo::new(0, config.name.clone(), config.elevated);
        Self {
            simulation: Simulation::new(local, Default::default()),
            config,
            store: RemoteStore::new(),
            link: RelayLink::default(),
            clock: SyncedClock::new(),
            input,
            join_sent_at: 0,
            joined_at: None,
            last_frame: None,
            rejection: None,
        }
    }

    pub fn join_packet(&mut self, local_ms: u64) -> Packet {
        self.join_sent_at = local_ms;
        Packet::Join {
            client_version: PROTOCOL_VERSION,
            name: self.config.name.clone(),
            elevated: self.config.elevated,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined_at.is_some()
    }

    /// Reason the relay turned us away, if it did.
    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    pub fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    pub fn document(&self) -> &SceneDocument {
        self.store.document()
    }

    pub fn round_trip_ms(&self) -> u64 {
        self.clock.round_trip_ms()
    }

    /// Shared time corresponding to a local wall clock reading.
    pub fn shared_time(&self, local_ms: u64) -> u64 {
        (local_ms as i64 + self.clock.offset_ms()).max(0) as u64
    }

    /// Processes one packet from the relay received at local time
    /// `local_ms`.
    pub fn handle_packet(&mut self, packet: Packet, local_ms: u64) {
        let now = self.shared_time(local_ms);

        match packet {
            Packet::Joined {
                participant_id,
                server_time,
                document,
            } => {
                self.clock.observe(self.join_sent_at, server_time, local_ms);
                info!(
                    "Joined as participant {} (clock offset {} ms)",
                    participant_id,
                    self.clock.offset_ms()
                );

                self.simulation.set_local_id(participant_id);
                self.store.replace(document);
                self.store.set_online(true);
                self.link.joined = true;
                self.ensure_actor();
                self.simulation.start(&mut self.store);
                self.joined_at = Some(local_ms);
                self.last_frame = None;
            }

            Packet::Membership { participants } => {
                debug!("Membership: {} participant(s)", participants.len());
                self.simulation.set_membership(participants, self.store.document());
            }

            Packet::Delivered { from, topic } => {
                self.simulation.on_delivered(from, topic, now);
            }

            Packet::AuthorityRequest { from, request } => {
                self.simulation
                    .on_authority_request(&mut self.store, from, request, now);
            }

            Packet::StoreChanged { revision, write } => {
                debug!("Store revision {}", revision);
                self.store.apply_remote(write);
            }

            Packet::Pong { sent_at, server_time } => {
                self.clock.observe(sent_at, server_time, local_ms);
            }

            Packet::Rejected { reason } => {
                warn!("Relay rejected us: {}", reason);
                self.rejection = Some(reason);
                self.simulation.stop();
                self.store.set_online(false);
                self.link.joined = false;
                self.joined_at = None;
            }

            _ => {
                warn!("Unexpected packet type from relay");
            }
        }
    }

    /// Creates the controlled actor in the scene if it is missing.
    fn ensure_actor(&mut self) {
        let Some(actor) = self.config.actor.clone() else {
            return;
        };
        if self.store.document().actors.contains_key(&actor) {
            return;
        }

        let (x, y) = self
            .store
            .document()
            .start_point()
            .map(|start| (start.bounds.x, start.bounds.y))
            .unwrap_or((0.0, 0.0));

        info!("Spawning actor {} at ({}, {})", actor, x, y);
        let record = PersistedActor::new(x, y, vec![self.config.name.clone()]);
        if let Err(e) = self.store.write(StoreWrite::UpsertActor { actor, record }) {
            warn!("Failed to spawn actor: {}", e);
        }
    }

    /// Runs one frame at local time `local_ms` and returns the trigger
    /// events it fired.
    pub fn frame(&mut self, local_ms: u64) -> Result<Vec<TriggerEvent>, SimulationError> {
        let Some(joined_at) = self.joined_at else {
            return Ok(Vec::new());
        };

        let dt = match self.last_frame {
            Some(last) => local_ms.saturating_sub(last) as f32 / MS_PER_TICK,
            None => 1.0,
        };
        self.last_frame = Some(local_ms);

        let now = self.shared_time(local_ms);
        if let Some(actor) = &self.config.actor {
            let input = self.input.sample(local_ms.saturating_sub(joined_at));
            self.simulation.set_input(actor, input, now);
        }

        self.simulation.tick(dt, now, &mut self.store, &mut self.link)?;
        Ok(self.simulation.drain_events())
    }

    /// Everything waiting to be sent to the relay.
    pub fn outgoing(&mut self) -> Vec<Packet> {
        let mut packets: Vec<Packet> = self
            .store
            .take_outgoing()
            .into_iter()
            .map(|write| Packet::StoreWrite { write })
            .collect();
        packets.extend(self.link.take_outbox());
        packets
    }

    pub fn presentations(&mut self, local_ms: u64) -> Vec<(ActorId, Presentation)> {
        let now = self.shared_time(local_ms);
        self.simulation.present(now, self.store.document())
    }
}

/// One trigger event as a JSON line for automation tooling.
pub fn event_line(now: u64, event: &TriggerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({
        "time": now,
        "actor": event.actor,
        "event": event.kind.name(),
        "detail": event.kind,
    }))
}
