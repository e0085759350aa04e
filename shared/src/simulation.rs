//! The per-frame driver tying store, physics, controllers and sync together.

use crate::actor::{ActorController, Authority, InputState, Presentation};
use crate::authority::{authority_for, ParticipantInfo};
use crate::config::Tuning;
use crate::error::SimulationError;
use crate::events::TriggerEvent;
use crate::level::{ActorId, SceneDocument, SceneStore, StoreWrite};
use crate::physics::PhysicsEngine;
use crate::sync::{apply_authority_request, NetworkCoordinator, Relay};
use crate::{AuthorityRequest, ParticipantId, Topic};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;

pub struct Simulation {
    local: ParticipantInfo,
    tuning: Tuning,
    engine: PhysicsEngine,
    coordinator: NetworkCoordinator,
    controllers: BTreeMap<ActorId, ActorController>,
    connected: Vec<ParticipantInfo>,
    scene_id: String,
    running: bool,
    events: Vec<TriggerEvent>,
}

impl Simulation {
    pub fn new(local: ParticipantInfo, tuning: Tuning) -> Self {
        Self {
            engine: PhysicsEngine::new(&Default::default(), tuning.clone()),
            coordinator: NetworkCoordinator::new(local.elevated, tuning.clone()),
            connected: vec![local.clone()],
            local,
            tuning,
            controllers: BTreeMap::new(),
            scene_id: String::new(),
            running: false,
            events: Vec::new(),
        }
    }

    pub fn local(&self) -> &ParticipantInfo {
        &self.local
    }

    /// Adopts the participant id handed out by the relay.
    pub fn set_local_id(&mut self, id: ParticipantId) {
        self.connected.retain(|p| p.id != self.local.id);
        self.local.id = id;
        if !self.connected.iter().any(|p| p.id == id) {
            self.connected.push(self.local.clone());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn engine(&self) -> &PhysicsEngine {
        &self.engine
    }

    pub fn controller(&self, actor: &str) -> Option<&ActorController> {
        self.controllers.get(actor)
    }

    pub fn controllers(&self) -> impl Iterator<Item = &ActorController> {
        self.controllers.values()
    }

    /// Activates the simulation for the store's scene.
    pub fn start<S: SceneStore + ?Sized>(&mut self, store: &mut S) {
        let document = store.document();
        self.scene_id = document.scene_id.clone();
        self.engine.apply_settings(&document.settings);
        info!(
            "Starting simulation for scene '{}' as {} ({})",
            self.scene_id,
            self.local.name,
            if self.local.elevated { "elevated" } else { "regular" }
        );

        if self.local.elevated {
            self.coordinator.commit(store, StoreWrite::ClearTransient);
        }

        self.running = true;
        self.sync_actors(store.document());
    }

    /// Stops ticking and tears down every controller.
    pub fn stop(&mut self) {
        if self.running {
            info!("Stopping simulation for scene '{}'", self.scene_id);
        }
        self.running = false;
        self.controllers.clear();
    }

    /// Replaces the connected participant list and re-evaluates who
    /// simulates each actor.
    pub fn set_membership(&mut self, participants: Vec<ParticipantInfo>, document: &SceneDocument) {
        self.connected = participants;
        if !self.connected.iter().any(|p| p.id == self.local.id) {
            self.connected.push(self.local.clone());
        }
        self.reevaluate_authority(document);
    }

    fn reevaluate_authority(&mut self, document: &SceneDocument) {
        for (id, controller) in self.controllers.iter_mut() {
            let Some(record) = document.actors.get(id) else {
                continue;
            };
            let role = authority_for(&record.owners, &self.connected, self.local.id);
            if controller.set_authority(role) {
                self.coordinator.forget(id);
            }
        }
    }

    /// Creates controllers for actors that entered the scene and drops
    /// those that left.
    fn sync_actors(&mut self, document: &SceneDocument) {
        self.controllers
            .retain(|id, _| document.actors.contains_key(id));

        for (id, record) in &document.actors {
            if self.controllers.contains_key(id) {
                continue;
            }
            let role = authority_for(&record.owners, &self.connected, self.local.id);
            debug!("Actor {} entered the scene as {:?}", id, role);
            let controller =
                ActorController::new(id.clone(), record, &document.settings, self.tuning.clone(), role);
            self.controllers.insert(id.clone(), controller);
        }
    }

    pub fn set_input(&mut self, actor: &str, input: InputState, now: u64) {
        if let Some(controller) = self.controllers.get_mut(actor) {
            controller.set_input(input, now);
        }
    }

    /// Runs one render frame of `dt` ticks at shared time `now`.
    ///
    /// Any error halts the simulation: the running flag is cleared and all
    /// controllers are torn down before the error is returned.
    pub fn tick<S, R>(&mut self, dt: f32, now: u64, store: &mut S, relay: &mut R) -> Result<(), SimulationError>
    where
        S: SceneStore + ?Sized,
        R: Relay + ?Sized,
    {
        if !self.running {
            return Err(SimulationError::Halted);
        }

        match self.run_frame(dt, now, store, relay) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Simulation halted: {}", e);
                self.stop();
                Err(e)
            }
        }
    }

    fn run_frame<S, R>(&mut self, dt: f32, now: u64, store: &mut S, relay: &mut R) -> Result<(), SimulationError>
    where
        S: SceneStore + ?Sized,
        R: Relay + ?Sized,
    {
        for change in store.take_changes() {
            self.on_store_change(&change, store.document());
        }
        self.sync_actors(store.document());

        let document = store.document();
        if !document.settings.enabled {
            return Ok(());
        }

        self.engine.advance_environment(dt, now, document);

        let mut snapshots = Vec::new();
        let mut writes = Vec::new();
        let mut fresh = Vec::new();
        for controller in self.controllers.values_mut() {
            controller.update_timers(now, document);
            if controller.authority() != Authority::Master {
                continue;
            }

            controller.handle_input(now);
            self.engine.advance_actor(controller, dt, document);

            let s = &controller.state;
            if !s.x.is_finite() || !s.y.is_finite() {
                return Err(SimulationError::NonFiniteState {
                    actor: controller.id().clone(),
                    x: s.x,
                    y: s.y,
                });
            }

            if self.coordinator.broadcast_due(controller, now) {
                let engine = &self.engine;
                snapshots.push(controller.snapshot(now, &document.scene_id, |id| {
                    engine.element_origin(document, id)
                }));
            }
            if let Some(write) = self.coordinator.persist_due(controller, now) {
                writes.push(write);
            }
            fresh.extend(controller.drain_events());
        }

        let requests = self.engine.drain_requests();
        for write in writes {
            self.coordinator.commit(store, write);
        }
        self.coordinator.route_requests(store, relay, requests, now);

        for snapshot in snapshots {
            self.coordinator.publish(relay, Topic::ActorState(snapshot));
        }
        for event in &fresh {
            debug!("Trigger {} for {}", event.kind.name(), event.actor);
            self.coordinator.publish(relay, Topic::Trigger(event.clone()));
        }
        self.events.extend(fresh);
        Ok(())
    }

    fn on_store_change(&mut self, change: &StoreWrite, document: &SceneDocument) {
        match change {
            StoreWrite::ActorPosition { actor, x, y } => {
                let Some(controller) = self.controllers.get_mut(actor) else {
                    return;
                };
                let dx = controller.state.x - x;
                let dy = controller.state.y - y;
                let threshold = self.tuning.teleport_threshold;
                if dx.abs() > threshold || dy.abs() > threshold {
                    info!("Actor {} repositioned externally", actor);
                    controller.teleport(*x, *y);
                    self.coordinator.forget(actor);
                }
            }
            StoreWrite::Settings(settings) => {
                self.engine.apply_settings(settings);
                for controller in self.controllers.values_mut() {
                    controller.set_move_speed(settings.move_speed);
                }
            }
            StoreWrite::UpsertActor { .. } | StoreWrite::RemoveActor { .. } => {
                self.sync_actors(document);
                self.reevaluate_authority(document);
            }
            StoreWrite::Elements(_)
            | StoreWrite::GateExpiry { .. }
            | StoreWrite::CrumbleStart { .. }
            | StoreWrite::ClearCrumble { .. }
            | StoreWrite::ClearTransient => {}
        }
    }

    /// Handles a topic delivered by the relay.
    pub fn on_delivered(&mut self, from: ParticipantId, topic: Topic, now: u64) {
        if from == self.local.id {
            return;
        }

        match topic {
            Topic::ActorState(snapshot) => {
                if snapshot.scene_id != self.scene_id {
                    return;
                }
                let Some(controller) = self.controllers.get_mut(&snapshot.actor) else {
                    debug!("Snapshot for unknown actor {}", snapshot.actor);
                    return;
                };
                if let Some(plate) = controller.on_snapshot(snapshot) {
                    self.engine.mark_plate_pressed(&plate, now);
                }
            }
            Topic::Trigger(event) => {
                debug!("Remote trigger {} for {}", event.kind.name(), event.actor);
            }
        }
    }

    /// Applies a side effect forwarded by another participant.
    pub fn on_authority_request<S: SceneStore + ?Sized>(
        &mut self,
        store: &mut S,
        from: ParticipantId,
        request: AuthorityRequest,
        now: u64,
    ) {
        if !self.local.elevated {
            warn!("Dropping authority request from {}: not elevated", from);
            return;
        }
        debug!("Applying {:?} for participant {}", request, from);
        if let Err(e) = apply_authority_request(store, &request, now) {
            warn!("Failed to apply request from {}: {}", from, e);
        }
    }

    /// Drawn state of every actor for this frame.
    pub fn present(&mut self, now: u64, document: &SceneDocument) -> Vec<(ActorId, Presentation)> {
        let engine = &self.engine;
        self.controllers
            .iter_mut()
            .map(|(id, controller)| {
                let presentation = controller.present(now, |element| engine.element_origin(document, element));
                (id.clone(), presentation)
            })
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<TriggerEvent> {
        std::mem::take(&mut self.events)
    }

    fn controller_mut(&mut self, actor: &str) -> Result<&mut ActorController, SimulationError> {
        self.controllers
            .get_mut(actor)
            .ok_or_else(|| SimulationError::UnknownActor(actor.to_string()))
    }

    /// Automation action: restore full health.
    pub fn reset_health(&mut self, actor: &str) -> Result<(), SimulationError> {
        self.controller_mut(actor)?.reset_health();
        Ok(())
    }

    /// Automation action: add or remove health through the damage rules.
    pub fn modify_health(&mut self, actor: &str, delta: i32, now: u64) -> Result<bool, SimulationError> {
        Ok(self.controller_mut(actor)?.modify_health(delta, now))
    }

    /// Automation action: respawn, keeping health when `soft`.
    pub fn respawn(&mut self, actor: &str, soft: bool, document: &SceneDocument) -> Result<(), SimulationError> {
        self.controller_mut(actor)?.respawn(document, soft);
        Ok(())
    }
}
