//! Environment animation and fixed-step actor physics.
//!
//! The engine owns the animated-element map. Every offset in it is derived
//! from trigger timestamps in the scene document plus shared time, so all
//! participants see gates, tiles, spikes and plates in the same place
//! without exchanging per-frame element state.

use crate::actor::{ActorController, RideAnchor};
use crate::config::{SceneSettings, Tuning};
use crate::events::TriggerKind;
use crate::level::{ElementId, ElementKind, LevelElement, Rect, SceneDocument};
use crate::AuthorityRequest;
use log::debug;
use std::collections::{HashMap, HashSet};

/// Shared-clock milliseconds covered by one fixed step.
pub const MS_PER_TICK: f32 = 1000.0 / 60.0;

const SPIKE_CYCLE_MS: u64 = 6000;
const SPIKE_EXTEND_AT: u64 = 2700;
const SPIKE_DANGER_AT: u64 = 3000;
const SPIKE_RETRACT_AT: u64 = 5700;

/// Phase of an animated spike within its global cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikePhase {
    Safe,
    Extending,
    Dangerous,
    Retracting,
}

/// Computes a spike's phase and vertical offset at `now`.
///
/// A retracted spike sits `height` pixels below its authored position.
/// Static spikes are pinned extended and dangerous.
pub fn spike_phase(now: u64, height: f32, is_static: bool) -> (SpikePhase, f32) {
    if is_static {
        return (SpikePhase::Dangerous, 0.0);
    }

    let t = now % SPIKE_CYCLE_MS;
    if t < SPIKE_EXTEND_AT {
        (SpikePhase::Safe, height)
    } else if t < SPIKE_DANGER_AT {
        let progress = (t - SPIKE_EXTEND_AT) as f32 / (SPIKE_DANGER_AT - SPIKE_EXTEND_AT) as f32;
        (SpikePhase::Extending, height * (1.0 - progress))
    } else if t < SPIKE_RETRACT_AT {
        (SpikePhase::Dangerous, 0.0)
    } else {
        let progress =
            (t - SPIKE_RETRACT_AT) as f32 / (SPIKE_CYCLE_MS - SPIKE_RETRACT_AT) as f32;
        (SpikePhase::Retracting, height * progress)
    }
}

/// Derived animation state of one gate, crumbling tile, spike or plate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnimatedElementState {
    pub offset: f32,
    pub target_offset: f32,
    /// Offset change produced by the latest environment advance.
    pub delta: f32,
    pub is_safe: bool,
    pub open_until: Option<u64>,
    pub collapse_started: Option<u64>,
    pub last_pressed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrumbleRequest {
    /// Requested, store has not confirmed yet.
    Pending,
    /// Store carries the collapse; re-arms once it is cleared.
    Confirmed,
}

pub struct PhysicsEngine {
    gravity: f32,
    grid_size: f32,
    scene_height: f32,
    tuning: Tuning,
    states: HashMap<ElementId, AnimatedElementState>,
    consumed_pickups: HashSet<ElementId>,
    crumble_requests: HashMap<ElementId, CrumbleRequest>,
    crumble_resets: HashSet<ElementId>,
    gate_requested_at: HashMap<ElementId, u64>,
    requests: Vec<AuthorityRequest>,
    now: u64,
}

fn approach(current: f32, target: f32, step: f32) -> f32 {
    if current < target {
        (current + step).min(target)
    } else {
        (current - step).max(target)
    }
}

impl PhysicsEngine {
    pub fn new(settings: &SceneSettings, tuning: Tuning) -> Self {
        Self {
            gravity: settings.gravity,
            grid_size: settings.grid_size,
            scene_height: settings.scene_height,
            tuning,
            states: HashMap::new(),
            consumed_pickups: HashSet::new(),
            crumble_requests: HashMap::new(),
            crumble_resets: HashSet::new(),
            gate_requested_at: HashMap::new(),
            requests: Vec::new(),
            now: 0,
        }
    }

    pub fn apply_settings(&mut self, settings: &SceneSettings) {
        self.gravity = settings.gravity;
        self.grid_size = settings.grid_size;
        self.scene_height = settings.scene_height;
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// Animated-element map, for presentation.
    pub fn element_states(&self) -> &HashMap<ElementId, AnimatedElementState> {
        &self.states
    }

    pub fn element_state(&self, id: &str) -> Option<&AnimatedElementState> {
        self.states.get(id)
    }

    /// Current vertical offset of an element; zero for static geometry.
    pub fn offset_of(&self, id: &str) -> f32 {
        self.states.get(id).map_or(0.0, |s| s.offset)
    }

    fn is_safe(&self, id: &str) -> bool {
        self.states.get(id).is_some_and(|s| s.is_safe)
    }

    /// World origin of an element including its animation offset.
    pub fn element_origin(&self, document: &SceneDocument, id: &str) -> Option<(f32, f32)> {
        document
            .element(id)
            .map(|e| (e.bounds.x, e.bounds.y + self.offset_of(id)))
    }

    /// Records a press on a plate, e.g. one reported by a remote master.
    pub fn mark_plate_pressed(&mut self, id: &str, now: u64) {
        self.states.entry(id.to_string()).or_default().last_pressed = Some(now);
    }

    /// Takes the side effects requested since the last call.
    pub fn drain_requests(&mut self) -> Vec<AuthorityRequest> {
        std::mem::take(&mut self.requests)
    }

    /// Re-derives every animated element's offset at shared time `now`.
    /// `dt` is in ticks and only scales the eased gate and plate motion.
    pub fn advance_environment(&mut self, dt: f32, now: u64, document: &SceneDocument) {
        self.now = now;
        let dt = dt.max(0.0);

        for element in &document.elements {
            if !element.kind.is_animated() {
                continue;
            }
            let height = element.bounds.height;
            let previous = self.states.get(&element.id).map_or(0.0, |s| s.offset);

            match &element.kind {
                ElementKind::Gate => {
                    let expiry = document.active_gates.get(&element.id).copied();
                    let open = expiry.is_some_and(|t| now < t);
                    let state = self.states.entry(element.id.clone()).or_default();
                    state.open_until = expiry;
                    state.target_offset = if open { -height } else { 0.0 };
                    state.offset = approach(state.offset, state.target_offset, self.tuning.gate_speed * dt);
                }
                ElementKind::CrumblingTile { wiggle_ms } => {
                    let started = document.active_crumbles.get(&element.id).copied();
                    let offset = match started {
                        Some(start) => {
                            self.crumble_requests
                                .insert(element.id.clone(), CrumbleRequest::Confirmed);
                            self.crumble_offset(&element.id, now.saturating_sub(start), *wiggle_ms)
                        }
                        None => {
                            if self.crumble_requests.get(&element.id) == Some(&CrumbleRequest::Confirmed) {
                                self.crumble_requests.remove(&element.id);
                            }
                            self.crumble_resets.remove(&element.id);
                            0.0
                        }
                    };
                    let state = self.states.entry(element.id.clone()).or_default();
                    state.collapse_started = started;
                    state.target_offset = offset;
                    state.offset = offset;
                }
                ElementKind::Spike { is_static, .. } => {
                    let (phase, offset) = spike_phase(now, height, *is_static);
                    let state = self.states.entry(element.id.clone()).or_default();
                    state.is_safe = phase == SpikePhase::Safe;
                    state.target_offset = offset;
                    state.offset = offset;
                }
                ElementKind::PressurePlate { .. } => {
                    let window = self.tuning.plate_press_window_ms;
                    let state = self.states.entry(element.id.clone()).or_default();
                    let pressed = state
                        .last_pressed
                        .is_some_and(|t| now.saturating_sub(t) < window);
                    state.target_offset = if pressed { self.tuning.plate_squash } else { 0.0 };
                    state.offset = approach(state.offset, state.target_offset, self.tuning.plate_speed * dt);
                }
                _ => {}
            }

            if let Some(state) = self.states.get_mut(&element.id) {
                state.delta = state.offset - previous;
            }
        }

        let present: HashSet<&str> = document.elements.iter().map(|e| e.id.as_str()).collect();
        self.states.retain(|id, _| present.contains(id.as_str()));
    }

    /// Offset of a collapsing tile `elapsed` ms after its trigger: a small
    /// wiggle, then a free fall, then back in place awaiting reset.
    fn crumble_offset(&mut self, id: &str, elapsed: u64, wiggle_ms: u64) -> f32 {
        if elapsed <= wiggle_ms {
            return (elapsed as f32 / 25.0).sin() * 2.0;
        }

        let fallen_ms = elapsed - wiggle_ms;
        if fallen_ms > self.tuning.crumble_reset_ms {
            if self.crumble_resets.insert(id.to_string()) {
                debug!("Crumbling tile {} settled, requesting reset", id);
                self.requests
                    .push(AuthorityRequest::ResetCrumble { id: id.to_string() });
            }
            return 0.0;
        }

        let frames = fallen_ms as f32 / MS_PER_TICK;
        0.5 * self.gravity * frames * frames
    }

    /// Advances one mastered actor by `dt` ticks, running as many fixed
    /// steps as the accumulator allows. Replicas and dead actors are left
    /// untouched.
    pub fn advance_actor(&mut self, actor: &mut ActorController, dt: f32, document: &SceneDocument) {
        if !actor.is_master() || actor.state.dead {
            return;
        }

        actor.state.accumulator += dt.clamp(0.0, self.tuning.max_frame_ticks);
        while actor.state.accumulator >= 1.0 {
            actor.state.prev_x = actor.state.x;
            actor.state.prev_y = actor.state.y;
            // A teleport inside the step restarts the accumulator.
            actor.state.accumulator -= 1.0;
            self.step(actor, document);

            if actor.state.dead {
                actor.state.accumulator = 0.0;
                break;
            }
        }
        actor.state.alpha = actor.state.accumulator;
    }

    /// One fixed 60 Hz step.
    pub fn step(&mut self, actor: &mut ActorController, document: &SceneDocument) {
        let now = self.now;
        let input = *actor.input();

        if let Some(anchor) = actor.state.riding.take() {
            if document.element(&anchor.element).is_some() {
                let current = self.offset_of(&anchor.element);
                let delta = current - anchor.offset;
                actor.state.y += delta;
                actor.state.prev_y += delta;
                actor.state.riding = Some(RideAnchor {
                    element: anchor.element,
                    offset: current,
                });
            } else {
                debug!("Dropping ride on missing element {}", anchor.element);
            }
        }

        let s = &mut actor.state;
        s.teleport_cooldown = s.teleport_cooldown.saturating_sub(1);
        if !s.on_ladder {
            if s.vy < self.tuning.short_hop_threshold && !input.jump {
                s.vy *= self.tuning.short_hop_factor;
            }
            s.vy += self.gravity;
        }
        s.vy = s.vy.min(self.tuning.terminal_velocity);

        let mut next_x = s.x + s.vx;
        let mut next_y = s.y + s.vy;
        s.on_ladder = false;
        s.touching_wall_left = false;
        s.touching_wall_right = false;
        s.pressing_plate = None;

        // Horizontal pass.
        for element in &document.elements {
            let offset = self.offset_of(&element.id);
            let probe = Rect::new(next_x, actor.state.y, actor.state.width, actor.state.height);
            if !element.touches(&probe, offset) {
                continue;
            }

            match &element.kind {
                ElementKind::Start | ElementKind::Checkpoint => actor.reach_checkpoint(element),
                ElementKind::Ladder => actor.state.on_ladder = true,
                ElementKind::PressurePlate { .. } => {}
                ElementKind::Spike { damage, .. } => {
                    if !self.is_safe(&element.id) && actor.take_damage(*damage, now) {
                        actor.state.vy = self.tuning.hazard_knockback;
                        next_y = actor.state.y + actor.state.vy;
                    }
                }
                ElementKind::Pickup { heal } => self.collect_pickup(actor, element, *heal),
                ElementKind::Portal { target } => {
                    if let Some(destination) = self.portal_destination(actor, target.as_deref(), document) {
                        let to = destination.id.clone();
                        let (x, y) = (destination.bounds.x, destination.bounds.y);
                        actor.teleport(x, y);
                        actor.state.teleport_cooldown = self.tuning.teleport_cooldown_ticks;
                        actor.push_event(TriggerKind::PortalUsed {
                            from: element.id.clone(),
                            to,
                        });
                        return;
                    }
                }
                ElementKind::Platform | ElementKind::Gate | ElementKind::CrumblingTile { .. } => {
                    let s = &mut actor.state;
                    if s.vx < 0.0 {
                        s.touching_wall_left = true;
                    } else if s.vx > 0.0 {
                        s.touching_wall_right = true;
                    }
                    s.vx = 0.0;
                    next_x = s.x;
                    break;
                }
            }
        }

        // Vertical pass at the resolved x.
        let mut on_ground = false;
        let mut ride = None;
        for element in &document.elements {
            let offset = self.offset_of(&element.id);
            let probe = Rect::new(next_x, next_y, actor.state.width, actor.state.height);
            if !element.touches(&probe, offset) {
                continue;
            }

            match &element.kind {
                ElementKind::Start | ElementKind::Checkpoint => {
                    actor.reach_checkpoint(element);
                    continue;
                }
                ElementKind::Ladder => {
                    actor.state.on_ladder = true;
                    continue;
                }
                ElementKind::Portal { .. } | ElementKind::Pickup { .. } => continue,
                ElementKind::Spike { damage, .. } => {
                    if !self.is_safe(&element.id) && actor.take_damage(*damage, now) {
                        actor.state.vy = self.tuning.hazard_knockback;
                        next_y = actor.state.y + actor.state.vy;
                    }
                    continue;
                }
                ElementKind::Platform
                | ElementKind::Gate
                | ElementKind::CrumblingTile { .. }
                | ElementKind::PressurePlate { .. } => {}
            }

            let s = &mut actor.state;
            if element.semi_permeable {
                if s.vy >= 0.0 && input.down {
                    continue;
                }
                if s.vy < 0.0 && input.jump {
                    continue;
                }
            }

            let rect = element.rect_at(offset);
            if s.vy >= 0.0 {
                let target_y = rect.y - s.height;
                let penetration = s.y + s.height - rect.y;
                if penetration <= self.tuning.landing_tolerance && target_y < next_y {
                    next_y = target_y;
                    on_ground = true;
                    s.vy = 0.0;
                    self.on_landed(actor, element, offset, &mut ride, document);
                }
            } else {
                let target_y = rect.bottom();
                if target_y > next_y {
                    next_y = target_y;
                    s.vy = 0.0;
                }
            }
        }

        let s = &mut actor.state;
        s.x = next_x;
        s.y = next_y;
        s.riding = ride;

        if on_ground {
            let fallen = s.y - s.fall_peak_y;
            let was_grounded = s.grounded;
            s.grounded = true;
            s.fall_peak_y = s.y;
            if !was_grounded && fallen > self.grid_size * self.tuning.fall_damage_grid_units {
                debug!("Actor {} fell {:.0}px", actor.id(), fallen);
                actor.take_damage(1, now);
            }
        } else {
            s.grounded = false;
            if s.on_ladder || s.y < s.fall_peak_y {
                s.fall_peak_y = s.y;
            }
        }

        if actor.state.y > self.scene_height {
            actor.die(now);
            return;
        }

        if !actor.state.dead && self.is_stuck(actor, document) {
            debug!("Actor {} is stuck inside geometry", actor.id());
            actor.die(now);
        }
    }

    fn on_landed(
        &mut self,
        actor: &mut ActorController,
        element: &LevelElement,
        offset: f32,
        ride: &mut Option<RideAnchor>,
        document: &SceneDocument,
    ) {
        match &element.kind {
            ElementKind::Gate => {
                *ride = Some(RideAnchor {
                    element: element.id.clone(),
                    offset,
                });
            }
            ElementKind::CrumblingTile { .. } => self.trigger_crumble(&element.id, document),
            ElementKind::PressurePlate { target, open_ms } => {
                self.mark_plate_pressed(&element.id, self.now);
                actor.state.pressing_plate = Some(element.id.clone());
                if let Some(gate) = target {
                    self.trigger_gate(gate, *open_ms);
                }
            }
            _ => {}
        }
    }

    fn trigger_crumble(&mut self, id: &str, document: &SceneDocument) {
        if self.crumble_requests.contains_key(id) {
            return;
        }
        if document.active_crumbles.contains_key(id) {
            self.crumble_requests
                .insert(id.to_string(), CrumbleRequest::Confirmed);
            return;
        }

        debug!("Requesting collapse of {}", id);
        self.crumble_requests
            .insert(id.to_string(), CrumbleRequest::Pending);
        self.requests.push(AuthorityRequest::StartCrumble {
            id: id.to_string(),
            started_at: self.now,
        });
    }

    fn trigger_gate(&mut self, gate: &str, duration_ms: u64) {
        let debounce = self.tuning.gate_trigger_debounce_ms;
        if self
            .gate_requested_at
            .get(gate)
            .is_some_and(|&at| self.now.saturating_sub(at) < debounce)
        {
            return;
        }

        self.gate_requested_at.insert(gate.to_string(), self.now);
        self.requests.push(AuthorityRequest::OpenGate {
            id: gate.to_string(),
            duration_ms,
        });
    }

    fn collect_pickup(&mut self, actor: &mut ActorController, element: &LevelElement, heal: u32) {
        if self.consumed_pickups.contains(&element.id) {
            return;
        }
        if !actor.heal(heal) {
            return;
        }

        self.consumed_pickups.insert(element.id.clone());
        actor.push_event(TriggerKind::ItemCollected {
            element: element.id.clone(),
            item: element.kind.label().to_string(),
        });
        self.requests.push(AuthorityRequest::ConsumePickup {
            id: element.id.clone(),
        });
    }

    fn portal_destination<'a>(
        &self,
        actor: &ActorController,
        target: Option<&str>,
        document: &'a SceneDocument,
    ) -> Option<&'a LevelElement> {
        if !actor.input().jump || actor.state.teleport_cooldown > 0 {
            return None;
        }
        let target = target?;
        let destination = document.element(target);
        if destination.is_none() {
            debug!("Portal target {} does not exist", target);
        }
        destination
    }

    fn is_stuck(&self, actor: &ActorController, document: &SceneDocument) -> bool {
        let s = &actor.state;
        let body = Rect::new(s.x, s.y, s.width, s.height).shrunk(self.tuning.stuck_shrink);
        let riding = s.riding.as_ref().map(|r| r.element.as_str());

        document.elements.iter().any(|element| {
            if element.kind.is_trigger() || element.semi_permeable {
                return false;
            }
            if riding == Some(element.id.as_str()) {
                return false;
            }
            element.touches(&body, self.offset_of(&element.id))
        })
    }
}
