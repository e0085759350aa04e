//! Per-actor state and control.
//!
//! An [`ActorController`] is the single owner of one actor's position data.
//! On the master participant it turns input into velocity and jump intent
//! and is stepped by the physics engine; on every other participant it is a
//! replica fed from the snapshot buffer and never stepped.

use crate::config::{SceneSettings, Tuning};
use crate::events::{TriggerEvent, TriggerKind, WallSide};
use crate::level::{ActorId, ElementId, LevelElement, PersistedActor, SceneDocument};
use crate::snapshot::{NetworkSnapshot, RelativePosition, SnapshotBuffer};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Which role this participant plays for an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authority {
    /// Simulates the actor and broadcasts its state.
    Master,
    /// Renders the actor from received snapshots only.
    Replica,
}

/// Raw directional input for one actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputState {
    pub left: bool,
    pub right: bool,
    /// Jump; doubles as "climb up" on ladders.
    pub jump: bool,
    /// Drop through one-way platforms; "climb down" on ladders.
    pub down: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub element: ElementId,
    pub x: f32,
    pub y: f32,
}

/// Element an actor is standing on, with the element's offset at the time
/// the actor was last carried by it.
#[derive(Debug, Clone, PartialEq)]
pub struct RideAnchor {
    pub element: ElementId,
    pub offset: f32,
}

#[derive(Debug, Clone)]
pub struct ActorState {
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub width: f32,
    pub height: f32,
    /// Position before the latest fixed step, for presentation blending.
    pub prev_x: f32,
    pub prev_y: f32,
    pub grounded: bool,
    pub on_ladder: bool,
    pub touching_wall_left: bool,
    pub touching_wall_right: bool,
    pub facing_right: bool,
    pub health: u32,
    pub max_health: u32,
    pub dead: bool,
    pub last_checkpoint: Option<Checkpoint>,
    pub authority: Authority,
    pub riding: Option<RideAnchor>,
    pub pressing_plate: Option<ElementId>,
    /// Highest point (smallest y) since last standing on something.
    pub fall_peak_y: f32,
    pub teleport_cooldown: u32,
    pub coyote_until: u64,
    pub wall_coyote_left_until: u64,
    pub wall_coyote_right_until: u64,
    pub jump_buffered_at: Option<u64>,
    pub last_wall_jump: Option<WallSide>,
    pub invulnerable_until: u64,
    /// Unconsumed fraction of a fixed step.
    pub accumulator: f32,
    /// Blend factor between previous and current step position.
    pub alpha: f32,
}

impl ActorState {
    pub fn new(x: f32, y: f32, width: f32, height: f32, max_health: u32, authority: Authority) -> Self {
        Self {
            x,
            y,
            vx: 0.0,
            vy: 0.0,
            width,
            height,
            prev_x: x,
            prev_y: y,
            grounded: false,
            on_ladder: false,
            touching_wall_left: false,
            touching_wall_right: false,
            facing_right: true,
            health: max_health,
            max_health,
            dead: false,
            last_checkpoint: None,
            authority,
            riding: None,
            pressing_plate: None,
            fall_peak_y: y,
            teleport_cooldown: 0,
            coyote_until: 0,
            wall_coyote_left_until: 0,
            wall_coyote_right_until: 0,
            jump_buffered_at: None,
            last_wall_jump: None,
            invulnerable_until: 0,
            accumulator: 0.0,
            alpha: 0.0,
        }
    }
}

/// Where and how an actor should be drawn this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Presentation {
    pub x: f32,
    pub y: f32,
    pub facing_right: bool,
    pub health: u32,
    pub max_health: u32,
    pub dead: bool,
}

pub struct ActorController {
    id: ActorId,
    pub state: ActorState,
    input: InputState,
    move_speed: f32,
    tuning: Tuning,
    buffer: SnapshotBuffer,
    events: Vec<TriggerEvent>,
    respawn_at: Option<u64>,
    needs_persist: bool,
}

impl ActorController {
    pub fn new(
        id: impl Into<ActorId>,
        record: &PersistedActor,
        settings: &SceneSettings,
        tuning: Tuning,
        authority: Authority,
    ) -> Self {
        let state = ActorState::new(
            record.x,
            record.y,
            record.width,
            record.height,
            tuning.max_health,
            authority,
        );
        Self {
            id: id.into(),
            state,
            input: InputState::default(),
            move_speed: settings.move_speed,
            buffer: SnapshotBuffer::new(tuning.snapshot_capacity),
            tuning,
            events: Vec::new(),
            respawn_at: None,
            needs_persist: false,
        }
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn authority(&self) -> Authority {
        self.state.authority
    }

    pub fn is_master(&self) -> bool {
        self.state.authority == Authority::Master
    }

    pub fn input(&self) -> &InputState {
        &self.input
    }

    pub fn buffer(&self) -> &SnapshotBuffer {
        &self.buffer
    }

    pub fn set_move_speed(&mut self, move_speed: f32) {
        self.move_speed = move_speed;
    }

    /// Replaces the held input. A fresh jump press is remembered for the
    /// jump-buffer window so it can fire slightly before landing.
    pub fn set_input(&mut self, input: InputState, now: u64) {
        if input.jump && !self.input.jump {
            self.state.jump_buffered_at = Some(now);
        }
        self.input = input;
    }

    /// Switches role. Returns true if the role changed.
    pub fn set_authority(&mut self, authority: Authority) -> bool {
        if self.state.authority == authority {
            return false;
        }
        self.state.authority = authority;

        match authority {
            Authority::Replica => {
                self.state.vx = 0.0;
                self.state.vy = 0.0;
                self.input = InputState::default();
            }
            Authority::Master => {
                self.input = InputState::default();
                self.state.accumulator = 0.0;
                self.state.prev_x = self.state.x;
                self.state.prev_y = self.state.y;
                self.state.fall_peak_y = self.state.y;
                // Died under the previous master, which owned the respawn timer.
                if self.state.dead && self.respawn_at.is_none() {
                    self.respawn_at = Some(0);
                }
            }
        }
        self.buffer.clear();
        info!("Actor {} is now {:?} on this participant", self.id, authority);
        true
    }

    /// Turns held input into velocity and jump intent for this frame.
    pub fn handle_input(&mut self, now: u64) {
        if self.state.dead {
            return;
        }
        if !self.is_master() {
            self.state.vx = 0.0;
            return;
        }

        let speed = self.move_speed;
        let s = &mut self.state;

        if self.input.left {
            s.vx = -speed;
            s.facing_right = false;
        } else if self.input.right {
            s.vx = speed;
            s.facing_right = true;
        } else {
            s.vx = 0.0;
        }

        if s.on_ladder {
            let climb = speed * self.tuning.ladder_speed_factor;
            s.vy = if self.input.jump {
                -climb
            } else if self.input.down {
                climb
            } else {
                0.0
            };
            return;
        }

        if s.grounded {
            s.coyote_until = now + self.tuning.coyote_ms;
            s.last_wall_jump = None;
        }
        if s.touching_wall_left {
            s.wall_coyote_left_until = now + self.tuning.wall_coyote_ms;
        }
        if s.touching_wall_right {
            s.wall_coyote_right_until = now + self.tuning.wall_coyote_ms;
        }

        let buffered = s
            .jump_buffered_at
            .is_some_and(|at| now.saturating_sub(at) < self.tuning.jump_buffer_ms);

        if self.input.jump || buffered {
            if s.grounded || now < s.coyote_until {
                s.vy = self.tuning.jump_force;
                s.grounded = false;
                s.coyote_until = 0;
                s.jump_buffered_at = None;
            } else if let Some(side) = Self::wall_jump_side(s, now) {
                s.vy = self.tuning.jump_force;
                s.fall_peak_y = s.y;
                s.jump_buffered_at = None;
                s.last_wall_jump = Some(side);
                match side {
                    WallSide::Left => {
                        s.vx = speed;
                        s.touching_wall_left = false;
                        s.wall_coyote_left_until = 0;
                    }
                    WallSide::Right => {
                        s.vx = -speed;
                        s.touching_wall_right = false;
                        s.wall_coyote_right_until = 0;
                    }
                }
                self.push_event(TriggerKind::WallJump { side });
            }
        }
    }

    fn wall_jump_side(s: &ActorState, now: u64) -> Option<WallSide> {
        let left = s.touching_wall_left || now < s.wall_coyote_left_until;
        let right = s.touching_wall_right || now < s.wall_coyote_right_until;

        if left && s.last_wall_jump != Some(WallSide::Left) {
            Some(WallSide::Left)
        } else if right && s.last_wall_jump != Some(WallSide::Right) {
            Some(WallSide::Right)
        } else {
            None
        }
    }

    /// Applies damage. Returns false if it was ignored (replica, dead, or
    /// still invulnerable from the previous hit).
    pub fn take_damage(&mut self, amount: u32, now: u64) -> bool {
        if !self.is_master() || self.state.dead || now < self.state.invulnerable_until {
            return false;
        }

        self.state.health = self.state.health.saturating_sub(amount);
        self.state.invulnerable_until = now + self.tuning.invulnerability_ms;
        self.push_event(TriggerKind::HealthChanged {
            health: self.state.health,
            max: self.state.max_health,
            delta: -(amount as i32),
        });

        if self.state.health == 0 {
            self.die(now);
        }
        true
    }

    /// Restores health. Returns false if ignored (replica, dead, or full).
    pub fn heal(&mut self, amount: u32) -> bool {
        if !self.is_master() || self.state.dead || self.state.health >= self.state.max_health {
            return false;
        }

        self.state.health = (self.state.health + amount).min(self.state.max_health);
        self.push_event(TriggerKind::HealthChanged {
            health: self.state.health,
            max: self.state.max_health,
            delta: amount as i32,
        });
        true
    }

    pub fn die(&mut self, now: u64) {
        if self.state.dead {
            return;
        }
        info!("Actor {} died", self.id);

        let s = &mut self.state;
        s.dead = true;
        s.health = 0;
        s.vx = 0.0;
        s.vy = 0.0;
        s.riding = None;
        s.accumulator = 0.0;
        self.respawn_at = Some(now + self.tuning.respawn_delay_ms);
        self.push_event(TriggerKind::Death);
    }

    pub fn reach_checkpoint(&mut self, element: &LevelElement) {
        if !self.is_master() {
            return;
        }
        let already = self
            .state
            .last_checkpoint
            .as_ref()
            .is_some_and(|cp| cp.element == element.id);
        if already {
            return;
        }

        info!("Actor {} reached checkpoint {}", self.id, element.id);
        self.state.last_checkpoint = Some(Checkpoint {
            element: element.id.clone(),
            x: element.bounds.x,
            y: element.bounds.y,
        });
        self.push_event(TriggerKind::CheckpointReached {
            element: element.id.clone(),
        });
    }

    /// Runs the pending respawn once its delay has passed.
    pub fn update_timers(&mut self, now: u64, document: &SceneDocument) {
        if self.state.dead && self.respawn_at.is_some_and(|at| now >= at) {
            self.respawn(document, false);
        }
    }

    /// Brings the actor back at its last checkpoint, or the scene start.
    ///
    /// A hard respawn also restores full health; a soft one only moves a
    /// living actor back.
    pub fn respawn(&mut self, document: &SceneDocument, soft: bool) {
        if !self.is_master() {
            return;
        }
        if !soft {
            self.state.health = self.state.max_health;
            self.state.invulnerable_until = 0;
        }
        if !self.state.dead && !soft {
            return;
        }

        self.respawn_at = None;
        let s = &mut self.state;
        s.dead = false;
        s.vx = 0.0;
        s.vy = 0.0;

        if s.last_checkpoint.is_none() {
            s.last_checkpoint = document.start_point().map(|start| Checkpoint {
                element: start.id.clone(),
                x: start.bounds.x,
                y: start.bounds.y,
            });
        }

        if let Some(cp) = &s.last_checkpoint {
            let (x, y) = (cp.x, cp.y);
            self.place(x, y);
            self.needs_persist = true;
        }
        info!("Actor {} respawned at ({:.0}, {:.0})", self.id, self.state.x, self.state.y);
    }

    /// Restores full health without other side effects.
    pub fn reset_health(&mut self) {
        self.state.health = self.state.max_health;
    }

    /// Adds or removes health through the regular damage/heal rules.
    pub fn modify_health(&mut self, delta: i32, now: u64) -> bool {
        match delta {
            d if d < 0 => self.take_damage(d.unsigned_abs(), now),
            d if d > 0 => self.heal(d as u32),
            _ => false,
        }
    }

    /// Hard reposition from outside the simulation: no smoothing, no
    /// carried velocity, no stale snapshots.
    pub fn teleport(&mut self, x: f32, y: f32) {
        debug!("Actor {} teleported to ({:.0}, {:.0})", self.id, x, y);
        self.place(x, y);
        self.state.vx = 0.0;
        self.state.vy = 0.0;
        self.buffer.clear();
    }

    fn place(&mut self, x: f32, y: f32) {
        let s = &mut self.state;
        s.x = x;
        s.y = y;
        s.prev_x = x;
        s.prev_y = y;
        s.fall_peak_y = y;
        s.riding = None;
        s.grounded = false;
        s.accumulator = 0.0;
    }

    /// Buffers a snapshot received for this actor. Returns the plate the
    /// master reports pressing, if any.
    pub fn on_snapshot(&mut self, snapshot: NetworkSnapshot) -> Option<ElementId> {
        if self.is_master() {
            return None;
        }

        self.state.health = snapshot.health;
        self.state.dead = snapshot.health == 0;
        let plate = snapshot.pressing_plate.clone();
        self.buffer.push(snapshot);
        plate
    }

    /// Builds the broadcast snapshot. `locate` yields the current world
    /// origin of an element, used to express riding actors relative to it.
    pub fn snapshot<F>(&self, now: u64, scene_id: &str, locate: F) -> NetworkSnapshot
    where
        F: Fn(&str) -> Option<(f32, f32)>,
    {
        let s = &self.state;
        let riding = s.riding.as_ref().and_then(|anchor| {
            locate(&anchor.element).map(|(px, py)| RelativePosition {
                element: anchor.element.clone(),
                x: s.x - px,
                y: s.y - py,
            })
        });

        NetworkSnapshot {
            actor: self.id.clone(),
            scene_id: scene_id.to_string(),
            timestamp: now,
            x: s.x,
            y: s.y,
            vx: s.vx,
            vy: s.vy,
            facing_right: s.facing_right,
            riding,
            health: s.health,
            pressing_plate: s.pressing_plate.clone(),
        }
    }

    /// Computes the drawn position for this frame.
    ///
    /// Masters blend their last two fixed-step positions; replicas sample
    /// the snapshot buffer one render delay in the past.
    pub fn present<F>(&mut self, now: u64, locate: F) -> Presentation
    where
        F: Fn(&str) -> Option<(f32, f32)>,
    {
        let (x, y) = if self.is_master() {
            let s = &self.state;
            let a = s.alpha;
            (
                s.prev_x * (1.0 - a) + s.x * a,
                s.prev_y * (1.0 - a) + s.y * a,
            )
        } else {
            let render_time = now.saturating_sub(self.tuning.render_delay_ms);
            match self.buffer.sample(render_time, locate) {
                Some(sample) => {
                    self.state.x = sample.x;
                    self.state.y = sample.y;
                    self.state.facing_right = sample.facing_right;
                    (sample.x, sample.y)
                }
                None => (self.state.x, self.state.y),
            }
        };

        Presentation {
            x,
            y,
            facing_right: self.state.facing_right,
            health: self.state.health,
            max_health: self.state.max_health,
            dead: self.state.dead,
        }
    }

    pub fn push_event(&mut self, kind: TriggerKind) {
        self.events.push(TriggerEvent {
            actor: self.id.clone(),
            kind,
        });
    }

    pub fn drain_events(&mut self) -> Vec<TriggerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Returns and clears the request to persist position right away.
    pub fn take_persist_request(&mut self) -> bool {
        std::mem::take(&mut self.needs_persist)
    }
}
