//! Level geometry and the shared scene document.
//!
//! The scene document is the persisted, last-writer-wins record every
//! participant mirrors: the ordered level elements, the trigger timestamps
//! that drive animated elements, the scene settings, and the last committed
//! position of every actor. The simulation only reads it, except for the
//! handful of [`StoreWrite`]s it requests (pickup removal, collapse and gate
//! timers, actor positions).

use crate::config::SceneSettings;
use crate::error::{DocumentError, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub type ElementId = String;
pub type ActorId = String;
pub type ParticipantId = u32;

/// Horizontal slack removed from both sides of a probe box before overlap
/// tests, so boxes standing flush against a wall do not snag on it.
const PROBE_MARGIN_X: f32 = 0.1;

/// Axis-aligned rectangle in scene pixels, y growing downward.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn translated(&self, dx: f32, dy: f32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Returns the rectangle shrunk by `by` on every side.
    pub fn shrunk(&self, by: f32) -> Rect {
        Rect::new(
            self.x + by,
            self.y + by,
            self.width - by * 2.0,
            self.height - by * 2.0,
        )
    }

    /// Strict overlap; touching edges do not count.
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.right()
            && self.right() > other.x
            && self.y < other.bottom()
            && self.bottom() > other.y
    }

    fn probe_overlaps(&self, target: &Rect) -> bool {
        let narrowed = Rect::new(
            self.x + PROBE_MARGIN_X,
            self.y,
            self.width - PROBE_MARGIN_X * 2.0,
            self.height,
        );
        narrowed.overlaps(target)
    }
}

fn default_damage() -> u32 {
    1
}

fn default_heal() -> u32 {
    1
}

fn default_open_ms() -> u64 {
    1000
}

fn default_wiggle_ms() -> u64 {
    500
}

/// Closed set of level element kinds with their kind-specific linkage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Platform,
    Spike {
        /// Pins the spike in its extended, always-dangerous position.
        #[serde(default)]
        is_static: bool,
        #[serde(default = "default_damage")]
        damage: u32,
    },
    Start,
    Checkpoint,
    Ladder,
    PressurePlate {
        /// Gate opened while the plate is pressed.
        #[serde(default)]
        target: Option<ElementId>,
        #[serde(default = "default_open_ms")]
        open_ms: u64,
    },
    Gate,
    CrumblingTile {
        #[serde(default = "default_wiggle_ms")]
        wiggle_ms: u64,
    },
    Portal {
        #[serde(default)]
        target: Option<ElementId>,
    },
    Pickup {
        #[serde(default = "default_heal")]
        heal: u32,
    },
}

impl ElementKind {
    /// Kinds whose rectangle carries a time-derived vertical offset.
    pub fn is_animated(&self) -> bool {
        matches!(
            self,
            ElementKind::Gate
                | ElementKind::CrumblingTile { .. }
                | ElementKind::Spike { .. }
                | ElementKind::PressurePlate { .. }
        )
    }

    /// Kinds that never count as solid for the anti-stuck check.
    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            ElementKind::Start
                | ElementKind::Checkpoint
                | ElementKind::Ladder
                | ElementKind::Pickup { .. }
                | ElementKind::PressurePlate { .. }
                | ElementKind::Spike { .. }
                | ElementKind::Portal { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ElementKind::Platform => "platform",
            ElementKind::Spike { .. } => "spike",
            ElementKind::Start => "start",
            ElementKind::Checkpoint => "checkpoint",
            ElementKind::Ladder => "ladder",
            ElementKind::PressurePlate { .. } => "pressure_plate",
            ElementKind::Gate => "gate",
            ElementKind::CrumblingTile { .. } => "crumbling_tile",
            ElementKind::Portal { .. } => "portal",
            ElementKind::Pickup { .. } => "pickup",
        }
    }
}

/// One piece of level geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelElement {
    pub id: ElementId,
    pub kind: ElementKind,
    pub bounds: Rect,
    /// Optional union of rectangles in authoring coordinates. When present,
    /// collision uses the shapes translated by the bounds' origin instead of
    /// the plain bounds.
    #[serde(default)]
    pub shapes: Vec<Rect>,
    #[serde(default)]
    pub semi_permeable: bool,
    #[serde(default)]
    pub tiled: bool,
}

impl LevelElement {
    pub fn new(id: impl Into<ElementId>, kind: ElementKind, bounds: Rect) -> Self {
        Self {
            id: id.into(),
            kind,
            bounds,
            shapes: Vec::new(),
            semi_permeable: false,
            tiled: false,
        }
    }

    pub fn semi_permeable(mut self) -> Self {
        self.semi_permeable = true;
        self
    }

    pub fn with_shapes(mut self, shapes: Vec<Rect>) -> Self {
        self.shapes = shapes;
        self
    }

    /// Bounds shifted by the current animation offset.
    pub fn rect_at(&self, offset_y: f32) -> Rect {
        self.bounds.translated(0.0, offset_y)
    }

    /// Tests a probe box (typically an actor) against this element shifted
    /// vertically by `offset_y`.
    pub fn touches(&self, probe: &Rect, offset_y: f32) -> bool {
        let current = self.rect_at(offset_y);
        if self.shapes.is_empty() {
            return probe.probe_overlaps(&current);
        }

        let min_x = self.shapes.iter().map(|s| s.x).fold(f32::INFINITY, f32::min);
        let min_y = self.shapes.iter().map(|s| s.y).fold(f32::INFINITY, f32::min);
        let dx = current.x - min_x;
        let dy = current.y - min_y;

        self.shapes
            .iter()
            .any(|shape| probe.probe_overlaps(&shape.translated(dx, dy)))
    }
}

/// Last committed state of an actor in the scene document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedActor {
    pub x: f32,
    pub y: f32,
    #[serde(default = "default_actor_size")]
    pub width: f32,
    #[serde(default = "default_actor_size")]
    pub height: f32,
    /// Names of the participants owning this actor.
    #[serde(default)]
    pub owners: Vec<String>,
}

fn default_actor_size() -> f32 {
    100.0
}

impl PersistedActor {
    pub fn new(x: f32, y: f32, owners: Vec<String>) -> Self {
        Self {
            x,
            y,
            width: default_actor_size(),
            height: default_actor_size(),
            owners,
        }
    }
}

/// The persisted scene record shared by all participants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDocument {
    #[serde(default)]
    pub scene_id: String,
    #[serde(default)]
    pub settings: SceneSettings,
    #[serde(default)]
    pub elements: Vec<LevelElement>,
    /// Gate id -> shared time at which the gate closes again.
    #[serde(default)]
    pub active_gates: BTreeMap<ElementId, u64>,
    /// Crumbling tile id -> shared time at which the collapse began.
    #[serde(default)]
    pub active_crumbles: BTreeMap<ElementId, u64>,
    #[serde(default)]
    pub actors: BTreeMap<ActorId, PersistedActor>,
}

impl SceneDocument {
    pub fn from_json(text: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn element(&self, id: &str) -> Option<&LevelElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// First start element, used when an actor has no checkpoint yet.
    pub fn start_point(&self) -> Option<&LevelElement> {
        self.elements
            .iter()
            .find(|e| matches!(e.kind, ElementKind::Start))
    }

    /// Applies a write with last-writer-wins semantics. Returns false when
    /// the write left the document unchanged.
    pub fn apply(&mut self, write: &StoreWrite) -> bool {
        match write {
            StoreWrite::Elements(elements) => {
                if &self.elements == elements {
                    return false;
                }
                self.elements = elements.clone();
            }
            StoreWrite::GateExpiry { id, expires_at } => {
                self.active_gates.insert(id.clone(), *expires_at);
            }
            StoreWrite::CrumbleStart { id, started_at } => {
                self.active_crumbles.insert(id.clone(), *started_at);
            }
            StoreWrite::ClearCrumble { id } => {
                return self.active_crumbles.remove(id).is_some();
            }
            StoreWrite::ClearTransient => {
                if self.active_gates.is_empty() && self.active_crumbles.is_empty() {
                    return false;
                }
                self.active_gates.clear();
                self.active_crumbles.clear();
            }
            StoreWrite::ActorPosition { actor, x, y } => match self.actors.get_mut(actor) {
                Some(record) => {
                    record.x = *x;
                    record.y = *y;
                }
                None => return false,
            },
            StoreWrite::UpsertActor { actor, record } => {
                self.actors.insert(actor.clone(), record.clone());
            }
            StoreWrite::RemoveActor { actor } => {
                return self.actors.remove(actor).is_some();
            }
            StoreWrite::Settings(settings) => {
                self.settings = settings.clone();
            }
        }
        true
    }
}

/// A single mutation of the scene document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreWrite {
    /// Full replacement of the element sequence.
    Elements(Vec<LevelElement>),
    GateExpiry { id: ElementId, expires_at: u64 },
    CrumbleStart { id: ElementId, started_at: u64 },
    ClearCrumble { id: ElementId },
    /// Clears all gate and crumble timers.
    ClearTransient,
    ActorPosition { actor: ActorId, x: f32, y: f32 },
    UpsertActor { actor: ActorId, record: PersistedActor },
    RemoveActor { actor: ActorId },
    Settings(SceneSettings),
}

/// Read/write access to the shared scene document.
///
/// `take_changes` is the change-notification channel: it yields every write
/// made by someone else since the previous call.
pub trait SceneStore {
    fn document(&self) -> &SceneDocument;

    fn write(&mut self, write: StoreWrite) -> Result<(), StoreError>;

    fn take_changes(&mut self) -> Vec<StoreWrite>;

    fn elements(&self) -> &[LevelElement] {
        &self.document().elements
    }

    fn set_elements(&mut self, elements: Vec<LevelElement>) -> Result<(), StoreError> {
        self.write(StoreWrite::Elements(elements))
    }
}

/// Scene store held entirely in memory.
///
/// Used directly by a participant running without a relay, and as the local
/// mirror behind the relay-backed store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: SceneDocument,
    revision: u64,
    changes: Vec<StoreWrite>,
    offline: bool,
}

impl MemoryStore {
    pub fn new(document: SceneDocument) -> Self {
        Self {
            document,
            revision: 0,
            changes: Vec::new(),
            offline: false,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Makes subsequent local writes fail with [`StoreError::Offline`].
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Applies a write made by another participant and queues it as a
    /// change notification.
    pub fn apply_remote(&mut self, write: StoreWrite) {
        if self.document.apply(&write) {
            self.revision += 1;
            self.changes.push(write);
        }
    }

    /// Replaces the whole document, as on a fresh join.
    pub fn replace(&mut self, document: SceneDocument) {
        self.document = document;
        self.revision += 1;
        self.changes.push(StoreWrite::Elements(self.document.elements.clone()));
    }
}

impl SceneStore for MemoryStore {
    fn document(&self) -> &SceneDocument {
        &self.document
    }

    fn write(&mut self, write: StoreWrite) -> Result<(), StoreError> {
        if self.offline {
            return Err(StoreError::Offline);
        }
        if self.document.apply(&write) {
            self.revision += 1;
        }
        Ok(())
    }

    fn take_changes(&mut self) -> Vec<StoreWrite> {
        std::mem::take(&mut self.changes)
    }
}
