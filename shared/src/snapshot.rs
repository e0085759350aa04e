//! Replicated actor state and the replica-side interpolation buffer.

use crate::level::{ActorId, ElementId};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Position of a riding actor expressed relative to the element it rides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativePosition {
    pub element: ElementId,
    pub x: f32,
    pub y: f32,
}

/// State of one actor as broadcast by its master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub actor: ActorId,
    pub scene_id: String,
    /// Shared time at which the master produced this snapshot.
    pub timestamp: u64,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub facing_right: bool,
    pub riding: Option<RelativePosition>,
    pub health: u32,
    pub pressing_plate: Option<ElementId>,
}

impl NetworkSnapshot {
    /// World position, preferring the riding-relative encoding when the
    /// ridden element can be located in the local animation state.
    fn resolve<F>(&self, riding: Option<&str>, locate: &F) -> ((f32, f32), Option<ElementId>)
    where
        F: Fn(&str) -> Option<(f32, f32)>,
    {
        match (&self.riding, riding) {
            (Some(rel), Some(id)) if rel.element == id => match locate(id) {
                Some((px, py)) => ((px + rel.x, py + rel.y), None),
                None => ((self.x, self.y), Some(rel.element.clone())),
            },
            _ => ((self.x, self.y), None),
        }
    }
}

/// Presentation state produced from the buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub x: f32,
    pub y: f32,
    pub facing_right: bool,
}

/// Time-ordered buffer of received snapshots for one replicated actor.
#[derive(Debug, Clone)]
pub struct SnapshotBuffer {
    entries: VecDeque<NetworkSnapshot>,
    capacity: usize,
}

impl SnapshotBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn latest(&self) -> Option<&NetworkSnapshot> {
        self.entries.back()
    }

    pub fn timestamps(&self) -> Vec<u64> {
        self.entries.iter().map(|s| s.timestamp).collect()
    }

    /// Inserts a snapshot keeping timestamps non-decreasing. Late packets are
    /// slotted into place; the oldest entry is dropped once over capacity.
    pub fn push(&mut self, snapshot: NetworkSnapshot) {
        let at = self
            .entries
            .partition_point(|s| s.timestamp <= snapshot.timestamp);
        if at < self.entries.len() {
            debug!(
                "Out-of-order snapshot for {} at {} slotted at {}",
                snapshot.actor, snapshot.timestamp, at
            );
        }
        self.entries.insert(at, snapshot);

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Samples the buffer at `render_time`.
    ///
    /// Interpolates between the two snapshots bracketing `render_time`,
    /// clamping to the first or last snapshot outside the buffered range.
    /// `locate` maps an element id to its current world origin so that
    /// riding-relative positions follow the element's local animation.
    pub fn sample<F>(&mut self, render_time: u64, locate: F) -> Option<Sample>
    where
        F: Fn(&str) -> Option<(f32, f32)>,
    {
        while self.entries.len() > 2 && self.entries[1].timestamp < render_time {
            self.entries.pop_front();
        }

        let first = self.entries.front()?;

        if self.entries.len() >= 2
            && first.timestamp <= render_time
            && self.entries[1].timestamp >= render_time
        {
            let p0 = &self.entries[0];
            let p1 = &self.entries[1];

            let riding = p1
                .riding
                .as_ref()
                .or(p0.riding.as_ref())
                .map(|r| r.element.clone());

            let (start, lost0) = p0.resolve(riding.as_deref(), &locate);
            let (end, lost1) = p1.resolve(riding.as_deref(), &locate);

            let total = p1.timestamp - p0.timestamp;
            let alpha = if total > 0 {
                (render_time - p0.timestamp) as f32 / total as f32
            } else {
                1.0
            };

            let sample = Sample {
                x: start.0 + (end.0 - start.0) * alpha,
                y: start.1 + (end.1 - start.1) * alpha,
                facing_right: p1.facing_right,
            };

            if let Some(lost) = lost0.or(lost1) {
                self.forget_anchor(&lost);
            }
            return Some(sample);
        }

        let nearest = if render_time < first.timestamp {
            first
        } else {
            self.entries.back()?
        };
        let riding = nearest.riding.as_ref().map(|r| r.element.clone());
        let ((x, y), lost) = nearest.resolve(riding.as_deref(), &locate);
        let facing_right = nearest.facing_right;

        if let Some(lost) = lost {
            self.forget_anchor(&lost);
        }
        Some(Sample { x, y, facing_right })
    }

    /// Drops riding references to an element that no longer exists, so the
    /// buffered world positions are used instead.
    pub fn forget_anchor(&mut self, element: &str) {
        debug!("Clearing dangling ride reference to {}", element);
        for entry in self.entries.iter_mut() {
            if entry.riding.as_ref().is_some_and(|r| r.element == element) {
                entry.riding = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn snap(timestamp: u64, x: f32) -> NetworkSnapshot {
        NetworkSnapshot {
            actor: "hero".into(),
            scene_id: "scene".into(),
            timestamp,
            x,
            y: 0.0,
            vx: 0.0,
            vy: 0.0,
            facing_right: true,
            riding: None,
            health: 3,
            pressing_plate: None,
        }
    }

    fn nowhere(_: &str) -> Option<(f32, f32)> {
        None
    }

    #[test]
    fn test_linear_interpolation_midpoint() {
        let mut buffer = SnapshotBuffer::new(20);
        buffer.push(snap(0, 0.0));
        buffer.push(snap(100, 100.0));

        let sample = buffer.sample(50, nowhere).unwrap();
        assert_approx_eq!(sample.x, 50.0, 0.001);
    }

    #[test]
    fn test_sampling_outside_range_clamps() {
        let mut buffer = SnapshotBuffer::new(20);
        buffer.push(snap(100, 10.0));
        buffer.push(snap(200, 20.0));

        assert_eq!(buffer.sample(50, nowhere).unwrap().x, 10.0);
        assert_eq!(buffer.sample(500, nowhere).unwrap().x, 20.0);
    }

    #[test]
    fn test_empty_buffer_has_no_sample() {
        let mut buffer = SnapshotBuffer::new(20);
        assert!(buffer.sample(0, nowhere).is_none());
    }

    #[test]
    fn test_single_entry_is_held() {
        let mut buffer = SnapshotBuffer::new(20);
        buffer.push(snap(100, 42.0));
        assert_eq!(buffer.sample(1000, nowhere).unwrap().x, 42.0);
    }

    #[test]
    fn test_out_of_order_push_keeps_timestamps_sorted() {
        let mut buffer = SnapshotBuffer::new(20);
        buffer.push(snap(0, 0.0));
        buffer.push(snap(200, 2.0));
        buffer.push(snap(100, 1.0));
        buffer.push(snap(100, 1.5));

        assert_eq!(buffer.timestamps(), vec![0, 100, 100, 200]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = SnapshotBuffer::new(3);
        for t in 0..5 {
            buffer.push(snap(t * 10, t as f32));
        }
        assert_eq!(buffer.timestamps(), vec![20, 30, 40]);
    }

    #[test]
    fn test_stale_entries_evicted_from_front() {
        let mut buffer = SnapshotBuffer::new(20);
        for t in 0..6 {
            buffer.push(snap(t * 100, t as f32 * 100.0));
        }

        let sample = buffer.sample(350, nowhere).unwrap();
        assert_approx_eq!(sample.x, 350.0, 0.001);
        assert_eq!(buffer.timestamps(), vec![300, 400, 500]);
    }

    #[test]
    fn test_relative_position_follows_current_element() {
        let mut buffer = SnapshotBuffer::new(20);
        let mut a = snap(0, 500.0);
        a.riding = Some(RelativePosition {
            element: "lift".into(),
            x: 10.0,
            y: -100.0,
        });
        let mut b = snap(100, 500.0);
        b.riding = Some(RelativePosition {
            element: "lift".into(),
            x: 20.0,
            y: -100.0,
        });
        buffer.push(a);
        buffer.push(b);

        // The lift has since moved to (300, 250) on this participant.
        let sample = buffer
            .sample(50, |id| (id == "lift").then_some((300.0, 250.0)))
            .unwrap();
        assert_approx_eq!(sample.x, 315.0, 0.001);
        assert_approx_eq!(sample.y, 150.0, 0.001);
    }

    #[test]
    fn test_dangling_ride_reference_falls_back_and_clears() {
        let mut buffer = SnapshotBuffer::new(20);
        let mut a = snap(0, 0.0);
        a.riding = Some(RelativePosition {
            element: "gone".into(),
            x: 1.0,
            y: 1.0,
        });
        buffer.push(a);
        buffer.push(snap(100, 100.0));

        let sample = buffer.sample(50, nowhere).unwrap();
        assert_approx_eq!(sample.x, 50.0, 0.001);
        assert!(buffer.entries.iter().all(|s| s.riding.is_none()));
    }
}
