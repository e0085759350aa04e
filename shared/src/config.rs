//! Scene settings and simulation tuning.
//!
//! [`SceneSettings`] travels inside the scene document and can be edited per
//! scene. [`Tuning`] holds the constants of the movement model; every
//! participant must run with the same values or replicas drift.

use serde::{Deserialize, Serialize};

/// Per-scene settings stored in the scene document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSettings {
    /// Whether the scene runs the platformer simulation at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Downward acceleration in pixels per tick squared.
    #[serde(default = "default_gravity")]
    pub gravity: f32,
    /// Horizontal run speed in pixels per tick.
    #[serde(default = "default_move_speed")]
    pub move_speed: f32,
    /// Size of one grid unit in pixels; fall damage is measured in these.
    #[serde(default = "default_grid_size")]
    pub grid_size: f32,
    /// Lower bound of the scene; actors falling past it die.
    #[serde(default = "default_scene_height")]
    pub scene_height: f32,
}

fn default_enabled() -> bool {
    true
}

fn default_gravity() -> f32 {
    1.0
}

fn default_move_speed() -> f32 {
    5.0
}

fn default_grid_size() -> f32 {
    100.0
}

fn default_scene_height() -> f32 {
    4000.0
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            gravity: default_gravity(),
            move_speed: default_move_speed(),
            grid_size: default_grid_size(),
            scene_height: default_scene_height(),
        }
    }
}

/// Movement-model and synchronization constants.
///
/// Time values ending in `_ms` are shared-clock milliseconds; values ending
/// in `_ticks` count fixed 60 Hz physics steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    pub terminal_velocity: f32,
    pub jump_force: f32,
    pub ladder_speed_factor: f32,
    pub coyote_ms: u64,
    pub wall_coyote_ms: u64,
    pub jump_buffer_ms: u64,
    /// Upward speed above which releasing jump cuts the ascent.
    pub short_hop_threshold: f32,
    pub short_hop_factor: f32,
    pub max_health: u32,
    pub invulnerability_ms: u64,
    pub respawn_delay_ms: u64,
    pub hazard_knockback: f32,
    pub teleport_cooldown_ticks: u32,
    /// Deepest penetration into a floor that still counts as landing on it.
    pub landing_tolerance: f32,
    pub stuck_shrink: f32,
    /// Fall distance, in grid units, beyond which a landing hurts.
    pub fall_damage_grid_units: f32,
    /// Most ticks one frame may catch up on.
    pub max_frame_ticks: f32,
    pub gate_speed: f32,
    pub plate_squash: f32,
    pub plate_speed: f32,
    pub plate_press_window_ms: u64,
    pub crumble_reset_ms: u64,
    pub gate_trigger_debounce_ms: u64,
    pub broadcast_interval_ms: u64,
    pub render_delay_ms: u64,
    pub snapshot_capacity: usize,
    pub persist_idle_ms: u64,
    pub persist_max_ms: u64,
    /// Persisted-position jump treated as an external teleport.
    pub teleport_threshold: f32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            terminal_velocity: 20.0,
            jump_force: -15.0,
            ladder_speed_factor: 1.0,
            coyote_ms: 166,
            wall_coyote_ms: 166,
            jump_buffer_ms: 150,
            short_hop_threshold: -4.0,
            short_hop_factor: 0.6,
            max_health: 3,
            invulnerability_ms: 1000,
            respawn_delay_ms: 2000,
            hazard_knockback: -10.0,
            teleport_cooldown_ticks: 60,
            landing_tolerance: 24.0,
            stuck_shrink: 2.0,
            fall_damage_grid_units: 3.0,
            max_frame_ticks: 5.0,
            gate_speed: 2.0,
            plate_squash: 8.0,
            plate_speed: 2.0,
            plate_press_window_ms: 100,
            crumble_reset_ms: 3000,
            gate_trigger_debounce_ms: 200,
            broadcast_interval_ms: 30,
            render_delay_ms: 100,
            snapshot_capacity: 20,
            persist_idle_ms: 2000,
            persist_max_ms: 5000,
            teleport_threshold: 50.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_fill_missing_fields() {
        let settings: SceneSettings = serde_json::from_str(r#"{"gravity": 0.5}"#).unwrap();
        assert_eq!(settings.gravity, 0.5);
        assert_eq!(settings.move_speed, 5.0);
        assert_eq!(settings.grid_size, 100.0);
        assert!(settings.enabled);
    }
}
