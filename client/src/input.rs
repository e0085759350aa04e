//! Input sources driving the locally controlled actor
//!
//! There is no window to read a keyboard from, so input is either replayed
//! from a script or generated by a wandering bot.
//!
//! Script format, one step per line:
//!
//! ```text
//! # ms    keys
//! 0       right
//! 400     right jump
//! 650     right
//! 1500    idle
//! ```
//!
//! Each step holds from its time until the next step's time. Keys are
//! `left`, `right`, `jump`, `down` or `idle`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::actor::InputState;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: expected a time in milliseconds, found '{found}'")]
    BadTime { line: usize, found: String },

    #[error("line {line}: unknown key '{key}'")]
    UnknownKey { line: usize, key: String },

    #[error("line {line}: steps must be in time order")]
    OutOfOrder { line: usize },

    #[error("failed to read input script: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that decides what the controlled actor presses
pub trait InputSource {
    /// Input held at `elapsed_ms` since the session started.
    fn sample(&mut self, elapsed_ms: u64) -> InputState;
}

/// Input that never presses anything
#[derive(Debug, Default)]
pub struct IdleInput;

impl InputSource for IdleInput {
    fn sample(&mut self, _elapsed_ms: u64) -> InputState {
        InputState::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptStep {
    pub at_ms: u64,
    pub input: InputState,
}

/// Timed input replay
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedInput {
    steps: Vec<ScriptStep>,
    looped: bool,
}

impl ScriptedInput {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps, looped: false }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        std::fs::read_to_string(path)?.parse()
    }

    /// Restart from the first step once the script runs out
    pub fn looped(mut self) -> Self {
        self.looped = true;
        self
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    fn duration(&self) -> u64 {
        self.steps.last().map(|s| s.at_ms).unwrap_or(0)
    }
}

impl FromStr for ScriptedInput {
    type Err = ScriptError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut steps: Vec<ScriptStep> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }

            let mut words = content.split_whitespace();
            let time = words.next().unwrap_or("");
            let at_ms: u64 = time.parse().map_err(|_| ScriptError::BadTime {
                line,
                found: time.to_string(),
            })?;

            if steps.last().is_some_and(|prev| prev.at_ms > at_ms) {
                return Err(ScriptError::OutOfOrder { line });
            }

            let mut input = InputState::default();
            for key in words {
                match key {
                    "left" => input.left = true,
                    "right" => input.right = true,
                    "jump" => input.jump = true,
                    "down" => input.down = true,
                    "idle" => {}
                    other => {
                        return Err(ScriptError::UnknownKey {
                            line,
                            key: other.to_string(),
                        })
                    }
                }
            }

            steps.push(ScriptStep { at_ms, input });
        }

        Ok(Self::new(steps))
    }
}

impl InputSource for ScriptedInput {
    fn sample(&mut self, elapsed_ms: u64) -> InputState {
        let duration = self.duration();
        let t = if self.looped && duration > 0 {
            elapsed_ms % duration
        } else {
            elapsed_ms
        };

        self.steps
            .iter()
            .take_while(|step| step.at_ms <= t)
            .last()
            .map(|step| step.input)
            .unwrap_or_default()
    }
}

/// Random walker: picks a direction, holds it for a while, sometimes jumps
pub struct WanderInput {
    rng: StdRng,
    current: InputState,
    next_change_ms: u64,
}

impl WanderInput {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            current: InputState::default(),
            next_change_ms: 0,
        }
    }

    fn reroll(&mut self) {
        let direction = self.rng.gen_range(0..3);
        self.current = InputState {
            left: direction == 0,
            right: direction == 1,
            jump: self.rng.gen_bool(0.3),
            down: false,
        };
    }
}

impl InputSource for WanderInput {
    fn sample(&mut self, elapsed_ms: u64) -> InputState {
        if elapsed_ms >= self.next_change_ms {
            self.reroll();
            self.next_change_ms = elapsed_ms + self.rng.gen_range(300..1500);
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "\
# warm up
0 right
400 right jump   # hop
650 right
1500 idle
";

    #[test]
    fn test_parse_script() {
        let script: ScriptedInput = SCRIPT.parse().unwrap();
        assert_eq!(script.steps().len(), 4);
        assert_eq!(script.steps()[1].at_ms, 400);
        assert!(script.steps()[1].input.right);
        assert!(script.steps()[1].input.jump);
        assert_eq!(script.steps()[3].input, InputState::default());
    }

    #[test]
    fn test_scripted_sampling_holds_until_next_step() {
        let mut script: ScriptedInput = SCRIPT.parse().unwrap();

        assert!(!script.sample(399).jump);
        assert!(script.sample(400).jump);
        assert!(script.sample(649).jump);
        assert!(!script.sample(650).jump);
        assert_eq!(script.sample(10_000), InputState::default());
    }

    #[test]
    fn test_looped_script_wraps() {
        let mut script = SCRIPT.parse::<ScriptedInput>().unwrap().looped();
        assert!(script.sample(1500 + 450).jump);
    }

    #[test]
    fn test_script_errors() {
        assert!(matches!(
            "soon right".parse::<ScriptedInput>(),
            Err(ScriptError::BadTime { line: 1, .. })
        ));
        assert!(matches!(
            "0 right\n10 fly".parse::<ScriptedInput>(),
            Err(ScriptError::UnknownKey { line: 2, .. })
        ));
        assert!(matches!(
            "100 right\n50 left".parse::<ScriptedInput>(),
            Err(ScriptError::OutOfOrder { line: 2 })
        ));
    }

    #[test]
    fn test_empty_script_is_idle() {
        let mut script: ScriptedInput = "# nothing\n\n".parse().unwrap();
        assert_eq!(script.sample(0), InputState::default());
    }

    #[test]
    fn test_wander_is_deterministic_per_seed() {
        let mut a = WanderInput::new(7);
        let mut b = WanderInput::new(7);
        for t in (0..10_000).step_by(16) {
            assert_eq!(a.sample(t), b.sample(t));
        }
    }

    #[test]
    fn test_wander_never_presses_both_directions() {
        let mut wander = WanderInput::new(42);
        for t in (0..20_000).step_by(100) {
            let input = wander.sample(t);
            assert!(!(input.left && input.right));
        }
    }
}
