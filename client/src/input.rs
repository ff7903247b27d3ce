//! Sources of movement for the local player.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::PLAYER_SPEED;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputCommand {
    /// Relative step in world units
    Move(f32, f32),
    Idle,
    Quit,
}

pub trait InputSource {
    /// Called once per frame.
    fn next_move(&mut self) -> InputCommand;
}

/// Wanders around in steps of [`PLAYER_SPEED`], eight directions plus standing still.
pub struct RandomWalk {
    rng: StdRng,
}

impl RandomWalk {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl InputSource for RandomWalk {
    fn next_move(&mut self) -> InputCommand {
        let dx = self.rng.gen_range(-1i8..=1);
        let dy = self.rng.gen_range(-1i8..=1);
        if dx == 0 && dy == 0 {
            return InputCommand::Idle;
        }
        InputCommand::Move(dx as f32 * PLAYER_SPEED, dy as f32 * PLAYER_SPEED)
    }
}

/// Replays a fixed list of commands, then quits.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    commands: VecDeque<InputCommand>,
}

impl ScriptedInput {
    pub fn new(commands: impl IntoIterator<Item = InputCommand>) -> Self {
        Self {
            commands: commands.into_iter().collect(),
        }
    }
}

impl InputSource for ScriptedInput {
    fn next_move(&mut self) -> InputCommand {
        self.commands.pop_front().unwrap_or(InputCommand::Quit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_walk_is_reproducible() {
        let mut a = RandomWalk::new(Some(7));
        let mut b = RandomWalk::new(Some(7));

        for _ in 0..50 {
            assert_eq!(a.next_move(), b.next_move());
        }
    }

    #[test]
    fn test_random_walk_steps_by_player_speed() {
        let mut walk = RandomWalk::new(Some(1));

        for _ in 0..200 {
            match walk.next_move() {
                InputCommand::Move(dx, dy) => {
                    assert!([-PLAYER_SPEED, 0.0, PLAYER_SPEED].contains(&dx));
                    assert!([-PLAYER_SPEED, 0.0, PLAYER_SPEED].contains(&dy));
                    assert!(dx != 0.0 || dy != 0.0);
                }
                InputCommand::Idle => {}
                InputCommand::Quit => panic!("random walk never quits"),
            }
        }
    }

    #[test]
    fn test_scripted_input_quits_when_exhausted() {
        let mut input = ScriptedInput::new([InputCommand::Move(1.0, 0.0), InputCommand::Idle]);

        assert_eq!(input.next_move(), InputCommand::Move(1.0, 0.0));
        assert_eq!(input.next_move(), InputCommand::Idle);
        assert_eq!(input.next_move(), InputCommand::Quit);
        assert_eq!(input.next_move(), InputCommand::Quit);
    }
}
