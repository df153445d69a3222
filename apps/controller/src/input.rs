//! Terminal stand-in for the touch controls: one line per press or release.

use shared::{domain::Direction, error::CommandParseError};
use thiserror::Error;

pub const HELP: &str = "\
commands:
  press <throttle|reverse|left|right>   (shorthand: w, s, a, d)
  release [direction]                   (shorthand: x) publishes Stop
  status                                session state and dispatch counters
  reconnect                             start again after a failed connect
  quit                                  disconnect and exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlInput {
    Press(Direction),
    /// Releasing always stops; the direction only matters for logging.
    Release(Option<Direction>),
    Status,
    Reconnect,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("empty input")]
    Empty,
    #[error("unknown input {0:?}, type 'help' for commands")]
    Unknown(String),
    #[error("'press' needs a direction")]
    MissingDirection,
    #[error(transparent)]
    Direction(#[from] CommandParseError),
}

pub fn parse_input(line: &str) -> Result<ControlInput, InputError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err(InputError::Empty);
    };
    let argument = words.next();

    let input = match verb.to_ascii_lowercase().as_str() {
        "w" => ControlInput::Press(Direction::Throttle),
        "s" => ControlInput::Press(Direction::Reverse),
        "a" => ControlInput::Press(Direction::Left),
        "d" => ControlInput::Press(Direction::Right),
        "x" => ControlInput::Release(None),
        "press" | "p" => {
            let direction = argument.ok_or(InputError::MissingDirection)?;
            ControlInput::Press(direction.parse()?)
        }
        "release" | "r" => ControlInput::Release(argument.map(str::parse).transpose()?),
        "status" => ControlInput::Status,
        "reconnect" => ControlInput::Reconnect,
        "help" | "?" => ControlInput::Help,
        "quit" | "exit" | "q" => ControlInput::Quit,
        other => return Err(InputError::Unknown(other.to_string())),
    };

    Ok(input)
}
