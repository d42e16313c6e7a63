//! Robot command vocabulary
//! This module contains all the commands that can be sent to the robot and the
//! `CommandSender` seam the front-ends and the script runner drive it through.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::bluetooth::channel::SendError;
use crate::core::bluetooth::constants::{
    ADVANCED_COMMAND_SEPARATOR, CMD_BACK, CMD_FORWARD, CMD_LEFT, CMD_RIGHT, CMD_STOP,
    MAX_ADVANCED_COMMAND_LEN,
};

static ADVANCED_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.]+(-[A-Za-z0-9_.]+)+$").expect("advanced command pattern is valid")
});

/// Primitive motions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Drive forward (w)
    Forward,
    /// Turn left (a)
    Left,
    /// Stop all movement (s)
    Stop,
    /// Turn right (d)
    Right,
    /// Drive backward (x)
    Back,
}

impl Direction {
    pub const ALL: [Direction; 5] = [
        Direction::Forward,
        Direction::Left,
        Direction::Stop,
        Direction::Right,
        Direction::Back,
    ];

    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            CMD_FORWARD => Some(Self::Forward),
            CMD_LEFT => Some(Self::Left),
            CMD_STOP => Some(Self::Stop),
            CMD_RIGHT => Some(Self::Right),
            CMD_BACK => Some(Self::Back),
            _ => None,
        }
    }

    /// The wire byte for this motion.
    pub fn as_char(&self) -> char {
        match self {
            Self::Forward => CMD_FORWARD,
            Self::Left => CMD_LEFT,
            Self::Stop => CMD_STOP,
            Self::Right => CMD_RIGHT,
            Self::Back => CMD_BACK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("advanced command is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("malformed advanced command '{0}'")]
    Malformed(String),
}

/// A motion command; immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotCommand {
    /// Single-byte primitive motion
    Move(Direction),
    /// Dash separated timed or compound token, passed through as-is
    Advanced(String),
}

impl RobotCommand {
    pub const STOP: RobotCommand = RobotCommand::Move(Direction::Stop);

    /// Parses a command, bounding advanced tokens to `max_advanced_len` bytes.
    pub fn parse(input: &str, max_advanced_len: usize) -> Result<Self, CommandParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(CommandParseError::Empty);
        }

        let mut chars = input.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Direction::from_char(c)
                .map(Self::Move)
                .ok_or_else(|| CommandParseError::Unknown(input.to_string()));
        }

        if !input.contains(ADVANCED_COMMAND_SEPARATOR) {
            return Err(CommandParseError::Unknown(input.to_string()));
        }
        if input.len() > max_advanced_len {
            return Err(CommandParseError::TooLong {
                len: input.len(),
                max: max_advanced_len,
            });
        }
        if !ADVANCED_COMMAND.is_match(input) {
            return Err(CommandParseError::Malformed(input.to_string()));
        }
        Ok(Self::Advanced(input.to_string()))
    }

    pub fn as_str(&self) -> String {
        match self {
            Self::Move(direction) => direction.as_char().to_string(),
            Self::Advanced(token) => token.clone(),
        }
    }

    /// Convert the command to its UTF-8 byte representation
    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_str().into_bytes()
    }

    pub fn is_stop(&self) -> bool {
        *self == Self::STOP
    }
}

impl From<Direction> for RobotCommand {
    fn from(direction: Direction) -> Self {
        Self::Move(direction)
    }
}

impl FromStr for RobotCommand {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, MAX_ADVANCED_COMMAND_LEN)
    }
}

impl fmt::Display for RobotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Move(direction) => write!(f, "{}", direction.as_char()),
            Self::Advanced(token) => f.write_str(token),
        }
    }
}

/// Command sender trait
#[async_trait::async_trait]
pub trait CommandSender: Send + Sync + 'static {
    /// Send a command to the robot over the active session
    async fn send_command(&self, command: &RobotCommand) -> Result<(), SendError>;

    /// Whether a session is ready to accept commands
    async fn is_ready(&self) -> bool;
}
