//! Front-end commands
//! This module defines the operations a front-end (console, buttons, web page,
//! keyboard) can invoke against the application state.

use std::collections::HashSet;

use log::debug;
use regex::Regex;

use crate::core::bluetooth::{
    BleAdapter, CommandParseError, Device, DeviceId, Direction, RobotCommand, SendError,
};
use crate::core::script::RunError;
use crate::state::AppState;

/// Starts a scan for robots; devices arrive as `DeviceDiscovered` events.
pub async fn start_scan<A: BleAdapter>(app_state: &AppState<A>) -> Result<(), String> {
    if app_state.connection.start_scanning(None).await {
        Ok(())
    } else {
        Err("Scan could not be started".to_string())
    }
}

pub async fn stop_scan<A: BleAdapter>(app_state: &AppState<A>) {
    app_state.connection.stop_scanning().await;
}

pub fn list_devices<A: BleAdapter>(app_state: &AppState<A>) -> Vec<Device> {
    app_state.connection.devices()
}

/// Connects to a Bluetooth device
///
/// # Arguments
/// * `device_id` - The unique identifier of the device to connect to (platform-specific ID)
/// * `app_state` - The application state
pub async fn connect_to_device<A: BleAdapter>(
    device_id: &str,
    app_state: &AppState<A>,
) -> Result<(), String> {
    if app_state.connection.connect(&DeviceId::from(device_id)).await {
        Ok(())
    } else {
        Err(format!("Could not connect to {}", device_id))
    }
}

/// Disconnects from the currently connected device
pub async fn disconnect<A: BleAdapter>(app_state: &AppState<A>) {
    app_state.connection.disconnect().await;
}

/// Sends a motion from a button press.
pub async fn press_direction<A: BleAdapter>(
    direction: Direction,
    app_state: &AppState<A>,
) -> Result<(), SendError> {
    app_state
        .connection
        .send_command(&RobotCommand::from(direction))
        .await
}

/// Button or key release: always a stop.
pub async fn release<A: BleAdapter>(app_state: &AppState<A>) -> Result<(), SendError> {
    app_state.connection.send_command(&RobotCommand::STOP).await
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Parse(#[from] CommandParseError),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Parses free text (a letter or an advanced token) and sends it.
pub async fn send_text<A: BleAdapter>(
    text: &str,
    app_state: &AppState<A>,
) -> Result<(), CommandError> {
    let command = RobotCommand::parse(text, app_state.config.commands.max_advanced_len)?;
    app_state.connection.send_command(&command).await?;
    Ok(())
}

/// Decodes `%XX` escapes and `+` in a query value.
fn percent_decode(value: &str) -> Result<String, CommandParseError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = value
                    .get(i + 1..i + 3)
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| CommandParseError::Malformed(value.to_string()))?;
                out.push(hex);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| CommandParseError::Malformed(value.to_string()))
}

/// Recognises web bridge navigations such as `scribby://drive?command=w` or
/// `scribby://drive?command=fwd-500`. Built once per configured scheme.
#[derive(Debug, Clone)]
pub struct BridgeUrls {
    pattern: Regex,
    max_advanced_len: usize,
}

impl BridgeUrls {
    pub fn new(scheme: &str, max_advanced_len: usize) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"(?i)^{}://[^?#]*(?:\?([^#]*))?",
            regex::escape(scheme)
        ))?;
        Ok(Self {
            pattern,
            max_advanced_len,
        })
    }

    /// Extracts the command from `url`.
    ///
    /// Returns `None` for URLs that are not bridge URLs; those navigations proceed normally.
    pub fn parse(&self, url: &str) -> Option<Result<RobotCommand, CommandParseError>> {
        let captures = self.pattern.captures(url.trim())?;

        let raw = captures
            .get(1)
            .map(|query| query.as_str())
            .unwrap_or_default()
            .split('&')
            .find_map(|pair| pair.strip_prefix("command="))
            .unwrap_or_default();

        Some(
            percent_decode(raw)
                .and_then(|value| RobotCommand::parse(&value, self.max_advanced_len)),
        )
    }
}

/// Handles a navigation from embedded web content.
///
/// `None` means the URL was not for the bridge and should be loaded.
pub async fn handle_bridge_url<A: BleAdapter>(
    url: &str,
    app_state: &AppState<A>,
) -> Option<Result<(), CommandError>> {
    let parsed = app_state.bridge.parse(url)?;
    debug!("Bridge navigation {} -> {:?}", url, parsed);
    let result = match parsed {
        Ok(command) => app_state
            .connection
            .send_command(&command)
            .await
            .map_err(CommandError::from),
        Err(e) => {
            app_state
                .events
                .status(format!("Ignored web command: {}", e));
            Err(e.into())
        }
    };
    Some(result)
}

pub async fn run_script<A: BleAdapter>(
    source: &str,
    app_state: &AppState<A>,
) -> Result<u64, RunError> {
    app_state.runner.run(source).await.map(|handle| handle.run_id)
}

pub async fn abort_script<A: BleAdapter>(app_state: &AppState<A>) -> Result<(), RunError> {
    app_state.runner.abort().await
}

/// Keys a front-end may forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Char(char),
    Up,
    Down,
    Left,
    Right,
}

impl Key {
    fn direction(self) -> Option<Direction> {
        match self {
            Key::Up => Some(Direction::Forward),
            Key::Down => Some(Direction::Back),
            Key::Left => Some(Direction::Left),
            Key::Right => Some(Direction::Right),
            Key::Char(c) => Direction::from_char(c),
        }
    }

    fn normalized(self) -> Self {
        match self {
            Key::Char(c) => Key::Char(c.to_ascii_lowercase()),
            other => other,
        }
    }
}

/// Maps keyboard input to motions. Auto-repeat is suppressed: a held key sends
/// once, and its release sends a stop.
#[derive(Debug, Default)]
pub struct KeyMapper {
    held: HashSet<Key>,
}

impl KeyMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_down(&mut self, key: Key) -> Option<RobotCommand> {
        let direction = key.direction()?;
        if self.held.insert(key.normalized()) {
            Some(direction.into())
        } else {
            None
        }
    }

    pub fn key_up(&mut self, key: Key) -> Option<RobotCommand> {
        key.direction()?;
        self.held.remove(&key.normalized());
        Some(RobotCommand::STOP)
    }
}
