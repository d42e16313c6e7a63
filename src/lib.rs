//! BLE robot bridge library
//! Connects to a Bluetooth Low Energy robot, picks the characteristic to write
//! commands to, and drives it from buttons, web pages, the keyboard and scripts.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;

pub use crate::config::BridgeConfig;
pub use crate::core::events::{BridgeEvent, EventSink};
pub use crate::state::AppState;
