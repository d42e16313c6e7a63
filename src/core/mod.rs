//! Core functionality for the robot bridge
//! This module contains the Bluetooth connection handling, the command channel
//! and the script runner.

pub mod bluetooth;
pub mod events;
pub mod script;

// Re-export commonly used types
pub use bluetooth::{ConnectionManager, RobotCommand};
pub use events::{BridgeEvent, EventSink};
pub use script::{ScriptOutcome, ScriptRunner};
