//! Constants used throughout the application
//! This module contains the constant values used by the Bluetooth layer,
//! such as timeouts, the command vocabulary and bridge limits.

/// Primitive motion commands understood by the robot firmware.
pub const CMD_FORWARD: char = 'w';
pub const CMD_LEFT: char = 'a';
pub const CMD_STOP: char = 's';
pub const CMD_RIGHT: char = 'd';
pub const CMD_BACK: char = 'x';

/// Separator marking an advanced (timed/compound) command token.
pub const ADVANCED_COMMAND_SEPARATOR: char = '-';

/// Upper bound on the length of an advanced command token.
pub const MAX_ADVANCED_COMMAND_LEN: usize = 32;

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 10;

/// How long a connect or scan waits for an old session to be torn down
pub const SESSION_TEARDOWN_TIMEOUT_MS: u64 = 3000;

/// Poll interval used to notice a remote link drop
pub const CONNECTION_WATCH_INTERVAL_MS: u64 = 1000;

/// Capacity of the bridge notification channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// URL scheme used by web content to talk to the robot
pub const DEFAULT_BRIDGE_SCHEME: &str = "scribby";
