use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{DEFAULT_BRIDGE_SCHEME, MAX_ADVANCED_COMMAND_LEN};

/// Command parsing and web bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Longest accepted advanced command token.
    pub max_advanced_len: usize,
    /// URL scheme intercepted from embedded web pages, e.g. `scribby://drive?command=w`.
    pub bridge_scheme: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        CommandConfig {
            max_advanced_len: MAX_ADVANCED_COMMAND_LEN,
            bridge_scheme: DEFAULT_BRIDGE_SCHEME.to_string(),
        }
    }
}
