use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::script::RunnerOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Interpreter used when none is named explicitly.
    pub default_engine: String,
    /// Upper bound for a single `sleep_ms` call, in milliseconds.
    pub max_sleep_ms: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        ScriptConfig {
            default_engine: "rhai".to_string(),
            max_sleep_ms: 60_000,
        }
    }
}

impl ScriptConfig {
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            max_sleep: Duration::from_millis(self.max_sleep_ms),
        }
    }
}
