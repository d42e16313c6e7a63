//! Interpreter seam.

use std::sync::Arc;

use thiserror::Error;

use crate::core::script::host::{HostError, ScriptHost};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("script aborted")]
    Cancelled,
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("{0}")]
    Runtime(String),
}

impl From<HostError> for ScriptError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Cancelled => Self::Cancelled,
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// An embeddable interpreter. `execute` runs on a blocking worker thread and must
/// route every robot interaction through `host`.
pub trait ScriptEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn execute(&self, source: &str, host: Arc<dyn ScriptHost>) -> Result<(), ScriptError>;
}
