//! Script execution against the connected robot.

mod engine;
mod host;
mod runner;

#[cfg(feature = "scripting")]
mod rhai_engine;

pub use engine::{ScriptEngine, ScriptError};
pub use host::{
    HOST_FN_CHECKPOINT, HOST_FN_DRIVE, HOST_FN_LOG, HOST_FN_SHOULD_ABORT, HOST_FN_SLEEP,
    HOST_FN_STOP, HostError, RunnerHost, ScriptHost,
};
pub use runner::{RunError, RunnerOptions, ScriptHandle, ScriptOutcome, ScriptRunner, ScriptStatus};

#[cfg(feature = "scripting")]
pub use rhai_engine::RhaiEngine;
