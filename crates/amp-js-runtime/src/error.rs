//! Error types for the script runtime.

use std::path::PathBuf;

/// Errors raised by the worker or the runtime context.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Runtime has terminated")]
    Terminated,

    #[error("Runtime thread panicked")]
    ThreadPanic,

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Runtime initialization failed: {0}")]
    Init(String),

    #[error("Script engine is not available on this thread")]
    NotOnWorker,

    #[error("Script engine is already borrowed by an outer task")]
    EngineBusy,

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Errors raised inside the script engine.
///
/// Every call into the engine returns one of these instead of leaving a
/// pending exception behind.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("Script exception: {0}")]
    Exception(String),

    #[error("Failed to create engine: {0}")]
    EngineCreation(String),

    #[error("Failed to read script {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Module not loaded: {0}")]
    ModuleNotFound(String),

    #[error("Module {name} is already loaded from {loaded}, not {requested}")]
    ModuleConflict {
        name: String,
        loaded: String,
        requested: String,
    },

    #[error("Module {0} did not export an object")]
    InvalidModule(String),

    #[error("Function not found: {module}.{name}")]
    FunctionNotFound { module: String, name: String },

    #[error("{module}.{name} is not a function")]
    NotAFunction { module: String, name: String },

    #[error("Function handle {0} does not belong to this engine")]
    StaleFunction(String),

    #[error("Expected {expected}, got {found}")]
    UnexpectedType {
        expected: &'static str,
        found: String,
    },
}

impl RuntimeError {
    /// Returns the script error if this failure came from inside the engine.
    pub fn script_error(&self) -> Option<&ScriptError> {
        match self {
            RuntimeError::Script(e) => Some(e),
            _ => None,
        }
    }
}
