//! Amp Script Runtime
//!
//! Runs an embedded QuickJS engine on one dedicated thread and lets any
//! number of other threads call into it synchronously.
//!
//! # Architecture
//!
//! - [`Worker`] owns an OS thread and a FIFO task queue; callers get a
//!   [`TaskHandle`] that resolves exactly once
//! - [`RuntimeContext`] owns a worker and the [`ScriptEngine`] living on it;
//!   the engine is created and freed on that thread and nowhere else
//! - [`FunctionRef`] names a function inside the engine without holding
//!   engine memory, so it is safe to keep on other threads
//! - [`shared`] hands out one process-wide context for callers that cannot
//!   carry one around (C entry points)

mod config;
mod context;
mod engine;
mod error;
mod globals;
mod types;
mod worker;

pub mod shared;

pub use config::RuntimeConfig;
pub use context::{RuntimeBuilder, RuntimeContext};
pub use engine::{with_engine, ScriptEngine};
pub use error::{RuntimeError, ScriptError};
pub use types::{FunctionRef, ScriptValue};
pub use worker::{panic_message, TaskHandle, Worker};
