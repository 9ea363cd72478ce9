//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Settings for a [`RuntimeContext`](crate::RuntimeContext).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name of the worker thread.
    pub worker_name: String,

    /// Script evaluated on the worker right after the engine is created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_script: Option<String>,

    /// Script evaluated on the worker right before the engine is freed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_script: Option<String>,

    /// Heap limit for the engine, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_name: "amp-script-runtime".to_string(),
            startup_script: None,
            shutdown_script: None,
            memory_limit_bytes: None,
        }
    }
}

impl RuntimeConfig {
    /// Set the worker thread name.
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Set the startup script.
    pub fn with_startup_script(mut self, source: impl Into<String>) -> Self {
        self.startup_script = Some(source.into());
        self
    }

    /// Set the shutdown script.
    pub fn with_shutdown_script(mut self, source: impl Into<String>) -> Self {
        self.shutdown_script = Some(source.into());
        self
    }

    /// Set the engine heap limit.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }
}
