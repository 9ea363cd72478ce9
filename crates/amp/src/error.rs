use amp_js_runtime::RuntimeError;

use crate::config::LoadError;

/// Errors surfaced by the plugin adapter.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Failed to load plugin config: {0}")]
    Config(#[from] LoadError),

    #[error("Failed to start script runtime: {0}")]
    Runtime(#[source] RuntimeError),

    #[error("Failed to resolve {function}: {source}")]
    Resolve {
        function: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Test call {function}({gain}) failed: {reason}")]
    TestCall {
        function: String,
        gain: f32,
        reason: String,
    },
}
