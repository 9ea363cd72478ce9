//! Process-wide shared context.
//!
//! Plugin entry points are plain C functions with no place to thread a
//! context through, so they share one here. The registry keeps only a weak
//! reference: the context lives as long as some caller holds it and is shut
//! down when the last holder lets go.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::context::{ContextInner, RuntimeContext};
use crate::error::RuntimeError;

static SHARED: Mutex<Weak<ContextInner>> = Mutex::new(Weak::new());

/// Return the shared context, starting it on first use.
///
/// `config` only applies when a new context has to be started; a live
/// context is returned as-is.
pub fn acquire(config: &RuntimeConfig) -> Result<RuntimeContext, RuntimeError> {
    let mut slot = SHARED.lock();

    if let Some(inner) = slot.upgrade() {
        let ctx = RuntimeContext { inner };
        if ctx.config() != config {
            tracing::debug!(
                "[shared] reusing runtime {} with its original configuration",
                ctx.config().worker_name
            );
        }
        return Ok(ctx);
    }

    let ctx = RuntimeContext::start(config.clone())?;
    *slot = Arc::downgrade(&ctx.inner);
    tracing::debug!("[shared] started runtime {}", config.worker_name);
    Ok(ctx)
}

/// The shared context, if one is currently alive.
pub fn current() -> Option<RuntimeContext> {
    SHARED.lock().upgrade().map(|inner| RuntimeContext { inner })
}
