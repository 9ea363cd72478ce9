//! Panic guards for the exported entry points.
//!
//! A panic must never unwind into the host. Each `extern "C" fn` runs its body
//! through one of these helpers, which log the panic and return a safe value.

use std::panic::{AssertUnwindSafe, catch_unwind};

use amp_js_runtime::panic_message;

fn report(op: &'static str, payload: Box<dyn std::any::Any + Send>) {
    let msg = panic_message(payload);
    let bt = std::backtrace::Backtrace::force_capture();
    tracing::error!("panic in ffi `{op}`: {msg}\nbacktrace:\n{bt}");
}

/// Guard a callback that returns nothing.
pub fn guard_void(op: &'static str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        report(op, payload);
    }
}

/// Guard a callback, returning `default` if it panics.
pub fn guard_with_default<T>(op: &'static str, default: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            report(op, payload);
            default
        }
    }
}
