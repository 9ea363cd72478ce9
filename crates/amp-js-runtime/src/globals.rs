//! Script global objects.
//!
//! Registers `console` and the `amp` namespace so scripts can log through
//! `tracing` instead of writing to stdout from the worker thread.

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Result as JsResult};

/// Register the `amp` global object and the console.
pub fn register_amp_globals(ctx: &Ctx<'_>) -> JsResult<()> {
    let globals = ctx.globals();

    register_console(ctx)?;

    let amp = Object::new(ctx.clone())?;

    amp.set("log", Function::new(ctx.clone(), |msg: Coerced<String>| {
        tracing::info!(target: "amp.js", "{}", msg.0);
    })?)?;

    amp.set("debug", Function::new(ctx.clone(), |msg: Coerced<String>| {
        tracing::debug!(target: "amp.js", "{}", msg.0);
    })?)?;

    amp.set("warn", Function::new(ctx.clone(), |msg: Coerced<String>| {
        tracing::warn!(target: "amp.js", "{}", msg.0);
    })?)?;

    amp.set("error", Function::new(ctx.clone(), |msg: Coerced<String>| {
        tracing::error!(target: "amp.js", "{}", msg.0);
    })?)?;

    globals.set("amp", amp)?;

    Ok(())
}

fn join(args: Rest<Coerced<String>>) -> String {
    args.0
        .into_iter()
        .map(|arg| arg.0)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Register the console object with log, info, warn, error and debug.
fn register_console(ctx: &Ctx<'_>) -> JsResult<()> {
    let globals = ctx.globals();

    if globals.get::<_, Object>("console").is_ok() {
        return Ok(());
    }

    let console = Object::new(ctx.clone())?;

    console.set("log", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::info!(target: "amp.js.console", "{}", join(args));
    })?)?;

    console.set("info", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::info!(target: "amp.js.console", "{}", join(args));
    })?)?;

    console.set("warn", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::warn!(target: "amp.js.console", "{}", join(args));
    })?)?;

    console.set("error", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::error!(target: "amp.js.console", "{}", join(args));
    })?)?;

    console.set("debug", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::debug!(target: "amp.js.console", "{}", join(args));
    })?)?;

    globals.set("console", console)?;

    Ok(())
}
