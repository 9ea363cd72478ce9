//! Scripted amplifier plugin.
//!
//! A mono LV2 amplifier whose decibel-to-coefficient mapping is a JavaScript
//! function (`db_to_coef` in `bundle/amp.js`). All script calls go through the
//! shared [`amp_js_runtime`] worker, so any number of instances on any number
//! of host threads share one engine.

mod coefficient;
mod config;
mod error;
mod ffi_guard;
mod plugin;
mod ports;

pub mod lv2;

pub use coefficient::{CoefficientCell, CoefficientMode, FallbackPolicy};
pub use config::{AmpConfig, LoadError};
pub use error::PluginError;
pub use plugin::{AmpPlugin, PluginState};
pub use ports::{Buffers, PortIndex, Ports};
