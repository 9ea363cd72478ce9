//! Plugin instance state machine.
//!
//! An [`AmpPlugin`] scales its input by a coefficient computed from the gain
//! control by a script function. The function is resolved on `activate` and
//! called again only when the gain changes.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use amp_js_runtime::{FunctionRef, RuntimeContext, shared};

use crate::coefficient::{CoefficientCell, CoefficientMode, checked};
use crate::config::AmpConfig;
use crate::error::PluginError;
use crate::ports::{Buffers, PortIndex, Ports};

/// Lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Instantiated,
    Active,
    /// Activation could not resolve a working conversion function.
    Failed,
    Inactive,
}

pub struct AmpPlugin {
    config: AmpConfig,
    runtime: RuntimeContext,
    state: PluginState,
    function: Option<FunctionRef>,
    cell: Arc<CoefficientCell>,
    refresh_pending: Arc<AtomicBool>,
    /// Bumped on every activate and deactivate; deferred results from an
    /// older generation are discarded.
    generation: Arc<AtomicU64>,
    ports: Ports,
}

impl std::fmt::Debug for AmpPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmpPlugin")
            .field("state", &self.state)
            .field("function", &self.function)
            .field("mode", &self.config.mode)
            .finish()
    }
}

impl AmpPlugin {
    pub fn new(config: AmpConfig, runtime: RuntimeContext) -> Self {
        Self {
            config,
            runtime,
            state: PluginState::Instantiated,
            function: None,
            cell: Arc::new(CoefficientCell::new()),
            refresh_pending: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            ports: Ports::default(),
        }
    }

    /// Load the bundle's config and attach to the shared runtime.
    ///
    /// The runtime is started here rather than on `activate`, so an engine
    /// that cannot start (or a failing startup script) shows up as a failed
    /// instantiation instead of an instance that can never activate. No
    /// module is loaded until `activate`.
    pub fn instantiate(bundle: &Path) -> Result<Self, PluginError> {
        let config = AmpConfig::load(bundle)?;
        let runtime = shared::acquire(&config.runtime).map_err(PluginError::Runtime)?;
        tracing::info!("Instantiated amp plugin from {}", bundle.display());
        Ok(Self::new(config, runtime))
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn config(&self) -> &AmpConfig {
        &self.config
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn connect_port(&mut self, port: PortIndex, data: *mut c_void) {
        self.ports.connect(port, data);
    }

    /// Load the conversion module and resolve its function.
    ///
    /// A script file is loaded once per runtime; later activations (from this
    /// or any other instance using the same file) reuse it.
    pub fn activate(&mut self) -> Result<(), PluginError> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.refresh_pending.store(false, Ordering::Release);
        self.function = None;
        self.cell.clear();

        match self.resolve() {
            Ok(function) => {
                tracing::info!("Activated with {function}");
                self.function = Some(function);
                self.state = PluginState::Active;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Activation failed: {e}");
                self.state = PluginState::Failed;
                Err(e)
            }
        }
    }

    /// Engine module name for this instance's script.
    ///
    /// Qualified by the script's canonical path, so bundles shipping
    /// different scripts under the same `module` never shadow each other.
    fn module_key(&self) -> (String, PathBuf) {
        let script = self.config.script_path();
        let script = std::fs::canonicalize(&script).unwrap_or(script);
        (format!("{}@{}", self.config.module, script.display()), script)
    }

    fn resolve(&self) -> Result<FunctionRef, PluginError> {
        let (module, script) = self.module_key();
        let name = self.config.function.clone();
        let qualified = format!("{}.{name}", self.config.module);

        let function = self
            .runtime
            .run_with_engine(move |engine| {
                if engine.load_module_file(&module, &script)? {
                    tracing::debug!("Loaded {}", script.display());
                }
                engine.get_function(&module, &name)
            })
            .map_err(|source| PluginError::Resolve {
                function: qualified.clone(),
                source,
            })?;

        if let Some(gain) = self.config.test_gain {
            let failed = |reason: String| PluginError::TestCall {
                function: qualified.clone(),
                gain,
                reason,
            };
            let value = self
                .runtime
                .call_scalar(&function, f64::from(gain))
                .map_err(|e| failed(e.to_string()))?;
            let coef = checked(value).ok_or_else(|| failed(format!("returned {value}")))?;
            tracing::debug!("{qualified}({gain}) = {coef}");
        }

        Ok(function)
    }

    pub fn deactivate(&mut self) {
        if self.state == PluginState::Active {
            tracing::debug!("Deactivated");
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.function = None;
        self.state = PluginState::Inactive;
    }

    /// Coefficient for `gain`, asking the script only when the gain changed.
    pub fn coefficient(&self, gain: f32) -> f32 {
        let fallback = self.config.fallback.coefficient();
        let Some(function) = self.function.as_ref() else {
            return fallback;
        };
        if !gain.is_finite() {
            tracing::warn!("Ignoring non-finite gain {gain}");
            return fallback;
        }
        if let Some(coef) = self.cell.lookup(gain) {
            return coef;
        }

        match self.config.mode {
            CoefficientMode::Synchronous => {
                let coef = match self.runtime.call_scalar(function, f64::from(gain)) {
                    Ok(value) => checked(value).unwrap_or_else(|| {
                        tracing::warn!("{function}({gain}) returned {value}");
                        fallback
                    }),
                    Err(e) => {
                        tracing::warn!("{function}({gain}) failed: {e}");
                        fallback
                    }
                };
                self.cell.store(gain, coef);
                coef
            }
            CoefficientMode::Deferred => {
                self.request_refresh(function.clone(), gain, fallback);
                self.cell.latest().unwrap_or(fallback)
            }
        }
    }

    // At most one conversion is queued per instance; a gain that changes again
    // while one is in flight is picked up by the next block.
    fn request_refresh(&self, function: FunctionRef, gain: f32, fallback: f32) {
        if self.refresh_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let cell = Arc::clone(&self.cell);
        let pending = Arc::clone(&self.refresh_pending);
        let current = Arc::clone(&self.generation);
        let generation = current.load(Ordering::Acquire);

        let mut handle = self.runtime.spawn_with_engine(move |engine| {
            if current.load(Ordering::Acquire) != generation {
                return Ok(());
            }
            let coef = match engine.call_scalar(&function, f64::from(gain)) {
                Ok(value) => checked(value).unwrap_or_else(|| {
                    tracing::warn!("{function}({gain}) returned {value}");
                    fallback
                }),
                Err(e) => {
                    tracing::warn!("{function}({gain}) failed: {e}");
                    fallback
                }
            };
            cell.store(gain, coef);
            // A bump since the check means the cell now belongs to a newer
            // activation.
            if current.load(Ordering::Acquire) == generation {
                pending.store(false, Ordering::Release);
            } else {
                cell.clear();
            }
            Ok(())
        });

        if let Some(Err(e)) = handle.try_take() {
            tracing::warn!("Coefficient refresh for {gain} not queued: {e}");
            self.refresh_pending.store(false, Ordering::Release);
        }
    }

    /// Scale `input` into `output`.
    pub fn process(&mut self, gain: f32, input: &[f32], output: &mut [f32]) {
        let coef = self.coefficient(gain);
        scale(coef, input, output);
    }

    /// Scale `buffer` in place.
    pub fn process_in_place(&mut self, gain: f32, buffer: &mut [f32]) {
        let coef = self.coefficient(gain);
        scale_in_place(coef, buffer);
    }

    /// Process one block using the connected ports.
    ///
    /// Without a connected gain port the block is scaled by the fallback
    /// coefficient.
    ///
    /// # Safety
    ///
    /// Connected ports must satisfy [`Ports::buffers`] for `n_samples`.
    pub unsafe fn run(&mut self, n_samples: u32) {
        let ports = self.ports;
        let Some(buffers) = (unsafe { ports.buffers(n_samples as usize) }) else {
            return;
        };
        let coef = match unsafe { ports.gain() } {
            Some(gain) => self.coefficient(gain),
            None => self.config.fallback.coefficient(),
        };
        match buffers {
            Buffers::Separate { input, output } => scale(coef, input, output),
            Buffers::InPlace(buffer) => scale_in_place(coef, buffer),
        }
    }
}

fn scale(coef: f32, input: &[f32], output: &mut [f32]) {
    for (out, sample) in output.iter_mut().zip(input) {
        *out = sample * coef;
    }
}

fn scale_in_place(coef: f32, buffer: &mut [f32]) {
    for sample in buffer {
        *sample *= coef;
    }
}
