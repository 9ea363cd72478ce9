//! Runtime context: lifecycle owner of the script engine.
//!
//! A `RuntimeContext` owns one [`Worker`] and the [`ScriptEngine`] installed
//! on it. The engine is created on the worker before the context is handed
//! out and freed on the worker as the last task the queue accepts, so every
//! engine call happens after initialization and before shutdown, on the same
//! thread.
//!
//! Contexts are cheap to clone. The last clone to go away shuts the engine
//! down; `shutdown()` does it explicitly. Either way it happens once.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::engine::{self, ScriptEngine};
use crate::error::{RuntimeError, ScriptError};
use crate::types::{FunctionRef, ScriptValue};
use crate::worker::{TaskHandle, Worker};

type Hook = Box<dyn FnOnce() + Send + 'static>;

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for a [`RuntimeContext`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    on_init: Option<Hook>,
    on_shutdown: Option<Hook>,
}

impl RuntimeBuilder {
    /// Run `f` on the worker thread once the engine is ready.
    pub fn on_init(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_init = Some(Box::new(f));
        self
    }

    /// Run `f` on the worker thread just before the engine is freed.
    pub fn on_shutdown(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_shutdown = Some(Box::new(f));
        self
    }

    /// Spawn the worker and initialize the engine on it.
    ///
    /// Fails with `RuntimeError::Init` without leaving a partially
    /// initialized engine behind.
    pub fn start(self) -> Result<RuntimeContext, RuntimeError> {
        let RuntimeBuilder {
            config,
            on_init,
            on_shutdown,
        } = self;

        let worker = Worker::new(config.worker_name.clone())?;
        tracing::debug!("[runtime:{}] initializing engine", config.worker_name);

        let startup = config.startup_script.clone();
        let memory_limit = config.memory_limit_bytes;
        worker
            .run(move || -> Result<(), RuntimeError> {
                let engine = ScriptEngine::new()?;
                if let Some(bytes) = memory_limit {
                    engine.set_memory_limit(bytes);
                }
                if let Some(source) = startup {
                    engine.eval(&source)?;
                }
                engine::install(engine)?;
                if let Some(hook) = on_init {
                    hook();
                }
                Ok(())
            })
            .and_then(|init| init)
            .map_err(|e| match e {
                RuntimeError::Init(msg) => RuntimeError::Init(msg),
                other => RuntimeError::Init(other.to_string()),
            })?;

        tracing::info!("[runtime:{}] script engine ready", config.worker_name);

        Ok(RuntimeContext {
            inner: Arc::new(ContextInner {
                worker,
                config,
                shut_down: AtomicBool::new(false),
                on_shutdown: Mutex::new(on_shutdown),
            }),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct ContextInner {
    worker: Worker,
    config: RuntimeConfig,
    shut_down: AtomicBool,
    on_shutdown: Mutex<Option<Hook>>,
}

impl ContextInner {
    fn shutdown(&self) -> Result<(), RuntimeError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let name = self.config.worker_name.clone();
        tracing::debug!("[runtime:{}] shutting down", name);

        let script = self.config.shutdown_script.clone();
        let hook = self.on_shutdown.lock().take();
        let task_name = name.clone();
        let mut last = self.worker.close_with(move || -> Result<(), RuntimeError> {
            let engine = engine::uninstall()?;
            if let (Some(engine), Some(source)) = (engine.as_ref(), script) {
                if let Err(e) = engine.eval(&source) {
                    tracing::warn!("[runtime:{}] shutdown script failed: {}", task_name, e);
                }
            }
            if let Some(hook) = hook {
                hook();
            }
            if let Some(engine) = engine {
                engine.shutdown();
            }
            Ok(())
        });

        if self.worker.is_worker_thread() {
            // Dropped from inside a task: the final task runs after this one.
            drop(last);
            return self.worker.shutdown();
        }

        // Joining drains the queue, so the final task has resolved by now.
        self.worker.shutdown()?;
        let result = last
            .try_take()
            .unwrap_or(Err(RuntimeError::Terminated))
            .and_then(|done| done);
        tracing::info!("[runtime:{}] script engine shut down", name);
        result
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(
                "[runtime:{}] shutdown failed: {}",
                self.config.worker_name,
                e
            );
        }
    }
}

/// Handle to a running script engine and its worker thread.
///
/// Every call is executed on the worker thread in submission order.
#[derive(Clone)]
pub struct RuntimeContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("worker", &self.inner.worker.name())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RuntimeContext {
    /// Start building a context.
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            on_init: None,
            on_shutdown: None,
        }
    }

    /// Start a context without hooks.
    pub fn start(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::builder(config).start()
    }

    /// Configuration the context was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Whether the engine is still accepting calls.
    pub fn is_running(&self) -> bool {
        !self.inner.shut_down.load(Ordering::SeqCst) && !self.inner.worker.is_closed()
    }

    /// Whether two handles refer to the same context.
    pub fn ptr_eq(&self, other: &RuntimeContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Shut the engine down and join the worker. Later calls are no-ops.
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        self.inner.shutdown()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Task submission
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue `f` on the worker and return immediately.
    pub fn spawn<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.worker.spawn(f)
    }

    /// Run `f` on the worker and block until it completes.
    pub fn run<F, T>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.worker.run(f)
    }

    /// Enqueue `f` with access to the engine.
    pub fn spawn_with_engine<F, T>(&self, f: F) -> TaskHandle<Result<T, RuntimeError>>
    where
        F: FnOnce(&mut ScriptEngine) -> Result<T, ScriptError> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(move || engine::with_engine(f))
    }

    /// Run `f` with access to the engine and block until it completes.
    pub fn run_with_engine<F, T>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(&mut ScriptEngine) -> Result<T, ScriptError> + Send + 'static,
        T: Send + 'static,
    {
        self.run(move || engine::with_engine(f))?
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Engine calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Evaluate `source` in the engine's global scope.
    pub fn eval(&self, source: impl Into<String>) -> Result<ScriptValue, RuntimeError> {
        let source = source.into();
        self.run_with_engine(move |engine| engine.eval(&source))
    }

    /// Load a module from a file, once per module name.
    pub fn load_module(&self, name: &str, path: impl AsRef<Path>) -> Result<bool, RuntimeError> {
        let name = name.to_string();
        let path = path.as_ref().to_path_buf();
        self.run_with_engine(move |engine| engine.load_module_file(&name, &path))
    }

    /// Load a module from source, once per module name.
    pub fn load_module_source(
        &self,
        name: &str,
        source: impl Into<String>,
    ) -> Result<bool, RuntimeError> {
        let name = name.to_string();
        let source = source.into();
        self.run_with_engine(move |engine| engine.load_module_source(&name, &source))
    }

    /// Resolve a function exported by a loaded module.
    pub fn get_function(&self, module: &str, name: &str) -> Result<FunctionRef, RuntimeError> {
        let module = module.to_string();
        let name = name.to_string();
        self.run_with_engine(move |engine| engine.get_function(&module, &name))
    }

    /// Call `function` with one number and require a number back.
    pub fn call_scalar(&self, function: &FunctionRef, arg: f64) -> Result<f64, RuntimeError> {
        let function = function.clone();
        self.run_with_engine(move |engine| engine.call_scalar(&function, arg))
    }

    /// Run a garbage collection cycle on the worker.
    pub fn collect_garbage(&self) -> Result<(), RuntimeError> {
        self.run_with_engine(|engine| {
            engine.collect_garbage();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const AMP_MODULE: &str = r#"
        function db_to_coef(gain) {
            return gain < 9.0 ? Math.pow(10, -0.05 * gain) : 0;
        }
        export default { db_to_coef };
    "#;

    fn config(name: &str) -> RuntimeConfig {
        RuntimeConfig::default().with_worker_name(name)
    }

    #[test]
    fn test_engine_initialized_on_worker_thread() {
        let init_thread = Arc::new(Mutex::new(None));
        let seen = init_thread.clone();
        let ctx = RuntimeContext::builder(config("ctx-init"))
            .on_init(move || {
                *seen.lock() = thread::current().name().map(str::to_string);
            })
            .start()
            .unwrap();

        assert_eq!(init_thread.lock().as_deref(), Some("ctx-init"));
        assert!(ctx.is_running());
        assert_eq!(ctx.eval("1 + 1").unwrap(), ScriptValue::Number(2.0));
    }

    #[test]
    fn test_engine_unreachable_from_caller_thread() {
        let ctx = RuntimeContext::start(config("ctx-caller")).unwrap();
        let result = engine::with_engine(|engine| Ok(engine.id()));
        assert!(matches!(result, Err(RuntimeError::NotOnWorker)));
        assert!(ctx.run_with_engine(|engine| Ok(engine.id())).is_ok());
    }

    #[test]
    fn test_failed_startup_script_is_init_error() {
        let result = RuntimeContext::start(
            config("ctx-bad-startup").with_startup_script("throw new Error('no start')"),
        );
        match result {
            Err(RuntimeError::Init(msg)) => assert!(msg.contains("no start"), "{}", msg),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_shutdown_runs_exactly_once() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = shutdowns.clone();
        let ctx = RuntimeContext::builder(config("ctx-shutdown-once"))
            .on_shutdown(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .unwrap();
        let clone = ctx.clone();

        ctx.shutdown().unwrap();
        clone.shutdown().unwrap();
        assert!(!ctx.is_running());
        drop(ctx);
        drop(clone);

        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_last_clone_drop_shuts_down() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = shutdowns.clone();
        let ctx = RuntimeContext::builder(config("ctx-drop"))
            .on_shutdown(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .unwrap();

        let clones: Vec<_> = (0..4).map(|_| ctx.clone()).collect();
        drop(ctx);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        drop(clones);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_shutdown_script_still_tears_down() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = shutdowns.clone();
        let ctx = RuntimeContext::builder(
            config("ctx-bad-shutdown").with_shutdown_script("throw new Error('late')"),
        )
        .on_shutdown(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .unwrap();

        ctx.shutdown().unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_calls_after_shutdown_fail() {
        let ctx = RuntimeContext::start(config("ctx-after")).unwrap();
        ctx.shutdown().unwrap();
        assert!(matches!(ctx.eval("1"), Err(RuntimeError::Terminated)));
        assert!(matches!(ctx.run(|| 1), Err(RuntimeError::Terminated)));
    }

    #[test]
    fn test_tasks_accepted_before_shutdown_complete() {
        let ctx = RuntimeContext::start(config("ctx-drain")).unwrap();
        let handles: Vec<_> = (0..20)
            .map(|i| ctx.spawn_with_engine(move |engine| engine.eval(&format!("{} * 2", i))))
            .collect();
        ctx.shutdown().unwrap();

        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.wait().unwrap().unwrap();
            assert_eq!(value, ScriptValue::Number((i * 2) as f64));
        }
    }

    #[test]
    fn test_exception_leaves_engine_usable() {
        let ctx = RuntimeContext::start(config("ctx-exception")).unwrap();
        ctx.load_module_source(
            "flaky",
            r#"
            export default {
                coef: (gain) => {
                    if (gain > 100) { throw new Error("gain out of range"); }
                    return gain / 2;
                },
            };
            "#,
        )
        .unwrap();
        let f = ctx.get_function("flaky", "coef").unwrap();

        let err = ctx.call_scalar(&f, 1000.0).unwrap_err();
        assert!(matches!(err.script_error(), Some(ScriptError::Exception(_))));
        assert_eq!(ctx.call_scalar(&f, 4.0).unwrap(), 2.0);
    }

    #[test]
    fn test_concurrent_callers_are_serialized() {
        let ctx = RuntimeContext::start(config("ctx-concurrent")).unwrap();
        ctx.load_module_source("amp", AMP_MODULE).unwrap();
        let f = ctx.get_function("amp", "db_to_coef").unwrap();
        ctx.eval("globalThis.calls = 0").unwrap();

        let callers: Vec<_> = (0..8)
            .map(|t| {
                let ctx = ctx.clone();
                let f = f.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let gain = -((t * 50 + i) % 12) as f64;
                        let coef = ctx.call_scalar(&f, gain).unwrap();
                        assert!((coef - 10f64.powf(-0.05 * gain)).abs() < 1e-9);
                        ctx.eval("globalThis.calls += 1").unwrap();
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        assert_eq!(ctx.eval("globalThis.calls").unwrap(), ScriptValue::Number(400.0));
    }

    #[test]
    fn test_function_ref_from_other_context_is_rejected() {
        let a = RuntimeContext::start(config("ctx-a")).unwrap();
        let b = RuntimeContext::start(config("ctx-b")).unwrap();
        a.load_module_source("amp", AMP_MODULE).unwrap();
        b.load_module_source("amp", AMP_MODULE).unwrap();
        let f = a.get_function("amp", "db_to_coef").unwrap();

        let err = b.call_scalar(&f, 0.0).unwrap_err();
        assert!(matches!(err.script_error(), Some(ScriptError::StaleFunction(_))));
        assert_eq!(a.call_scalar(&f, 0.0).unwrap(), 1.0);
    }

    #[test]
    fn test_load_module_is_idempotent() {
        let ctx = RuntimeContext::start(config("ctx-load-once")).unwrap();
        assert!(ctx.load_module_source("amp", AMP_MODULE).unwrap());
        assert!(!ctx.load_module_source("amp", AMP_MODULE).unwrap());
        ctx.collect_garbage().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_with_engine_is_awaitable() {
        let ctx = RuntimeContext::start(config("ctx-async")).unwrap();
        let value = ctx
            .spawn_with_engine(|engine| engine.eval("'from worker'"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, ScriptValue::String("from worker".into()));
    }

    #[tokio::test]
    async fn test_blocking_api_inside_async_runtime() {
        let ctx = RuntimeContext::start(config("ctx-block-in-async")).unwrap();
        assert_eq!(ctx.run(|| 6 * 7).unwrap(), 42);
        assert_eq!(ctx.eval("2 + 3").unwrap(), ScriptValue::Number(5.0));

        ctx.load_module_source("amp", AMP_MODULE).unwrap();
        let f = ctx.get_function("amp", "db_to_coef").unwrap();
        assert_eq!(ctx.call_scalar(&f, 0.0).unwrap(), 1.0);

        ctx.shutdown().unwrap();
        assert!(matches!(ctx.eval("1"), Err(RuntimeError::Terminated)));
    }
}
