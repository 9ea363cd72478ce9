//! QuickJS engine wrapper.
//!
//! A `ScriptEngine` owns one QuickJS runtime and context. Neither is
//! thread-safe, so the engine is installed in a thread-local slot on the
//! worker thread and reached only through [`with_engine`]. Code running on
//! any other thread gets `RuntimeError::NotOnWorker`.
//!
//! Modules are plain scripts ending in `export default { ... }`. The body is
//! evaluated inside a function scope and the exported object is kept as a
//! persistent value, so top-level declarations never leak into the global
//! scope.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rquickjs::{CatchResultExt, Context, Function, Object, Persistent, Runtime, Value as JsValue};

use crate::error::{RuntimeError, ScriptError};
use crate::globals::register_amp_globals;
use crate::types::{FunctionRef, ScriptValue};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ENGINE: RefCell<Option<ScriptEngine>> = const { RefCell::new(None) };
}

/// Run `f` against the engine installed on the current thread.
pub fn with_engine<T>(
    f: impl FnOnce(&mut ScriptEngine) -> Result<T, ScriptError>,
) -> Result<T, RuntimeError> {
    ENGINE.with(|slot| {
        let mut slot = slot.try_borrow_mut().map_err(|_| RuntimeError::EngineBusy)?;
        let engine = slot.as_mut().ok_or(RuntimeError::NotOnWorker)?;
        f(engine).map_err(RuntimeError::from)
    })
}

/// Install `engine` on the current thread. Fails if one is already present.
pub(crate) fn install(engine: ScriptEngine) -> Result<(), RuntimeError> {
    ENGINE.with(|slot| {
        let mut slot = slot.try_borrow_mut().map_err(|_| RuntimeError::EngineBusy)?;
        if slot.is_some() {
            return Err(RuntimeError::Init(
                "an engine is already installed on this thread".to_string(),
            ));
        }
        *slot = Some(engine);
        Ok(())
    })
}

/// Remove the engine from the current thread.
pub(crate) fn uninstall() -> Result<Option<ScriptEngine>, RuntimeError> {
    ENGINE.with(|slot| {
        let mut slot = slot.try_borrow_mut().map_err(|_| RuntimeError::EngineBusy)?;
        Ok(slot.take())
    })
}

fn exception(e: impl std::fmt::Display) -> ScriptError {
    ScriptError::Exception(e.to_string())
}

/// Where a loaded module's code came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ModuleOrigin {
    File(PathBuf),
    Source(u64),
}

impl ModuleOrigin {
    fn file(path: &Path) -> Self {
        ModuleOrigin::File(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
    }

    fn source(source: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        ModuleOrigin::Source(hasher.finish())
    }
}

impl fmt::Display for ModuleOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleOrigin::File(path) => write!(f, "{}", path.display()),
            ModuleOrigin::Source(hash) => write!(f, "inline source {hash:016x}"),
        }
    }
}

struct LoadedModule {
    exports: Persistent<Object<'static>>,
    origin: ModuleOrigin,
}

// ─────────────────────────────────────────────────────────────────────────────
// Script Engine
// ─────────────────────────────────────────────────────────────────────────────

/// A QuickJS runtime plus the modules and functions resolved from it.
///
/// Field order matters: persistent values must be released before the
/// context and runtime they belong to.
pub struct ScriptEngine {
    id: u64,
    functions: Vec<Persistent<Function<'static>>>,
    function_index: HashMap<(String, String), usize>,
    modules: HashMap<String, LoadedModule>,
    context: Context,
    runtime: Runtime,
}

impl ScriptEngine {
    /// Create a new engine with the `amp` and `console` globals registered.
    pub fn new() -> Result<Self, ScriptError> {
        let runtime = Runtime::new().map_err(|e| ScriptError::EngineCreation(e.to_string()))?;
        let context =
            Context::full(&runtime).map_err(|e| ScriptError::EngineCreation(e.to_string()))?;

        context
            .with(|ctx| register_amp_globals(&ctx))
            .map_err(|e| ScriptError::EngineCreation(e.to_string()))?;

        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("[engine:{}] created", id);

        Ok(Self {
            id,
            functions: Vec::new(),
            function_index: HashMap::new(),
            modules: HashMap::new(),
            context,
            runtime,
        })
    }

    /// Unique id of this engine instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cap the heap size of the runtime.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.runtime.set_memory_limit(bytes);
    }

    /// Evaluate `source` in the global scope.
    pub fn eval(&self, source: &str) -> Result<ScriptValue, ScriptError> {
        self.context.with(|ctx| {
            let value: JsValue = ctx.eval(source).catch(&ctx).map_err(exception)?;
            Ok::<_, ScriptError>(ScriptValue::from_js(&value))
        })
    }

    /// Whether a module with this name has been loaded.
    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Load a module from a file, once per module name.
    ///
    /// Loading the same file under the same name again is a no-op; returns
    /// whether the module was newly loaded. A name already bound to other
    /// code fails with `ScriptError::ModuleConflict`.
    pub fn load_module_file(&mut self, name: &str, path: &Path) -> Result<bool, ScriptError> {
        let origin = ModuleOrigin::file(path);
        if self.is_loaded(name, &origin)? {
            return Ok(false);
        }
        let source = std::fs::read_to_string(path).map_err(|e| ScriptError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        tracing::debug!("[engine:{}] loading module {} from {}", self.id, name, path.display());
        self.define_module(name, &source, origin)?;
        Ok(true)
    }

    /// Load a module from source. Same once-only rule as [`Self::load_module_file`],
    /// keyed on the source text.
    pub fn load_module_source(&mut self, name: &str, source: &str) -> Result<bool, ScriptError> {
        let origin = ModuleOrigin::source(source);
        if self.is_loaded(name, &origin)? {
            return Ok(false);
        }
        self.define_module(name, source, origin)?;
        Ok(true)
    }

    fn is_loaded(&self, name: &str, origin: &ModuleOrigin) -> Result<bool, ScriptError> {
        match self.modules.get(name) {
            None => Ok(false),
            Some(loaded) if loaded.origin == *origin => Ok(true),
            Some(loaded) => Err(ScriptError::ModuleConflict {
                name: name.to_string(),
                loaded: loaded.origin.to_string(),
                requested: origin.to_string(),
            }),
        }
    }

    fn define_module(
        &mut self,
        name: &str,
        source: &str,
        origin: ModuleOrigin,
    ) -> Result<(), ScriptError> {
        let wrapped = format!(
            "(() => {{\n{}\n}})()",
            source.replace("export default", "return")
        );

        let exports = self.context.with(|ctx| {
            let value: JsValue = ctx.eval(wrapped).catch(&ctx).map_err(exception)?;
            let object = value
                .into_object()
                .ok_or_else(|| ScriptError::InvalidModule(name.to_string()))?;
            Ok::<_, ScriptError>(Persistent::save(&ctx, object))
        })?;

        self.modules
            .insert(name.to_string(), LoadedModule { exports, origin });
        tracing::debug!("[engine:{}] module {} loaded", self.id, name);
        Ok(())
    }

    /// Resolve `module.name` to a callable handle.
    ///
    /// Repeated lookups of the same function return the same handle.
    pub fn get_function(&mut self, module: &str, name: &str) -> Result<FunctionRef, ScriptError> {
        let key = (module.to_string(), name.to_string());
        if let Some(&slot) = self.function_index.get(&key) {
            return Ok(FunctionRef::new(self.id, slot, module, name));
        }

        let exports = self
            .modules
            .get(module)
            .map(|loaded| loaded.exports.clone())
            .ok_or_else(|| ScriptError::ModuleNotFound(module.to_string()))?;

        let function = self.context.with(|ctx| {
            let exports = exports.restore(&ctx).map_err(exception)?;
            let value: JsValue = exports.get(name).catch(&ctx).map_err(exception)?;
            if value.is_undefined() {
                return Err(ScriptError::FunctionNotFound {
                    module: module.to_string(),
                    name: name.to_string(),
                });
            }
            let function = value.into_function().ok_or_else(|| ScriptError::NotAFunction {
                module: module.to_string(),
                name: name.to_string(),
            })?;
            Ok::<_, ScriptError>(Persistent::save(&ctx, function))
        })?;

        let slot = self.functions.len();
        self.functions.push(function);
        self.function_index.insert(key, slot);
        Ok(FunctionRef::new(self.id, slot, module, name))
    }

    /// Call `function` with one numeric argument and return its value.
    pub fn call(&self, function: &FunctionRef, arg: f64) -> Result<ScriptValue, ScriptError> {
        if function.engine != self.id {
            return Err(ScriptError::StaleFunction(function.to_string()));
        }
        let persistent = self
            .functions
            .get(function.slot)
            .cloned()
            .ok_or_else(|| ScriptError::StaleFunction(function.to_string()))?;

        self.context.with(|ctx| {
            let callee = persistent.restore(&ctx).map_err(exception)?;
            let value: JsValue = callee.call((arg,)).catch(&ctx).map_err(exception)?;
            Ok::<_, ScriptError>(ScriptValue::from_js(&value))
        })
    }

    /// Call `function` and require a numeric result.
    pub fn call_scalar(&self, function: &FunctionRef, arg: f64) -> Result<f64, ScriptError> {
        let value = self.call(function, arg)?;
        value.as_number().ok_or_else(|| ScriptError::UnexpectedType {
            expected: "number",
            found: value.type_name().to_string(),
        })
    }

    /// Run a full garbage collection cycle.
    pub fn collect_garbage(&self) {
        self.runtime.run_gc();
    }

    /// Release every resolved function and module, then free the runtime.
    pub fn shutdown(mut self) {
        let id = self.id;
        self.function_index.clear();
        self.functions.clear();
        self.modules.clear();
        self.runtime.run_gc();
        drop(self);
        tracing::debug!("[engine:{}] shut down", id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const AMP_MODULE: &str = r#"
        function db_to_coef(gain) {
            return gain < 9.0 ? Math.pow(10, -0.05 * gain) : 0;
        }
        export default { db_to_coef, threshold: 9.0 };
    "#;

    #[test]
    fn test_eval_primitives() {
        let engine = ScriptEngine::new().unwrap();

        assert_eq!(engine.eval("40 + 2").unwrap(), ScriptValue::Number(42.0));
        assert_eq!(engine.eval("0.5").unwrap(), ScriptValue::Number(0.5));
        assert_eq!(engine.eval("'hello'").unwrap(), ScriptValue::String("hello".into()));
        assert_eq!(engine.eval("true").unwrap(), ScriptValue::Bool(true));
        assert_eq!(engine.eval("undefined").unwrap(), ScriptValue::Undefined);
        assert_eq!(engine.eval("null").unwrap(), ScriptValue::Null);
    }

    #[test]
    fn test_eval_exception_is_classified() {
        let engine = ScriptEngine::new().unwrap();
        let err = engine.eval("throw new Error('nope')").unwrap_err();
        match err {
            ScriptError::Exception(msg) => assert!(msg.contains("nope"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }

        // The engine stays usable after an exception.
        assert_eq!(engine.eval("1").unwrap(), ScriptValue::Number(1.0));
    }

    #[test]
    fn test_globals_are_registered() {
        let engine = ScriptEngine::new().unwrap();
        assert_eq!(engine.eval("typeof amp.log").unwrap(), ScriptValue::String("function".into()));
        assert_eq!(
            engine.eval("typeof console.warn").unwrap(),
            ScriptValue::String("function".into())
        );
        engine.eval("console.log('x', 1, true); amp.log(2)").unwrap();
    }

    #[test]
    fn test_load_module_once() {
        let mut engine = ScriptEngine::new().unwrap();
        assert!(engine.load_module_source("amp", AMP_MODULE).unwrap());
        assert!(!engine.load_module_source("amp", AMP_MODULE).unwrap());
        assert!(engine.has_module("amp"));

        // Module scope does not leak into the global scope.
        assert_eq!(
            engine.eval("typeof db_to_coef").unwrap(),
            ScriptValue::String("undefined".into())
        );
    }

    #[test]
    fn test_same_name_different_code_conflicts() {
        let mut engine = ScriptEngine::new().unwrap();
        engine.load_module_source("amp", AMP_MODULE).unwrap();

        let err = engine
            .load_module_source("amp", "export default { db_to_coef: (g) => 0.25 };")
            .unwrap_err();
        assert!(matches!(err, ScriptError::ModuleConflict { ref name, .. } if name == "amp"));

        // The original binding is untouched.
        let f = engine.get_function("amp", "db_to_coef").unwrap();
        assert_eq!(engine.call_scalar(&f, 0.0).unwrap(), 1.0);
    }

    #[test]
    fn test_call_scalar() {
        let mut engine = ScriptEngine::new().unwrap();
        engine.load_module_source("amp", AMP_MODULE).unwrap();
        let f = engine.get_function("amp", "db_to_coef").unwrap();

        let coef = engine.call_scalar(&f, -3.0).unwrap();
        assert!((coef - 10f64.powf(0.15)).abs() < 1e-9);

        assert_eq!(engine.call_scalar(&f, 9.0).unwrap(), 0.0);
        assert_eq!(engine.call_scalar(&f, 20.0).unwrap(), 0.0);
        assert_eq!(engine.call_scalar(&f, 0.0).unwrap(), 1.0);
    }

    #[test]
    fn test_get_function_is_cached() {
        let mut engine = ScriptEngine::new().unwrap();
        engine.load_module_source("amp", AMP_MODULE).unwrap();
        let a = engine.get_function("amp", "db_to_coef").unwrap();
        let b = engine.get_function("amp", "db_to_coef").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_lookup_errors() {
        let mut engine = ScriptEngine::new().unwrap();
        engine.load_module_source("amp", AMP_MODULE).unwrap();

        assert_eq!(
            engine.get_function("missing", "db_to_coef").unwrap_err(),
            ScriptError::ModuleNotFound("missing".into())
        );
        assert_eq!(
            engine.get_function("amp", "nope").unwrap_err(),
            ScriptError::FunctionNotFound {
                module: "amp".into(),
                name: "nope".into()
            }
        );
        assert_eq!(
            engine.get_function("amp", "threshold").unwrap_err(),
            ScriptError::NotAFunction {
                module: "amp".into(),
                name: "threshold".into()
            }
        );
    }

    #[test]
    fn test_invalid_module() {
        let mut engine = ScriptEngine::new().unwrap();
        assert_eq!(
            engine.load_module_source("bad", "export default 5;").unwrap_err(),
            ScriptError::InvalidModule("bad".into())
        );
        assert!(!engine.has_module("bad"));
        assert!(matches!(
            engine.load_module_source("broken", "export default {").unwrap_err(),
            ScriptError::Exception(_)
        ));
    }

    #[test]
    fn test_call_errors() {
        let mut engine = ScriptEngine::new().unwrap();
        engine
            .load_module_source(
                "odd",
                r#"
                export default {
                    text: (x) => "gain " + x,
                    fail: (x) => { throw new RangeError("bad gain " + x); },
                };
                "#,
            )
            .unwrap();

        let text = engine.get_function("odd", "text").unwrap();
        assert_eq!(
            engine.call_scalar(&text, 1.0).unwrap_err(),
            ScriptError::UnexpectedType {
                expected: "number",
                found: "string".into()
            }
        );

        let fail = engine.get_function("odd", "fail").unwrap();
        let err = engine.call_scalar(&fail, 2.0).unwrap_err();
        assert!(matches!(err, ScriptError::Exception(ref msg) if msg.contains("bad gain")));
    }

    #[test]
    fn test_function_from_other_engine_is_stale() {
        let mut first = ScriptEngine::new().unwrap();
        first.load_module_source("amp", AMP_MODULE).unwrap();
        let f = first.get_function("amp", "db_to_coef").unwrap();

        let second = ScriptEngine::new().unwrap();
        assert!(matches!(
            second.call_scalar(&f, 1.0).unwrap_err(),
            ScriptError::StaleFunction(_)
        ));
    }

    #[test]
    fn test_load_module_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("amp.js");
        std::fs::write(&path, AMP_MODULE).unwrap();

        let mut engine = ScriptEngine::new().unwrap();
        assert!(engine.load_module_file("amp", &path).unwrap());
        assert!(!engine.load_module_file("amp", &dir.path().join(".").join("amp.js")).unwrap());

        let other = dir.path().join("other.js");
        std::fs::write(&other, AMP_MODULE).unwrap();
        assert!(matches!(
            engine.load_module_file("amp", &other).unwrap_err(),
            ScriptError::ModuleConflict { .. }
        ));

        let missing = dir.path().join("missing.js");
        assert!(matches!(
            engine.load_module_file("other", &missing).unwrap_err(),
            ScriptError::Io { .. }
        ));
    }

    #[test]
    fn test_with_engine_off_worker() {
        let result = with_engine(|engine| Ok(engine.id()));
        assert!(matches!(result, Err(RuntimeError::NotOnWorker)));
    }

    #[test]
    fn test_install_and_nested_access() {
        std::thread::spawn(|| {
            install(ScriptEngine::new().unwrap()).unwrap();
            let nested = with_engine(|_| Ok(with_engine(|e| Ok(e.id()))));
            assert!(matches!(nested, Ok(Err(RuntimeError::EngineBusy))));

            let engine = uninstall().unwrap().unwrap();
            engine.shutdown();
            assert!(uninstall().unwrap().is_none());
        })
        .join()
        .unwrap();
    }
}
