//! Lifecycle of the process-wide runtime behind the exported descriptor.
//!
//! Kept in its own test binary so no other instance holds the shared runtime.

use std::ffi::CString;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use amp::lv2::{LV2Descriptor, LV2Handle, lv2_descriptor};
use amp_js_runtime::shared;

const AMP_JS: &str = include_str!("../bundle/amp.js");

const AMP_TOML: &str = r#"
[runtime]
worker_name = "amp-teardown-test"
shutdown_script = "amp.log('runtime-teardown')"
"#;

/// Counts `amp.log('runtime-teardown')` calls made by scripts.
struct TeardownCounter(Arc<AtomicUsize>);

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for TeardownCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != "amp.js" {
            return;
        }
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        if visitor.0 == "runtime-teardown" {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn instantiate(descriptor: &LV2Descriptor, bundle: &CString) -> LV2Handle {
    let handle = unsafe { descriptor.instantiate.unwrap()(descriptor, 48_000.0, bundle.as_ptr(), ptr::null()) };
    assert!(!handle.is_null());
    handle
}

fn run_once(descriptor: &LV2Descriptor, handle: LV2Handle) {
    let mut gain = 0.0f32;
    let mut input = [1.0f32, 2.0];
    let mut output = [0.0f32; 2];
    unsafe {
        let connect = descriptor.connect_port.unwrap();
        connect(handle, 0, (&raw mut gain).cast());
        connect(handle, 1, input.as_mut_ptr().cast());
        connect(handle, 2, output.as_mut_ptr().cast());
        descriptor.run.unwrap()(handle, 2);
    }
    assert_eq!(output, input);
}

#[test]
fn test_shared_runtime_shuts_down_once_after_last_cleanup() {
    let shutdowns = Arc::new(AtomicUsize::new(0));
    tracing_subscriber::registry()
        .with(TeardownCounter(shutdowns.clone()))
        .init();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("amp.js"), AMP_JS).unwrap();
    std::fs::write(dir.path().join("amp.toml"), AMP_TOML).unwrap();
    let bundle = CString::new(dir.path().to_str().unwrap()).unwrap();
    let descriptor = unsafe { &*lv2_descriptor(0) };

    let handles: Vec<LV2Handle> = (0..4).map(|_| instantiate(descriptor, &bundle)).collect();
    let runtime = shared::current().unwrap();
    assert_eq!(runtime.config().worker_name, "amp-teardown-test");
    drop(runtime);

    for &handle in &handles {
        unsafe { descriptor.activate.unwrap()(handle) };
        run_once(descriptor, handle);
    }

    for (i, &handle) in handles.iter().enumerate() {
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0, "shut down before instance {i}");
        unsafe {
            descriptor.deactivate.unwrap()(handle);
            descriptor.cleanup.unwrap()(handle);
        }
    }
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    assert!(shared::current().is_none());

    // A later instance gets a fresh runtime with its own single shutdown.
    let handle = instantiate(descriptor, &bundle);
    unsafe {
        descriptor.activate.unwrap()(handle);
        run_once(descriptor, handle);
        descriptor.cleanup.unwrap()(handle);
    }
    assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
}
