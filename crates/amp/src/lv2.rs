//! LV2 descriptor and C entry points.
//!
//! Hosts locate the plugin by loading the shared library and calling
//! [`lv2_descriptor`]. The handle they get back from `instantiate` is a boxed
//! [`AmpPlugin`].

use std::ffi::{CStr, c_char, c_void};
use std::path::PathBuf;
use std::ptr;

use crate::ffi_guard::{guard_void, guard_with_default};
use crate::plugin::AmpPlugin;
use crate::ports::PortIndex;

pub const AMP_URI: &CStr = c"http://lv2plug.in/plugins/eg-js-amp";

pub type LV2Handle = *mut c_void;

#[repr(C)]
pub struct LV2Feature {
    pub uri: *const c_char,
    pub data: *mut c_void,
}

#[repr(C)]
pub struct LV2Descriptor {
    pub uri: *const c_char,
    pub instantiate: Option<
        unsafe extern "C" fn(
            descriptor: *const LV2Descriptor,
            sample_rate: f64,
            bundle_path: *const c_char,
            features: *const *const LV2Feature,
        ) -> LV2Handle,
    >,
    pub connect_port: Option<unsafe extern "C" fn(instance: LV2Handle, port: u32, data: *mut c_void)>,
    pub activate: Option<unsafe extern "C" fn(instance: LV2Handle)>,
    pub run: Option<unsafe extern "C" fn(instance: LV2Handle, sample_count: u32)>,
    pub deactivate: Option<unsafe extern "C" fn(instance: LV2Handle)>,
    pub cleanup: Option<unsafe extern "C" fn(instance: LV2Handle)>,
    pub extension_data: Option<unsafe extern "C" fn(uri: *const c_char) -> *const c_void>,
}

// Immutable after construction; the pointers are to static data.
unsafe impl Sync for LV2Descriptor {}

static DESCRIPTOR: LV2Descriptor = LV2Descriptor {
    uri: AMP_URI.as_ptr(),
    instantiate: Some(instantiate),
    connect_port: Some(connect_port),
    activate: Some(activate),
    run: Some(run),
    deactivate: Some(deactivate),
    cleanup: Some(cleanup),
    extension_data: Some(extension_data),
};

/// Plugin lookup entry point.
#[unsafe(no_mangle)]
pub extern "C" fn lv2_descriptor(index: u32) -> *const LV2Descriptor {
    match index {
        0 => &DESCRIPTOR,
        _ => ptr::null(),
    }
}

unsafe fn instance<'a>(handle: LV2Handle) -> Option<&'a mut AmpPlugin> {
    unsafe { handle.cast::<AmpPlugin>().as_mut() }
}

unsafe extern "C" fn instantiate(
    _descriptor: *const LV2Descriptor,
    _sample_rate: f64,
    bundle_path: *const c_char,
    _features: *const *const LV2Feature,
) -> LV2Handle {
    guard_with_default("instantiate", ptr::null_mut(), || {
        let bundle = if bundle_path.is_null() {
            PathBuf::from(".")
        } else {
            let path = unsafe { CStr::from_ptr(bundle_path) };
            PathBuf::from(path.to_string_lossy().into_owned())
        };

        match AmpPlugin::instantiate(&bundle) {
            Ok(plugin) => Box::into_raw(Box::new(plugin)).cast(),
            Err(e) => {
                tracing::error!("Failed to instantiate {}: {e}", bundle.display());
                ptr::null_mut()
            }
        }
    })
}

unsafe extern "C" fn connect_port(handle: LV2Handle, port: u32, data: *mut c_void) {
    guard_void("connect_port", || {
        let Some(plugin) = (unsafe { instance(handle) }) else {
            return;
        };
        match PortIndex::from_index(port) {
            Some(port) => plugin.connect_port(port, data),
            None => tracing::trace!("Ignoring unknown port {port}"),
        }
    })
}

unsafe extern "C" fn activate(handle: LV2Handle) {
    guard_void("activate", || {
        if let Some(plugin) = unsafe { instance(handle) } {
            // Already logged; the instance stays silent until reactivated.
            let _ = plugin.activate();
        }
    })
}

unsafe extern "C" fn run(handle: LV2Handle, sample_count: u32) {
    guard_void("run", || {
        if let Some(plugin) = unsafe { instance(handle) } {
            unsafe { plugin.run(sample_count) };
        }
    })
}

unsafe extern "C" fn deactivate(handle: LV2Handle) {
    guard_void("deactivate", || {
        if let Some(plugin) = unsafe { instance(handle) } {
            plugin.deactivate();
        }
    })
}

unsafe extern "C" fn cleanup(handle: LV2Handle) {
    guard_void("cleanup", || {
        if !handle.is_null() {
            drop(unsafe { Box::from_raw(handle.cast::<AmpPlugin>()) });
        }
    })
}

unsafe extern "C" fn extension_data(_uri: *const c_char) -> *const c_void {
    ptr::null()
}
