//! Host-connected port buffers.

use std::ffi::c_void;
use std::ptr;

/// Port layout declared in `amp.ttl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortIndex {
    Gain = 0,
    Input = 1,
    Output = 2,
}

impl PortIndex {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(PortIndex::Gain),
            1 => Some(PortIndex::Input),
            2 => Some(PortIndex::Output),
            _ => None,
        }
    }
}

/// Sample buffers for one `run` call.
pub enum Buffers<'a> {
    Separate {
        input: &'a [f32],
        output: &'a mut [f32],
    },
    /// The host connected input and output to the same memory.
    InPlace(&'a mut [f32]),
}

/// Raw locations the host connected. Owned by the host, not the plugin.
#[derive(Debug, Clone, Copy)]
pub struct Ports {
    gain: *const f32,
    input: *const f32,
    output: *mut f32,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            gain: ptr::null(),
            input: ptr::null(),
            output: ptr::null_mut(),
        }
    }
}

impl Ports {
    pub fn connect(&mut self, port: PortIndex, data: *mut c_void) {
        match port {
            PortIndex::Gain => self.gain = data as *const f32,
            PortIndex::Input => self.input = data as *const f32,
            PortIndex::Output => self.output = data as *mut f32,
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.gain.is_null() && !self.input.is_null() && !self.output.is_null()
    }

    /// Current value of the gain control port.
    ///
    /// # Safety
    ///
    /// A connected gain pointer must point to a readable `f32`.
    pub unsafe fn gain(&self) -> Option<f32> {
        if self.gain.is_null() {
            return None;
        }
        Some(unsafe { self.gain.read() })
    }

    /// View the audio ports as slices of `n_samples`.
    ///
    /// # Safety
    ///
    /// Connected audio pointers must be valid for `n_samples` floats for the
    /// returned lifetime, and nothing else may access them meanwhile.
    pub unsafe fn buffers<'a>(&self, n_samples: usize) -> Option<Buffers<'a>> {
        if self.input.is_null() || self.output.is_null() {
            return None;
        }
        if ptr::eq(self.input, self.output) {
            let buffer = unsafe { std::slice::from_raw_parts_mut(self.output, n_samples) };
            return Some(Buffers::InPlace(buffer));
        }
        let input = unsafe { std::slice::from_raw_parts(self.input, n_samples) };
        let output = unsafe { std::slice::from_raw_parts_mut(self.output, n_samples) };
        Some(Buffers::Separate { input, output })
    }
}
