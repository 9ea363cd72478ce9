//! Gain-to-coefficient caching for the audio path.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Coefficient applied when the conversion function cannot produce one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Output silence.
    #[default]
    Silence,
    /// Pass the input through unchanged.
    Unity,
}

impl FallbackPolicy {
    pub fn coefficient(self) -> f32 {
        match self {
            FallbackPolicy::Silence => 0.0,
            FallbackPolicy::Unity => 1.0,
        }
    }
}

/// How `run` obtains a coefficient for a gain it has not seen yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoefficientMode {
    /// Block on the script worker inside `run`.
    #[default]
    Synchronous,
    /// Queue the conversion and keep using the last coefficient until it lands.
    Deferred,
}

/// Convert a script result into a usable coefficient.
pub fn checked(value: f64) -> Option<f32> {
    let coef = value as f32;
    coef.is_finite().then_some(coef)
}

// Gain bits all-ones is a NaN pattern; non-finite gains are never stored.
const EMPTY: u64 = u64::MAX;

fn pack(gain: f32, coef: f32) -> u64 {
    (u64::from(gain.to_bits()) << 32) | u64::from(coef.to_bits())
}

fn unpack(packed: u64) -> (f32, f32) {
    (f32::from_bits((packed >> 32) as u32), f32::from_bits(packed as u32))
}

/// Last computed `(gain, coefficient)` pair, readable without locking.
///
/// Both halves live in one atomic word, so a reader never sees a coefficient
/// paired with the wrong gain.
#[derive(Debug)]
pub struct CoefficientCell {
    packed: AtomicU64,
}

impl Default for CoefficientCell {
    fn default() -> Self {
        Self::new()
    }
}

impl CoefficientCell {
    pub const fn new() -> Self {
        Self {
            packed: AtomicU64::new(EMPTY),
        }
    }

    /// Cached coefficient for exactly `gain`.
    pub fn lookup(&self, gain: f32) -> Option<f32> {
        let packed = self.packed.load(Ordering::Acquire);
        if packed == EMPTY {
            return None;
        }
        let (cached_gain, coef) = unpack(packed);
        (cached_gain.to_bits() == gain.to_bits()).then_some(coef)
    }

    /// Most recent coefficient regardless of gain.
    pub fn latest(&self) -> Option<f32> {
        let packed = self.packed.load(Ordering::Acquire);
        (packed != EMPTY).then(|| unpack(packed).1)
    }

    pub fn store(&self, gain: f32, coef: f32) {
        debug_assert!(gain.is_finite());
        self.packed.store(pack(gain, coef), Ordering::Release);
    }

    pub fn clear(&self) {
        self.packed.store(EMPTY, Ordering::Release);
    }
}
