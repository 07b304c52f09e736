//! Memory Sampling Abstraction
//!
//! The in-process cache watches overall memory usage so it can shed decrypted
//! buffers before the host starts swapping or the OS kills the process.

use serde::{Deserialize, Serialize};

use crate::platform::PlatformSendSync;

/// One reading of memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    /// Bytes currently in use.
    pub used_bytes: u64,
    /// Bytes available before the platform considers memory exhausted.
    pub limit_bytes: u64,
}

impl MemorySample {
    pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            used_bytes,
            limit_bytes,
        }
    }

    /// Usage as a fraction of the limit; `0.0` when the limit is unknown.
    pub fn usage_ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64
    }
}

/// Memory probe trait
///
/// - **Desktop**: system memory counters
/// - **Mobile**: process footprint vs. the OS memory warning level
/// - **Tests**: scripted samples
///
/// Returns `None` when the platform cannot provide a reading; the pressure
/// sampler then skips that tick.
pub trait MemoryProbe: PlatformSendSync {
    fn sample(&self) -> Option<MemorySample>;
}
