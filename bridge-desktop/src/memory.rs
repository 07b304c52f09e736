//! Memory probe backed by `sysinfo`

use bridge_traits::memory::{MemoryProbe, MemorySample};
use parking_lot::Mutex;
use sysinfo::System;
use tracing::trace;

/// Reports system-wide memory usage.
///
/// `sysinfo` keeps its counters inside the `System` value, so the probe holds
/// one behind a mutex and refreshes only the memory section on each sample.
pub struct SysinfoMemoryProbe {
    system: Mutex<System>,
}

impl SysinfoMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoMemoryProbe {
    fn sample(&self) -> Option<MemorySample> {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        let used = system.used_memory();
        trace!(used_bytes = used, limit_bytes = total, "Sampled system memory");
        Some(MemorySample::new(used, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_within_limit() {
        let probe = SysinfoMemoryProbe::new();
        if let Some(sample) = probe.sample() {
            assert!(sample.limit_bytes > 0);
            assert!(sample.used_bytes <= sample.limit_bytes);
            let ratio = sample.usage_ratio();
            assert!((0.0..=1.0).contains(&ratio));
        }
    }
}
