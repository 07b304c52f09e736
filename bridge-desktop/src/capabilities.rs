//! Desktop capability probe

use bridge_traits::platform::PlatformCapabilities;
use tracing::debug;

/// Reports what a desktop host can do.
///
/// Desktop builds have a real filesystem and native threads. There is no
/// media element to feed incrementally, so streaming assembly is off unless
/// the embedder supplies its own sink and flips the flag.
pub struct DesktopCapabilities;

impl DesktopCapabilities {
    pub fn probe() -> PlatformCapabilities {
        let cores = num_cpus::get();
        let capabilities = PlatformCapabilities::default()
            .with_worker_pool(cores > 1)
            .with_persistent_store(true)
            .with_incremental_media_append(false);

        debug!(cores, ?capabilities, "Probed desktop capabilities");
        capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_persistent_store() {
        let caps = DesktopCapabilities::probe();
        assert!(caps.persistent_store);
        assert!(!caps.incremental_media_append);
        assert_eq!(caps.worker_pool, num_cpus::get() > 1);
    }
}
