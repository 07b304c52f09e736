//! Platform helpers: thread-safety markers and the capability probe result.
//!
//! Native targets require `Send + Sync` so bridge implementations can be
//! shared across async tasks. WebAssembly builds run on a single thread and
//! cannot satisfy those bounds, so the marker below is conditional.

use serde::{Deserialize, Serialize};

/// Marker trait that applies `Send + Sync` on native targets while becoming a
/// no-op on `wasm32`.
#[cfg(not(target_arch = "wasm32"))]
pub trait PlatformSendSync: Send + Sync {}

#[cfg(not(target_arch = "wasm32"))]
impl<T> PlatformSendSync for T where T: Send + Sync {}

#[cfg(target_arch = "wasm32")]
pub trait PlatformSendSync {}

#[cfg(target_arch = "wasm32")]
impl<T> PlatformSendSync for T {}

/// Features the host reported when it was probed.
///
/// The engine consults these flags when picking an assembly strategy and when
/// deciding which services to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    /// The host can feed decrypted chunks into a media element incrementally
    /// (e.g. Media Source Extensions, an AVPlayer resource loader).
    pub incremental_media_append: bool,

    /// Background decryption threads may be started.
    pub worker_pool: bool,

    /// A durable blob store is available for the persistent cache.
    pub persistent_store: bool,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            incremental_media_append: false,
            worker_pool: true,
            persistent_store: true,
        }
    }
}

impl PlatformCapabilities {
    /// Capabilities with everything disabled; useful for constrained hosts.
    pub fn minimal() -> Self {
        Self {
            incremental_media_append: false,
            worker_pool: false,
            persistent_store: false,
        }
    }

    pub fn with_incremental_media_append(mut self, supported: bool) -> Self {
        self.incremental_media_append = supported;
        self
    }

    pub fn with_worker_pool(mut self, supported: bool) -> Self {
        self.worker_pool = supported;
        self
    }

    pub fn with_persistent_store(mut self, supported: bool) -> Self {
        self.persistent_store = supported;
        self
    }
}
