//! Workspace facade crate.
//!
//! Re-exports the engine crates so a host can depend on
//! `media-engine-workspace` alone. The `desktop-shims` feature (on by
//! default) also exposes the reqwest, tokio and sysinfo bridge
//! implementations and lets `EngineConfig::builder()` fall back to them.

pub use bridge_traits;
pub use core_media;
pub use core_runtime;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;

pub use core_media::{LoadRequest, LoadedAsset, MediaEngine, MediaError};
pub use core_runtime::{EngineConfig, EventBus};
