//! # Engine Configuration Module
//!
//! Provides configuration for the media engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct an
//! `EngineConfig` holding every bridge and tuning knob the engine needs. It
//! enforces fail-fast validation so that a missing bridge or a nonsensical
//! limit is reported at startup, not on the first asset load.
//!
//! ## Required Dependencies
//!
//! - `BlockFetcher` - Retrieves encrypted blocks
//! - `FileSystemAccess` - Required while the persistent store is enabled
//!
//! ## Optional Dependencies
//!
//! - `MemoryProbe` - Enables the memory pressure monitor
//! - `Clock` - Defaults to `SystemClock`
//! - `LoggerSink` - Host log forwarding
//!
//! When the `desktop-shims` feature is enabled, desktop implementations from
//! `bridge-desktop` are injected for any bridge left unset, and the platform
//! capabilities are probed instead of assumed.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::EngineConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = EngineConfig::builder()
//!     .block_fetcher(Arc::new(MyFetcher))
//!     .file_system(Arc::new(MyFileSystem))
//!     .memory_cap_mb(64)
//!     .persistent_ttl(Duration::from_secs(24 * 60 * 60))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::EngineConfig;
//!
//! // Fails: a zero-byte memory budget can never admit an asset
//! let config = EngineConfig::builder()
//!     .memory_cap_mb(0)
//!     .build()
//!     .expect("Should fail - invalid memory cap");
//! ```

use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use bridge_traits::{
    BlockFetcher, Clock, FileSystemAccess, LoggerSink, MemoryProbe, PlatformCapabilities,
    SystemClock,
};
use std::sync::Arc;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Engine configuration.
///
/// Use [`EngineConfigBuilder`] to construct instances. Component
/// configurations in `core-media` are derived from this struct.
#[derive(Clone)]
pub struct EngineConfig {
    /// Fetches encrypted blocks (required)
    pub block_fetcher: Arc<dyn BlockFetcher>,

    /// Backs the persistent cache; present whenever `capabilities.persistent_store` is set
    pub file_system: Option<Arc<dyn FileSystemAccess>>,

    /// Samples host memory for the pressure monitor
    pub memory_probe: Option<Arc<dyn MemoryProbe>>,

    /// Time source for cache expiry
    pub clock: Arc<dyn Clock>,

    /// Host log forwarding, applied through [`EngineConfig::logging_config`]
    pub logger_sink: Option<Arc<dyn LoggerSink>>,

    /// What the host supports
    pub capabilities: PlatformCapabilities,

    /// In-memory working set cap in megabytes
    pub memory_cap_mb: u64,

    /// Usage ratio above which the pressure monitor evicts
    pub memory_pressure_threshold: f64,

    pub memory_monitor_interval: Duration,

    /// Persistent cache size bound in megabytes
    pub persistent_max_mb: u64,

    /// Default time-to-live of persisted blobs
    pub persistent_ttl: Duration,

    pub persistent_sweep_interval: Duration,

    /// Subdirectory of the host cache directory used by the persistent cache
    pub cache_directory: String,

    /// Decrypt worker count; `None` sizes the pool from the CPU count
    pub worker_count: Option<usize>,

    /// Ceiling for one decrypt batch
    pub task_timeout: Duration,

    /// Ceiling for one block fetch
    pub fetch_timeout: Duration,

    /// Parts fetched before a batch is handed to the pool
    pub decrypt_window: usize,

    /// Estimated size above which streaming assembly is preferred
    pub streaming_threshold_mb: u64,

    /// Estimated size above which chunked assembly is used
    pub chunked_threshold_mb: u64,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("block_fetcher", &"BlockFetcher { ... }")
            .field(
                "file_system",
                &self
                    .file_system
                    .as_ref()
                    .map(|_| "FileSystemAccess { ... }"),
            )
            .field(
                "memory_probe",
                &self.memory_probe.as_ref().map(|_| "MemoryProbe { ... }"),
            )
            .field("clock", &"Clock { ... }")
            .field(
                "logger_sink",
                &self.logger_sink.as_ref().map(|_| "LoggerSink { ... }"),
            )
            .field("capabilities", &self.capabilities)
            .field("memory_cap_mb", &self.memory_cap_mb)
            .field("memory_pressure_threshold", &self.memory_pressure_threshold)
            .field("memory_monitor_interval", &self.memory_monitor_interval)
            .field("persistent_max_mb", &self.persistent_max_mb)
            .field("persistent_ttl", &self.persistent_ttl)
            .field("persistent_sweep_interval", &self.persistent_sweep_interval)
            .field("cache_directory", &self.cache_directory)
            .field("worker_count", &self.worker_count)
            .field("task_timeout", &self.task_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("decrypt_window", &self.decrypt_window)
            .field("streaming_threshold_mb", &self.streaming_threshold_mb)
            .field("chunked_threshold_mb", &self.chunked_threshold_mb)
            .finish()
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn memory_cap_bytes(&self) -> u64 {
        self.memory_cap_mb * MIB
    }

    pub fn persistent_max_bytes(&self) -> u64 {
        self.persistent_max_mb * MIB
    }

    /// Default logging setup for this engine, forwarding to the configured
    /// host sink if any. Pass the result to [`crate::logging::init_logging`].
    pub fn logging_config(&self) -> LoggingConfig {
        match &self.logger_sink {
            Some(sink) => LoggingConfig::default().with_logger_sink(sink.clone()),
            None => LoggingConfig::default(),
        }
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Memory and persistent limits are non-zero and below sane ceilings
    /// - Intervals and timeouts are non-zero
    /// - Pool and window sizes are usable
    /// - Strategy thresholds are ordered
    /// - Bridges required by the enabled capabilities are present
    pub fn validate(&self) -> Result<()> {
        if self.memory_cap_mb == 0 {
            return Err(Error::Config(
                "Memory cap must be greater than 0 MB".to_string(),
            ));
        }

        if self.memory_cap_mb > 64 * 1024 {
            return Err(Error::Config(
                "Memory cap exceeds maximum of 64GB (65,536 MB)".to_string(),
            ));
        }

        if !(self.memory_pressure_threshold > 0.0 && self.memory_pressure_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "Memory pressure threshold must be in (0, 1], got {}",
                self.memory_pressure_threshold
            )));
        }

        if self.memory_monitor_interval.is_zero() {
            return Err(Error::Config(
                "Memory monitor interval must be greater than zero".to_string(),
            ));
        }

        if self.capabilities.persistent_store {
            if self.file_system.is_none() {
                return Err(Error::CapabilityMissing {
                    capability: "FileSystemAccess".to_string(),
                    message: "The persistent store is enabled but no FileSystemAccess was provided. \
                             Inject a FileSystemAccess implementation or disable the capability \
                             with PlatformCapabilities::with_persistent_store(false)."
                        .to_string(),
                });
            }

            if self.persistent_max_mb == 0 {
                return Err(Error::Config(
                    "Persistent cache size must be greater than 0 MB".to_string(),
                ));
            }

            if self.persistent_ttl.is_zero() {
                return Err(Error::Config(
                    "Persistent TTL must be greater than zero".to_string(),
                ));
            }

            if self.persistent_sweep_interval.is_zero() {
                return Err(Error::Config(
                    "Persistent sweep interval must be greater than zero".to_string(),
                ));
            }

            if self.cache_directory.is_empty()
                || self.cache_directory.contains(['/', '\\'])
                || self.cache_directory == ".."
            {
                return Err(Error::Config(format!(
                    "Cache directory must be a single path component, got '{}'",
                    self.cache_directory
                )));
            }
        }

        if self.worker_count == Some(0) {
            return Err(Error::Config(
                "Worker count must be at least 1; leave it unset to size from the CPU count"
                    .to_string(),
            ));
        }

        if self.task_timeout.is_zero() || self.fetch_timeout.is_zero() {
            return Err(Error::Config(
                "Task and fetch timeouts must be greater than zero".to_string(),
            ));
        }

        if self.decrypt_window == 0 {
            return Err(Error::Config(
                "Decrypt window must be at least 1 part".to_string(),
            ));
        }

        if self.chunked_threshold_mb > self.streaming_threshold_mb {
            return Err(Error::Config(format!(
                "Chunked threshold ({} MB) cannot exceed streaming threshold ({} MB)",
                self.chunked_threshold_mb, self.streaming_threshold_mb
            )));
        }

        Ok(())
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn block_fetcher_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "BlockFetcher".to_string(),
        message: "BlockFetcher implementation is required to download encrypted blocks. \
                 Desktop: enable the 'desktop-shims' feature to use the default ReqwestBlockFetcher. \
                 Mobile/Web: inject a fetcher backed by the platform HTTP stack."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_block_fetcher() -> Result<Arc<dyn BlockFetcher>> {
    use bridge_desktop::ReqwestBlockFetcher;

    let fetcher = ReqwestBlockFetcher::new().map_err(|e| {
        Error::Internal(format!("Failed to create default BlockFetcher: {}", e))
    })?;
    Ok(Arc::new(fetcher))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_block_fetcher() -> Result<Arc<dyn BlockFetcher>> {
    Err(block_fetcher_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system() -> Option<Arc<dyn FileSystemAccess>> {
    Some(Arc::new(bridge_desktop::TokioFileSystem::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system() -> Option<Arc<dyn FileSystemAccess>> {
    None
}

#[cfg(feature = "desktop-shims")]
fn provide_default_memory_probe() -> Option<Arc<dyn MemoryProbe>> {
    Some(Arc::new(bridge_desktop::SysinfoMemoryProbe::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_memory_probe() -> Option<Arc<dyn MemoryProbe>> {
    None
}

#[cfg(feature = "desktop-shims")]
fn provide_default_capabilities() -> PlatformCapabilities {
    bridge_desktop::DesktopCapabilities::probe()
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_capabilities() -> PlatformCapabilities {
    PlatformCapabilities::default()
}

/// Builder for constructing [`EngineConfig`] instances.
///
/// Every numeric setting starts at its documented default; call
/// [`build()`](EngineConfigBuilder::build) to validate and produce the config.
pub struct EngineConfigBuilder {
    block_fetcher: Option<Arc<dyn BlockFetcher>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
    clock: Option<Arc<dyn Clock>>,
    logger_sink: Option<Arc<dyn LoggerSink>>,
    capabilities: Option<PlatformCapabilities>,
    memory_cap_mb: u64,
    memory_pressure_threshold: f64,
    memory_monitor_interval: Duration,
    persistent_max_mb: u64,
    persistent_ttl: Duration,
    persistent_sweep_interval: Duration,
    cache_directory: String,
    worker_count: Option<usize>,
    task_timeout: Duration,
    fetch_timeout: Duration,
    decrypt_window: usize,
    streaming_threshold_mb: u64,
    chunked_threshold_mb: u64,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self {
            block_fetcher: None,
            file_system: None,
            memory_probe: None,
            clock: None,
            logger_sink: None,
            capabilities: None,
            memory_cap_mb: 100,
            memory_pressure_threshold: 0.8,
            memory_monitor_interval: Duration::from_secs(5),
            persistent_max_mb: 200,
            persistent_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            persistent_sweep_interval: Duration::from_secs(60 * 60),
            cache_directory: "media_cache".to_string(),
            worker_count: None,
            task_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(60),
            decrypt_window: 8,
            streaming_threshold_mb: 50,
            chunked_threshold_mb: 5,
        }
    }
}

impl EngineConfigBuilder {
    /// Sets the block fetcher implementation (required).
    ///
    /// If not provided, the desktop default (reqwest-based) is used when the
    /// `desktop-shims` feature is enabled.
    pub fn block_fetcher(mut self, fetcher: Arc<dyn BlockFetcher>) -> Self {
        self.block_fetcher = Some(fetcher);
        self
    }

    /// Sets the file system access implementation.
    ///
    /// Required while the persistent store capability is enabled.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    /// Overrides the probed platform capabilities.
    pub fn capabilities(mut self, capabilities: PlatformCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Default: 100 MB
    pub fn memory_cap_mb(mut self, mb: u64) -> Self {
        self.memory_cap_mb = mb;
        self
    }

    /// Default: 0.8
    pub fn memory_pressure_threshold(mut self, threshold: f64) -> Self {
        self.memory_pressure_threshold = threshold;
        self
    }

    /// Default: 5 seconds
    pub fn memory_monitor_interval(mut self, interval: Duration) -> Self {
        self.memory_monitor_interval = interval;
        self
    }

    /// Default: 200 MB
    pub fn persistent_max_mb(mut self, mb: u64) -> Self {
        self.persistent_max_mb = mb;
        self
    }

    /// Default: 7 days
    pub fn persistent_ttl(mut self, ttl: Duration) -> Self {
        self.persistent_ttl = ttl;
        self
    }

    /// Default: 1 hour
    pub fn persistent_sweep_interval(mut self, interval: Duration) -> Self {
        self.persistent_sweep_interval = interval;
        self
    }

    /// Default: "media_cache"
    pub fn cache_directory(mut self, directory: impl Into<String>) -> Self {
        self.cache_directory = directory.into();
        self
    }

    /// Default: derived from the CPU count
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Default: 120 seconds
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Default: 60 seconds
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Default: 8 parts
    pub fn decrypt_window(mut self, parts: usize) -> Self {
        self.decrypt_window = parts;
        self
    }

    /// Default: 50 MB streaming, 5 MB chunked
    pub fn strategy_thresholds_mb(mut self, streaming: u64, chunked: u64) -> Self {
        self.streaming_threshold_mb = streaming;
        self.chunked_threshold_mb = chunked;
        self
    }

    /// Builds the final `EngineConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns `Ok(EngineConfig)` on success, or an error if:
    /// - No block fetcher is available (`Error::CapabilityMissing`)
    /// - The persistent store is enabled without a file system
    /// - Any limit or interval is invalid (`Error::Config`)
    pub fn build(self) -> Result<EngineConfig> {
        let block_fetcher = match self.block_fetcher {
            Some(fetcher) => fetcher,
            None => provide_default_block_fetcher()?,
        };

        let file_system = self.file_system.or_else(provide_default_file_system);
        let memory_probe = self.memory_probe.or_else(provide_default_memory_probe);
        let capabilities = self
            .capabilities
            .unwrap_or_else(provide_default_capabilities);

        let config = EngineConfig {
            block_fetcher,
            file_system,
            memory_probe,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            logger_sink: self.logger_sink,
            capabilities,
            memory_cap_mb: self.memory_cap_mb,
            memory_pressure_threshold: self.memory_pressure_threshold,
            memory_monitor_interval: self.memory_monitor_interval,
            persistent_max_mb: self.persistent_max_mb,
            persistent_ttl: self.persistent_ttl,
            persistent_sweep_interval: self.persistent_sweep_interval,
            cache_directory: self.cache_directory,
            worker_count: self.worker_count,
            task_timeout: self.task_timeout,
            fetch_timeout: self.fetch_timeout,
            decrypt_window: self.decrypt_window,
            streaming_threshold_mb: self.streaming_threshold_mb,
            chunked_threshold_mb: self.chunked_threshold_mb,
        };

        config.validate()?;

        Ok(config)
    }
}
