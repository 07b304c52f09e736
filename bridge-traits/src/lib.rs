//! # Host Bridge Traits
//!
//! Capability contracts the media engine needs from its host platform.
//!
//! ## Overview
//!
//! The engine never talks to the network, the disk, or the OS memory counters
//! directly. Every such capability is expressed as a trait in this crate and
//! injected by the host at construction time, so the same engine runs on a
//! desktop build, inside a mobile shell, or against in-memory fakes in tests.
//!
//! ## Traits
//!
//! ### I/O
//! - [`BlockFetcher`](fetch::BlockFetcher) - Fetch one encrypted block by URL
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Blob storage for the persistent cache
//!
//! ### Platform Integration
//! - [`MemoryProbe`](memory::MemoryProbe) - Process/host memory sampling for pressure detection
//! - [`PlatformCapabilities`](platform::PlatformCapabilities) - Feature probe results
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for TTL bookkeeping and deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! Missing required capabilities are reported when the engine configuration is
//! built, not at first use:
//!
//! ```ignore
//! use core_runtime::config::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .block_fetcher(Arc::new(MyFetcher))
//!     .build()?; // CapabilityMissing if the persistent store has no FileSystemAccess
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! convert platform errors into it and keep messages free of key material.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so one instance can be shared by
//! concurrent asset loads.
//!
//! ## Example
//!
//! ```ignore
//! use bridge_traits::fetch::BlockFetcher;
//! use bridge_traits::error::Result;
//! use async_trait::async_trait;
//! use bytes::Bytes;
//!
//! pub struct MyFetcher {
//!     client: reqwest::Client,
//! }
//!
//! #[async_trait]
//! impl BlockFetcher for MyFetcher {
//!     async fn fetch_block(&self, location: &str) -> Result<Bytes> {
//!         todo!()
//!     }
//! }
//! ```

pub mod error;
pub mod fetch;
pub mod memory;
pub mod platform;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use fetch::BlockFetcher;
pub use memory::{MemoryProbe, MemorySample};
pub use platform::PlatformCapabilities;
pub use storage::{FileMetadata, FileSystemAccess};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
