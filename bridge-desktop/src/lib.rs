//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `BlockFetcher` using `reqwest` with retry and a per-block size guard
//! - `FileSystemAccess` using `tokio::fs` and the platform cache directory
//! - `MemoryProbe` using `sysinfo` system memory counters
//! - `DesktopCapabilities` reporting what a desktop host supports
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopCapabilities, ReqwestBlockFetcher, TokioFileSystem};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fetcher = ReqwestBlockFetcher::new()?;
//!     let fs = TokioFileSystem::new();
//!     let capabilities = DesktopCapabilities::probe();
//!
//!     // Hand these to the engine configuration builder
//!     Ok(())
//! }
//! ```

mod capabilities;
mod fetcher;
mod filesystem;
mod memory;

pub use capabilities::DesktopCapabilities;
pub use fetcher::{ReqwestBlockFetcher, RetryPolicy};
pub use filesystem::TokioFileSystem;
pub use memory::SysinfoMemoryProbe;
