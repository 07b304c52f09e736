//! # Core Runtime Module
//!
//! Provides the runtime infrastructure shared by the media engine crates:
//! - Logging and tracing infrastructure
//! - Engine configuration with fail-fast validation
//! - Event bus for load progress, memory pressure and cache activity
//!
//! ## Overview
//!
//! Nothing in this crate knows how media is fetched or decrypted. It
//! establishes the logging conventions, the configuration surface, and the
//! event broadcasting used by `core-media`.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, EventSeverity, EventStream, MediaEvent};
