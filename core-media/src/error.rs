//! # Media Error Types
//!
//! Error taxonomy for loading encrypted media.
//!
//! Display-layer guidance: show a retry affordance for [`MediaError::is_retryable`]
//! errors, reset silently on [`MediaError::Aborted`], and show a
//! partial-content indicator for soft errors.

use bridge_traits::BridgeError;
use thiserror::Error;

/// Errors that can occur while loading, decrypting or caching media.
#[derive(Error, Debug)]
pub enum MediaError {
    // ========================================================================
    // Per-part Failures
    // ========================================================================
    /// A block could not be fetched.
    #[error("Failed to fetch part {part_id}: {reason}")]
    FetchFailed { part_id: String, reason: String },

    /// A block could not be decrypted or decoded.
    #[error("Failed to decrypt part {part_id}: {reason}")]
    DecryptFailed { part_id: String, reason: String },

    /// A fetch or decrypt batch did not finish in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ========================================================================
    // Load Outcomes
    // ========================================================================
    /// The load was cancelled or superseded. Not a user-visible failure.
    #[error("Load aborted")]
    Aborted,

    /// The requested strategy cannot run on this host.
    #[error("Unsupported strategy: {0}")]
    UnsupportedStrategy(String),

    /// The asset was truncated to stay within the memory budget.
    #[error("Capacity exceeded: assembled {assembled} of {total} parts")]
    CapacityExceeded { assembled: usize, total: usize },

    // ========================================================================
    // Input Errors
    // ========================================================================
    /// The content key or a block IV is malformed.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// The asset manifest is unusable.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    // ========================================================================
    // Infrastructure Errors
    // ========================================================================
    /// Persistent cache failure.
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    pub fn fetch_failed(part_id: impl Into<String>, reason: impl ToString) -> Self {
        MediaError::FetchFailed {
            part_id: part_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decrypt_failed(part_id: impl Into<String>, reason: impl ToString) -> Self {
        MediaError::DecryptFailed {
            part_id: part_id.into(),
            reason: reason.to_string(),
        }
    }

    /// `true` for user or supersession cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, MediaError::Aborted)
    }

    /// `true` when loading the same asset again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MediaError::FetchFailed { .. }
                | MediaError::DecryptFailed { .. }
                | MediaError::Timeout(_)
        )
    }

    /// `true` for degradations the caller can still display.
    pub fn is_soft(&self) -> bool {
        matches!(self, MediaError::CapacityExceeded { .. })
    }

    /// The part a per-part failure refers to.
    pub fn part_id(&self) -> Option<&str> {
        match self {
            MediaError::FetchFailed { part_id, .. } | MediaError::DecryptFailed { part_id, .. } => {
                Some(part_id)
            }
            _ => None,
        }
    }
}

/// Result type for media operations.
pub type Result<T> = std::result::Result<T, MediaError>;
