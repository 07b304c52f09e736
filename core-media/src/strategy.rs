//! # Assembly Strategy Selection
//!
//! Picks how an asset is put back together from its size estimate and the
//! host's support for incremental media append.

use bridge_traits::PlatformCapabilities;
use core_runtime::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::manifest::AssetManifest;

const MIB: u64 = 1024 * 1024;

/// How decrypted parts are accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyStrategy {
    /// Feed each decrypted window into a media sink, keeping a bounded tail.
    Streaming,
    /// Full buffer, truncated once 70% of the memory budget is reached.
    Chunked,
    /// Sequential full buffer for small assets.
    Legacy,
}

impl AssemblyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblyStrategy::Streaming => "streaming",
            AssemblyStrategy::Chunked => "chunked",
            AssemblyStrategy::Legacy => "legacy",
        }
    }
}

impl fmt::Display for AssemblyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size boundaries between strategies, in bytes. Both are exclusive lower
/// bounds: an asset of exactly `chunked_above` bytes is still Legacy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyThresholds {
    pub streaming_above: u64,
    pub chunked_above: u64,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            streaming_above: 50 * MIB,
            chunked_above: 5 * MIB,
        }
    }
}

impl From<&EngineConfig> for StrategyThresholds {
    fn from(config: &EngineConfig) -> Self {
        Self {
            streaming_above: config.streaming_threshold_mb * MIB,
            chunked_above: config.chunked_threshold_mb * MIB,
        }
    }
}

/// Best guess at an asset's size before anything is decrypted.
///
/// Uses the server's estimate when present, otherwise each part's size hint,
/// falling back to one and a half times the IV text length for parts without
/// one.
pub fn estimate_size(manifest: &AssetManifest) -> u64 {
    if let Some(size) = manifest.estimated_size {
        return size;
    }

    manifest
        .parts()
        .iter()
        .map(|part| {
            part.size_hint
                .unwrap_or_else(|| (part.block_iv.len() as u64).saturating_mul(3) / 2)
        })
        .fold(0u64, |acc, n| acc.saturating_add(n))
}

/// Choose the strategy for `manifest`. Pure: same inputs, same answer.
pub fn select(
    manifest: &AssetManifest,
    thresholds: &StrategyThresholds,
    capabilities: &PlatformCapabilities,
) -> AssemblyStrategy {
    select_for_size(estimate_size(manifest), thresholds, capabilities)
}

pub fn select_for_size(
    estimated: u64,
    thresholds: &StrategyThresholds,
    capabilities: &PlatformCapabilities,
) -> AssemblyStrategy {
    if estimated > thresholds.streaming_above && capabilities.incremental_media_append {
        AssemblyStrategy::Streaming
    } else if estimated > thresholds.chunked_above {
        AssemblyStrategy::Chunked
    } else {
        AssemblyStrategy::Legacy
    }
}
