//! # Asset Manifests
//!
//! Server-provided description of an encrypted attachment: its kind, and the
//! ordered list of encrypted blocks it is split into.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{MediaError, Result};

/// What an attachment is, which decides how missing parts are tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Video,
    Audio,
    Binary,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Video => "video",
            AssetKind::Audio => "audio",
            AssetKind::Binary => "binary",
        }
    }

    /// Whether a contiguous prefix of the parts is still displayable.
    ///
    /// Images render progressively; video and audio need a contiguous stream
    /// and binaries are useless when truncated.
    pub fn tolerates_partial(&self) -> bool {
        matches!(self, AssetKind::Image)
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One encrypted block of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub part_id: String,
    /// Position of this part's plaintext in the assembled output.
    pub order: u32,
    /// Where the block can be fetched.
    pub location: String,
    /// Hex-encoded CBC initialisation vector.
    pub block_iv: String,
    /// Encrypted length, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

/// Part metadata as delivered by the message layer, before a fetch URL is
/// attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartDescriptor {
    pub part_id: String,
    pub order: u32,
    pub block_iv: String,
    #[serde(default)]
    pub size_hint: Option<u64>,
}

/// Immutable description of an encrypted asset.
///
/// Deserialization goes through [`AssetManifest::new`], so a manifest read
/// from server JSON is validated and sorted like one built in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawManifest")]
pub struct AssetManifest {
    pub asset_id: String,
    pub kind: AssetKind,
    /// File extension without the dot, e.g. `jpg`.
    pub extension: String,
    parts: Vec<Part>,
    pub estimated_size: Option<u64>,
}

#[derive(Deserialize)]
struct RawManifest {
    asset_id: String,
    kind: AssetKind,
    extension: String,
    parts: Vec<Part>,
    #[serde(default)]
    estimated_size: Option<u64>,
}

impl TryFrom<RawManifest> for AssetManifest {
    type Error = MediaError;

    fn try_from(raw: RawManifest) -> Result<Self> {
        Self::new(
            raw.asset_id,
            raw.kind,
            raw.extension,
            raw.parts,
            raw.estimated_size,
        )
    }
}

impl AssetManifest {
    /// Build a manifest, sorting parts by `order`.
    ///
    /// # Errors
    ///
    /// [`MediaError::InvalidManifest`] when the asset id is empty, there are
    /// no parts, or two parts share an order.
    pub fn new(
        asset_id: impl Into<String>,
        kind: AssetKind,
        extension: impl Into<String>,
        mut parts: Vec<Part>,
        estimated_size: Option<u64>,
    ) -> Result<Self> {
        let asset_id = asset_id.into();
        if asset_id.is_empty() {
            return Err(MediaError::InvalidManifest(
                "asset id cannot be empty".to_string(),
            ));
        }
        if parts.is_empty() {
            return Err(MediaError::InvalidManifest(format!(
                "asset {} has no parts",
                asset_id
            )));
        }

        let mut seen = HashSet::with_capacity(parts.len());
        for part in &parts {
            if !seen.insert(part.order) {
                return Err(MediaError::InvalidManifest(format!(
                    "asset {} has two parts with order {}",
                    asset_id, part.order
                )));
            }
        }

        parts.sort_by_key(|p| p.order);

        Ok(Self {
            asset_id,
            kind,
            extension: extension.into(),
            parts,
            estimated_size,
        })
    }

    /// Build a manifest from descriptors, resolving each part's location with
    /// `url_for(part_id)`.
    pub fn from_parts<F>(
        asset_id: impl Into<String>,
        kind: AssetKind,
        extension: impl Into<String>,
        descriptors: Vec<PartDescriptor>,
        url_for: F,
        estimated_size: Option<u64>,
    ) -> Result<Self>
    where
        F: Fn(&str) -> String,
    {
        let parts = descriptors
            .into_iter()
            .map(|d| Part {
                location: url_for(&d.part_id),
                part_id: d.part_id,
                order: d.order,
                block_iv: d.block_iv,
                size_hint: d.size_hint,
            })
            .collect();

        Self::new(asset_id, kind, extension, parts, estimated_size)
    }

    /// Parts in concatenation order.
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn total_parts(&self) -> usize {
        self.parts.len()
    }
}
