//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use aes::Aes128;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bridge_desktop::TokioFileSystem;
use bridge_traits::{
    BlockFetcher, BridgeError, ManualClock, MemoryProbe, MemorySample, PlatformCapabilities,
};
use bytes::Bytes;
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use core_media::{AssetKind, AssetManifest, ContentKey, MediaSink, Part};
use core_runtime::{CoreEvent, EngineConfig, EngineConfigBuilder, MediaEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::Receiver;

pub const KEY_HEX: &str = "2b7e151628aed2a6abf7158809cf4f3c";
pub const START_MILLIS: i64 = 1_700_000_000_000;

pub fn key() -> ContentKey {
    ContentKey::from_hex(KEY_HEX).unwrap()
}

pub fn iv_for(order: u32) -> String {
    hex::encode([order as u8 ^ 0x5a; 16])
}

/// Encrypt `media` into the sealed block format: base64(AES-CBC(base64(media))).
pub fn seal(media: &[u8], iv_hex: &str) -> Bytes {
    let key = hex::decode(KEY_HEX).unwrap();
    let iv = hex::decode(iv_hex).unwrap();
    let inner = STANDARD.encode(media).into_bytes();
    let len = inner.len();
    let mut buf = inner;
    buf.resize(len + 16, 0);
    let ciphertext = cbc::Encryptor::<Aes128>::new(key.as_slice().into(), iv.as_slice().into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, len)
        .unwrap();
    Bytes::from(STANDARD.encode(ciphertext))
}

/// Plaintext of part `order`: a recognisable repeated byte.
pub fn media_part(order: u32, len: usize) -> Vec<u8> {
    vec![(order as u8).wrapping_mul(31).wrapping_add(7); len]
}

// ============================================================================
// Fetcher
// ============================================================================

/// Serves sealed parts from memory and counts calls per location.
#[derive(Default)]
pub struct MockFetcher {
    bodies: Mutex<HashMap<String, Bytes>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, location: &str, body: Bytes) {
        self.bodies.lock().insert(location.to_string(), body);
    }

    /// Make `location` answer 404 from now on.
    pub fn forget(&self, location: &str) {
        self.bodies.lock().remove(location);
    }

    pub fn delay(&self, location: &str, by: Duration) {
        self.delays.lock().insert(location.to_string(), by);
    }

    pub fn calls_for(&self, location: &str) -> usize {
        self.calls.lock().get(location).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl BlockFetcher for MockFetcher {
    async fn fetch_block(&self, location: &str) -> bridge_traits::error::Result<Bytes> {
        *self.calls.lock().entry(location.to_string()).or_default() += 1;
        let delay = self.delays.lock().get(location).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let body = self.bodies.lock().get(location).cloned();
        body.ok_or(BridgeError::Http { status: 404 })
    }
}

/// An asset whose parts are registered with `fetcher`.
///
/// `orders` lists the part orders in manifest (wire) order; the expected
/// media is always the concatenation in ascending order.
pub struct Fixture {
    pub manifest: AssetManifest,
    pub expected: Vec<u8>,
}

pub fn asset(
    fetcher: &MockFetcher,
    asset_id: &str,
    kind: AssetKind,
    orders: &[u32],
    part_len: usize,
) -> Fixture {
    let mut parts = Vec::new();
    for &order in orders {
        let location = format!("https://cdn.test/{}/{}", asset_id, order);
        let iv = iv_for(order);
        fetcher.serve(&location, seal(&media_part(order, part_len), &iv));
        parts.push(Part {
            part_id: format!("{}-p{}", asset_id, order),
            order,
            location,
            block_iv: iv,
            size_hint: Some(part_len as u64),
        });
    }

    let mut sorted = orders.to_vec();
    sorted.sort_unstable();
    let expected = sorted
        .iter()
        .flat_map(|&order| media_part(order, part_len))
        .collect();

    let extension = match kind {
        AssetKind::Image => "jpg",
        AssetKind::Video => "mp4",
        AssetKind::Audio => "m4a",
        AssetKind::Binary => "bin",
    };
    let manifest = AssetManifest::new(asset_id, kind, extension, parts, None).unwrap();
    Fixture { manifest, expected }
}

pub fn location(asset_id: &str, order: u32) -> String {
    format!("https://cdn.test/{}/{}", asset_id, order)
}

// ============================================================================
// Host Fakes
// ============================================================================

/// Never reports a reading, so the pressure monitor stays idle.
pub struct QuietProbe;

impl MemoryProbe for QuietProbe {
    fn sample(&self) -> Option<MemorySample> {
        None
    }
}

/// Collects appended chunks in order.
#[derive(Default)]
pub struct CollectingSink {
    pub chunks: Mutex<Vec<Bytes>>,
    pub ended: Mutex<bool>,
}

impl CollectingSink {
    pub fn bytes(&self) -> Vec<u8> {
        self.chunks.lock().iter().flat_map(|c| c.to_vec()).collect()
    }
}

#[async_trait]
impl MediaSink for CollectingSink {
    async fn append(&self, chunk: Bytes) -> bridge_traits::error::Result<()> {
        self.chunks.lock().push(chunk);
        Ok(())
    }

    async fn end_of_stream(&self) -> bridge_traits::error::Result<()> {
        *self.ended.lock() = true;
        Ok(())
    }
}

// ============================================================================
// Engine Config
// ============================================================================

pub struct Host {
    pub dir: TempDir,
    pub fetcher: Arc<MockFetcher>,
    pub clock: Arc<ManualClock>,
}

impl Host {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            fetcher: MockFetcher::new(),
            clock: Arc::new(ManualClock::new(START_MILLIS)),
        }
    }

    /// Builder wired to this host's fakes with two decrypt workers.
    pub fn config(&self) -> EngineConfigBuilder {
        EngineConfig::builder()
            .block_fetcher(self.fetcher.clone())
            .file_system(Arc::new(TokioFileSystem::with_cache_directory(
                self.dir.path().to_path_buf(),
            )))
            .clock(self.clock.clone())
            .memory_probe(Arc::new(QuietProbe))
            .capabilities(PlatformCapabilities::default())
            .worker_count(2)
    }
}

/// Drain every media event currently buffered on `rx`.
pub fn drain(rx: &mut Receiver<CoreEvent>) -> Vec<MediaEvent> {
    let mut events = Vec::new();
    while let Ok(CoreEvent::Media(event)) = rx.try_recv() {
        events.push(event);
    }
    events
}
