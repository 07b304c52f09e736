//! # Asset Assembly
//!
//! Drives fetch → decrypt → accumulate for one asset under a chosen
//! [`AssemblyStrategy`].
//!
//! ## Windows
//!
//! Parts are fetched in manifest order, `decrypt_window` at a time, and each
//! window is decrypted as one pool batch. Legacy uses a window of one. The
//! abort check runs before every fetch and again before every dispatch.
//!
//! ## Failures
//!
//! A failed part is recorded and its window siblings still complete, but no
//! further window is fetched. Kinds that need every part surface the first
//! failure as an error; images return the contiguous prefix marked
//! `partial`.

use async_trait::async_trait;
use bridge_traits::BlockFetcher;
use bytes::{Bytes, BytesMut};
use core_runtime::EngineConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::crypto::{ContentKey, EncryptedBlock};
use crate::error::{MediaError, Result};
use crate::manifest::{AssetManifest, Part};
use crate::strategy::AssemblyStrategy;
use crate::worker_pool::DecryptionWorkerPool;

const MIB: u64 = 1024 * 1024;

// ============================================================================
// Cancellation and Progress
// ============================================================================

/// Polled before each fetch and each decrypt dispatch.
pub trait AbortCheck: Send + Sync {
    fn is_aborted(&self) -> bool;
}

impl AbortCheck for CancellationToken {
    fn is_aborted(&self) -> bool {
        self.is_cancelled()
    }
}

impl<F> AbortCheck for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_aborted(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadProgress {
    pub parts_processed: usize,
    pub total_parts: usize,
}

impl LoadProgress {
    pub fn is_complete(&self) -> bool {
        self.parts_processed == self.total_parts
    }
}

pub type ProgressObserver = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Receives the first part's plaintext while the rest is still loading.
pub type PreviewObserver = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Cancellation, progress and preview hooks for one assembly run.
#[derive(Clone)]
pub struct AssemblyControl {
    pub abort: Arc<dyn AbortCheck>,
    pub progress: Option<ProgressObserver>,
    pub preview: Option<PreviewObserver>,
}

impl AssemblyControl {
    pub fn new(abort: Arc<dyn AbortCheck>) -> Self {
        Self {
            abort,
            progress: None,
            preview: None,
        }
    }

    pub fn with_progress(mut self, observer: ProgressObserver) -> Self {
        self.progress = Some(observer);
        self
    }

    /// Hand the first part's plaintext to `observer` as soon as it decrypts.
    pub fn with_preview(mut self, observer: PreviewObserver) -> Self {
        self.preview = Some(observer);
        self
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.is_aborted() {
            Err(MediaError::Aborted)
        } else {
            Ok(())
        }
    }

    fn report(&self, parts_processed: usize, total_parts: usize) {
        if let Some(progress) = &self.progress {
            progress(LoadProgress {
                parts_processed,
                total_parts,
            });
        }
    }

    fn preview(&self, first_part: &Bytes) {
        if let Some(preview) = &self.preview {
            preview(first_part.clone());
        }
    }
}

impl Default for AssemblyControl {
    fn default() -> Self {
        Self::new(Arc::new(CancellationToken::new()))
    }
}

// ============================================================================
// Streaming Sink
// ============================================================================

/// Incremental media consumer, e.g. a platform media source buffer.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn append(&self, chunk: Bytes) -> bridge_traits::error::Result<()>;

    /// No more chunks will follow.
    async fn end_of_stream(&self) -> bridge_traits::error::Result<()>;
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Fetch,
    Decrypt,
    Timeout,
}

/// One part that could not be assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartFailure {
    pub part_id: String,
    pub order: u32,
    pub kind: FailureKind,
    pub reason: String,
}

impl PartFailure {
    fn new(part: &Part, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            part_id: part.part_id.clone(),
            order: part.order,
            kind,
            reason: reason.into(),
        }
    }

    pub fn to_error(&self) -> MediaError {
        match self.kind {
            FailureKind::Fetch => MediaError::fetch_failed(&self.part_id, &self.reason),
            FailureKind::Decrypt => MediaError::decrypt_failed(&self.part_id, &self.reason),
            FailureKind::Timeout => {
                MediaError::Timeout(format!("part {}: {}", self.part_id, self.reason))
            }
        }
    }
}

/// Buffered output of a Legacy or Chunked run.
#[derive(Debug, Clone)]
pub struct AssembledAsset {
    pub bytes: Bytes,
    pub parts_assembled: usize,
    pub total_parts: usize,
    /// `true` when `bytes` is a prefix of the asset, not all of it.
    pub partial: bool,
    pub failures: Vec<PartFailure>,
}

/// Output of a Streaming run. The sink holds the full stream; `retained` is
/// the most recent tail kept locally within the memory budget.
#[derive(Debug, Clone)]
pub struct StreamedAsset {
    pub retained: Vec<Bytes>,
    pub retained_bytes: u64,
    pub total_bytes: u64,
    pub parts_appended: usize,
    pub total_parts: usize,
    pub partial: bool,
    pub failures: Vec<PartFailure>,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct AssemblerConfig {
    pub memory_budget_bytes: u64,
    /// Share of the budget after which Chunked stops.
    pub chunked_cap_ratio: f64,
    pub decrypt_window: usize,
    pub fetch_timeout: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 100 * MIB,
            chunked_cap_ratio: 0.7,
            decrypt_window: 8,
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&EngineConfig> for AssemblerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            memory_budget_bytes: config.memory_cap_bytes(),
            decrypt_window: config.decrypt_window,
            fetch_timeout: config.fetch_timeout,
            ..Self::default()
        }
    }
}

impl AssemblerConfig {
    pub fn with_memory_budget_bytes(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn with_decrypt_window(mut self, parts: usize) -> Self {
        self.decrypt_window = parts;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn chunked_cap_bytes(&self) -> u64 {
        (self.memory_budget_bytes as f64 * self.chunked_cap_ratio) as u64
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.memory_budget_bytes == 0 {
            return Err("memory_budget_bytes must be greater than zero".to_string());
        }
        if !(self.chunked_cap_ratio > 0.0 && self.chunked_cap_ratio <= 1.0) {
            return Err(format!(
                "chunked_cap_ratio must be in (0, 1], got {}",
                self.chunked_cap_ratio
            ));
        }
        if self.decrypt_window == 0 {
            return Err("decrypt_window must be at least 1".to_string());
        }
        if self.fetch_timeout.is_zero() {
            return Err("fetch_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Window Iteration
// ============================================================================

type PartOutcome = std::result::Result<Bytes, PartFailure>;

/// Walks a manifest one fetch+decrypt window at a time.
struct PartWindows<'a> {
    assembler: &'a AssetAssembler,
    parts: &'a [Part],
    key: &'a ContentKey,
    control: &'a AssemblyControl,
    window: usize,
    cursor: usize,
}

impl<'a> PartWindows<'a> {
    async fn next(&mut self) -> Result<Option<Vec<PartOutcome>>> {
        if self.cursor >= self.parts.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.window).min(self.parts.len());
        let window = &self.parts[self.cursor..end];

        let mut fetched: Vec<std::result::Result<Bytes, PartFailure>> =
            Vec::with_capacity(window.len());
        for part in window {
            self.control.check_abort()?;
            fetched.push(self.assembler.fetch_part(part).await);
        }

        self.control.check_abort()?;

        let mut blocks = Vec::new();
        let mut slots = Vec::new();
        for (i, (part, body)) in window.iter().zip(&fetched).enumerate() {
            if let Ok(body) = body {
                blocks.push(EncryptedBlock::new(body.clone(), part.block_iv.clone()));
                slots.push(i);
            }
        }

        let mut outcomes: Vec<PartOutcome> = fetched
            .into_iter()
            .map(|fetch| fetch.map(|_| Bytes::new()))
            .collect();

        if !blocks.is_empty() {
            let batch = self.assembler.pool.decrypt(blocks, self.key, None).await;
            if batch.timed_out {
                warn!(window_start = self.cursor, "Decrypt window timed out");
            }
            for (slot, (result, i)) in batch.results.iter().zip(&slots).enumerate() {
                outcomes[*i] = match result {
                    Some(plaintext) => Ok(plaintext.clone()),
                    None => Err(PartFailure::new(
                        &window[*i],
                        FailureKind::Decrypt,
                        batch.failure_reason(slot),
                    )),
                };
            }
        }

        debug!(
            window_start = self.cursor,
            window_len = window.len(),
            "Window assembled"
        );
        self.cursor = end;
        Ok(Some(outcomes))
    }
}

// ============================================================================
// Assembler
// ============================================================================

/// Assembles assets from fetched, decrypted parts.
pub struct AssetAssembler {
    fetcher: Arc<dyn BlockFetcher>,
    pool: Arc<DecryptionWorkerPool>,
    config: AssemblerConfig,
}

impl AssetAssembler {
    pub fn new(
        fetcher: Arc<dyn BlockFetcher>,
        pool: Arc<DecryptionWorkerPool>,
        config: AssemblerConfig,
    ) -> Self {
        Self {
            fetcher,
            pool,
            config,
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    async fn fetch_part(&self, part: &Part) -> std::result::Result<Bytes, PartFailure> {
        match tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetcher.fetch_block(&part.location),
        )
        .await
        {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => {
                warn!(part_id = %part.part_id, error = %e, "Part fetch failed");
                Err(PartFailure::new(part, FailureKind::Fetch, e.to_string()))
            }
            Err(_) => {
                warn!(part_id = %part.part_id, "Part fetch timed out");
                Err(PartFailure::new(
                    part,
                    FailureKind::Timeout,
                    format!("fetch exceeded {:?}", self.config.fetch_timeout),
                ))
            }
        }
    }

    fn windows<'a>(
        &'a self,
        manifest: &'a AssetManifest,
        key: &'a ContentKey,
        control: &'a AssemblyControl,
        window: usize,
    ) -> PartWindows<'a> {
        PartWindows {
            assembler: self,
            parts: manifest.parts(),
            key,
            control,
            window: window.max(1),
            cursor: 0,
        }
    }

    /// Buffer the whole asset under Legacy or Chunked.
    ///
    /// # Errors
    ///
    /// - [`MediaError::Aborted`] once `control.abort` reports true
    /// - [`MediaError::UnsupportedStrategy`] for Streaming, which needs a sink
    /// - the first part failure, when the asset kind needs every part
    #[instrument(skip(self, manifest, key, control), fields(asset_id = %manifest.asset_id, %strategy))]
    pub async fn assemble(
        &self,
        manifest: &AssetManifest,
        key: &ContentKey,
        strategy: AssemblyStrategy,
        control: &AssemblyControl,
    ) -> Result<AssembledAsset> {
        let (window, cap) = match strategy {
            AssemblyStrategy::Legacy => (1, None),
            AssemblyStrategy::Chunked => {
                (self.config.decrypt_window, Some(self.config.chunked_cap_bytes()))
            }
            AssemblyStrategy::Streaming => {
                return Err(MediaError::UnsupportedStrategy(
                    "streaming assembly requires a media sink".to_string(),
                ))
            }
        };

        let total = manifest.total_parts();
        let mut windows = self.windows(manifest, key, control, window);
        let mut chunks: Vec<Bytes> = Vec::with_capacity(total);
        let mut accumulated = 0u64;
        let mut failures = Vec::new();
        let mut processed = 0;
        let mut truncated = false;
        control.report(0, total);

        'windows: while let Some(outcomes) = windows.next().await? {
            for outcome in outcomes {
                processed += 1;
                match outcome {
                    Ok(plaintext) if failures.is_empty() => {
                        if chunks.is_empty() {
                            control.preview(&plaintext);
                        }
                        accumulated += plaintext.len() as u64;
                        chunks.push(plaintext);
                    }
                    Ok(_) => {}
                    Err(failure) => failures.push(failure),
                }
                control.report(processed, total);

                if let Some(cap) = cap {
                    if failures.is_empty() && accumulated > cap && chunks.len() < total {
                        info!(
                            accumulated,
                            cap,
                            parts_assembled = chunks.len(),
                            total_parts = total,
                            "Memory budget reached, returning partial asset"
                        );
                        truncated = true;
                        break 'windows;
                    }
                }
            }
            if !failures.is_empty() {
                break;
            }
        }

        if let Some(first) = failures.first() {
            if !manifest.kind.tolerates_partial() || chunks.is_empty() {
                return Err(first.to_error());
            }
            warn!(
                failed_parts = failures.len(),
                parts_assembled = chunks.len(),
                "Returning partial asset after part failure"
            );
        }

        let mut bytes = BytesMut::with_capacity(accumulated as usize);
        for chunk in &chunks {
            bytes.extend_from_slice(chunk);
        }

        Ok(AssembledAsset {
            bytes: bytes.freeze(),
            parts_assembled: chunks.len(),
            total_parts: total,
            partial: truncated || !failures.is_empty(),
            failures,
        })
    }

    /// Feed the asset into `sink` window by window, retaining at most the
    /// memory budget of recent chunks locally.
    #[instrument(skip(self, manifest, key, sink, control), fields(asset_id = %manifest.asset_id))]
    pub async fn stream(
        &self,
        manifest: &AssetManifest,
        key: &ContentKey,
        sink: &dyn MediaSink,
        control: &AssemblyControl,
    ) -> Result<StreamedAsset> {
        let total = manifest.total_parts();
        let budget = self.config.memory_budget_bytes;
        let mut windows = self.windows(manifest, key, control, self.config.decrypt_window);

        let mut retained: VecDeque<Bytes> = VecDeque::new();
        let mut retained_bytes = 0u64;
        let mut total_bytes = 0u64;
        let mut appended = 0;
        let mut failures = Vec::new();
        let mut processed = 0;
        control.report(0, total);

        while let Some(outcomes) = windows.next().await? {
            for outcome in outcomes {
                processed += 1;
                match outcome {
                    Ok(plaintext) if failures.is_empty() => {
                        control.check_abort()?;
                        if appended == 0 {
                            control.preview(&plaintext);
                        }
                        sink.append(plaintext.clone())
                            .await
                            .map_err(|e| MediaError::Internal(format!("media sink append failed: {}", e)))?;
                        appended += 1;
                        total_bytes += plaintext.len() as u64;
                        retained_bytes += plaintext.len() as u64;
                        retained.push_back(plaintext);

                        while retained_bytes > budget && retained.len() > 1 {
                            if let Some(dropped) = retained.pop_front() {
                                retained_bytes -= dropped.len() as u64;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(failure) => failures.push(failure),
                }
                control.report(processed, total);
            }
            if !failures.is_empty() {
                break;
            }
        }

        if let Some(first) = failures.first() {
            if !manifest.kind.tolerates_partial() || appended == 0 {
                return Err(first.to_error());
            }
        }

        sink.end_of_stream()
            .await
            .map_err(|e| MediaError::Internal(format!("media sink close failed: {}", e)))?;

        info!(
            parts_appended = appended,
            total_bytes,
            retained_bytes,
            "Streaming assembly finished"
        );

        Ok(StreamedAsset {
            retained: retained.into(),
            retained_bytes,
            total_bytes,
            parts_appended: appended,
            total_parts: total,
            partial: !failures.is_empty(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::{iv_hex, key, seal};
    use crate::manifest::{AssetKind, Part};
    use crate::worker_pool::PoolConfig;
    use bridge_traits::BridgeError;
    use mockall::mock;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Serves sealed parts from memory, failing the locations it is told to.
    struct MapFetcher {
        bodies: HashMap<String, Bytes>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlockFetcher for MapFetcher {
        async fn fetch_block(&self, location: &str) -> bridge_traits::error::Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bodies
                .get(location)
                .cloned()
                .ok_or(BridgeError::Http { status: 404 })
        }
    }

    mock! {
        Sink {}

        #[async_trait]
        impl MediaSink for Sink {
            async fn append(&self, chunk: Bytes) -> bridge_traits::error::Result<()>;
            async fn end_of_stream(&self) -> bridge_traits::error::Result<()>;
        }
    }

    fn plaintext(order: u32, len: usize) -> Vec<u8> {
        vec![order as u8; len]
    }

    /// A manifest of `sizes.len()` parts; parts listed in `missing` 404.
    fn fixture(
        kind: AssetKind,
        sizes: &[usize],
        missing: &[u32],
    ) -> (AssetManifest, Arc<MapFetcher>) {
        let mut bodies = HashMap::new();
        let mut parts = Vec::new();
        for (i, len) in sizes.iter().enumerate() {
            let order = i as u32;
            let iv = iv_hex(order as u8);
            let location = format!("https://assets.example/p{}", order);
            if !missing.contains(&order) {
                bodies.insert(location.clone(), seal(&plaintext(order, *len), &key(), &iv));
            }
            parts.push(Part {
                part_id: format!("p{}", order),
                order,
                location,
                block_iv: iv,
                size_hint: None,
            });
        }
        // Shuffle the input so sorting is exercised.
        parts.reverse();
        let manifest = AssetManifest::new("asset-1", kind, "bin", parts, None).unwrap();
        let fetcher = Arc::new(MapFetcher {
            bodies,
            calls: AtomicUsize::new(0),
        });
        (manifest, fetcher)
    }

    fn assembler(fetcher: Arc<MapFetcher>, config: AssemblerConfig) -> AssetAssembler {
        let pool = DecryptionWorkerPool::new(
            PoolConfig::default().with_worker_count(2),
            Arc::new(crate::crypto::AesCbcDecryptor),
        )
        .unwrap();
        AssetAssembler::new(fetcher, Arc::new(pool), config)
    }

    fn expected(sizes: &[usize]) -> Vec<u8> {
        sizes
            .iter()
            .enumerate()
            .flat_map(|(i, len)| plaintext(i as u32, *len))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_chunked_concatenates_in_order() {
        let sizes = [10, 300, 7, 64, 128, 1, 90, 33, 12, 40];
        let (manifest, fetcher) = fixture(AssetKind::Video, &sizes, &[]);
        let assembler = assembler(fetcher, AssemblerConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let control = AssemblyControl::default().with_progress(Arc::new(move |p: LoadProgress| {
            log.lock().push(p.parts_processed);
        }));

        let asset = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Chunked, &control)
            .await
            .unwrap();

        assert_eq!(&asset.bytes[..], &expected(&sizes)[..]);
        assert_eq!(asset.parts_assembled, 10);
        assert!(!asset.partial);
        assert_eq!(*seen.lock(), (0..=10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_preview_carries_first_part_once() {
        let sizes = [16, 32, 48, 64, 80, 96];
        let (manifest, fetcher) = fixture(AssetKind::Image, &sizes, &[]);
        let assembler = assembler(fetcher, AssemblerConfig::default());

        let previews = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&previews);
        let control = AssemblyControl::default().with_preview(Arc::new(move |first: Bytes| {
            log.lock().push(first);
        }));

        let asset = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Chunked, &control)
            .await
            .unwrap();

        assert_eq!(&asset.bytes[..], &expected(&sizes)[..]);
        let previews = previews.lock();
        assert_eq!(previews.len(), 1);
        assert_eq!(&previews[0][..], &plaintext(0, 16)[..]);
    }

    #[tokio::test]
    async fn test_no_preview_when_first_part_fails() {
        let (manifest, fetcher) = fixture(AssetKind::Image, &[16, 32], &[0]);
        let assembler = assembler(fetcher, AssemblerConfig::default());

        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let control = AssemblyControl::default().with_preview(Arc::new(move |_: Bytes| {
            flag.store(true, Ordering::SeqCst);
        }));

        let result = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Legacy, &control)
            .await;
        assert!(result.is_err());
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_legacy_matches_chunked_output() {
        let sizes = [5, 6, 7];
        let (manifest, fetcher) = fixture(AssetKind::Audio, &sizes, &[]);
        let assembler = assembler(fetcher.clone(), AssemblerConfig::default());

        let asset = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Legacy, &AssemblyControl::default())
            .await
            .unwrap();
        assert_eq!(&asset.bytes[..], &expected(&sizes)[..]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_abort_before_start_fetches_nothing() {
        let (manifest, fetcher) = fixture(AssetKind::Video, &[10; 12], &[]);
        let assembler = assembler(fetcher.clone(), AssemblerConfig::default());

        let token = CancellationToken::new();
        token.cancel();
        let result = assembler
            .assemble(
                &manifest,
                &key(),
                AssemblyStrategy::Chunked,
                &AssemblyControl::new(Arc::new(token)),
            )
            .await;

        assert!(matches!(result, Err(MediaError::Aborted)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(assembler.pool.stats().queued_tasks, 0);
    }

    #[tokio::test]
    async fn test_abort_midway_stops_fetching() {
        let (manifest, fetcher) = fixture(AssetKind::Video, &[10; 6], &[]);
        let assembler = assembler(fetcher.clone(), AssemblerConfig::default());

        let counter = fetcher.clone();
        let abort = move || counter.calls.load(Ordering::SeqCst) >= 2;
        let result = assembler
            .assemble(
                &manifest,
                &key(),
                AssemblyStrategy::Legacy,
                &AssemblyControl::new(Arc::new(abort)),
            )
            .await;

        assert!(matches!(result, Err(MediaError::Aborted)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chunked_truncates_at_budget() {
        let sizes = [40; 10];
        let (manifest, fetcher) = fixture(AssetKind::Video, &sizes, &[]);
        // 70% of 200 bytes is 140: the fourth part crosses it.
        let config = AssemblerConfig::default()
            .with_memory_budget_bytes(200)
            .with_decrypt_window(2);
        let assembler = assembler(fetcher, config);

        let asset = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Chunked, &AssemblyControl::default())
            .await
            .unwrap();

        assert!(asset.partial);
        assert_eq!(asset.parts_assembled, 4);
        assert_eq!(asset.bytes.len(), 160);
        assert!(asset.failures.is_empty());
    }

    #[tokio::test]
    async fn test_video_surfaces_first_failure() {
        let (manifest, fetcher) = fixture(AssetKind::Video, &[10; 6], &[2, 4]);
        let assembler = assembler(fetcher.clone(), AssemblerConfig::default());

        let err = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Chunked, &AssemblyControl::default())
            .await
            .unwrap_err();

        assert_eq!(err.part_id(), Some("p2"));
        assert!(matches!(err, MediaError::FetchFailed { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_image_returns_prefix_before_failure() {
        let sizes = [10, 11, 12, 13, 14];
        let (manifest, fetcher) = fixture(AssetKind::Image, &sizes, &[3]);
        let config = AssemblerConfig::default().with_decrypt_window(2);
        let assembler = assembler(fetcher.clone(), config);

        let asset = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Chunked, &AssemblyControl::default())
            .await
            .unwrap();

        assert!(asset.partial);
        assert_eq!(asset.parts_assembled, 3);
        assert_eq!(&asset.bytes[..], &expected(&sizes[..3])[..]);
        assert_eq!(asset.failures.len(), 1);
        assert_eq!(asset.failures[0].part_id, "p3");
        // Windows of two: p0-p1, p2-p3. Nothing after the failing window.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_image_with_no_good_prefix_fails() {
        let (manifest, fetcher) = fixture(AssetKind::Image, &[10, 10], &[0]);
        let assembler = assembler(fetcher, AssemblerConfig::default());

        let err = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Legacy, &AssemblyControl::default())
            .await
            .unwrap_err();
        assert_eq!(err.part_id(), Some("p0"));
    }

    #[tokio::test]
    async fn test_corrupt_block_is_decrypt_failure() {
        let (manifest, mut fetcher) = fixture(AssetKind::Binary, &[10, 10], &[]);
        Arc::get_mut(&mut fetcher).unwrap().bodies.insert(
            "https://assets.example/p1".to_string(),
            Bytes::from_static(b"bm90IGEgY2lwaGVydGV4dA=="),
        );
        let assembler = assembler(fetcher, AssemblerConfig::default());

        let err = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Legacy, &AssemblyControl::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::DecryptFailed { ref part_id, .. } if part_id == "p1"));
    }

    #[tokio::test]
    async fn test_streaming_requires_sink_path() {
        let (manifest, fetcher) = fixture(AssetKind::Video, &[10], &[]);
        let assembler = assembler(fetcher, AssemblerConfig::default());
        let err = assembler
            .assemble(&manifest, &key(), AssemblyStrategy::Streaming, &AssemblyControl::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::UnsupportedStrategy(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_appends_in_order_and_bounds_retention() {
        let sizes = [50; 9];
        let (manifest, fetcher) = fixture(AssetKind::Video, &sizes, &[]);
        let config = AssemblerConfig::default()
            .with_memory_budget_bytes(120)
            .with_decrypt_window(8);
        let assembler = assembler(fetcher, config);

        let appended = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&appended);
        let ended = Arc::new(AtomicBool::new(false));
        let closed = Arc::clone(&ended);

        let mut sink = MockSink::new();
        sink.expect_append().times(9).returning(move |chunk| {
            log.lock().push(chunk[0]);
            Ok(())
        });
        sink.expect_end_of_stream().times(1).returning(move || {
            closed.store(true, Ordering::SeqCst);
            Ok(())
        });

        let streamed = assembler
            .stream(&manifest, &key(), &sink, &AssemblyControl::default())
            .await
            .unwrap();

        assert_eq!(*appended.lock(), (0..9).collect::<Vec<u8>>());
        assert!(ended.load(Ordering::SeqCst));
        assert_eq!(streamed.total_bytes, 450);
        assert_eq!(streamed.parts_appended, 9);
        // Budget of 120 bytes keeps the last two 50-byte chunks.
        assert_eq!(streamed.retained_bytes, 100);
        assert_eq!(streamed.retained.len(), 2);
        assert_eq!(streamed.retained[1][0], 8);
    }

    #[tokio::test]
    async fn test_stream_sink_failure_is_internal() {
        let (manifest, fetcher) = fixture(AssetKind::Video, &[10, 10], &[]);
        let assembler = assembler(fetcher, AssemblerConfig::default());

        let mut sink = MockSink::new();
        sink.expect_append()
            .returning(|_| Err(BridgeError::OperationFailed("buffer full".into())));
        sink.expect_end_of_stream().times(0);

        let err = assembler
            .stream(&manifest, &key(), &sink, &AssemblyControl::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Internal(_)));
    }

    #[test]
    fn test_config_validation() {
        assert!(AssemblerConfig::default().validate().is_ok());
        assert!(AssemblerConfig::default()
            .with_decrypt_window(0)
            .validate()
            .is_err());
        assert_eq!(
            AssemblerConfig::default()
                .with_memory_budget_bytes(1000)
                .chunked_cap_bytes(),
            700
        );
    }
}
