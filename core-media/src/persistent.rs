//! # Persistent Blob Cache
//!
//! Size- and TTL-bounded on-disk store for fully decrypted assets, so a
//! repeat view skips both the download and the decryption.
//!
//! Layout under the host cache directory:
//!
//! ```text
//! <cache_dir>/<directory>/index.json
//! <cache_dir>/<directory>/blobs/<sha256(key)>.bin
//! ```
//!
//! Expiry is enforced on read. The background sweeper only compacts.
//! Whenever the store grows past 90% of its maximum, least recently accessed
//! entries are removed until it is back under 70%.

use bridge_traits::{Clock, FileSystemAccess};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use core_runtime::{EngineConfig, EventBus, MediaEvent};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{MediaError, Result};
use crate::manifest::AssetKind;

const MIB: u64 = 1024 * 1024;
const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";
const INDEX_VERSION: u32 = 1;

/// Usage ratio that triggers size eviction.
const EVICT_ABOVE: f64 = 0.9;
/// Usage ratio size eviction brings the store back down to.
const EVICT_DOWN_TO: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentConfig {
    pub max_size_bytes: u64,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
    /// Subdirectory of the host cache directory.
    pub directory: String,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 200 * MIB,
            default_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            directory: "media_cache".to_string(),
        }
    }
}

impl From<&EngineConfig> for PersistentConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_size_bytes: config.persistent_max_bytes(),
            default_ttl: config.persistent_ttl,
            sweep_interval: config.persistent_sweep_interval,
            directory: config.cache_directory.clone(),
        }
    }
}

impl PersistentConfig {
    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_size_bytes == 0 {
            return Err("max_size_bytes must be greater than zero".to_string());
        }
        if self.default_ttl.is_zero() {
            return Err("default_ttl must be greater than zero".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be greater than zero".to_string());
        }
        if self.directory.is_empty() || self.directory.contains("..") {
            return Err(format!("invalid cache directory '{}'", self.directory));
        }
        Ok(())
    }
}

/// Content-derived cache key, rendered `kind:label:extension`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersistentKey(String);

impl PersistentKey {
    pub fn new(kind: AssetKind, label: &str, extension: &str) -> Self {
        Self(format!("{}:{}:{}", kind.as_str(), label, extension))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn blob_name(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        format!("{}.bin", hex::encode(digest))
    }
}

impl fmt::Display for PersistentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored blob with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentEntry {
    pub key: PersistentKey,
    pub data: Bytes,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistentStats {
    pub item_count: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub usage_percent: f64,
    pub expired_count: usize,
}

// ============================================================================
// On-disk Index
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    blob: String,
    size_bytes: u64,
    created_at_ms: i64,
    last_access_at_ms: i64,
    expires_at_ms: i64,
    /// Tie-breaker for entries touched within the same millisecond.
    #[serde(default)]
    access_seq: u64,
}

impl IndexEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms < now_ms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    #[serde(default)]
    next_seq: u64,
    entries: HashMap<String, IndexEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            next_seq: 0,
            entries: HashMap::new(),
        }
    }
}

impl CacheIndex {
    fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Default)]
struct CacheState {
    root: Option<PathBuf>,
    index: CacheIndex,
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ============================================================================
// Cache
// ============================================================================

/// On-disk cache of decrypted assets. One instance per process.
pub struct PersistentCache {
    config: PersistentConfig,
    fs: Arc<dyn FileSystemAccess>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    state: Mutex<CacheState>,
}

impl PersistentCache {
    pub fn new(
        config: PersistentConfig,
        fs: Arc<dyn FileSystemAccess>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            fs,
            clock,
            events,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &PersistentConfig {
        &self.config
    }

    /// Create the cache directories and load the index.
    ///
    /// A missing or unreadable index starts the cache empty. Calling this
    /// again is a no-op; other operations call it on first use.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await.map(|_| ())
    }

    async fn ensure_loaded(&self, state: &mut CacheState) -> Result<PathBuf> {
        if let Some(root) = &state.root {
            return Ok(root.clone());
        }

        self.config
            .validate()
            .map_err(|e| MediaError::Cache(format!("Invalid cache configuration: {}", e)))?;

        let cache_dir = self.fs.get_cache_directory().await.map_err(|e| {
            error!("Failed to get cache directory: {}", e);
            MediaError::Cache(format!("Failed to get cache directory: {}", e))
        })?;
        let root = cache_dir.join(&self.config.directory);

        self.fs
            .create_dir_all(&root.join(BLOB_DIR))
            .await
            .map_err(|e| MediaError::Cache(format!("Failed to create cache directory: {}", e)))?;

        state.index = self.read_index(&root).await;
        state.root = Some(root.clone());

        info!(
            path = ?root,
            entries = state.index.entries.len(),
            total_size = state.index.total_size(),
            "Persistent media cache initialized"
        );
        Ok(root)
    }

    async fn read_index(&self, root: &Path) -> CacheIndex {
        let path = root.join(INDEX_FILE);
        match self.fs.exists(&path).await {
            Ok(true) => {}
            Ok(false) => return CacheIndex::default(),
            Err(e) => {
                warn!(error = %e, "Could not check for cache index, starting empty");
                return CacheIndex::default();
            }
        }

        let raw = match self.fs.read_file(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Could not read cache index, starting empty");
                return CacheIndex::default();
            }
        };

        match serde_json::from_slice::<CacheIndex>(&raw) {
            Ok(index) if index.version == INDEX_VERSION => index,
            Ok(index) => {
                warn!(version = index.version, "Unknown cache index version, starting empty");
                CacheIndex::default()
            }
            Err(e) => {
                warn!(error = %e, "Corrupt cache index, starting empty");
                CacheIndex::default()
            }
        }
    }

    async fn write_index(&self, root: &Path, index: &CacheIndex) -> Result<()> {
        let raw = serde_json::to_vec(index)
            .map_err(|e| MediaError::Cache(format!("Failed to encode cache index: {}", e)))?;
        self.fs
            .write_file(&root.join(INDEX_FILE), Bytes::from(raw))
            .await
            .map_err(|e| MediaError::Cache(format!("Failed to write cache index: {}", e)))
    }

    fn blob_path(root: &Path, blob: &str) -> PathBuf {
        root.join(BLOB_DIR).join(blob)
    }

    async fn delete_blob(&self, root: &Path, blob: &str) {
        if let Err(e) = self.fs.delete_file(&Self::blob_path(root, blob)).await {
            debug!(blob, error = %e, "Blob already gone");
        }
    }

    /// Look up `key`. Expired entries are purged and reported as absent.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &PersistentKey) -> Result<Option<PersistentEntry>> {
        let mut state = self.state.lock().await;
        let root = self.ensure_loaded(&mut state).await?;
        let now = self.clock.unix_timestamp_millis();

        let Some(entry) = state.index.entries.get(key.as_str()).cloned() else {
            return Ok(None);
        };

        if entry.is_expired(now) {
            debug!("Persistent entry expired, purging");
            state.index.entries.remove(key.as_str());
            self.delete_blob(&root, &entry.blob).await;
            self.write_index(&root, &state.index).await?;
            return Ok(None);
        }

        let data = match self.fs.read_file(&Self::blob_path(&root, &entry.blob)).await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Persistent blob unreadable, dropping entry");
                state.index.entries.remove(key.as_str());
                self.write_index(&root, &state.index).await?;
                return Ok(None);
            }
        };

        let seq = state.index.bump_seq();
        if let Some(stored) = state.index.entries.get_mut(key.as_str()) {
            stored.last_access_at_ms = now;
            stored.access_seq = seq;
        }
        self.write_index(&root, &state.index).await?;

        Ok(Some(PersistentEntry {
            key: key.clone(),
            size_bytes: entry.size_bytes,
            data,
            created_at: millis_to_datetime(entry.created_at_ms),
            last_access_at: millis_to_datetime(now),
            expires_at: millis_to_datetime(entry.expires_at_ms),
        }))
    }

    /// `true` if `key` is present and unexpired. Does not touch recency.
    pub async fn contains(&self, key: &PersistentKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let now = self.clock.unix_timestamp_millis();
        Ok(state
            .index
            .entries
            .get(key.as_str())
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    /// Store `data` under `key` for `ttl` (the configured default when
    /// `None`). Blobs larger than the whole store are skipped.
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    pub async fn put(
        &self,
        key: &PersistentKey,
        data: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let size = data.len() as u64;
        if size > self.config.max_size_bytes {
            warn!(
                max_size = self.config.max_size_bytes,
                "Blob larger than the persistent cache, not storing"
            );
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let root = self.ensure_loaded(&mut state).await?;
        let now = self.clock.unix_timestamp_millis();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let blob = key.blob_name();

        self.fs
            .write_file(&Self::blob_path(&root, &blob), data)
            .await
            .map_err(|e| MediaError::Cache(format!("Failed to write blob: {}", e)))?;

        let seq = state.index.bump_seq();
        state.index.entries.insert(
            key.as_str().to_string(),
            IndexEntry {
                blob,
                size_bytes: size,
                created_at_ms: now,
                last_access_at_ms: now,
                expires_at_ms: now.saturating_add(duration_millis(ttl)),
                access_seq: seq,
            },
        );

        let (removed, freed) = self.enforce_size_limit(&root, &mut state).await;
        self.write_index(&root, &state.index).await?;
        drop(state);

        debug!("Stored persistent entry");
        if removed > 0 {
            self.events.emit_media(MediaEvent::CacheEvicted {
                removed,
                freed_bytes: freed,
            });
        }
        Ok(())
    }

    /// Evict least recently accessed entries once usage passes the
    /// high-water mark. The newest write is a candidate too and goes last.
    async fn enforce_size_limit(&self, root: &Path, state: &mut CacheState) -> (usize, u64) {
        let max = self.config.max_size_bytes as f64;
        let mut total = state.index.total_size();
        if (total as f64) <= max * EVICT_ABOVE {
            return (0, 0);
        }

        let low_water = (max * EVICT_DOWN_TO) as u64;
        let mut candidates: Vec<(i64, u64, String)> = state
            .index
            .entries
            .iter()
            .map(|(k, e)| (e.last_access_at_ms, e.access_seq, k.clone()))
            .collect();
        candidates.sort_unstable();

        let mut removed = 0;
        let mut freed = 0;
        for (_, _, key) in candidates {
            if total <= low_water {
                break;
            }
            if let Some(entry) = state.index.entries.remove(&key) {
                self.delete_blob(root, &entry.blob).await;
                total -= entry.size_bytes;
                freed += entry.size_bytes;
                removed += 1;
            }
        }

        info!(removed, freed_bytes = freed, total_size = total, "Evicted persistent entries");
        (removed, freed)
    }

    /// Delete `key`. Returns whether it was present.
    pub async fn remove(&self, key: &PersistentKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        let root = self.ensure_loaded(&mut state).await?;
        let Some(entry) = state.index.entries.remove(key.as_str()) else {
            return Ok(false);
        };
        self.delete_blob(&root, &entry.blob).await;
        self.write_index(&root, &state.index).await?;
        Ok(true)
    }

    /// Purge every expired entry. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let root = self.ensure_loaded(&mut state).await?;
        let now = self.clock.unix_timestamp_millis();

        let expired: Vec<String> = state
            .index
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        for key in &expired {
            if let Some(entry) = state.index.entries.remove(key) {
                self.delete_blob(&root, &entry.blob).await;
            }
        }
        self.write_index(&root, &state.index).await?;
        drop(state);

        info!(removed = expired.len(), "Swept expired persistent entries");
        self.events.emit_media(MediaEvent::CacheSwept {
            removed: expired.len(),
        });
        Ok(expired.len())
    }

    /// Drop every entry. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let root = self.ensure_loaded(&mut state).await?;
        let entries = std::mem::take(&mut state.index.entries);
        for entry in entries.values() {
            self.delete_blob(&root, &entry.blob).await;
        }
        self.write_index(&root, &state.index).await?;
        info!(removed = entries.len(), "Cleared persistent media cache");
        Ok(entries.len())
    }

    pub async fn stats(&self) -> Result<PersistentStats> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let now = self.clock.unix_timestamp_millis();
        let total_size = state.index.total_size();

        Ok(PersistentStats {
            item_count: state.index.entries.len(),
            total_size,
            max_size: self.config.max_size_bytes,
            usage_percent: total_size as f64 / self.config.max_size_bytes as f64 * 100.0,
            expired_count: state
                .index
                .entries
                .values()
                .filter(|e| e.is_expired(now))
                .count(),
        })
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval`
    /// until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = cache.sweep_expired().await {
                            warn!(error = %e, "Persistent cache sweep failed");
                        }
                    }
                }
            }
            debug!("Persistent cache sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_desktop::TokioFileSystem;
    use bridge_traits::ManualClock;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        cache: PersistentCache,
        fs: Arc<TokioFileSystem>,
    }

    fn fixture(config: PersistentConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let fs = Arc::new(TokioFileSystem::with_cache_directory(dir.path().to_path_buf()));
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = PersistentCache::new(config, fs.clone(), clock.clone(), EventBus::new(16));
        Fixture {
            _dir: dir,
            clock,
            cache,
            fs,
        }
    }

    fn key(label: &str) -> PersistentKey {
        PersistentKey::new(AssetKind::Image, label, "jpg")
    }

    #[test]
    fn test_key_format() {
        let key = PersistentKey::new(AssetKind::Video, "att-42", "mp4");
        assert_eq!(key.to_string(), "video:att-42:mp4");
        assert_eq!(key.blob_name().len(), 64 + 4);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let f = fixture(PersistentConfig::default());
        f.cache
            .put(&key("a"), Bytes::from_static(b"decrypted"), None)
            .await
            .unwrap();

        let entry = f.cache.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(&entry.data[..], b"decrypted");
        assert_eq!(entry.size_bytes, 9);
        assert_eq!(
            (entry.expires_at - entry.created_at).num_days(),
            7,
        );
        assert!(f.cache.get(&key("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_purged_on_read() {
        let f = fixture(PersistentConfig::default());
        f.cache
            .put(&key("a"), Bytes::from_static(b"x"), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(61));
        assert!(!f.cache.contains(&key("a")).await.unwrap());
        assert_eq!(f.cache.stats().await.unwrap().expired_count, 1);

        assert!(f.cache.get(&key("a")).await.unwrap().is_none());
        let stats = f.cache.stats().await.unwrap();
        assert_eq!(stats.item_count, 0);
        assert_eq!(stats.total_size, 0);
    }

    #[tokio::test]
    async fn test_size_eviction_down_to_seventy_percent() {
        // Fill to 9.5 MiB under a roomier limit, then reopen at 10 MiB.
        let f = fixture(PersistentConfig::default().with_max_size_bytes(20 * MIB));
        let half = (MIB / 2) as usize;
        for i in 0..19 {
            f.cache
                .put(&key(&format!("e{}", i)), Bytes::from(vec![0u8; half]), None)
                .await
                .unwrap();
            f.clock.advance(Duration::from_millis(10));
        }
        assert_eq!(f.cache.stats().await.unwrap().total_size, 19 * MIB / 2);

        let cache = PersistentCache::new(
            PersistentConfig::default().with_max_size_bytes(10 * MIB),
            f.fs.clone(),
            f.clock.clone(),
            EventBus::new(16),
        );
        cache
            .put(&key("new"), Bytes::from(vec![1u8; MIB as usize]), None)
            .await
            .unwrap();

        let stats = cache.stats().await.unwrap();
        assert!(stats.total_size <= 7 * MIB, "total {}", stats.total_size);
        assert!(cache.contains(&key("new")).await.unwrap());
        assert!(!cache.contains(&key("e0")).await.unwrap());
        assert!(cache.contains(&key("e18")).await.unwrap());
    }

    #[tokio::test]
    async fn test_single_large_put_cannot_pin_store_above_high_water() {
        let f = fixture(PersistentConfig::default().with_max_size_bytes(10 * MIB));
        f.cache
            .put(&key("huge"), Bytes::from(vec![0u8; (19 * MIB / 2) as usize]), None)
            .await
            .unwrap();

        let stats = f.cache.stats().await.unwrap();
        assert!(stats.total_size <= 9 * MIB, "total {}", stats.total_size);
    }

    #[tokio::test]
    async fn test_recently_read_entries_survive_eviction() {
        let f = fixture(PersistentConfig::default().with_max_size_bytes(1000));
        for label in ["a", "b", "c"] {
            f.cache
                .put(&key(label), Bytes::from(vec![0u8; 300]), None)
                .await
                .unwrap();
        }
        // Same millisecond throughout; reading `a` still makes it newest.
        f.cache.get(&key("a")).await.unwrap();
        f.cache
            .put(&key("d"), Bytes::from(vec![0u8; 100]), None)
            .await
            .unwrap();

        // 1000 bytes stored; dropping the oldest, `b`, gets back to 700.
        assert!(f.cache.contains(&key("a")).await.unwrap());
        assert!(!f.cache.contains(&key("b")).await.unwrap());
        assert!(f.cache.contains(&key("c")).await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_blob_is_skipped() {
        let f = fixture(PersistentConfig::default().with_max_size_bytes(10));
        f.cache
            .put(&key("big"), Bytes::from(vec![0u8; 11]), None)
            .await
            .unwrap();
        assert!(!f.cache.contains(&key("big")).await.unwrap());
    }

    #[tokio::test]
    async fn test_index_survives_restart() {
        let f = fixture(PersistentConfig::default());
        f.cache
            .put(&key("kept"), Bytes::from_static(b"bytes"), None)
            .await
            .unwrap();

        let reopened = PersistentCache::new(
            PersistentConfig::default(),
            f.fs.clone(),
            f.clock.clone(),
            EventBus::new(16),
        );
        reopened.initialize().await.unwrap();
        let entry = reopened.get(&key("kept")).await.unwrap().unwrap();
        assert_eq!(&entry.data[..], b"bytes");
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_empty() {
        let f = fixture(PersistentConfig::default());
        let root = f.fs.get_cache_directory().await.unwrap().join("media_cache");
        f.fs.create_dir_all(&root).await.unwrap();
        f.fs
            .write_file(&root.join(INDEX_FILE), Bytes::from_static(b"{not json"))
            .await
            .unwrap();

        f.cache.initialize().await.unwrap();
        assert_eq!(f.cache.stats().await.unwrap().item_count, 0);
    }

    #[tokio::test]
    async fn test_sweep_remove_and_clear() {
        let f = fixture(PersistentConfig::default());
        f.cache
            .put(&key("short"), Bytes::from_static(b"1"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        f.cache.put(&key("long"), Bytes::from_static(b"2"), None).await.unwrap();
        f.cache.put(&key("other"), Bytes::from_static(b"3"), None).await.unwrap();

        f.clock.advance(Duration::from_secs(5));
        assert_eq!(f.cache.sweep_expired().await.unwrap(), 1);
        assert!(f.cache.remove(&key("long")).await.unwrap());
        assert!(!f.cache.remove(&key("long")).await.unwrap());
        assert_eq!(f.cache.clear().await.unwrap(), 1);
        assert_eq!(f.cache.stats().await.unwrap().item_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let f = fixture(PersistentConfig::default().with_sweep_interval(Duration::from_secs(60)));
        f.cache
            .put(&key("short"), Bytes::from_static(b"1"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(2));

        let cache = Arc::new(f.cache);
        let cancel = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        // Let the sweep's file I/O finish.
        for _ in 0..50 {
            if cache.stats().await.unwrap().item_count == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(cache.stats().await.unwrap().item_count, 0);

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
