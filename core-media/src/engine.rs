//! # Media Engine
//!
//! Dependency-injected facade over the worker pool, the assembler, and both
//! caches. One engine per process; share it behind an `Arc`.
//!
//! ## Load flow
//!
//! 1. Register the load, superseding any pending load of the same asset
//! 2. Serve from the persistent cache when possible
//! 3. Otherwise pick a strategy and assemble from the network
//! 4. Admit the bytes to the in-memory cache and hand back a handle
//! 5. Persist complete results for the next view
//!
//! ```ignore
//! use core_media::{LoadRequest, MediaEngine};
//!
//! let engine = MediaEngine::new(&config, EventBus::default())?;
//! engine.start().await?;
//!
//! let loaded = engine.load_asset(LoadRequest::new(manifest, key)).await?;
//! let bytes = engine.get_bytes(&loaded.handle);
//! // ... display ...
//! engine.release(&loaded.handle);
//! ```

use bridge_traits::{Clock, PlatformCapabilities};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use core_runtime::{EngineConfig, EventBus, MediaEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::assembler::{
    AssemblerConfig, AssemblyControl, AssetAssembler, LoadProgress, MediaSink, PartFailure,
    PreviewObserver, ProgressObserver,
};
use crate::crypto::{AesCbcDecryptor, BlockDecryptor, ContentKey};
use crate::error::{MediaError, Result};
use crate::manifest::{AssetKind, AssetManifest};
use crate::memory::{MediaHandle, MemoryConfig, MemoryManager, MemoryStats};
use crate::persistent::{PersistentCache, PersistentConfig, PersistentKey, PersistentStats};
use crate::registry::{LoadRegistry, LoadTicket};
use crate::strategy::{self, AssemblyStrategy, StrategyThresholds};
use crate::worker_pool::{DecryptionWorkerPool, PoolConfig, PoolStats};

fn config_error(component: &str, message: String) -> MediaError {
    MediaError::Runtime(core_runtime::Error::Config(format!(
        "{}: {}",
        component, message
    )))
}

// ============================================================================
// Requests and Results
// ============================================================================

/// Everything needed to load one asset.
pub struct LoadRequest {
    pub manifest: AssetManifest,
    pub key: ContentKey,
    pub progress: Option<ProgressObserver>,
    /// Image loads only: receives the first decrypted part before assembly ends.
    pub preview: Option<PreviewObserver>,
    pub cancel: CancellationToken,
    pub sink: Option<Arc<dyn MediaSink>>,
    /// Overrides strategy selection.
    pub strategy: Option<AssemblyStrategy>,
    /// Fail with `CapacityExceeded` instead of returning a truncated asset.
    pub require_complete: bool,
}

impl LoadRequest {
    pub fn new(manifest: AssetManifest, key: ContentKey) -> Self {
        Self {
            manifest,
            key,
            progress: None,
            preview: None,
            cancel: CancellationToken::new(),
            sink: None,
            strategy: None,
            require_complete: false,
        }
    }

    pub fn with_progress(mut self, observer: ProgressObserver) -> Self {
        self.progress = Some(observer);
        self
    }

    /// Show a progressive preview from the first part of an image. Ignored
    /// for other kinds and for cache hits.
    pub fn with_preview(mut self, observer: PreviewObserver) -> Self {
        self.preview = Some(observer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_strategy(mut self, strategy: AssemblyStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn require_complete(mut self, required: bool) -> Self {
        self.require_complete = required;
        self
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("asset_id", &self.manifest.asset_id)
            .field("kind", &self.manifest.kind)
            .field("parts", &self.manifest.total_parts())
            .field("key", &self.key)
            .field("has_progress", &self.progress.is_some())
            .field("has_preview", &self.preview.is_some())
            .field("has_sink", &self.sink.is_some())
            .field("strategy", &self.strategy)
            .field("require_complete", &self.require_complete)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    PersistentCache,
    Network,
}

/// A loaded asset. Call [`MediaEngine::release`] when it leaves the screen.
#[derive(Debug, Clone)]
pub struct LoadedAsset {
    pub handle: MediaHandle,
    pub strategy: AssemblyStrategy,
    pub source: LoadSource,
    pub partial: bool,
    /// Decrypted bytes produced; for Streaming, everything fed to the sink.
    pub total_bytes: u64,
    pub failures: Vec<PartFailure>,
}

/// Operator-facing diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub memory: MemoryStats,
    pub pool: PoolStats,
    pub persistent: Option<PersistentStats>,
    pub active_loads: usize,
    pub captured_at: DateTime<Utc>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct MediaEngine {
    capabilities: PlatformCapabilities,
    thresholds: StrategyThresholds,
    memory: Arc<MemoryManager>,
    persistent: Option<Arc<PersistentCache>>,
    pool: Arc<DecryptionWorkerPool>,
    assembler: AssetAssembler,
    registry: Arc<LoadRegistry>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaEngine {
    /// Build an engine with the default AES-CBC decryptor.
    ///
    /// Must be called inside a Tokio runtime when the worker pool is enabled.
    pub fn new(config: &EngineConfig, events: EventBus) -> Result<Self> {
        Self::with_decryptor(config, events, Arc::new(AesCbcDecryptor))
    }

    pub fn with_decryptor(
        config: &EngineConfig,
        events: EventBus,
        decryptor: Arc<dyn BlockDecryptor>,
    ) -> Result<Self> {
        config.validate()?;

        let pool_config = PoolConfig::from(config);
        pool_config
            .validate()
            .map_err(|e| config_error("worker pool", e))?;
        let memory_config = MemoryConfig::from(config);
        memory_config
            .validate()
            .map_err(|e| config_error("memory cache", e))?;
        let assembler_config = AssemblerConfig::from(config);
        assembler_config
            .validate()
            .map_err(|e| config_error("assembler", e))?;

        let pool = Arc::new(DecryptionWorkerPool::new(pool_config, decryptor)?);

        let mut memory =
            MemoryManager::new(memory_config, Arc::clone(&config.clock), events.clone());
        if let Some(probe) = &config.memory_probe {
            memory = memory.with_probe(Arc::clone(probe));
        }

        let persistent = if config.capabilities.persistent_store {
            let fs = config.file_system.clone().ok_or_else(|| {
                MediaError::Runtime(core_runtime::Error::CapabilityMissing {
                    capability: "FileSystemAccess".to_string(),
                    message: "required by the persistent media cache".to_string(),
                })
            })?;
            let persistent_config = PersistentConfig::from(config);
            persistent_config
                .validate()
                .map_err(|e| config_error("persistent cache", e))?;
            Some(Arc::new(PersistentCache::new(
                persistent_config,
                fs,
                Arc::clone(&config.clock),
                events.clone(),
            )))
        } else {
            None
        };

        let assembler = AssetAssembler::new(
            Arc::clone(&config.block_fetcher),
            Arc::clone(&pool),
            assembler_config,
        );

        info!(
            workers = pool.stats().total_workers,
            memory_cap_mb = config.memory_cap_mb,
            persistent = persistent.is_some(),
            streaming = config.capabilities.incremental_media_append,
            "Media engine created"
        );

        Ok(Self {
            capabilities: config.capabilities,
            thresholds: StrategyThresholds::from(config),
            memory: Arc::new(memory),
            persistent,
            pool,
            assembler,
            registry: Arc::new(LoadRegistry::new()),
            events,
            clock: Arc::clone(&config.clock),
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Load the persistent index and start the pressure monitor and sweeper.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if let Some(persistent) = &self.persistent {
            persistent.initialize().await?;
        }

        let mut tasks = self.tasks.lock();
        tasks.push(
            self.memory
                .spawn_pressure_monitor(self.background.child_token()),
        );
        if let Some(persistent) = &self.persistent {
            tasks.push(persistent.spawn_sweeper(self.background.child_token()));
        }

        info!("Media engine started");
        Ok(())
    }

    /// Stop background tasks and the worker pool. Handles stay valid.
    pub async fn shutdown(&self) {
        self.background.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.pool.shutdown().await;
        info!("Media engine shut down");
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn persistent(&self) -> Option<&Arc<PersistentCache>> {
        self.persistent.as_ref()
    }

    pub fn pool(&self) -> &Arc<DecryptionWorkerPool> {
        &self.pool
    }

    /// Strategy that would be used for `manifest` without an override.
    pub fn select_strategy(&self, manifest: &AssetManifest) -> AssemblyStrategy {
        strategy::select(manifest, &self.thresholds, &self.capabilities)
    }

    /// Load, decrypt, and cache one asset.
    ///
    /// # Errors
    ///
    /// - [`MediaError::Aborted`] when cancelled or superseded; not a failure
    /// - [`MediaError::UnsupportedStrategy`] for a forced Streaming load the
    ///   host cannot serve
    /// - [`MediaError::CapacityExceeded`] when `require_complete` is set and
    ///   the asset was truncated
    /// - the first part failure for kinds that need every part
    #[instrument(skip(self, request), fields(asset_id = %request.manifest.asset_id, kind = %request.manifest.kind))]
    pub async fn load_asset(&self, request: LoadRequest) -> Result<LoadedAsset> {
        let key = PersistentKey::new(
            request.manifest.kind,
            &request.manifest.asset_id,
            &request.manifest.extension,
        );
        let asset_id = request.manifest.asset_id.clone();
        let ticket = self.registry.begin(key.as_str(), &request.cancel);

        let outcome = self.run_load(&ticket, &key, request).await;
        self.registry.finish(&ticket);

        match &outcome {
            Ok(loaded) => {
                info!(
                    handle = %loaded.handle,
                    strategy = %loaded.strategy,
                    source = ?loaded.source,
                    bytes = loaded.total_bytes,
                    partial = loaded.partial,
                    "Asset loaded"
                );
                self.events.emit_media(MediaEvent::LoadCompleted {
                    asset_id,
                    bytes: loaded.total_bytes,
                    partial: loaded.partial,
                    from_cache: loaded.source == LoadSource::PersistentCache,
                });
            }
            Err(e) if e.is_aborted() => {
                debug!("Asset load aborted");
                self.events.emit_media(MediaEvent::LoadAborted { asset_id });
            }
            Err(e) => {
                warn!(error = %e, "Asset load failed");
                self.events.emit_media(MediaEvent::LoadFailed {
                    asset_id,
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                });
            }
        }

        outcome
    }

    async fn run_load(
        &self,
        ticket: &LoadTicket,
        key: &PersistentKey,
        request: LoadRequest,
    ) -> Result<LoadedAsset> {
        let LoadRequest {
            manifest,
            key: content_key,
            progress,
            preview,
            sink,
            strategy: forced,
            require_complete,
            ..
        } = request;
        let total_parts = manifest.total_parts();

        if ticket.token().is_cancelled() {
            return Err(MediaError::Aborted);
        }

        let strategy = self.resolve_strategy(&manifest, forced, sink.is_some())?;

        if strategy != AssemblyStrategy::Streaming {
            if let Some(loaded) = self.load_from_cache(key, strategy).await {
                if let Some(progress) = &progress {
                    progress(LoadProgress {
                        parts_processed: total_parts,
                        total_parts,
                    });
                }
                return Ok(loaded);
            }
        }

        self.events.emit_media(MediaEvent::LoadStarted {
            asset_id: manifest.asset_id.clone(),
            strategy: strategy.to_string(),
        });

        let mut control = AssemblyControl::new(Arc::new(ticket.clone()))
            .with_progress(self.progress_relay(ticket, &manifest.asset_id, progress));
        if let Some(preview) = preview.filter(|_| manifest.kind == AssetKind::Image) {
            control = control.with_preview(self.preview_relay(ticket, preview));
        }

        match (strategy, sink) {
            (AssemblyStrategy::Streaming, Some(sink)) => {
                let streamed = self
                    .assembler
                    .stream(&manifest, &content_key, sink.as_ref(), &control)
                    .await?;
                if ticket.token().is_cancelled() {
                    return Err(MediaError::Aborted);
                }

                let mut tail = BytesMut::with_capacity(streamed.retained_bytes as usize);
                for chunk in &streamed.retained {
                    tail.extend_from_slice(chunk);
                }
                let handle = self.memory.register(tail.freeze(), key.as_str());

                Ok(LoadedAsset {
                    handle,
                    strategy,
                    source: LoadSource::Network,
                    partial: streamed.partial,
                    total_bytes: streamed.total_bytes,
                    failures: streamed.failures,
                })
            }
            (AssemblyStrategy::Streaming, None) => Err(MediaError::UnsupportedStrategy(
                "streaming requires a media sink".to_string(),
            )),
            (strategy, _) => {
                let assembled = self
                    .assembler
                    .assemble(&manifest, &content_key, strategy, &control)
                    .await?;
                if ticket.token().is_cancelled() {
                    return Err(MediaError::Aborted);
                }

                if assembled.partial && require_complete {
                    if let Some(first) = assembled.failures.first() {
                        return Err(first.to_error());
                    }
                    return Err(MediaError::CapacityExceeded {
                        assembled: assembled.parts_assembled,
                        total: assembled.total_parts,
                    });
                }

                let total_bytes = assembled.bytes.len() as u64;
                let handle = self.memory.register(assembled.bytes.clone(), key.as_str());

                if !assembled.partial {
                    self.persist(key, assembled.bytes).await;
                }

                Ok(LoadedAsset {
                    handle,
                    strategy,
                    source: LoadSource::Network,
                    partial: assembled.partial,
                    total_bytes,
                    failures: assembled.failures,
                })
            }
        }
    }

    fn resolve_strategy(
        &self,
        manifest: &AssetManifest,
        forced: Option<AssemblyStrategy>,
        has_sink: bool,
    ) -> Result<AssemblyStrategy> {
        match forced {
            Some(AssemblyStrategy::Streaming) => {
                if !self.capabilities.incremental_media_append {
                    return Err(MediaError::UnsupportedStrategy(
                        "host does not support incremental media append".to_string(),
                    ));
                }
                if !has_sink {
                    return Err(MediaError::UnsupportedStrategy(
                        "streaming requires a media sink".to_string(),
                    ));
                }
                Ok(AssemblyStrategy::Streaming)
            }
            Some(other) => Ok(other),
            None => {
                let selected = self.select_strategy(manifest);
                if selected == AssemblyStrategy::Streaming && !has_sink {
                    debug!("No media sink supplied, assembling chunked instead of streaming");
                    return Ok(AssemblyStrategy::Chunked);
                }
                Ok(selected)
            }
        }
    }

    async fn load_from_cache(
        &self,
        key: &PersistentKey,
        strategy: AssemblyStrategy,
    ) -> Option<LoadedAsset> {
        let persistent = self.persistent.as_ref()?;
        let entry = match persistent.get(key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(error = %e, "Persistent cache lookup failed, loading from network");
                return None;
            }
        };

        debug!(size = entry.size_bytes, "Serving asset from persistent cache");
        let total_bytes = entry.data.len() as u64;
        let handle = self.memory.register(entry.data, key.as_str());
        Some(LoadedAsset {
            handle,
            strategy,
            source: LoadSource::PersistentCache,
            partial: false,
            total_bytes,
            failures: Vec::new(),
        })
    }

    async fn persist(&self, key: &PersistentKey, bytes: Bytes) {
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.put(key, bytes, None).await {
                warn!(error = %e, "Failed to persist decrypted asset");
            }
        }
    }

    /// Wrap the caller's observer so a superseded run goes quiet.
    fn progress_relay(
        &self,
        ticket: &LoadTicket,
        asset_id: &str,
        observer: Option<ProgressObserver>,
    ) -> ProgressObserver {
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let ticket = ticket.clone();
        let asset_id = asset_id.to_string();

        Arc::new(move |progress: LoadProgress| {
            if ticket.token().is_cancelled() || !registry.is_current(&ticket) {
                return;
            }
            events.emit_media(MediaEvent::LoadProgress {
                asset_id: asset_id.clone(),
                parts_processed: progress.parts_processed,
                total_parts: progress.total_parts,
            });
            if let Some(observer) = &observer {
                observer(progress);
            }
        })
    }

    fn preview_relay(&self, ticket: &LoadTicket, observer: PreviewObserver) -> PreviewObserver {
        let registry = Arc::clone(&self.registry);
        let ticket = ticket.clone();

        Arc::new(move |first_part: Bytes| {
            if ticket.token().is_cancelled() || !registry.is_current(&ticket) {
                return;
            }
            debug!(bytes = first_part.len(), "Delivering progressive preview");
            observer(first_part);
        })
    }

    // ------------------------------------------------------------------------
    // Handle operations
    // ------------------------------------------------------------------------

    pub fn retain(&self, handle: &MediaHandle) -> bool {
        self.memory.retain(handle)
    }

    pub fn release(&self, handle: &MediaHandle) -> bool {
        self.memory.release(handle)
    }

    /// Bytes behind `handle`; `None` once evicted, which callers treat as a
    /// cache miss and reload.
    pub fn get_bytes(&self, handle: &MediaHandle) -> Option<Bytes> {
        self.memory.get(handle)
    }

    pub fn discard(&self, handle: &MediaHandle) -> bool {
        self.memory.discard(handle)
    }

    /// Drop every cached buffer and persisted blob.
    pub async fn clear_caches(&self) -> Result<()> {
        self.memory.clear();
        if let Some(persistent) = &self.persistent {
            persistent.clear().await?;
        }
        Ok(())
    }

    pub async fn telemetry(&self) -> TelemetrySnapshot {
        let persistent = match &self.persistent {
            Some(persistent) => match persistent.stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(error = %e, "Persistent cache stats unavailable");
                    None
                }
            },
            None => None,
        };

        TelemetrySnapshot {
            memory: self.memory.stats(),
            pool: self.pool.stats(),
            persistent,
            active_loads: self.registry.active_loads(),
            captured_at: self.clock.now(),
        }
    }
}
