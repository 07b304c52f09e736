//! # Encrypted Media Module
//!
//! Turns an asset manifest and a content key into displayable media bytes.
//!
//! ## Overview
//!
//! This module handles:
//! - AES-CBC block decryption on a bounded pool of worker threads
//! - Assembly of decrypted parts in order (legacy, chunked, or streamed)
//! - A reference-counted in-memory cache with LRU eviction under pressure
//! - A size-bounded, TTL-expiring persistent cache of decrypted blobs
//! - Cancellation and supersession of pending loads
//!
//! [`MediaEngine`] wires these together; the component types are public so
//! hosts can also drive them individually.

pub mod assembler;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod memory;
pub mod persistent;
pub mod registry;
pub mod strategy;
pub mod worker_pool;

pub use assembler::{
    AbortCheck, AssembledAsset, AssemblerConfig, AssemblyControl, AssetAssembler, FailureKind,
    LoadProgress, MediaSink, PartFailure, PreviewObserver, ProgressObserver, StreamedAsset,
};
pub use crypto::{AesCbcDecryptor, BlockDecryptor, ContentKey, CryptoError, EncryptedBlock};
pub use engine::{LoadRequest, LoadSource, LoadedAsset, MediaEngine, TelemetrySnapshot};
pub use error::{MediaError, Result};
pub use manifest::{AssetKind, AssetManifest, Part, PartDescriptor};
pub use memory::{MediaHandle, MemoryConfig, MemoryManager, MemoryStats};
pub use persistent::{PersistentCache, PersistentConfig, PersistentKey, PersistentStats};
pub use registry::{LoadRegistry, LoadTicket};
pub use strategy::{AssemblyStrategy, StrategyThresholds};
pub use worker_pool::{DecryptBatch, DecryptionWorkerPool, PoolConfig, PoolStats};
