//! # In-Memory Media Cache
//!
//! Owns every live decrypted buffer, counts their bytes against a cap, and
//! hands out opaque [`MediaHandle`]s instead of the buffers themselves.
//!
//! ## Reference counting
//!
//! `register` returns a handle pinned once. Each consumer that keeps the
//! asset on screen calls `retain`, and `release` when it goes away. Only
//! entries with no pins are eviction candidates, least recently used first.
//!
//! ## Admission
//!
//! When a new buffer would push usage past the cap, unpinned entries are
//! evicted first until the total after admission sits at 70% of the cap. If
//! everything is pinned the buffer is admitted anyway and usage runs over
//! the cap until something is released.
//!
//! ## Pressure
//!
//! [`MemoryManager::spawn_pressure_monitor`] samples the host through a
//! [`MemoryProbe`] and sheds unpinned entries whenever usage crosses the
//! configured threshold.

use bridge_traits::{Clock, MemoryProbe};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_runtime::{EngineConfig, EventBus, MediaEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

/// Fraction of the cap that admission-time eviction aims for.
const ADMISSION_TARGET_RATIO: f64 = 0.7;

/// Extra headroom, as a fraction of used memory, shed on a pressure tick.
const PRESSURE_HEADROOM: f64 = 0.1;

/// Entries listed in [`MemoryStats::lru`].
const LRU_PREVIEW: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    pub max_bytes: u64,
    /// Host usage ratio above which the monitor sheds entries.
    pub pressure_threshold: f64,
    pub monitor_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_bytes: 100 * MIB,
            pressure_threshold: 0.8,
            monitor_interval: Duration::from_secs(5),
        }
    }
}

impl From<&EngineConfig> for MemoryConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_bytes: config.memory_cap_bytes(),
            pressure_threshold: config.memory_pressure_threshold,
            monitor_interval: config.memory_monitor_interval,
        }
    }
}

impl MemoryConfig {
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_pressure_threshold(mut self, threshold: f64) -> Self {
        self.pressure_threshold = threshold;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_bytes == 0 {
            return Err("max_bytes must be greater than zero".to_string());
        }
        if !(self.pressure_threshold > 0.0 && self.pressure_threshold <= 1.0) {
            return Err(format!(
                "pressure_threshold must be in (0, 1], got {}",
                self.pressure_threshold
            ));
        }
        if self.monitor_interval.is_zero() {
            return Err("monitor_interval must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Capability for one cached buffer. Exchange it via [`MemoryManager::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaHandle(Uuid);

impl MediaHandle {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "media:{}", self.0)
    }
}

struct CacheEntry {
    label: String,
    data: Bytes,
    size: u64,
    ref_count: u32,
    created_at: DateTime<Utc>,
    last_access_at: DateTime<Utc>,
    last_access_tick: u64,
}

#[derive(Default)]
struct CacheTable {
    entries: HashMap<MediaHandle, CacheEntry>,
    used: u64,
    tick: u64,
}

impl CacheTable {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Remove unpinned entries, oldest access first, until `target` bytes
    /// are freed or nothing evictable is left.
    fn evict_lru(&mut self, target: u64) -> Eviction {
        let mut candidates: Vec<(u64, MediaHandle)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.ref_count == 0)
            .map(|(handle, entry)| (entry.last_access_tick, *handle))
            .collect();
        candidates.sort_unstable_by_key(|(tick, _)| *tick);

        let mut eviction = Eviction {
            target,
            ..Eviction::default()
        };
        for (_, handle) in candidates {
            if eviction.freed >= target {
                break;
            }
            if let Some(entry) = self.entries.remove(&handle) {
                self.used -= entry.size;
                eviction.freed += entry.size;
                eviction.removed += 1;
            }
        }
        eviction
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Eviction {
    target: u64,
    freed: u64,
    removed: usize,
}

/// One line of the LRU preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LruEntry {
    pub handle: MediaHandle,
    pub label: String,
    pub size_bytes: u64,
    pub ref_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub entry_count: usize,
    pub pinned_entries: usize,
    pub usage_percent: f64,
    /// Least recently used entries first.
    pub lru: Vec<LruEntry>,
}

/// Process-wide owner of decrypted buffers.
pub struct MemoryManager {
    config: MemoryConfig,
    table: Mutex<CacheTable>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            config,
            table: Mutex::new(CacheTable::default()),
            clock,
            events,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Admit `data` and return a handle already retained once.
    pub fn register(&self, data: Bytes, label: impl Into<String>) -> MediaHandle {
        let size = data.len() as u64;
        let label = label.into();
        let now = self.clock.now();
        let handle = MediaHandle::generate();

        let (eviction, used) = {
            let mut table = self.table.lock();

            let eviction = if table.used + size > self.config.max_bytes {
                let keep = (self.config.max_bytes as f64 * ADMISSION_TARGET_RATIO) as u64;
                let target = (table.used + size).saturating_sub(keep);
                Some(table.evict_lru(target))
            } else {
                None
            };

            let tick = table.next_tick();
            table.used += size;
            table.entries.insert(
                handle,
                CacheEntry {
                    label: label.clone(),
                    data,
                    size,
                    ref_count: 1,
                    created_at: now,
                    last_access_at: now,
                    last_access_tick: tick,
                },
            );
            (eviction, table.used)
        };

        if let Some(eviction) = eviction {
            self.report_eviction(eviction, used);
        }
        if used > self.config.max_bytes {
            warn!(
                used_bytes = used,
                max_bytes = self.config.max_bytes,
                "Memory cap exceeded by pinned entries"
            );
        }

        debug!(%handle, label = %label, size_bytes = size, used_bytes = used, "Registered media buffer");
        handle
    }

    /// Pin `handle` once more. `false` when it has been evicted.
    pub fn retain(&self, handle: &MediaHandle) -> bool {
        let now = self.clock.now();
        let mut table = self.table.lock();
        let tick = table.next_tick();
        match table.entries.get_mut(handle) {
            Some(entry) => {
                entry.ref_count += 1;
                entry.last_access_tick = tick;
                entry.last_access_at = now;
                true
            }
            None => false,
        }
    }

    /// Drop one pin. Saturates at zero; unknown handles are ignored.
    pub fn release(&self, handle: &MediaHandle) -> bool {
        let mut table = self.table.lock();
        match table.entries.get_mut(handle) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    /// The buffer behind `handle`, or `None` after eviction.
    pub fn get(&self, handle: &MediaHandle) -> Option<Bytes> {
        let now = self.clock.now();
        let mut table = self.table.lock();
        let tick = table.next_tick();
        table.entries.get_mut(handle).map(|entry| {
            entry.last_access_tick = tick;
            entry.last_access_at = now;
            entry.data.clone()
        })
    }

    pub fn contains(&self, handle: &MediaHandle) -> bool {
        self.table.lock().entries.contains_key(handle)
    }

    /// Remove `handle` regardless of pins.
    pub fn discard(&self, handle: &MediaHandle) -> bool {
        let mut table = self.table.lock();
        match table.entries.remove(handle) {
            Some(entry) => {
                table.used -= entry.size;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut table = self.table.lock();
        let count = table.entries.len();
        table.entries.clear();
        table.used = 0;
        info!(removed = count, "Cleared in-memory media cache");
    }

    pub fn used_bytes(&self) -> u64 {
        self.table.lock().used
    }

    /// Evict unpinned entries until `bytes` are freed. Returns bytes freed.
    pub fn evict_bytes(&self, bytes: u64) -> u64 {
        let (eviction, used) = {
            let mut table = self.table.lock();
            let eviction = table.evict_lru(bytes);
            (eviction, table.used)
        };
        self.report_eviction(eviction, used);
        eviction.freed
    }

    /// Take one memory sample and shed entries if the host is over the
    /// threshold. Returns the bytes freed, or `None` when no action was due.
    pub fn check_pressure(&self) -> Option<u64> {
        let sample = self.probe.as_ref()?.sample()?;
        let ratio = sample.usage_ratio();
        if ratio <= self.config.pressure_threshold {
            return None;
        }

        warn!(
            used_bytes = sample.used_bytes,
            limit_bytes = sample.limit_bytes,
            usage_ratio = ratio,
            "Memory pressure detected"
        );
        self.events.emit_media(MediaEvent::MemoryPressure {
            used_bytes: sample.used_bytes,
            limit_bytes: sample.limit_bytes,
            usage_ratio: ratio,
        });

        let excess = ratio - self.config.pressure_threshold + PRESSURE_HEADROOM;
        let target = (sample.used_bytes as f64 * excess) as u64;
        Some(self.evict_bytes(target))
    }

    /// Run [`check_pressure`](Self::check_pressure) every
    /// `monitor_interval` until `cancel` fires.
    pub fn spawn_pressure_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.monitor_interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Memory pressure monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.check_pressure();
                    }
                }
            }
        })
    }

    fn report_eviction(&self, eviction: Eviction, used_after: u64) {
        if eviction.removed > 0 {
            info!(
                removed = eviction.removed,
                freed_bytes = eviction.freed,
                used_bytes = used_after,
                "Evicted media buffers"
            );
            self.events.emit_media(MediaEvent::CacheEvicted {
                removed: eviction.removed,
                freed_bytes: eviction.freed,
            });
        }

        if eviction.target > 0 && eviction.freed * 2 < eviction.target {
            warn!(
                needed_bytes = eviction.target,
                freed_bytes = eviction.freed,
                used_bytes = used_after,
                "Eviction freed less than half of what was needed"
            );
            self.events.emit_media(MediaEvent::MemoryCritical {
                needed_bytes: eviction.target,
                freed_bytes: eviction.freed,
                used_bytes: used_after,
            });
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let table = self.table.lock();

        let mut by_age: Vec<(&MediaHandle, &CacheEntry)> = table.entries.iter().collect();
        by_age.sort_unstable_by_key(|(_, entry)| entry.last_access_tick);
        let lru = by_age
            .into_iter()
            .take(LRU_PREVIEW)
            .map(|(handle, entry)| LruEntry {
                handle: *handle,
                label: entry.label.clone(),
                size_bytes: entry.size,
                ref_count: entry.ref_count,
                created_at: entry.created_at,
                last_access_at: entry.last_access_at,
            })
            .collect();

        MemoryStats {
            used_bytes: table.used,
            max_bytes: self.config.max_bytes,
            entry_count: table.entries.len(),
            pinned_entries: table.entries.values().filter(|e| e.ref_count > 0).count(),
            usage_percent: table.used as f64 / self.config.max_bytes as f64 * 100.0,
            lru,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::{ManualClock, MemorySample};
    use core_runtime::CoreEvent;
    use mockall::mock;

    mock! {
        Probe {}

        impl MemoryProbe for Probe {
            fn sample(&self) -> Option<MemorySample>;
        }
    }

    fn manager(max_bytes: u64) -> (MemoryManager, EventBus) {
        let events = EventBus::new(32);
        let manager = MemoryManager::new(
            MemoryConfig::default().with_max_bytes(max_bytes),
            Arc::new(ManualClock::new(0)),
            events.clone(),
        );
        (manager, events)
    }

    fn buffer(size: usize) -> Bytes {
        Bytes::from(vec![7u8; size])
    }

    #[test]
    fn test_register_pins_until_release() {
        let (manager, _) = manager(100);
        let first = manager.register(buffer(60), "first");

        // Pinned entries survive admission pressure.
        let second = manager.register(buffer(60), "second");
        assert!(manager.contains(&first));
        assert_eq!(manager.used_bytes(), 120);

        // Released, the first entry goes on the next admission that needs room.
        manager.release(&first);
        assert!(manager.contains(&first));
        manager.release(&second);
        let _third = manager.register(buffer(10), "third");
        assert!(!manager.contains(&first));
        assert!(manager.get(&first).is_none());
    }

    #[test]
    fn test_admission_evicts_down_to_seventy_percent() {
        let (manager, _) = manager(1000);
        let handles: Vec<_> = (0..9)
            .map(|i| {
                let h = manager.register(buffer(100), format!("e{}", i));
                manager.release(&h);
                h
            })
            .collect();
        assert_eq!(manager.used_bytes(), 900);

        manager.register(buffer(200), "big");
        // 900 + 200 - 700 = 400 bytes had to go: the four oldest.
        assert_eq!(manager.used_bytes(), 700);
        for h in &handles[..4] {
            assert!(!manager.contains(h));
        }
        for h in &handles[4..] {
            assert!(manager.contains(h));
        }
    }

    #[test]
    fn test_lru_order_follows_access() {
        let (manager, _) = manager(300);
        let a = manager.register(buffer(100), "a");
        let b = manager.register(buffer(100), "b");
        let c = manager.register(buffer(100), "c");
        for h in [&a, &b, &c] {
            manager.release(h);
        }

        // Touch `a`, making `b` the oldest.
        assert!(manager.get(&a).is_some());
        manager.register(buffer(10), "d");

        assert!(manager.contains(&a));
        assert!(!manager.contains(&b));
        assert_eq!(manager.stats().lru[0].label, "c");
    }

    #[test]
    fn test_retain_release_counts() {
        let (manager, _) = manager(100);
        let h = manager.register(buffer(10), "x");
        assert!(manager.retain(&h));
        manager.release(&h);
        manager.release(&h);
        manager.release(&h);
        assert_eq!(manager.stats().pinned_entries, 0);

        assert!(manager.discard(&h));
        assert!(!manager.retain(&h));
        assert!(!manager.release(&h));
        assert_eq!(manager.used_bytes(), 0);
    }

    #[test]
    fn test_all_pinned_overflow_emits_critical() {
        let (manager, events) = manager(100);
        let mut rx = events.subscribe();
        manager.register(buffer(90), "pinned");
        manager.register(buffer(50), "also-pinned");
        assert_eq!(manager.used_bytes(), 140);

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            CoreEvent::Media(MediaEvent::MemoryCritical { freed_bytes: 0, .. })
        ));
    }

    #[test]
    fn test_pressure_sample_sheds_unpinned() {
        let events = EventBus::new(32);
        let mut probe = MockProbe::new();
        probe
            .expect_sample()
            .returning(|| Some(MemorySample::new(900, 1000)));
        let manager = MemoryManager::new(
            MemoryConfig::default().with_max_bytes(10_000),
            Arc::new(ManualClock::new(0)),
            events.clone(),
        )
        .with_probe(Arc::new(probe));
        let mut rx = events.subscribe();

        let pinned = manager.register(buffer(100), "pinned");
        for i in 0..3 {
            let h = manager.register(buffer(100), format!("loose-{}", i));
            manager.release(&h);
        }

        // 900 * (0.9 - 0.8 + 0.1) = 180 bytes to shed
        let freed = manager.check_pressure().unwrap();
        assert_eq!(freed, 200);
        assert!(manager.contains(&pinned));
        assert_eq!(manager.stats().entry_count, 2);

        assert!(matches!(
            rx.try_recv().unwrap(),
            CoreEvent::Media(MediaEvent::MemoryPressure { .. })
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            CoreEvent::Media(MediaEvent::CacheEvicted { removed: 2, freed_bytes: 200 })
        ));
    }

    #[test]
    fn test_pressure_below_threshold_is_noop() {
        let mut probe = MockProbe::new();
        probe
            .expect_sample()
            .returning(|| Some(MemorySample::new(100, 1000)));
        let (manager, _) = manager(1000);
        let manager = manager.with_probe(Arc::new(probe));
        assert_eq!(manager.check_pressure(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pressure_monitor_runs_until_cancelled() {
        let mut probe = MockProbe::new();
        probe
            .expect_sample()
            .returning(|| Some(MemorySample::new(950, 1000)));
        let events = EventBus::new(32);
        let manager = Arc::new(
            MemoryManager::new(
                MemoryConfig::default()
                    .with_max_bytes(10_000)
                    .with_monitor_interval(Duration::from_secs(5)),
                Arc::new(ManualClock::new(0)),
                events.clone(),
            )
            .with_probe(Arc::new(probe)),
        );
        let loose = manager.register(buffer(100), "loose");
        manager.release(&loose);

        let cancel = CancellationToken::new();
        let monitor = manager.spawn_pressure_monitor(cancel.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!manager.contains(&loose));

        cancel.cancel();
        monitor.await.unwrap();
    }

    #[test]
    fn test_config_validation() {
        assert!(MemoryConfig::default().validate().is_ok());
        assert!(MemoryConfig::default().with_max_bytes(0).validate().is_err());
        assert!(MemoryConfig::default()
            .with_pressure_threshold(1.5)
            .validate()
            .is_err());
    }
}
