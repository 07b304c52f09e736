//! # Decryption Worker Pool
//!
//! A fixed set of named OS threads that open sealed blocks in parallel.
//!
//! ## Overview
//!
//! A batch of blocks is split into one job per block. The jobs go onto a
//! queue owned by a single dispatcher task, which hands each job to an idle
//! worker and collects the plaintext by chunk index. Workers never touch the
//! queue or each other, so completion order has no effect on the result
//! order.
//!
//! Small batches, and batches submitted while every worker is busy, are
//! decrypted inline on the caller instead.
//!
//! ## Failure handling
//!
//! - A failed or panicking decrypt yields `None` at its own index only.
//! - A worker that faults is returned to the idle set and the queue is
//!   drained again.
//! - A batch not finished within `task_timeout` is purged. Chunks already
//!   decrypted are kept; the rest are `None`.

use bytes::Bytes;
use core_runtime::EngineConfig;
use crossbeam_channel::{unbounded as job_channel, Receiver as JobReceiver, Sender as JobSender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::crypto::{BlockDecryptor, ContentKey, CryptoError, EncryptedBlock};
use crate::error::{MediaError, Result};

/// Upper bound on automatically sized pools.
pub const MAX_AUTO_WORKERS: usize = 8;

/// Called with `(chunks_done, chunks_total)` as a batch progresses.
pub type DecryptProgress = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Worker count for this host: one less than the core count, at least two,
/// at most eight.
pub fn default_worker_count() -> usize {
    let cores = num_cpus::get();
    cores
        .min(cores.saturating_sub(1).max(2))
        .min(MAX_AUTO_WORKERS)
        .max(2)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// `None` sizes the pool from the core count.
    pub worker_count: Option<usize>,
    /// Batches with at most this many blocks are decrypted inline.
    pub sequential_threshold: usize,
    pub task_timeout: Duration,
    /// `false` builds a pool without threads; every batch runs inline.
    pub enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            sequential_threshold: 4,
            task_timeout: Duration::from_secs(120),
            enabled: true,
        }
    }
}

impl From<&EngineConfig> for PoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            task_timeout: config.task_timeout,
            enabled: config.capabilities.worker_pool,
            ..Self::default()
        }
    }
}

impl PoolConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn with_sequential_threshold(mut self, blocks: usize) -> Self {
        self.sequential_threshold = blocks;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(default_worker_count)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.worker_count == Some(0) {
            return Err("worker_count must be at least 1".to_string());
        }
        if self.task_timeout.is_zero() {
            return Err("task_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Results and Stats
// ============================================================================

/// Outcome of one `decrypt` call.
#[derive(Debug, Clone)]
pub struct DecryptBatch {
    /// Plaintext per input block, in input order. `None` marks a failed,
    /// faulted, or timed-out chunk.
    pub results: Vec<Option<Bytes>>,
    /// Failure cause per chunk index, for chunks that reported one.
    pub failures: HashMap<usize, CryptoError>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl DecryptBatch {
    fn from_slots(slots: ChunkSlots, timed_out: bool, started: Instant) -> Self {
        Self {
            results: slots.results,
            failures: slots.failures,
            timed_out,
            elapsed: started.elapsed(),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(Option::is_some)
    }

    /// Human-readable cause for a `None` slot.
    pub fn failure_reason(&self, index: usize) -> String {
        match self.failures.get(&index) {
            Some(err) => err.to_string(),
            None if self.timed_out => "decrypt batch timed out".to_string(),
            None => "decrypt worker unavailable".to_string(),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
}

#[derive(Default)]
struct PoolGauges {
    idle: AtomicUsize,
    busy: AtomicUsize,
    queued: AtomicUsize,
}

struct ChunkSlots {
    results: Vec<Option<Bytes>>,
    failures: HashMap<usize, CryptoError>,
}

impl ChunkSlots {
    fn empty(len: usize) -> Self {
        Self {
            results: vec![None; len],
            failures: HashMap::new(),
        }
    }

    fn record(&mut self, index: usize, outcome: std::result::Result<Bytes, CryptoError>) {
        match outcome {
            Ok(plaintext) => self.results[index] = Some(plaintext),
            Err(err) => {
                self.failures.insert(index, err);
            }
        }
    }
}

// ============================================================================
// Dispatcher Protocol
// ============================================================================

struct ChunkJob {
    task_id: Uuid,
    index: usize,
    block: EncryptedBlock,
    key: ContentKey,
}

struct BatchTask {
    task_id: Uuid,
    blocks: Vec<EncryptedBlock>,
    key: ContentKey,
    progress: Option<DecryptProgress>,
    reply: oneshot::Sender<ChunkSlots>,
}

enum PoolMessage {
    Submit(BatchTask),
    ChunkDone {
        worker: usize,
        task_id: Uuid,
        index: usize,
        outcome: std::result::Result<Bytes, CryptoError>,
    },
    WorkerFault {
        worker: usize,
        task_id: Uuid,
        index: usize,
        message: String,
    },
    Expire {
        task_id: Uuid,
        reply: oneshot::Sender<Option<ChunkSlots>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

struct PendingTask {
    slots: ChunkSlots,
    outstanding: usize,
    progress: Option<DecryptProgress>,
    reply: oneshot::Sender<ChunkSlots>,
}

impl PendingTask {
    fn report_progress(&mut self) {
        let total = self.slots.results.len();
        let done = total - self.outstanding;
        let panicked = self
            .progress
            .as_ref()
            .is_some_and(|progress| !notify(progress, done, total));
        if panicked {
            // Stop calling a callback that panicked.
            self.progress = None;
        }
    }
}

/// Call a progress callback, containing any panic. Returns false if it panicked.
fn notify(progress: &DecryptProgress, done: usize, total: usize) -> bool {
    match catch_unwind(AssertUnwindSafe(|| progress(done, total))) {
        Ok(()) => true,
        Err(payload) => {
            warn!(done, total, message = %panic_message(payload), "Progress callback panicked");
            false
        }
    }
}

struct Dispatcher {
    inbox: mpsc::UnboundedReceiver<PoolMessage>,
    workers: Vec<Option<JobSender<ChunkJob>>>,
    idle: VecDeque<usize>,
    queue: VecDeque<ChunkJob>,
    pending: HashMap<Uuid, PendingTask>,
    gauges: Arc<PoolGauges>,
}

impl Dispatcher {
    async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            match message {
                PoolMessage::Submit(task) => self.submit(task),
                PoolMessage::ChunkDone {
                    worker,
                    task_id,
                    index,
                    outcome,
                } => {
                    self.idle.push_back(worker);
                    self.complete_chunk(task_id, index, outcome);
                }
                PoolMessage::WorkerFault {
                    worker,
                    task_id,
                    index,
                    message,
                } => {
                    warn!(worker, %task_id, index, %message, "Decrypt worker faulted");
                    self.idle.push_back(worker);
                    self.complete_chunk(task_id, index, Err(CryptoError::Panicked(message)));
                }
                PoolMessage::Expire { task_id, reply } => {
                    let expired = self.expire(task_id);
                    let _ = reply.send(expired);
                }
                PoolMessage::Shutdown { ack } => {
                    self.stop();
                    let _ = ack.send(());
                    return;
                }
            }
            self.drain();
        }
        self.stop();
    }

    fn submit(&mut self, task: BatchTask) {
        let total = task.blocks.len();
        debug!(task_id = %task.task_id, chunks = total, "Queueing decrypt batch");

        for (index, block) in task.blocks.into_iter().enumerate() {
            self.queue.push_back(ChunkJob {
                task_id: task.task_id,
                index,
                block,
                key: task.key.clone(),
            });
        }

        self.pending.insert(
            task.task_id,
            PendingTask {
                slots: ChunkSlots::empty(total),
                outstanding: total,
                progress: task.progress,
                reply: task.reply,
            },
        );
    }

    fn complete_chunk(
        &mut self,
        task_id: Uuid,
        index: usize,
        outcome: std::result::Result<Bytes, CryptoError>,
    ) {
        // Late results for purged tasks are dropped.
        let Some(task) = self.pending.get_mut(&task_id) else {
            return;
        };

        task.slots.record(index, outcome);
        task.outstanding -= 1;
        task.report_progress();

        if task.outstanding == 0 {
            if let Some(task) = self.pending.remove(&task_id) {
                let _ = task.reply.send(task.slots);
            }
        }
    }

    fn expire(&mut self, task_id: Uuid) -> Option<ChunkSlots> {
        let task = self.pending.remove(&task_id)?;
        self.queue.retain(|job| job.task_id != task_id);
        warn!(
            %task_id,
            outstanding = task.outstanding,
            "Decrypt batch timed out, purging"
        );
        Some(task.slots)
    }

    /// Hand queued jobs to idle workers, oldest idle worker first.
    fn drain(&mut self) {
        while !self.idle.is_empty() {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            if !self.pending.contains_key(&job.task_id) {
                continue;
            }
            let Some(worker) = self.idle.pop_front() else {
                break;
            };

            let Some(sender) = self.workers.get(worker).and_then(Option::as_ref) else {
                continue;
            };
            if let Err(returned) = sender.send(job) {
                // The thread is gone; retire the slot and fail the chunk.
                let job = returned.into_inner();
                warn!(worker, "Decrypt worker exited, retiring it");
                self.workers[worker] = None;
                self.complete_chunk(
                    job.task_id,
                    job.index,
                    Err(CryptoError::Panicked("worker thread exited".to_string())),
                );
            }
        }
        self.publish_gauges();
    }

    fn publish_gauges(&self) {
        let live = self.workers.iter().filter(|w| w.is_some()).count();
        let idle = self.idle.len().min(live);
        self.gauges.idle.store(idle, Ordering::Relaxed);
        self.gauges.busy.store(live - idle, Ordering::Relaxed);
        self.gauges.queued.store(self.queue.len(), Ordering::Relaxed);
    }

    fn stop(&mut self) {
        // Dropping the job senders lets every worker thread fall out of its loop.
        self.workers.clear();
        self.queue.clear();
        self.idle.clear();
        for (_, task) in self.pending.drain() {
            let _ = task.reply.send(task.slots);
        }
        self.gauges.idle.store(0, Ordering::Relaxed);
        self.gauges.busy.store(0, Ordering::Relaxed);
        self.gauges.queued.store(0, Ordering::Relaxed);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "decryptor panicked".to_string()
    }
}

fn open_block(
    decryptor: &dyn BlockDecryptor,
    block: &EncryptedBlock,
    key: &ContentKey,
) -> std::result::Result<Bytes, CryptoError> {
    match catch_unwind(AssertUnwindSafe(|| decryptor.decrypt_block(block, key))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(CryptoError::Panicked(panic_message(payload))),
    }
}

fn worker_loop(
    worker: usize,
    jobs: JobReceiver<ChunkJob>,
    events: mpsc::UnboundedSender<PoolMessage>,
    decryptor: Arc<dyn BlockDecryptor>,
) {
    while let Ok(job) = jobs.recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            decryptor.decrypt_block(&job.block, &job.key)
        }));

        let message = match outcome {
            Ok(outcome) => PoolMessage::ChunkDone {
                worker,
                task_id: job.task_id,
                index: job.index,
                outcome,
            },
            Err(payload) => PoolMessage::WorkerFault {
                worker,
                task_id: job.task_id,
                index: job.index,
                message: panic_message(payload),
            },
        };

        if events.send(message).is_err() {
            break;
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

struct PoolRuntime {
    inbox: mpsc::UnboundedSender<PoolMessage>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Pool of decryption threads shared by every concurrent asset load.
///
/// Create one per process and share it behind an `Arc`.
pub struct DecryptionWorkerPool {
    config: PoolConfig,
    decryptor: Arc<dyn BlockDecryptor>,
    runtime: Option<PoolRuntime>,
    total_workers: usize,
    gauges: Arc<PoolGauges>,
    shut_down: AtomicBool,
}

impl DecryptionWorkerPool {
    /// Start the worker threads and the dispatcher.
    ///
    /// Must be called inside a Tokio runtime when `config.enabled` is set.
    pub fn new(config: PoolConfig, decryptor: Arc<dyn BlockDecryptor>) -> Result<Self> {
        config
            .validate()
            .map_err(|msg| MediaError::Runtime(core_runtime::Error::Config(msg)))?;

        let gauges = Arc::new(PoolGauges::default());

        if !config.enabled {
            info!("Decrypt worker pool disabled, all batches run inline");
            return Ok(Self {
                config,
                decryptor,
                runtime: None,
                total_workers: 0,
                gauges,
                shut_down: AtomicBool::new(false),
            });
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            MediaError::Internal("decrypt worker pool must be started inside a Tokio runtime".into())
        })?;

        let worker_count = config.resolved_worker_count();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let mut senders = Vec::with_capacity(worker_count);
        let mut threads = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let (job_tx, job_rx) = job_channel::<ChunkJob>();
            let events = inbox_tx.clone();
            let decryptor = Arc::clone(&decryptor);
            let thread = thread::Builder::new()
                .name(format!("decrypt-worker-{}", worker))
                .spawn(move || worker_loop(worker, job_rx, events, decryptor))
                .map_err(|e| MediaError::Internal(format!("failed to spawn decrypt worker: {}", e)))?;
            senders.push(Some(job_tx));
            threads.push(thread);
        }

        gauges.idle.store(worker_count, Ordering::Relaxed);
        let dispatcher = Dispatcher {
            inbox: inbox_rx,
            workers: senders,
            idle: (0..worker_count).collect(),
            queue: VecDeque::new(),
            pending: HashMap::new(),
            gauges: Arc::clone(&gauges),
        };
        handle.spawn(dispatcher.run());

        info!(workers = worker_count, "Decrypt worker pool started");

        Ok(Self {
            config,
            decryptor,
            runtime: Some(PoolRuntime {
                inbox: inbox_tx,
                threads: Mutex::new(threads),
            }),
            total_workers: worker_count,
            gauges,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Pool with no threads, for hosts without background execution.
    pub fn sequential(decryptor: Arc<dyn BlockDecryptor>) -> Self {
        Self {
            config: PoolConfig::default().with_enabled(false),
            decryptor,
            runtime: None,
            total_workers: 0,
            gauges: Arc::new(PoolGauges::default()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_workers: self.total_workers,
            idle_workers: self.gauges.idle.load(Ordering::Relaxed),
            busy_workers: self.gauges.busy.load(Ordering::Relaxed),
            queued_tasks: self.gauges.queued.load(Ordering::Relaxed),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn parallel_inbox(&self, blocks: usize) -> Option<&mpsc::UnboundedSender<PoolMessage>> {
        if self.is_shut_down() || blocks <= self.config.sequential_threshold {
            return None;
        }
        if self.gauges.idle.load(Ordering::Relaxed) == 0 {
            return None;
        }
        self.runtime.as_ref().map(|runtime| &runtime.inbox)
    }

    /// Decrypt `blocks` with `key`, one result slot per block in input order.
    ///
    /// Never fails as a whole: per-block problems show up as `None` slots.
    #[instrument(skip(self, blocks, key, progress), fields(blocks = blocks.len()))]
    pub async fn decrypt(
        &self,
        blocks: Vec<EncryptedBlock>,
        key: &ContentKey,
        progress: Option<DecryptProgress>,
    ) -> DecryptBatch {
        let started = Instant::now();

        let Some(inbox) = self.parallel_inbox(blocks.len()) else {
            return self.decrypt_sequential(&blocks, key, progress.as_ref(), started);
        };

        let task_id = Uuid::new_v4();
        let total = blocks.len();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let task = BatchTask {
            task_id,
            blocks,
            key: key.clone(),
            progress,
            reply: reply_tx,
        };

        if let Err(mpsc::error::SendError(message)) = inbox.send(PoolMessage::Submit(task)) {
            // Dispatcher already stopped.
            if let PoolMessage::Submit(task) = message {
                return self.decrypt_sequential(
                    &task.blocks,
                    key,
                    task.progress.as_ref(),
                    started,
                );
            }
            return DecryptBatch::from_slots(ChunkSlots::empty(total), false, started);
        }

        match tokio::time::timeout(self.config.task_timeout, &mut reply_rx).await {
            Ok(Ok(slots)) => DecryptBatch::from_slots(slots, false, started),
            Ok(Err(_)) => DecryptBatch::from_slots(ChunkSlots::empty(total), false, started),
            Err(_) => {
                let (expire_tx, expire_rx) = oneshot::channel();
                let _ = inbox.send(PoolMessage::Expire {
                    task_id,
                    reply: expire_tx,
                });

                match expire_rx.await.ok().flatten() {
                    Some(slots) => DecryptBatch::from_slots(slots, true, started),
                    // Finished between the deadline and the purge.
                    None => match reply_rx.try_recv() {
                        Ok(slots) => DecryptBatch::from_slots(slots, false, started),
                        Err(_) => DecryptBatch::from_slots(ChunkSlots::empty(total), true, started),
                    },
                }
            }
        }
    }

    fn decrypt_sequential(
        &self,
        blocks: &[EncryptedBlock],
        key: &ContentKey,
        progress: Option<&DecryptProgress>,
        started: Instant,
    ) -> DecryptBatch {
        let total = blocks.len();
        let mut slots = ChunkSlots::empty(total);

        let mut progress = progress;
        for (index, block) in blocks.iter().enumerate() {
            slots.record(index, open_block(self.decryptor.as_ref(), block, key));
            if let Some(callback) = progress {
                if !notify(callback, index + 1, total) {
                    progress = None;
                }
            }
        }

        DecryptBatch::from_slots(slots, false, started)
    }

    /// Stop the dispatcher and join every worker thread.
    ///
    /// Later batches run inline. Calling this twice is a no-op.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(runtime) = &self.runtime else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if runtime.inbox.send(PoolMessage::Shutdown { ack: ack_tx }).is_ok() {
            let _ = ack_rx.await;
        }

        let threads: Vec<_> = runtime.threads.lock().drain(..).collect();
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await;
        if joined.is_err() {
            warn!("Failed to join decrypt worker threads");
        }

        info!("Decrypt worker pool shut down");
    }
}

impl Drop for DecryptionWorkerPool {
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = &self.runtime {
            let (ack_tx, _ack_rx) = oneshot::channel();
            let _ = runtime.inbox.send(PoolMessage::Shutdown { ack: ack_tx });
        }
    }
}
