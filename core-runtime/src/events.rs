//! # Event Bus System
//!
//! Broadcasts engine activity to any number of observers using
//! `tokio::sync::broadcast`. The display layer listens for load progress and
//! failures; diagnostics tooling listens for memory pressure and cache churn.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     emit      ┌───────────┐
//! │ MediaEngine  ├──────────────>│           │
//! └──────────────┘               │           │     subscribe    ┌────────────┐
//! ┌──────────────┐     emit      │ EventBus  ├─────────────────>│ Subscriber │
//! │MemoryManager ├──────────────>│ (broadcast│                  └────────────┘
//! └──────────────┘               │  channel) │     subscribe    ┌────────────┐
//! ┌──────────────┐     emit      │           ├─────────────────>│ Subscriber │
//! │PersistentCache──────────────>│           │                  └────────────┘
//! └──────────────┘               └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, MediaEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Media(MediaEvent::LoadAborted {
//!         asset_id: "a-1".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Asset load aborted");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber was too slow and missed `n`
//!   events. Non-fatal; keep receiving.
//! - **`RecvError::Closed`**: every sender has been dropped. Treat as shutdown.
//!
//! Emitting with no subscribers returns an error that publishers ignore with
//! `.ok()`; events are advisory and nothing in the engine depends on delivery.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that fall further behind than this receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Media loading and caching events
    Media(MediaEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Media(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Media(e) => e.severity(),
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Media Events
// ============================================================================

/// Events emitted while loading, holding, and caching decrypted media.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum MediaEvent {
    /// A load missed the persistent cache and began assembling.
    LoadStarted {
        asset_id: String,
        /// Assembly strategy name (`streaming`, `chunked`, `legacy`).
        strategy: String,
    },
    /// Another part of the asset was fetched and decrypted.
    LoadProgress {
        asset_id: String,
        parts_processed: usize,
        total_parts: usize,
    },
    /// The asset is registered in memory and a handle was returned.
    LoadCompleted {
        asset_id: String,
        /// Decrypted size in bytes.
        bytes: u64,
        /// The result is missing trailing parts.
        partial: bool,
        /// Served from the persistent cache without touching the network.
        from_cache: bool,
    },
    /// The load failed.
    LoadFailed {
        asset_id: String,
        message: String,
        /// Whether showing a retry affordance makes sense.
        retryable: bool,
    },
    /// The load was cancelled or superseded by a newer load.
    LoadAborted { asset_id: String },
    /// Sampled memory usage crossed the pressure threshold.
    MemoryPressure {
        used_bytes: u64,
        limit_bytes: u64,
        usage_ratio: f64,
    },
    /// An eviction pass freed less than half of what it needed.
    MemoryCritical {
        needed_bytes: u64,
        freed_bytes: u64,
        used_bytes: u64,
    },
    /// Persistent cache entries were evicted to stay under its size bound.
    CacheEvicted { removed: usize, freed_bytes: u64 },
    /// Expired persistent cache entries were swept.
    CacheSwept { removed: usize },
}

impl MediaEvent {
    fn description(&self) -> &str {
        match self {
            MediaEvent::LoadStarted { .. } => "Asset load started",
            MediaEvent::LoadProgress { .. } => "Asset load progress",
            MediaEvent::LoadCompleted { .. } => "Asset load completed",
            MediaEvent::LoadFailed { .. } => "Asset load failed",
            MediaEvent::LoadAborted { .. } => "Asset load aborted",
            MediaEvent::MemoryPressure { .. } => "Memory pressure detected",
            MediaEvent::MemoryCritical { .. } => "Memory critically low",
            MediaEvent::CacheEvicted { .. } => "Persistent cache entries evicted",
            MediaEvent::CacheSwept { .. } => "Expired cache entries swept",
        }
    }

    fn severity(&self) -> EventSeverity {
        match self {
            MediaEvent::LoadFailed { .. } | MediaEvent::MemoryCritical { .. } => {
                EventSeverity::Error
            }
            MediaEvent::MemoryPressure { .. } => EventSeverity::Warning,
            MediaEvent::LoadCompleted { partial: true, .. } => EventSeverity::Warning,
            MediaEvent::LoadCompleted { .. } | MediaEvent::CacheEvicted { .. } => {
                EventSeverity::Info
            }
            _ => EventSeverity::Debug,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Cloning the bus clones the sender, so every component can hold its own
/// copy. Each `subscribe()` creates an independent receiver.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Shorthand for emitting a [`MediaEvent`] and ignoring delivery.
    pub fn emit_media(&self, event: MediaEvent) {
        self.emit(CoreEvent::Media(event)).ok();
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{EventBus, EventSeverity, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let problems = EventStream::new(event_bus.subscribe())
///     .filter(|event| event.severity() >= EventSeverity::Warning);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            match &self.filter {
                Some(filter) if !filter(&event) => continue,
                _ => return Ok(event),
            }
        }
    }

    /// Non-blocking receive. `None` means nothing matching is queued.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
