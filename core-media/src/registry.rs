//! # Load Registry
//!
//! Tracks the live generation of every asset key being loaded. Starting a
//! new load for a key cancels the one before it, and callbacks from the
//! superseded run are recognised as stale and dropped.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::assembler::AbortCheck;

/// Proof of one registered load.
#[derive(Debug, Clone)]
pub struct LoadTicket {
    key: String,
    generation: u64,
    token: CancellationToken,
}

impl LoadTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancelled by the caller's token or by a newer load of the same key.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl AbortCheck for LoadTicket {
    fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct LiveLoad {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
pub struct LoadRegistry {
    live: Mutex<HashMap<String, LiveLoad>>,
    generations: AtomicU64,
}

impl LoadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a load of `key`, cancelling any load of it still running.
    ///
    /// The ticket's token is a child of `caller`, so cancelling the caller's
    /// token aborts this load too.
    pub fn begin(&self, key: impl Into<String>, caller: &CancellationToken) -> LoadTicket {
        let key = key.into();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let token = caller.child_token();

        let previous = self.live.lock().insert(
            key.clone(),
            LiveLoad {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(
                key = %key,
                superseded = previous.generation,
                generation,
                "Superseding pending load"
            );
            previous.token.cancel();
        }

        LoadTicket {
            key,
            generation,
            token,
        }
    }

    /// Whether `ticket` is still the newest load of its key.
    pub fn is_current(&self, ticket: &LoadTicket) -> bool {
        self.live
            .lock()
            .get(&ticket.key)
            .is_some_and(|live| live.generation == ticket.generation)
    }

    /// Retire `ticket`. A newer load of the same key is left alone.
    pub fn finish(&self, ticket: &LoadTicket) {
        let mut live = self.live.lock();
        if live
            .get(&ticket.key)
            .is_some_and(|l| l.generation == ticket.generation)
        {
            live.remove(&ticket.key);
        }
    }

    pub fn active_loads(&self) -> usize {
        self.live.lock().len()
    }
}
