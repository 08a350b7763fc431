use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::oneshot;

use crate::domain::snapshot::CacheKey;

use super::types::{RenderFailure, RenderOutcome};

type Waiters = Vec<oneshot::Sender<RenderOutcome>>;

/// Tracks cache keys that currently have a render running.
///
/// The first caller to [`claim`](InFlightRenders::claim) a key becomes the
/// leader and receives a [`RenderLease`]; everyone arriving while the lease is
/// held is parked on a channel and receives the leader's outcome verbatim.
#[derive(Default, Clone)]
pub struct InFlightRenders {
    keys: Arc<DashMap<CacheKey, Waiters>>,
}

/// Result of claiming a key.
pub enum Claim {
    /// No render was running; the caller must render and complete the lease.
    Leader(RenderLease),
    /// A render is already running; await the shared outcome.
    Follower(oneshot::Receiver<RenderOutcome>),
}

impl InFlightRenders {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(DashMap::new()),
        }
    }

    pub fn claim(&self, key: &CacheKey) -> Claim {
        match self.keys.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Vec::new());
                Claim::Leader(RenderLease {
                    key: key.clone(),
                    keys: Arc::clone(&self.keys),
                    completed: false,
                })
            }
            Entry::Occupied(mut occupied) => {
                let (tx, rx) = oneshot::channel();
                occupied.get_mut().push(tx);
                Claim::Follower(rx)
            }
        }
    }

    /// Number of keys with a render in flight.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Exclusive right to render one key. Dropping it without calling
/// [`complete`](RenderLease::complete) releases the key and tells every
/// follower the render was aborted.
pub struct RenderLease {
    key: CacheKey,
    keys: Arc<DashMap<CacheKey, Waiters>>,
    completed: bool,
}

impl RenderLease {
    /// Release the key and hand `outcome` to every follower.
    pub fn complete(mut self, outcome: &RenderOutcome) {
        self.completed = true;
        self.release(outcome);
    }

    // The entry is removed before notifying so a request arriving after this
    // point starts a fresh claim instead of joining a finished render.
    fn release(&self, outcome: &RenderOutcome) {
        if let Some((_key, waiters)) = self.keys.remove(&self.key) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}

impl Drop for RenderLease {
    fn drop(&mut self) {
        if !self.completed {
            self.release(&Err(RenderFailure::Aborted(
                "render task ended without a result".to_string(),
            )));
        }
    }
}

/// Await a follower's channel, mapping a vanished leader to an abort.
pub async fn await_outcome(receiver: oneshot::Receiver<RenderOutcome>) -> RenderOutcome {
    receiver.await.unwrap_or_else(|_| {
        Err(RenderFailure::Aborted(
            "render leader dropped its result channel".to_string(),
        ))
    })
}
