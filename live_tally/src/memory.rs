//! An in-memory vote store implementing the three collaborator interfaces.
//!
//! Used by the command line host and by the tests. Failures can be injected
//! on every interface.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::config::*;
use crate::gateway::VoteWriter;
use crate::snapshot::SnapshotSource;
use crate::subscriber::{LiveSource, LiveSubscription};

const LIVE_CAPACITY: usize = 1_024;

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MemoryBallotBox {
    rows: Mutex<Vec<SnapshotRow>>,
    live: broadcast::Sender<LiveNotification>,
    drops: watch::Sender<u64>,
    snapshot_gate: watch::Sender<bool>,
    failing_fetches: AtomicU32,
    failing_subscribes: AtomicU32,
    failing_writes: AtomicBool,
    open_subscriptions: Arc<AtomicUsize>,
}

impl Default for MemoryBallotBox {
    fn default() -> Self {
        MemoryBallotBox::new(vec![])
    }
}

impl MemoryBallotBox {
    /// A ballot box already holding `rows`.
    pub fn new(rows: Vec<SnapshotRow>) -> MemoryBallotBox {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        let (drops, _) = watch::channel(0);
        let (snapshot_gate, _) = watch::channel(true);
        MemoryBallotBox {
            rows: Mutex::new(rows),
            live,
            drops,
            snapshot_gate,
            failing_fetches: AtomicU32::new(0),
            failing_subscribes: AtomicU32::new(0),
            failing_writes: AtomicBool::new(false),
            open_subscriptions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stores a vote and notifies the subscribers, as a vote cast by another
    /// client would.
    pub fn insert(&self, candidate_id: CandidateId, category: Category) -> PersistedVote {
        let row = PersistedVote {
            event_id: EventId::new(Uuid::new_v4().to_string()),
            candidate_id,
            category,
            created_at: Utc::now(),
        };
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SnapshotRow {
                candidate_id: row.candidate_id.clone(),
                event_id: Some(row.event_id.clone()),
                created_at: Some(row.created_at),
            });
        let _ = self.live.send(LiveNotification {
            candidate_id: row.candidate_id.clone(),
            category: row.category,
            event_id: row.event_id.clone(),
            timestamp: row.created_at,
        });
        debug!("insert: stored {} for {}", row.event_id, row.candidate_id);
        row
    }

    /// Pushes a notification without storing anything, e.g. a redelivery.
    pub fn push(&self, notification: LiveNotification) {
        let _ = self.live.send(notification);
    }

    pub fn len(&self) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_subscribes(&self, n: u32) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// Drops every open subscription, as a transport disconnect would.
    pub fn drop_subscriptions(&self) {
        self.drops.send_modify(|n| *n += 1);
    }

    /// Snapshot queries wait until [`MemoryBallotBox::release_snapshots`].
    pub fn hold_snapshots(&self) {
        self.snapshot_gate.send_replace(false);
    }

    pub fn release_snapshots(&self) {
        self.snapshot_gate.send_replace(true);
    }

    pub fn open_subscriptions(&self) -> usize {
        self.open_subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for MemoryBallotBox {
    async fn fetch(&self) -> Result<Vec<SnapshotRow>, CollaboratorError> {
        let mut gate = self.snapshot_gate.subscribe();
        // The sender lives as long as self.
        let _ = gate.wait_for(|open| *open).await;
        if take_one(&self.failing_fetches) {
            return Err(CollaboratorError::Unavailable {
                message: "snapshot query timed out".to_string(),
            });
        }
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[async_trait]
impl VoteWriter for MemoryBallotBox {
    async fn cast(&self, vote: CastVote) -> Result<PersistedVote, CollaboratorError> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable {
                message: "insert failed".to_string(),
            });
        }
        Ok(self.insert(vote.candidate_id, vote.category))
    }
}

#[async_trait]
impl LiveSource for MemoryBallotBox {
    async fn subscribe(&self) -> Result<Box<dyn LiveSubscription>, CollaboratorError> {
        if take_one(&self.failing_subscribes) {
            return Err(CollaboratorError::Unavailable {
                message: "realtime channel refused".to_string(),
            });
        }
        self.open_subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription {
            events: self.live.subscribe(),
            drops: self.drops.subscribe(),
            open: Some(self.open_subscriptions.clone()),
        }))
    }
}

struct MemorySubscription {
    events: broadcast::Receiver<LiveNotification>,
    drops: watch::Receiver<u64>,
    open: Option<Arc<AtomicUsize>>,
}

#[async_trait]
impl LiveSubscription for MemorySubscription {
    async fn next(&mut self) -> Option<LiveNotification> {
        tokio::select! {
            _ = self.drops.changed() => None,
            received = self.events.recv() => match received {
                Ok(n) => Some(n),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The subscriber reconnects and reloads the baseline.
                    warn!("next: lagging behind by {} notifications", skipped);
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        }
    }

    async fn unsubscribe(&mut self) {
        if let Some(open) = self.open.take() {
            open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
