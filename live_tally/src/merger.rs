use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::*;
use crate::store::AggregateStore;

#[derive(Debug)]
enum Phase {
    /// The first snapshot is outstanding. Live events wait here in arrival order.
    AwaitingSnapshot {
        buffered: Vec<VoteEvent>,
    },
    Live,
}

/// What a batch of events did to the store.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub struct MergeReport {
    pub applied: usize,
    pub duplicates: usize,
}

impl MergeReport {
    fn record(&mut self, applied: bool) {
        if applied {
            self.applied += 1;
        } else {
            self.duplicates += 1;
        }
    }

    fn extend(&mut self, other: MergeReport) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
    }
}

/// Orders snapshot and live events so that neither source double counts or
/// loses a vote, whatever the order in which they arrive.
///
/// Until the first snapshot resolves, live events are held back. The
/// snapshot is then applied, followed by the held events in arrival order.
/// From then on live events go straight to the store. Later snapshots (after
/// a reconnection) are applied directly as well and rely on deduplication.
pub struct ReconciliationMerger {
    store: Arc<AggregateStore>,
    phase: Phase,
    degraded: bool,
}

impl ReconciliationMerger {
    pub fn new(store: Arc<AggregateStore>) -> ReconciliationMerger {
        ReconciliationMerger {
            store,
            phase: Phase::AwaitingSnapshot {
                buffered: Vec::new(),
            },
            degraded: false,
        }
    }

    /// True until a snapshot resolved or failed for good.
    pub fn is_awaiting_snapshot(&self) -> bool {
        matches!(self.phase, Phase::AwaitingSnapshot { .. })
    }

    pub fn buffered(&self) -> usize {
        match &self.phase {
            Phase::AwaitingSnapshot { buffered } => buffered.len(),
            Phase::Live => 0,
        }
    }

    /// True when the first snapshot failed and the counts only reflect live events.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn on_live(&mut self, event: VoteEvent) -> MergeReport {
        let mut report = MergeReport::default();
        match &mut self.phase {
            Phase::AwaitingSnapshot { buffered } => {
                debug!(
                    "on_live: buffering {} until the snapshot resolves",
                    event.id
                );
                buffered.push(event);
            }
            Phase::Live => report.record(self.store.apply(&event)),
        }
        report
    }

    pub fn on_snapshot(&mut self, events: Vec<VoteEvent>) -> MergeReport {
        let mut report = self.apply_all(&events);
        if self.degraded {
            info!("on_snapshot: baseline recovered");
            self.degraded = false;
        }
        report.extend(self.release());
        info!(
            "on_snapshot: {} events in snapshot, {} applied, {} duplicates",
            events.len(),
            report.applied,
            report.duplicates
        );
        report
    }

    /// The snapshot gave up. Held live events are applied and the merger
    /// runs on live events only until a later snapshot succeeds.
    ///
    /// This also applies to a reload after a reconnection: votes stored while
    /// the subscription was down are then missing from the counts.
    pub fn on_snapshot_failed(&mut self) -> MergeReport {
        warn!(
            "on_snapshot_failed: continuing with live events only ({} buffered)",
            self.buffered()
        );
        self.degraded = true;
        self.release()
    }

    fn release(&mut self) -> MergeReport {
        match std::mem::replace(&mut self.phase, Phase::Live) {
            Phase::AwaitingSnapshot { buffered } => self.apply_all(&buffered),
            Phase::Live => MergeReport::default(),
        }
    }

    fn apply_all(&self, events: &[VoteEvent]) -> MergeReport {
        let mut report = MergeReport::default();
        for e in events.iter() {
            report.record(self.store.apply(e));
        }
        report
    }
}
