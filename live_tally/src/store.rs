use std::{
    collections::{HashMap, HashSet},
    ops::AddAssign,
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::{debug, trace};
use tokio::sync::broadcast;

use crate::config::*;

#[derive(Eq, PartialEq, Debug, Clone, Copy, PartialOrd, Ord, Hash, Default)]
pub(crate) struct VoteCount(pub(crate) u64);

impl VoteCount {
    pub(crate) const EMPTY: VoteCount = VoteCount(0);
    const ONE: VoteCount = VoteCount(1);
}

impl std::iter::Sum for VoteCount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        VoteCount(iter.map(|vc| vc.0).sum())
    }
}

impl AddAssign for VoteCount {
    fn add_assign(&mut self, rhs: VoteCount) {
        self.0 += rhs.0;
    }
}

#[derive(Default)]
struct Tally {
    seen: HashSet<EventId>,
    counts: HashMap<CandidateId, VoteCount>,
}

/// Owner of the per-candidate counts and of the identities of every applied
/// event.
///
/// Every mutation goes through [`AggregateStore::apply`]. An event is counted
/// at most once, whatever the number of times it is delivered, so the counts
/// only depend on the set of distinct event identifiers ever applied.
pub struct AggregateStore {
    tally: Mutex<Tally>,
    changes: broadcast::Sender<TallyChange>,
}

impl AggregateStore {
    pub fn new(change_capacity: usize) -> AggregateStore {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        AggregateStore {
            tally: Mutex::new(Tally::default()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tally> {
        // Identity and count are updated with no fallible call in between,
        // so a poisoned tally is still consistent.
        self.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies an event. Returns false if the event was already applied.
    pub fn apply(&self, event: &VoteEvent) -> bool {
        let change = {
            let mut tally = self.lock();
            if !tally.seen.insert(event.id.clone()) {
                trace!("apply: duplicate event {}", event.id);
                return false;
            }
            let count = tally
                .counts
                .entry(event.candidate.clone())
                .or_insert(VoteCount::EMPTY);
            *count += VoteCount::ONE;
            TallyChange {
                event_id: event.id.clone(),
                candidate: event.candidate.clone(),
                count: count.0,
            }
        };
        debug!(
            "apply: event {} -> {} now has {} votes",
            change.event_id, change.candidate, change.count
        );
        // No receiver is not an error: nobody is observing yet.
        let _ = self.changes.send(change);
        true
    }

    pub fn get(&self, candidate: &CandidateId) -> u64 {
        self.lock()
            .counts
            .get(candidate)
            .map(|vc| vc.0)
            .unwrap_or(0)
    }

    /// A consistent copy of all the counts.
    pub fn snapshot_all(&self) -> HashMap<CandidateId, u64> {
        self.lock()
            .counts
            .iter()
            .map(|(cid, vc)| (cid.clone(), vc.0))
            .collect()
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.lock().seen.contains(event_id)
    }

    /// Number of distinct events applied so far.
    pub fn applied_events(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn total(&self) -> u64 {
        let total: VoteCount = self.lock().counts.values().cloned().sum();
        total.0
    }

    /// Receives a [`TallyChange`] after every successful apply.
    pub fn subscribe(&self) -> broadcast::Receiver<TallyChange> {
        self.changes.subscribe()
    }
}
