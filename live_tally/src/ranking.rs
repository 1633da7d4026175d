use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use crate::builder::CandidateRegistry;
use crate::config::*;
use crate::store::AggregateStore;

/// Ranks the candidates of one category.
///
/// Candidates are taken in registry order and sorted by decreasing count
/// with a stable sort, so equal counts keep their registry order. Candidates
/// without votes are left out.
pub fn rank_counts(
    registry: &CandidateRegistry,
    counts: &HashMap<CandidateId, u64>,
    category: Category,
    excluded: &HashSet<CandidateId>,
    highlighted: Option<&CandidateId>,
) -> Vec<LeaderboardEntry> {
    let mut ranked: Vec<(&Candidate, u64)> = registry
        .in_category(category)
        .filter(|c| !excluded.contains(&c.id))
        .map(|c| (c, counts.get(&c.id).cloned().unwrap_or(0)))
        .filter(|(_, count)| *count > 0)
        .collect();
    ranked.sort_by(|(_, a), (_, b)| b.cmp(a));

    ranked
        .into_iter()
        .enumerate()
        .map(|(idx, (c, count))| LeaderboardEntry {
            position: idx + 1,
            candidate: c.id.clone(),
            name: c.name.clone(),
            count,
            marker: RankMarker::for_position(idx + 1),
            highlighted: highlighted == Some(&c.id),
        })
        .collect()
}

/// Derives leaderboards from the aggregate store on demand.
#[derive(Clone)]
pub struct RankingEngine {
    store: Arc<AggregateStore>,
    registry: Arc<CandidateRegistry>,
}

impl RankingEngine {
    pub fn new(store: Arc<AggregateStore>, registry: Arc<CandidateRegistry>) -> RankingEngine {
        RankingEngine { store, registry }
    }

    pub fn rank(
        &self,
        category: Category,
        excluded: &HashSet<CandidateId>,
    ) -> Vec<LeaderboardEntry> {
        self.rank_highlighting(category, excluded, None)
    }

    pub fn rank_highlighting(
        &self,
        category: Category,
        excluded: &HashSet<CandidateId>,
        highlighted: Option<&CandidateId>,
    ) -> Vec<LeaderboardEntry> {
        let counts = self.store.snapshot_all();
        let res = rank_counts(&self.registry, &counts, category, excluded, highlighted);
        debug!("rank: {}: {} ranked candidates", category, res.len());
        res
    }

    /// The leaderboard as displayed: withdrawn candidates are left out.
    pub fn leaderboard(
        &self,
        category: Category,
        highlighted: Option<&CandidateId>,
    ) -> Vec<LeaderboardEntry> {
        self.rank_highlighting(category, &self.registry.excluded_ids(), highlighted)
    }
}
