use std::collections::{HashMap, HashSet};

use log::debug;
use snafu::ensure;

pub use crate::config::*;

/// The static candidate list, in the order it was registered.
///
/// The registration order is the tie-break order of the leaderboards.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CandidateRegistry {
    candidates: Vec<Candidate>,
    positions: HashMap<CandidateId, usize>,
}

impl CandidateRegistry {
    pub fn get(&self, id: &CandidateId) -> Option<&Candidate> {
        self.positions.get(id).map(|idx| &self.candidates[*idx])
    }

    /// Position in the original list, starting at 0.
    pub fn position(&self, id: &CandidateId) -> Option<usize> {
        self.positions.get(id).cloned()
    }

    pub fn contains(&self, id: &CandidateId) -> bool {
        self.positions.contains_key(id)
    }

    /// The candidates of a category, in list order.
    pub fn in_category(&self, category: Category) -> impl Iterator<Item = &Candidate> {
        self.candidates
            .iter()
            .filter(move |c| c.category == category)
    }

    pub fn excluded_ids(&self) -> HashSet<CandidateId> {
        self.candidates
            .iter()
            .filter(|c| c.excluded)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// A builder for the candidate registry.
///
/// ```
/// use live_tally::builder::Builder;
/// use live_tally::{Category, TallyErrors};
///
/// let registry = Builder::new()
///     .candidate("anna", "Anna", Category::Mayor, "Mayor")
///     .candidate("bob", "Bob", Category::Councillor, "Taupō Ward")
///     .build()?;
///
/// assert_eq!(registry.len(), 2);
///
/// # Ok::<(), TallyErrors>(())
/// ```
#[derive(Default)]
pub struct Builder {
    _candidates: Vec<Candidate>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            _candidates: Vec::new(),
        }
    }

    /// Appends a candidate at the end of the list.
    pub fn candidate(self, id: &str, name: &str, category: Category, ward: &str) -> Builder {
        self.add(Candidate {
            id: CandidateId::new(id),
            name: name.to_string(),
            category,
            ward: ward.to_string(),
            excluded: false,
        })
    }

    pub fn add(mut self, candidate: Candidate) -> Builder {
        self._candidates.push(candidate);
        self
    }

    /// Marks an already added candidate as withdrawn.
    pub fn excluded(mut self, id: &str) -> Builder {
        for c in self._candidates.iter_mut().filter(|c| c.id.0 == id) {
            c.excluded = true;
        }
        self
    }

    pub fn build(self) -> Result<CandidateRegistry, TallyErrors> {
        ensure!(!self._candidates.is_empty(), EmptyRegistrySnafu {});
        let mut positions: HashMap<CandidateId, usize> = HashMap::new();
        for (idx, c) in self._candidates.iter().enumerate() {
            ensure!(
                positions.insert(c.id.clone(), idx).is_none(),
                DuplicateCandidateSnafu {
                    candidate: c.id.clone()
                }
            );
        }
        debug!("build: {} candidates registered", positions.len());
        Ok(CandidateRegistry {
            candidates: self._candidates,
            positions,
        })
    }
}
