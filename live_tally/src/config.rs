// ********* Input data structures ***********

use std::fmt::Display;
use std::time::Duration;

use backon::ExponentialBuilder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// The race a candidate stands in.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Mayor,
    Councillor,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Mayor, Category::Councillor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Mayor => "mayor",
            Category::Councillor => "councillor",
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mayor" => Ok(Category::Mayor),
            "councillor" => Ok(Category::Councillor),
            x => Err(format!("unknown category {:?}", x)),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub String);

impl CandidateId {
    pub fn new(id: impl Into<String>) -> CandidateId {
        CandidateId(id.into())
    }
}

impl Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a single cast vote. Two events with the same identifier are
/// the same vote, however they were delivered.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(id: impl Into<String>) -> EventId {
        EventId(id.into())
    }

    /// Identifier for a snapshot row that came without one.
    ///
    /// `ordinal` is the 1-based occurrence of the candidate among the
    /// snapshot rows without an identifier, so the same row set always
    /// yields the same identifiers.
    pub fn synthesized(candidate: &CandidateId, ordinal: usize) -> EventId {
        EventId(format!("snapshot:{}-{:08}", candidate, ordinal))
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static reference data for a candidate.
///
/// Only the identifier, the category and the position in the registry
/// matter to the tally; the rest is carried for display.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub name: String,
    pub category: Category,
    pub ward: String,
    /// Withdrawn candidates stay in the registry but are not ranked and
    /// cannot receive new votes.
    pub excluded: bool,
}

/// One immutable record of a cast vote.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Serialize, Deserialize)]
pub struct VoteEvent {
    pub id: EventId,
    pub candidate: CandidateId,
    pub category: Category,
    pub timestamp: DateTime<Utc>,
}

/// A row returned by the snapshot query. Only the candidate is mandatory.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub candidate_id: CandidateId,
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Payload pushed by the live notification collaborator for every inserted vote.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct LiveNotification {
    pub candidate_id: CandidateId,
    pub category: Category,
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
}

/// The request handed to the persistence collaborator.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CastVote {
    pub candidate_id: CandidateId,
    pub category: Category,
}

/// The row created by the persistence collaborator.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct PersistedVote {
    pub event_id: EventId,
    pub candidate_id: CandidateId,
    pub category: Category,
    pub created_at: DateTime<Utc>,
}

// ******** Output data structures *********

/// Annotation for the top three places of a leaderboard.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RankMarker {
    Crown,
    Silver,
    Bronze,
}

impl RankMarker {
    pub fn for_position(position: usize) -> Option<RankMarker> {
        match position {
            1 => Some(RankMarker::Crown),
            2 => Some(RankMarker::Silver),
            3 => Some(RankMarker::Bronze),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            RankMarker::Crown => "👑",
            RankMarker::Silver => "🥈",
            RankMarker::Bronze => "🥉",
        }
    }
}

/// One row of a leaderboard. Recomputed on every read.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based place in the leaderboard.
    pub position: usize,
    pub candidate: CandidateId,
    pub name: String,
    pub count: u64,
    pub marker: Option<RankMarker>,
    /// Set when this candidate received the latest local submission.
    pub highlighted: bool,
}

/// Published by the aggregate store after each newly applied event.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct TallyChange {
    pub event_id: EventId,
    pub candidate: CandidateId,
    /// The count of the candidate after the event was applied.
    pub count: u64,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum NoticeKind {
    Saved,
    Failed,
}

/// A transient, user-facing message about a submission outcome.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

/// How far the engine got in establishing its baseline.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum SyncStatus {
    /// The snapshot has not resolved yet; live events are being buffered.
    Pending,
    /// The snapshot was applied.
    Synced,
    /// The snapshot could not be loaded; counts only reflect live events
    /// observed since startup.
    Degraded,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum SubscriptionState {
    Connecting,
    Open,
    /// Reconnection gave up.
    Lost,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineStatus {
    pub sync: SyncStatus,
    pub subscription: SubscriptionState,
}

impl EngineStatus {
    pub const STARTING: EngineStatus = EngineStatus {
        sync: SyncStatus::Pending,
        subscription: SubscriptionState::Connecting,
    };

    /// The baseline is settled and the subscription is no longer connecting.
    pub fn is_settled(&self) -> bool {
        self.sync != SyncStatus::Pending && self.subscription != SubscriptionState::Connecting
    }
}

// ********* Errors **********

/// Failure reported by one of the external collaborators.
#[derive(Eq, PartialEq, Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum CollaboratorError {
    #[snafu(display("collaborator unavailable: {message}"))]
    Unavailable { message: String },
    #[snafu(display("collaborator rejected the request: {message}"))]
    Rejected { message: String },
}

impl CollaboratorError {
    /// Transient failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Unavailable { .. })
    }
}

/// Why a submission was refused before reaching persistence.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum InvalidVote {
    UnknownCandidate,
    WrongCategory { expected: Category },
    Withdrawn,
}

impl Display for InvalidVote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidVote::UnknownCandidate => write!(f, "unknown candidate"),
            InvalidVote::WrongCategory { expected } => {
                write!(f, "candidate stands for {}", expected)
            }
            InvalidVote::Withdrawn => write!(f, "candidate has withdrawn"),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TallyErrors {
    #[snafu(display("Invalid vote for {candidate} ({category}): {reason}"))]
    Validation {
        candidate: CandidateId,
        category: Category,
        reason: InvalidVote,
    },
    #[snafu(display("Could not reach the vote store"))]
    Network { source: CollaboratorError },
    #[snafu(display("Snapshot failed after {attempts} attempts"))]
    SnapshotExhausted {
        attempts: u32,
        source: CollaboratorError,
    },
    #[snafu(display("Candidate {candidate} is registered twice"))]
    DuplicateCandidate { candidate: CandidateId },
    #[snafu(display("No candidates registered"))]
    EmptyRegistry {},
    #[snafu(display("The tally engine has stopped"))]
    EngineStopped {},
}

impl TallyErrors {
    pub fn is_validation(&self) -> bool {
        matches!(self, TallyErrors::Validation { .. })
    }

    pub fn is_network(&self) -> bool {
        matches!(self, TallyErrors::Network { .. })
    }
}

pub type TallyResult<T> = Result<T, TallyErrors>;

// ********* Configuration **********

/// Bounded exponential backoff.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
    /// Retries after the first attempt. Zero disables retrying.
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            min_delay_ms: 200,
            max_delay_ms: 10_000,
            factor: 2.0,
            max_attempts: 5,
            jitter: false,
        }
    }
}

impl RetrySettings {
    /// The backoff schedule. Its iterator is exhausted once the attempt
    /// ceiling is reached.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_factor(self.factor)
            .with_max_times(self.max_attempts as usize);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub snapshot_retry: RetrySettings,
    pub reconnect_retry: RetrySettings,
    /// How long a submission notice stays visible.
    pub notice_ttl_ms: u64,
    /// Capacity of the change notification channel.
    pub change_capacity: usize,
    /// Capacity of the reconciliation input queue.
    pub input_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            snapshot_retry: RetrySettings::default(),
            reconnect_retry: RetrySettings::default(),
            notice_ttl_ms: 2_000,
            change_capacity: 256,
            input_capacity: 1_024,
        }
    }
}

impl EngineSettings {
    pub fn notice_ttl(&self) -> Duration {
        Duration::from_millis(self.notice_ttl_ms)
    }
}
