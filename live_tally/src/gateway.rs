use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::builder::CandidateRegistry;
use crate::config::*;

/// The persistence collaborator storing cast votes.
#[async_trait]
pub trait VoteWriter: Send + Sync {
    async fn cast(&self, vote: CastVote) -> Result<PersistedVote, CollaboratorError>;
}

pub const SAVED_TEXT: &str = "Vote saved!";
pub const FAILED_TEXT: &str = "Error saving vote";

/// Holds the current notice and clears it once its display time is over.
/// A newer notice replaces the current one and restarts the timer.
pub struct NoticeBoard {
    current: Arc<watch::Sender<Option<Notice>>>,
    generation: Arc<AtomicU64>,
    ttl: Duration,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl NoticeBoard {
    pub fn new(ttl: Duration) -> NoticeBoard {
        let (current, _) = watch::channel(None);
        NoticeBoard {
            current: Arc::new(current),
            generation: Arc::new(AtomicU64::new(0)),
            ttl,
            expiry: Mutex::new(None),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn post(&self, notice: Notice) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("post: {:?} (generation {})", notice, generation);
        self.current.send_replace(Some(notice));

        let current = self.current.clone();
        let latest = self.generation.clone();
        let ttl = self.ttl;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            current.send_if_modified(|n| {
                if latest.load(Ordering::SeqCst) == generation && n.is_some() {
                    *n = None;
                    true
                } else {
                    false
                }
            });
        });
        let previous = self
            .expiry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn current(&self) -> Option<Notice> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Notice>> {
        self.current.subscribe()
    }

    /// Stops the pending expiry timer, if any.
    pub fn cancel(&self) {
        let pending = self
            .expiry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            pending.abort();
        }
    }
}

/// Accepts cast-vote requests and hands them to persistence.
///
/// The gateway never touches the counts: the stored vote comes back through
/// the live subscription and is counted there, exactly once.
pub struct VoteGateway {
    registry: Arc<CandidateRegistry>,
    writer: Arc<dyn VoteWriter>,
    last_voted: watch::Sender<Option<CandidateId>>,
    notices: NoticeBoard,
}

impl VoteGateway {
    pub fn new(
        registry: Arc<CandidateRegistry>,
        writer: Arc<dyn VoteWriter>,
        notice_ttl: Duration,
    ) -> VoteGateway {
        let (last_voted, _) = watch::channel(None);
        VoteGateway {
            registry,
            writer,
            last_voted,
            notices: NoticeBoard::new(notice_ttl),
        }
    }

    fn validate(&self, candidate: &CandidateId, category: Category) -> TallyResult<()> {
        let reason = match self.registry.get(candidate) {
            None => InvalidVote::UnknownCandidate,
            Some(c) if c.category != category => InvalidVote::WrongCategory {
                expected: c.category,
            },
            Some(c) if c.excluded => InvalidVote::Withdrawn,
            Some(_) => return Ok(()),
        };
        ValidationSnafu {
            candidate: candidate.clone(),
            category,
            reason,
        }
        .fail()
    }

    /// Casts one vote. Returns the identifier of the stored vote.
    ///
    /// Failures are reported as they are and never retried here.
    pub async fn submit(
        &self,
        candidate: &CandidateId,
        category: Category,
    ) -> TallyResult<EventId> {
        self.validate(candidate, category)?;
        let request = CastVote {
            candidate_id: candidate.clone(),
            category,
        };
        match self.writer.cast(request).await {
            Ok(row) => {
                info!("submit: vote {} stored for {}", row.event_id, candidate);
                self.last_voted.send_replace(Some(candidate.clone()));
                self.notices.post(Notice {
                    kind: NoticeKind::Saved,
                    text: SAVED_TEXT.to_string(),
                });
                Ok(row.event_id)
            }
            Err(e) => {
                error!("submit: could not store vote for {}: {}", candidate, e);
                self.notices.post(Notice {
                    kind: NoticeKind::Failed,
                    text: FAILED_TEXT.to_string(),
                });
                Err(TallyErrors::Network { source: e })
            }
        }
    }

    pub fn last_voted(&self) -> Option<CandidateId> {
        self.last_voted.borrow().clone()
    }

    pub fn watch_last_voted(&self) -> watch::Receiver<Option<CandidateId>> {
        self.last_voted.subscribe()
    }

    pub fn notices(&self) -> &NoticeBoard {
        &self.notices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        calls: AtomicU64,
        failing: AtomicBool,
    }

    #[async_trait]
    impl VoteWriter for Recorder {
        async fn cast(&self, vote: CastVote) -> Result<PersistedVote, CollaboratorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.load(Ordering::SeqCst) {
                return Err(CollaboratorError::Unavailable {
                    message: "connection reset".to_string(),
                });
            }
            Ok(PersistedVote {
                event_id: EventId::new(format!("row-{}", n)),
                candidate_id: vote.candidate_id,
                category: vote.category,
                created_at: Utc::now(),
            })
        }
    }

    fn gateway() -> (Arc<Recorder>, VoteGateway) {
        let registry = Arc::new(
            Builder::new()
                .candidate("m", "M", Category::Mayor, "Mayor")
                .candidate("c", "C", Category::Councillor, "Mangakino-Pouakani")
                .candidate("gone", "Gone", Category::Councillor, "Taupō Ward")
                .excluded("gone")
                .build()
                .unwrap(),
        );
        let writer = Arc::new(Recorder::default());
        let gw = VoteGateway::new(registry, writer.clone(), Duration::from_secs(2));
        (writer, gw)
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_votes_have_no_side_effect() {
        let (writer, gw) = gateway();
        for (id, category) in [
            ("unknown-id", Category::Mayor),
            ("m", Category::Councillor),
            ("gone", Category::Councillor),
        ] {
            let err = gw
                .submit(&CandidateId::new(id), category)
                .await
                .unwrap_err();
            assert!(err.is_validation(), "{}", err);
        }
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(gw.last_voted(), None);
        assert_eq!(gw.notices().current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn success_marks_last_voted_and_expires_the_notice() {
        let (_, gw) = gateway();
        let id = gw
            .submit(&CandidateId::new("c"), Category::Councillor)
            .await
            .unwrap();
        assert_eq!(id, EventId::new("row-1"));
        assert_eq!(gw.last_voted(), Some(CandidateId::new("c")));
        assert_eq!(gw.notices().current().unwrap().kind, NoticeKind::Saved);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(gw.notices().current().is_some());
        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(gw.notices().current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_reported_without_retry() {
        let (writer, gw) = gateway();
        gw.submit(&CandidateId::new("m"), Category::Mayor)
            .await
            .unwrap();
        writer.failing.store(true, Ordering::SeqCst);
        let err = gw
            .submit(&CandidateId::new("c"), Category::Councillor)
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(writer.calls.load(Ordering::SeqCst), 2);
        // The marker keeps pointing at the last successful vote.
        assert_eq!(gw.last_voted(), Some(CandidateId::new("m")));
        let notice = gw.notices().current().unwrap();
        assert_eq!(notice.kind, NoticeKind::Failed);
        assert_eq!(notice.text, FAILED_TEXT);
    }

    #[tokio::test(start_paused = true)]
    async fn a_newer_notice_restarts_the_timer() {
        let board = NoticeBoard::new(Duration::from_secs(2));
        board.post(Notice {
            kind: NoticeKind::Saved,
            text: SAVED_TEXT.to_string(),
        });
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        board.post(Notice {
            kind: NoticeKind::Failed,
            text: FAILED_TEXT.to_string(),
        });
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        tokio::task::yield_now().await;
        assert_eq!(board.current().unwrap().kind, NoticeKind::Failed);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;
        assert_eq!(board.current(), None);
    }
}
