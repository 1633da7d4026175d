use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use chrono::Utc;
use log::{debug, info, warn};

use crate::builder::CandidateRegistry;
use crate::config::*;

/// The query returning every vote row stored so far.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<SnapshotRow>, CollaboratorError>;
}

/// Fetches the full history of votes and turns it into events.
pub struct SnapshotLoader {
    source: Arc<dyn SnapshotSource>,
    registry: Arc<CandidateRegistry>,
    retry: RetrySettings,
}

impl SnapshotLoader {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        registry: Arc<CandidateRegistry>,
        retry: RetrySettings,
    ) -> SnapshotLoader {
        SnapshotLoader {
            source,
            registry,
            retry,
        }
    }

    /// Loads the snapshot, retrying transient failures with backoff until
    /// the attempt ceiling.
    pub async fn load(&self) -> TallyResult<Vec<VoteEvent>> {
        let mut delays = self.retry.backoff().build();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.source.fetch().await {
                Ok(rows) => {
                    info!("load: snapshot returned {} rows", rows.len());
                    return Ok(rows_to_events(&self.registry, rows));
                }
                Err(e) if e.is_transient() => match delays.next() {
                    Some(delay) => {
                        warn!(
                            "load: attempt {} failed ({}), retrying in {:?}",
                            attempts, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(TallyErrors::SnapshotExhausted {
                            attempts,
                            source: e,
                        });
                    }
                },
                Err(e) => {
                    return Err(TallyErrors::SnapshotExhausted {
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }
}

/// One event per row. Rows of unknown candidates are dropped: their
/// category cannot be inferred.
pub fn rows_to_events(registry: &CandidateRegistry, rows: Vec<SnapshotRow>) -> Vec<VoteEvent> {
    let loaded_at = Utc::now();
    let mut ordinals: HashMap<CandidateId, usize> = HashMap::new();
    let mut res: Vec<VoteEvent> = Vec::with_capacity(rows.len());
    for row in rows {
        let category = match registry.get(&row.candidate_id) {
            Some(c) => c.category,
            None => {
                warn!(
                    "rows_to_events: skipping row for unknown candidate {:?}",
                    row.candidate_id
                );
                continue;
            }
        };
        let id = match row.event_id {
            Some(id) => id,
            None => {
                let ordinal = ordinals.entry(row.candidate_id.clone()).or_insert(0);
                *ordinal += 1;
                EventId::synthesized(&row.candidate_id, *ordinal)
            }
        };
        res.push(VoteEvent {
            id,
            candidate: row.candidate_id,
            category,
            timestamp: row.created_at.unwrap_or(loaded_at),
        });
    }
    debug!("rows_to_events: {} events", res.len());
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Flaky {
        failures: Mutex<Vec<CollaboratorError>>,
        rows: Vec<SnapshotRow>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl SnapshotSource for Flaky {
        async fn fetch(&self) -> Result<Vec<SnapshotRow>, CollaboratorError> {
            *self.calls.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(self.rows.clone()),
            }
        }
    }

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn registry() -> Arc<CandidateRegistry> {
        Arc::new(
            Builder::new()
                .candidate("a", "A", Category::Mayor, "Mayor")
                .candidate("b", "B", Category::Councillor, "Taupō East Rural")
                .build()
                .unwrap(),
        )
    }

    fn row(candidate: &str, id: Option<&str>) -> SnapshotRow {
        SnapshotRow {
            candidate_id: CandidateId::new(candidate),
            event_id: id.map(EventId::new),
            created_at: None,
        }
    }

    fn unavailable() -> CollaboratorError {
        CollaboratorError::Unavailable {
            message: "timeout".to_string(),
        }
    }

    fn retry(max_attempts: u32) -> RetrySettings {
        RetrySettings {
            min_delay_ms: 100,
            max_delay_ms: 1_000,
            factor: 2.0,
            max_attempts,
            jitter: false,
        }
    }

    #[test]
    fn synthesized_ids_do_not_depend_on_row_order() {
        let r = registry();
        let forward = rows_to_events(
            &r,
            vec![
                row("a", None),
                row("b", None),
                row("a", None),
                row("b", Some("x")),
            ],
        );
        let backward = rows_to_events(
            &r,
            vec![
                row("b", Some("x")),
                row("a", None),
                row("b", None),
                row("a", None),
            ],
        );
        let mut f: Vec<EventId> = forward.iter().map(|e| e.id.clone()).collect();
        let mut b: Vec<EventId> = backward.iter().map(|e| e.id.clone()).collect();
        f.sort();
        b.sort();
        assert_eq!(f, b);
        assert!(f.contains(&EventId::new("snapshot:a-00000002")));
        assert!(f.contains(&EventId::new("x")));
    }

    #[test]
    fn category_comes_from_the_registry() {
        let events = rows_to_events(&registry(), vec![row("b", None), row("ghost", None)]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, Category::Councillor);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let source = Arc::new(Flaky {
            failures: Mutex::new(vec![unavailable(), unavailable()]),
            rows: vec![row("a", Some("1"))],
            calls: Mutex::new(0),
        });
        init_logs();
        let loader = SnapshotLoader::new(source.clone(), registry(), retry(5));
        let start = tokio::time::Instant::now();
        let events = loader.load().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(*source.calls.lock().unwrap(), 3);
        // 100ms then 200ms
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_ceiling() {
        let source = Arc::new(Flaky {
            failures: Mutex::new(vec![unavailable(); 10]),
            rows: vec![],
            calls: Mutex::new(0),
        });
        init_logs();
        let loader = SnapshotLoader::new(source.clone(), registry(), retry(3));
        let res = loader.load().await;
        assert!(matches!(
            res,
            Err(TallyErrors::SnapshotExhausted { attempts: 4, .. })
        ));
        assert_eq!(*source.calls.lock().unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let source = Arc::new(Flaky {
            failures: Mutex::new(vec![CollaboratorError::Rejected {
                message: "no such table".to_string(),
            }]),
            rows: vec![],
            calls: Mutex::new(0),
        });
        let loader = SnapshotLoader::new(source.clone(), registry(), retry(3));
        assert!(loader.load().await.is_err());
        assert_eq!(*source.calls.lock().unwrap(), 1);
    }
}
