use std::sync::Arc;

use async_trait::async_trait;
use backon::BackoffBuilder;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::builder::CandidateRegistry;
use crate::config::*;

/// The push channel announcing every inserted vote row.
#[async_trait]
pub trait LiveSource: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn LiveSubscription>, CollaboratorError>;
}

/// One open subscription.
#[async_trait]
pub trait LiveSubscription: Send {
    /// The next notification, or `None` once the transport dropped.
    async fn next(&mut self) -> Option<LiveNotification>;

    /// Releases the subscription on the collaborator side.
    async fn unsubscribe(&mut self);
}

/// What the subscriber reports to the reconciliation loop.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum LiveSignal {
    /// The subscription was opened for the first time.
    Connected,
    Event(VoteEvent),
    /// The subscription dropped and was opened again. Events may have been
    /// missed in between, so the baseline must be loaded again.
    Reconnected,
    /// The subscription could not be opened again.
    Lost {
        attempts: u32,
    },
}

enum Connection {
    Open(Box<dyn LiveSubscription>),
    Stopped,
    Lost(u32),
}

/// Keeps one logical subscription open and forwards its events.
pub struct LiveSubscriber {
    source: Arc<dyn LiveSource>,
    registry: Arc<CandidateRegistry>,
    retry: RetrySettings,
}

impl LiveSubscriber {
    pub fn new(
        source: Arc<dyn LiveSource>,
        registry: Arc<CandidateRegistry>,
        retry: RetrySettings,
    ) -> LiveSubscriber {
        LiveSubscriber {
            source,
            registry,
            retry,
        }
    }

    /// Runs until `shutdown` flips, the receiving side goes away, or the
    /// subscription is lost for good. The subscription is always released
    /// before returning.
    pub async fn run<T>(self, tx: mpsc::Sender<T>, mut shutdown: watch::Receiver<bool>)
    where
        T: From<LiveSignal> + Send,
    {
        let mut reconnecting = false;
        loop {
            let mut subscription = match self.connect(&mut shutdown).await {
                Connection::Open(s) => s,
                Connection::Stopped => return,
                Connection::Lost(attempts) => {
                    let _ = tx.send(LiveSignal::Lost { attempts }.into()).await;
                    return;
                }
            };
            let opened = if reconnecting {
                LiveSignal::Reconnected
            } else {
                LiveSignal::Connected
            };
            if tx.send(opened.into()).await.is_err() {
                subscription.unsubscribe().await;
                return;
            }

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("run: shutting down, unsubscribing");
                        subscription.unsubscribe().await;
                        return;
                    }
                    notification = subscription.next() => match notification {
                        Some(n) => {
                            let event = match self.to_event(n) {
                                Some(e) => e,
                                None => continue,
                            };
                            if tx.send(LiveSignal::Event(event).into()).await.is_err() {
                                debug!("run: reconciliation loop is gone");
                                subscription.unsubscribe().await;
                                return;
                            }
                        }
                        None => {
                            warn!("run: subscription dropped, reconnecting");
                            break;
                        }
                    }
                }
            }
            subscription.unsubscribe().await;
            reconnecting = true;
        }
    }

    async fn connect(&self, shutdown: &mut watch::Receiver<bool>) -> Connection {
        let mut delays = self.retry.backoff().build();
        let mut attempts: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return Connection::Stopped;
            }
            attempts += 1;
            match self.source.subscribe().await {
                Ok(s) => {
                    info!("connect: subscribed after {} attempt(s)", attempts);
                    return Connection::Open(s);
                }
                Err(e) => match delays.next() {
                    Some(delay) => {
                        warn!(
                            "connect: attempt {} failed ({}), retrying in {:?}",
                            attempts, e, delay
                        );
                        tokio::select! {
                            _ = shutdown.changed() => return Connection::Stopped,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        error!("connect: giving up after {} attempts: {}", attempts, e);
                        return Connection::Lost(attempts);
                    }
                },
            }
        }
    }

    /// Unknown candidates are dropped, like in the snapshot. The category of
    /// the reference data wins over the notified one.
    fn to_event(&self, n: LiveNotification) -> Option<VoteEvent> {
        let candidate = match self.registry.get(&n.candidate_id) {
            Some(c) => c,
            None => {
                warn!(
                    "to_event: dropping event {} for unknown candidate {:?}",
                    n.event_id, n.candidate_id
                );
                return None;
            }
        };
        if candidate.category != n.category {
            warn!(
                "to_event: event {} announced {} for {}, who stands for {}",
                n.event_id, n.category, n.candidate_id, candidate.category
            );
        }
        Some(VoteEvent {
            id: n.event_id,
            candidate: n.candidate_id,
            category: candidate.category,
            timestamp: n.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Session = Result<Vec<LiveNotification>, CollaboratorError>;

    struct Scripted {
        sessions: Mutex<VecDeque<Session>>,
        unsubscribed: Arc<AtomicUsize>,
    }

    struct ScriptedSubscription {
        items: VecDeque<LiveNotification>,
        // The last session never drops.
        endless: bool,
        unsubscribed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LiveSource for Scripted {
        async fn subscribe(&self) -> Result<Box<dyn LiveSubscription>, CollaboratorError> {
            let next = self.sessions.lock().unwrap().pop_front();
            let (items, endless) = match next {
                Some(session) => (session?, false),
                None => (vec![], true),
            };
            Ok(Box::new(ScriptedSubscription {
                items: items.into(),
                endless,
                unsubscribed: self.unsubscribed.clone(),
            }))
        }
    }

    #[async_trait]
    impl LiveSubscription for ScriptedSubscription {
        async fn next(&mut self) -> Option<LiveNotification> {
            match self.items.pop_front() {
                Some(n) => Some(n),
                None if self.endless => std::future::pending().await,
                None => None,
            }
        }

        async fn unsubscribe(&mut self) {
            self.unsubscribed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> Arc<CandidateRegistry> {
        Arc::new(
            Builder::new()
                .candidate("a", "A", Category::Mayor, "Mayor")
                .build()
                .unwrap(),
        )
    }

    fn note(id: &str, candidate: &str, category: Category) -> LiveNotification {
        LiveNotification {
            candidate_id: CandidateId::new(candidate),
            category,
            event_id: EventId::new(id),
            timestamp: Utc::now(),
        }
    }

    fn retry(max_attempts: u32) -> RetrySettings {
        RetrySettings {
            min_delay_ms: 50,
            max_delay_ms: 500,
            factor: 2.0,
            max_attempts,
            jitter: false,
        }
    }

    fn start(
        sessions: Vec<Session>,
        max_attempts: u32,
    ) -> (
        mpsc::Receiver<LiveSignal>,
        watch::Sender<bool>,
        Arc<AtomicUsize>,
        tokio::task::JoinHandle<()>,
    ) {
        let _ = env_logger::builder().is_test(true).try_init();
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(Scripted {
            sessions: Mutex::new(sessions.into()),
            unsubscribed: unsubscribed.clone(),
        });
        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let subscriber = LiveSubscriber::new(source, registry(), retry(max_attempts));
        let handle = tokio::spawn(subscriber.run(tx, stop_rx));
        (rx, stop_tx, unsubscribed, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_known_candidates_and_unsubscribes_on_shutdown() {
        let (mut rx, stop, unsubscribed, handle) = start(
            vec![Ok(vec![
                note("1", "a", Category::Mayor),
                note("2", "ghost", Category::Mayor),
                note("3", "a", Category::Councillor),
            ])],
            3,
        );
        assert_eq!(rx.recv().await, Some(LiveSignal::Connected));
        match rx.recv().await {
            Some(LiveSignal::Event(e)) => assert_eq!(e.id, EventId::new("1")),
            x => panic!("unexpected {:?}", x),
        }
        match rx.recv().await {
            Some(LiveSignal::Event(e)) => {
                assert_eq!(e.id, EventId::new("3"));
                assert_eq!(e.category, Category::Mayor);
            }
            x => panic!("unexpected {:?}", x),
        }
        // The scripted session drops after its items.
        assert_eq!(rx.recv().await, Some(LiveSignal::Reconnected));

        stop.send(true).unwrap();
        handle.await.unwrap();
        // The dropped session and the live one.
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_the_first_subscription() {
        let unavailable = || CollaboratorError::Unavailable {
            message: "refused".to_string(),
        };
        let (mut rx, stop, _, handle) = start(
            vec![
                Err(unavailable()),
                Err(unavailable()),
                Ok(vec![note("1", "a", Category::Mayor)]),
            ],
            3,
        );
        assert_eq!(rx.recv().await, Some(LiveSignal::Connected));
        assert!(matches!(rx.recv().await, Some(LiveSignal::Event(_))));
        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reports_a_lost_subscription() {
        let failures: Vec<Session> = (0..5)
            .map(|_| {
                Err(CollaboratorError::Unavailable {
                    message: "down".to_string(),
                })
            })
            .collect();
        let (mut rx, _stop, _, handle) = start(failures, 2);
        assert_eq!(rx.recv().await, Some(LiveSignal::Lost { attempts: 3 }));
        handle.await.unwrap();
    }
}
