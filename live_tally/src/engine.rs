use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::builder::CandidateRegistry;
use crate::config::*;
use crate::gateway::{VoteGateway, VoteWriter};
use crate::merger::ReconciliationMerger;
use crate::ranking::RankingEngine;
use crate::snapshot::{SnapshotLoader, SnapshotSource};
use crate::store::AggregateStore;
use crate::subscriber::{LiveSignal, LiveSource, LiveSubscriber};

/// Everything that reaches the reconciliation loop.
#[derive(Debug)]
enum Input {
    Live(LiveSignal),
    Snapshot(TallyResult<Vec<VoteEvent>>),
}

impl From<LiveSignal> for Input {
    fn from(signal: LiveSignal) -> Self {
        Input::Live(signal)
    }
}

/// The live tally: one aggregate store fed by a snapshot and a live
/// subscription, with the submission gateway and the leaderboards on top.
///
/// The store is only mutated by a single reconciliation task that handles
/// one input at a time.
///
/// ```no_run
/// # async fn demo() -> live_tally::TallyResult<()> {
/// use std::sync::Arc;
/// use live_tally::builder::Builder;
/// use live_tally::memory::MemoryBallotBox;
/// use live_tally::*;
///
/// let registry = Builder::new()
///     .candidate("anna", "Anna", Category::Mayor, "Mayor")
///     .build()?;
/// let ballot_box = Arc::new(MemoryBallotBox::default());
/// let engine = TallyEngine::start(
///     registry,
///     ballot_box.clone(),
///     ballot_box.clone(),
///     ballot_box,
///     EngineSettings::default(),
/// );
/// engine.wait_until_settled().await?;
/// let id = engine.submit(&CandidateId::new("anna"), Category::Mayor).await?;
/// engine.wait_for_event(&id).await?;
/// assert_eq!(engine.leaderboard(Category::Mayor)[0].count, 1);
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TallyEngine {
    registry: Arc<CandidateRegistry>,
    store: Arc<AggregateStore>,
    ranking: RankingEngine,
    gateway: VoteGateway,
    status: watch::Receiver<EngineStatus>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TallyEngine {
    /// Starts loading the snapshot and subscribing. Must be called from
    /// within a tokio runtime.
    pub fn start(
        registry: CandidateRegistry,
        snapshots: Arc<dyn SnapshotSource>,
        live: Arc<dyn LiveSource>,
        writer: Arc<dyn VoteWriter>,
        settings: EngineSettings,
    ) -> TallyEngine {
        let registry = Arc::new(registry);
        let store = Arc::new(AggregateStore::new(settings.change_capacity));
        let (status_tx, status) = watch::channel(EngineStatus::STARTING);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel::<Input>(settings.input_capacity.max(1));

        let loader = Arc::new(SnapshotLoader::new(
            snapshots,
            registry.clone(),
            settings.snapshot_retry.clone(),
        ));
        let subscriber =
            LiveSubscriber::new(live, registry.clone(), settings.reconnect_retry.clone());

        info!(
            "start: {} candidates, snapshot retry {:?}, reconnect retry {:?}",
            registry.len(),
            settings.snapshot_retry,
            settings.reconnect_retry
        );
        spawn_load(loader.clone(), tx.clone(), shutdown_rx.clone());
        let tasks = vec![
            tokio::spawn(subscriber.run(tx.clone(), shutdown_rx.clone())),
            tokio::spawn(reconcile(
                ReconciliationMerger::new(store.clone()),
                rx,
                tx,
                loader,
                status_tx,
                shutdown_rx,
            )),
        ];

        TallyEngine {
            ranking: RankingEngine::new(store.clone(), registry.clone()),
            gateway: VoteGateway::new(registry.clone(), writer, settings.notice_ttl()),
            registry,
            store,
            status,
            shutdown,
            tasks,
        }
    }

    pub fn registry(&self) -> &CandidateRegistry {
        &self.registry
    }

    /// Casts a vote. The count moves once the stored vote comes back
    /// through the live subscription.
    pub async fn submit(
        &self,
        candidate: &CandidateId,
        category: Category,
    ) -> TallyResult<EventId> {
        self.gateway.submit(candidate, category).await
    }

    pub fn count(&self, candidate: &CandidateId) -> u64 {
        self.store.get(candidate)
    }

    pub fn counts(&self) -> HashMap<CandidateId, u64> {
        self.store.snapshot_all()
    }

    pub fn rank(
        &self,
        category: Category,
        excluded: &HashSet<CandidateId>,
    ) -> Vec<LeaderboardEntry> {
        self.ranking.rank(category, excluded)
    }

    /// The leaderboard as displayed: withdrawn candidates are left out and
    /// the last locally voted candidate is highlighted.
    pub fn leaderboard(&self, category: Category) -> Vec<LeaderboardEntry> {
        let last_voted = self.gateway.last_voted();
        self.ranking.leaderboard(category, last_voted.as_ref())
    }

    pub fn last_voted(&self) -> Option<CandidateId> {
        self.gateway.last_voted()
    }

    pub fn watch_last_voted(&self) -> watch::Receiver<Option<CandidateId>> {
        self.gateway.watch_last_voted()
    }

    pub fn notice(&self) -> Option<Notice> {
        self.gateway.notices().current()
    }

    pub fn notices(&self) -> watch::Receiver<Option<Notice>> {
        self.gateway.notices().subscribe()
    }

    pub fn changes(&self) -> broadcast::Receiver<TallyChange> {
        self.store.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    /// Waits until the first snapshot resolved (or failed for good) and the
    /// subscription left its connecting state.
    pub async fn wait_until_settled(&self) -> TallyResult<EngineStatus> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| s.is_settled())
            .await
            .map_err(|_| TallyErrors::EngineStopped {})?;
        Ok(*settled)
    }

    /// Waits until the event has been applied to the store.
    pub async fn wait_for_event(&self, event_id: &EventId) -> TallyResult<()> {
        let mut changes = self.store.subscribe();
        loop {
            if self.store.contains(event_id) {
                return Ok(());
            }
            match changes.recv().await {
                Ok(change) if change.event_id == *event_id => return Ok(()),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return EngineStoppedSnafu {}.fail(),
            }
        }
    }

    /// Stops every task, releases the subscription and cancels the pending
    /// timers.
    pub async fn shutdown(self) {
        info!("shutdown: stopping the tally engine");
        self.shutdown.send_replace(true);
        self.gateway.notices().cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("shutdown: task ended abnormally: {}", e);
            }
        }
    }
}

fn spawn_load(
    loader: Arc<SnapshotLoader>,
    tx: mpsc::Sender<Input>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.changed() => debug!("spawn_load: cancelled"),
            res = loader.load() => {
                let _ = tx.send(Input::Snapshot(res)).await;
            }
        }
    });
}

async fn reconcile(
    mut merger: ReconciliationMerger,
    mut inputs: mpsc::Receiver<Input>,
    tx: mpsc::Sender<Input>,
    loader: Arc<SnapshotLoader>,
    status: watch::Sender<EngineStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let input = tokio::select! {
            _ = shutdown.changed() => break,
            input = inputs.recv() => match input {
                Some(i) => i,
                None => break,
            },
        };
        match input {
            Input::Live(LiveSignal::Event(event)) => {
                merger.on_live(event);
            }
            Input::Live(LiveSignal::Connected) => {
                status.send_modify(|s| s.subscription = SubscriptionState::Open);
            }
            Input::Live(LiveSignal::Reconnected) => {
                info!("reconcile: subscription re-established, reloading the snapshot");
                status.send_modify(|s| s.subscription = SubscriptionState::Open);
                spawn_load(loader.clone(), tx.clone(), shutdown.clone());
            }
            Input::Live(LiveSignal::Lost { attempts }) => {
                error!(
                    "reconcile: live subscription lost after {} attempts, counts will not move",
                    attempts
                );
                status.send_modify(|s| s.subscription = SubscriptionState::Lost);
            }
            Input::Snapshot(Ok(events)) => {
                merger.on_snapshot(events);
                status.send_modify(|s| s.sync = SyncStatus::Synced);
            }
            Input::Snapshot(Err(e)) => {
                error!("reconcile: {}", e);
                merger.on_snapshot_failed();
                status.send_modify(|s| s.sync = SyncStatus::Degraded);
            }
        }
    }
    debug!("reconcile: stopped");
}
