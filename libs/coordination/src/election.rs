//! Leader election on a named seat.
//!
//! An [`ElectionManager`] campaigns for one election on behalf of this
//! process, binding its campaign entry to the session lease so leadership
//! ends with the session. [`LeaderObserver`] turns the backend's leader
//! watch into a live value that survives transient stream failures.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{ConnectionSlot, LeaderKey, current_connection};
use crate::error::{BackendError, CoordinationError, CoordinationResult};
use crate::lease::LeaseManager;
use crate::metrics;

/// Campaign state of this process for one election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Campaigning,
    Leading,
}

/// Health of the leader watch behind a [`LeaderObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverStatus {
    /// Establishing (or re-establishing) the watch.
    Pending,
    /// The watch is live; the observed leader is current.
    Watching,
    /// The watch stopped for good; the observed leader is stale.
    Failed(CoordinationError),
}

/// Live view of an election's leader, fed by a single watch task.
#[derive(Debug)]
pub struct LeaderObserver {
    election: String,
    leader: watch::Sender<Option<String>>,
    status: watch::Sender<ObserverStatus>,
    stop: CancellationToken,
}

impl LeaderObserver {
    fn new(election: String) -> Self {
        let (leader, _) = watch::channel(None);
        let (status, _) = watch::channel(ObserverStatus::Pending);
        Self {
            election,
            leader,
            status,
            stop: CancellationToken::new(),
        }
    }

    pub fn election(&self) -> &str {
        &self.election
    }

    /// Last observed leader; `None` while the seat is empty or before the
    /// first observation.
    pub fn current(&self) -> Option<String> {
        self.leader.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.leader.subscribe()
    }

    /// Stream of the current leader followed by every change.
    pub fn changes(&self) -> WatchStream<Option<String>> {
        WatchStream::new(self.leader.subscribe())
    }

    pub fn status(&self) -> ObserverStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ObserverStatus> {
        self.status.subscribe()
    }

    fn publish(&self, leader: Option<String>) {
        self.leader.send_if_modified(|current| {
            if *current != leader {
                debug!(election = %self.election, ?leader, "leader changed");
                *current = leader;
                true
            } else {
                false
            }
        });
    }

    fn set_status(&self, status: ObserverStatus) {
        self.status.send_replace(status);
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

/// Campaigns for a named election seat. Cheap to clone; clones share the
/// campaign.
#[derive(Debug, Clone)]
pub struct ElectionManager {
    inner: Arc<ElectionInner>,
}

#[derive(Debug)]
struct ElectionInner {
    name: String,
    slot: ConnectionSlot,
    lease: LeaseManager,
    campaign: Mutex<Campaign>,
    observer: Mutex<Option<Arc<LeaderObserver>>>,
}

#[derive(Debug)]
struct Campaign {
    state: ElectionState,
    candidate: Option<String>,
    /// cancelled to abort the in-flight campaign
    context: Option<CancellationToken>,
    leader: Option<LeaderKey>,
    /// bumped whenever a campaign is superseded or resigned
    generation: u64,
}

impl Campaign {
    fn reset(&mut self) -> Option<LeaderKey> {
        if let Some(context) = self.context.take() {
            context.cancel();
        }
        self.generation = self.generation.wrapping_add(1);
        self.state = ElectionState::Idle;
        self.leader.take()
    }
}

impl ElectionManager {
    pub(crate) fn new(name: impl Into<String>, slot: ConnectionSlot, lease: LeaseManager) -> Self {
        Self {
            inner: Arc::new(ElectionInner {
                name: name.into(),
                slot,
                lease,
                campaign: Mutex::new(Campaign {
                    state: ElectionState::Idle,
                    candidate: None,
                    context: None,
                    leader: None,
                    generation: 0,
                }),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Candidate id of the latest campaign.
    pub fn candidate(&self) -> Option<String> {
        self.inner.campaign.lock().candidate.clone()
    }

    pub fn state(&self) -> ElectionState {
        let mut campaign = self.inner.campaign.lock();
        self.demote_if_lease_changed(&mut campaign);
        campaign.state
    }

    /// Leadership is bound to the session lease it was won under.
    fn demote_if_lease_changed(&self, campaign: &mut Campaign) {
        let Some(leader) = campaign.leader.as_ref() else {
            return;
        };
        let current = self.inner.lease.current().ok().map(|lease| lease.id());
        if current != Some(leader.lease) {
            warn!(
                election = %self.inner.name,
                lease_id = %leader.lease,
                "session lease replaced, leadership lost"
            );
            campaign.reset();
        }
    }

    /// Campaign as `id` until elected, cancelled, or failed.
    ///
    /// Returns `Ok` once elected, or immediately if already leading.
    /// Cancelling `cancel` (or starting another campaign, or resigning)
    /// abandons the campaign with `Aborted`.
    pub async fn campaign(
        &self,
        id: &str,
        cancel: Option<CancellationToken>,
    ) -> CoordinationResult<()> {
        let conn = current_connection(&self.inner.slot, "campaign").await?;
        let lease = self.inner.lease.current()?;

        let (context, generation) = {
            let mut campaign = self.inner.campaign.lock();
            self.demote_if_lease_changed(&mut campaign);
            match campaign.state {
                ElectionState::Leading => {
                    debug!(election = %self.inner.name, "already leading");
                    return Ok(());
                }
                ElectionState::Campaigning => {
                    debug!(election = %self.inner.name, "superseding in-flight campaign");
                    campaign.reset();
                }
                ElectionState::Idle => {}
            }
            let context = CancellationToken::new();
            campaign.context = Some(context.clone());
            campaign.state = ElectionState::Campaigning;
            campaign.candidate = Some(id.to_owned());
            (context, campaign.generation)
        };
        let cancel = cancel.unwrap_or_default();

        info!(
            election = %self.inner.name,
            candidate = id,
            lease_id = %lease.id(),
            "campaigning"
        );
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoordinationError::Aborted("campaign cancelled".into())),
            _ = context.cancelled() => Err(CoordinationError::Aborted("campaign superseded".into())),
            elected = conn.campaign(&self.inner.name, id, lease.id()) => elected,
        };

        let won_superseded = {
            let mut campaign = self.inner.campaign.lock();
            if campaign.generation == generation {
                return self.settle(&mut campaign, id, outcome);
            }
            outcome.ok()
        };
        metrics::ELECTION_ABORTED.inc();
        // elected after being superseded or resigned: hand the seat back
        if let Some(leader) = won_superseded {
            match conn.resign(&leader).await {
                Ok(()) => debug!(election = %self.inner.name, candidate = id, "resigned superseded win"),
                Err(err) => warn!(
                    election = %self.inner.name,
                    candidate = id,
                    error = %err,
                    "failed to resign superseded win"
                ),
            }
        }
        Err(CoordinationError::Aborted("campaign superseded".into()))
    }

    fn settle(
        &self,
        campaign: &mut Campaign,
        id: &str,
        outcome: CoordinationResult<LeaderKey>,
    ) -> CoordinationResult<()> {
        match outcome {
            Ok(leader) => {
                metrics::ELECTION_WON.inc();
                info!(election = %self.inner.name, candidate = id, "elected leader");
                campaign.state = ElectionState::Leading;
                campaign.leader = Some(leader);
                Ok(())
            }
            Err(err) => {
                campaign.context = None;
                campaign.state = ElectionState::Idle;
                if err.is_aborted() {
                    metrics::ELECTION_ABORTED.inc();
                    info!(election = %self.inner.name, candidate = id, "campaign aborted");
                } else {
                    warn!(election = %self.inner.name, candidate = id, error = %err, "campaign failed");
                }
                Err(err)
            }
        }
    }

    /// Abandon any in-flight campaign and give up leadership if held.
    ///
    /// If the backend refuses the resignation, leadership is kept so the
    /// call can be retried.
    pub async fn resign(&self) -> CoordinationResult<()> {
        let (leader, generation) = {
            let mut campaign = self.inner.campaign.lock();
            let leader = campaign.reset();
            (leader, campaign.generation)
        };
        let Some(leader) = leader else {
            debug!(election = %self.inner.name, "not leading, nothing to resign");
            return Ok(());
        };
        let resigned = match current_connection(&self.inner.slot, "resign").await {
            Ok(conn) => conn.resign(&leader).await,
            Err(err) => Err(err),
        };
        if let Err(err) = resigned {
            warn!(election = %self.inner.name, error = %err, "resign failed, still leading");
            self.restore_leadership(leader, generation);
            return Err(err);
        }
        info!(election = %self.inner.name, "resigned leadership");
        Ok(())
    }

    /// Put back leadership taken by a failed resign, unless a campaign or
    /// shutdown has happened since.
    fn restore_leadership(&self, leader: LeaderKey, generation: u64) {
        let mut campaign = self.inner.campaign.lock();
        if campaign.generation == generation {
            campaign.state = ElectionState::Leading;
            campaign.leader = Some(leader);
        }
    }

    /// Current leader as reported by the backend right now.
    pub async fn leader(&self) -> CoordinationResult<Option<String>> {
        let conn = current_connection(&self.inner.slot, "leader").await?;
        conn.leader(&self.inner.name).await
    }

    /// The election's leader observer. Every call returns the same
    /// instance; the first call starts its watch task, so it must run
    /// inside a tokio runtime.
    pub fn observer(&self) -> Arc<LeaderObserver> {
        let mut slot = self.inner.observer.lock();
        if let Some(observer) = slot.as_ref() {
            return Arc::clone(observer);
        }
        let observer = Arc::new(LeaderObserver::new(self.inner.name.clone()));
        *slot = Some(Arc::clone(&observer));
        drop(slot);

        tokio::spawn(watch_leader(self.inner.slot.clone(), Arc::clone(&observer)));
        observer
    }

    /// Stop the observer and abandon campaigning. Used on disconnect.
    pub(crate) fn shutdown(&self) {
        self.inner.campaign.lock().reset();
        if let Some(observer) = self.inner.observer.lock().take() {
            observer.stop();
        }
    }
}

/// Keep `observer` fed from the backend's leader watch, re-establishing
/// the watch with backoff after recoverable failures.
async fn watch_leader(slot: ConnectionSlot, observer: Arc<LeaderObserver>) {
    let election = observer.election.clone();
    let conn = match current_connection(&slot, "observe").await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(%election, error = %err, "cannot observe leader");
            observer.set_status(ObserverStatus::Failed(err));
            return;
        }
    };
    let mut backoff = conn.faults().watch_backoff();
    let mut established = 0u64;

    loop {
        let opened = tokio::select! {
            _ = observer.stop.cancelled() => return,
            opened = conn.observe(&election) => opened,
        };
        let err = match opened {
            Ok(mut stream) => {
                if established > 0 {
                    metrics::WATCH_RESTARTS.inc();
                    info!(%election, "leader watch re-established");
                }
                established += 1;
                backoff.reset();
                observer.set_status(ObserverStatus::Watching);
                loop {
                    let next = tokio::select! {
                        _ = observer.stop.cancelled() => return,
                        _ = conn.closed().cancelled() => None,
                        next = stream.next() => Some(next),
                    };
                    match next {
                        None => {
                            debug!(%election, "connection closed, leader watch stopped");
                            observer.set_status(ObserverStatus::Failed(
                                CoordinationError::NotConnected("connection closed".into()),
                            ));
                            return;
                        }
                        Some(Some(Ok(leader))) => observer.publish(leader),
                        Some(Some(Err(err))) => break err,
                        Some(None) => break BackendError::WatchClosed("leader stream ended".into()),
                    }
                }
            }
            Err(err) => err,
        };

        if !err.is_recoverable() {
            error!(%election, error = %err, "leader watch failed");
            observer.set_status(ObserverStatus::Failed(err.into()));
            return;
        }
        let delay = backoff.next_delay();
        warn!(
            %election,
            error = %err,
            retry_in_ms = delay.as_millis(),
            "leader watch interrupted, re-establishing"
        );
        observer.set_status(ObserverStatus::Pending);
        tokio::select! {
            _ = observer.stop.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        trace!(%election, attempt = backoff.attempt(), "re-opening leader watch");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::RwLock;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::{Backend, Connection, LeaderStream, LeaseGrant, LeaseId, LockKey};
    use crate::error::BackendResult;
    use crate::event::EventSender;
    use crate::memory::{BackendOp, MemoryBackend};
    use crate::policy::FaultHandling;

    struct Node {
        lease: LeaseManager,
        election: ElectionManager,
    }

    async fn node(backend: &MemoryBackend, election: &str) -> Node {
        node_over(Arc::new(backend.clone()), election).await
    }

    async fn node_over(backend: Arc<dyn Backend>, election: &str) -> Node {
        let conn = Connection::new(backend, FaultHandling::default());
        let slot: ConnectionSlot = Arc::new(RwLock::new(Some(conn)));
        let lease = LeaseManager::new(
            slot.clone(),
            Duration::from_secs(10),
            Duration::from_secs(1),
            EventSender::new(),
        );
        lease.start_session();
        lease.grant_lease().await.unwrap();
        Node {
            election: ElectionManager::new(election, slot, lease.clone()),
            lease,
        }
    }

    type Hook = Box<dyn FnOnce() + Send>;

    /// Memory backend that runs a hook when a campaign wins, before the
    /// win reaches the campaigner.
    struct WinHook {
        inner: MemoryBackend,
        hook: Mutex<Option<Hook>>,
    }

    impl WinHook {
        fn on_win(&self, hook: impl FnOnce() + Send + 'static) {
            *self.hook.lock() = Some(Box::new(hook));
        }
    }

    impl std::fmt::Debug for WinHook {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("WinHook").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl Backend for WinHook {
        fn host(&self) -> &str {
            self.inner.host()
        }
        async fn grant_lease(&self, ttl: Duration) -> BackendResult<LeaseGrant> {
            self.inner.grant_lease(ttl).await
        }
        async fn keep_alive(&self, lease: LeaseId) -> BackendResult<Duration> {
            self.inner.keep_alive(lease).await
        }
        async fn revoke_lease(&self, lease: LeaseId) -> BackendResult<()> {
            self.inner.revoke_lease(lease).await
        }
        async fn lock(&self, name: &str, lease: LeaseId) -> BackendResult<LockKey> {
            self.inner.lock(name, lease).await
        }
        async fn unlock(&self, key: &LockKey) -> BackendResult<()> {
            self.inner.unlock(key).await
        }
        async fn campaign(
            &self,
            election: &str,
            candidate: &str,
            lease: LeaseId,
        ) -> BackendResult<LeaderKey> {
            let leader = self.inner.campaign(election, candidate, lease).await?;
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            Ok(leader)
        }
        async fn resign(&self, leader: &LeaderKey) -> BackendResult<()> {
            self.inner.resign(leader).await
        }
        async fn leader(&self, election: &str) -> BackendResult<Option<String>> {
            self.inner.leader(election).await
        }
        async fn observe(&self, election: &str) -> BackendResult<LeaderStream> {
            self.inner.observe(election).await
        }
        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_requires_connection_and_lease() {
        let slot: ConnectionSlot = Arc::new(RwLock::new(None));
        let lease = LeaseManager::new(
            slot.clone(),
            Duration::from_secs(10),
            Duration::from_secs(1),
            EventSender::new(),
        );
        let election = ElectionManager::new("leader", slot, lease);
        let err = election.campaign("A", None).await.unwrap_err();
        assert!(err.is_not_connected());
        assert!(election.leader().await.unwrap_err().is_not_connected());
        assert_eq!(election.state(), ElectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_elected_and_resign() {
        let backend = MemoryBackend::new();
        let a = node(&backend, "leader").await;

        a.election.campaign("A", None).await.unwrap();
        assert_eq!(a.election.state(), ElectionState::Leading);
        assert_eq!(a.election.candidate().as_deref(), Some("A"));
        assert_eq!(a.election.leader().await.unwrap().as_deref(), Some("A"));

        // no-op while leading
        a.election.campaign("A", None).await.unwrap();
        assert_eq!(backend.candidates("leader"), vec!["A"]);

        a.election.resign().await.unwrap();
        assert_eq!(a.election.state(), ElectionState::Idle);
        assert_eq!(a.election.leader().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_without_leftover_entry() {
        let backend = MemoryBackend::new();
        let a = node(&backend, "leader").await;
        let b = node(&backend, "leader").await;
        a.election.campaign("A", None).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let err = b.election.campaign("B", Some(cancel)).await.unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(b.election.state(), ElectionState::Idle);
        assert_eq!(backend.candidates("leader"), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_campaign_supersedes_pending_one() {
        let backend = MemoryBackend::new();
        let a = node(&backend, "leader").await;
        let b = node(&backend, "leader").await;
        a.election.campaign("A", None).await.unwrap();

        let first = {
            let election = b.election.clone();
            tokio::spawn(async move { election.campaign("B1", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let election = b.election.clone();
            tokio::spawn(async move { election.campaign("B2", None).await })
        };

        assert!(first.await.unwrap().unwrap_err().is_aborted());
        a.election.resign().await.unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(b.election.state(), ElectionState::Leading);
        assert_eq!(b.election.leader().await.unwrap().as_deref(), Some("B2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_win_after_shutdown_gives_seat_back() {
        let backend = MemoryBackend::new();
        let hooked = Arc::new(WinHook {
            inner: backend.clone(),
            hook: Mutex::new(None),
        });
        let a = node_over(hooked.clone(), "leader").await;
        let election = a.election.clone();
        hooked.on_win(move || election.shutdown());

        let err = a.election.campaign("A", None).await.unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(a.election.state(), ElectionState::Idle);
        assert_eq!(a.election.leader().await.unwrap(), None);
        assert!(backend.candidates("leader").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resign_keeps_leadership() {
        let backend = MemoryBackend::new();
        let a = node(&backend, "leader").await;
        a.election.campaign("A", None).await.unwrap();

        backend.fail_next(BackendOp::Resign, BackendError::PermissionDenied("no".into()));
        let err = a.election.resign().await.unwrap_err();
        assert_eq!(err.backend(), Some(&BackendError::PermissionDenied("no".into())));
        assert_eq!(a.election.state(), ElectionState::Leading);
        assert_eq!(a.election.leader().await.unwrap().as_deref(), Some("A"));

        // retrying releases the seat
        a.election.resign().await.unwrap();
        assert_eq!(a.election.state(), ElectionState::Idle);
        assert_eq!(a.election.leader().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_campaign_error_propagates() {
        let backend = MemoryBackend::new();
        let a = node(&backend, "leader").await;
        backend.fail_next(BackendOp::Campaign, BackendError::PermissionDenied("no".into()));

        let err = a.election.campaign("A", None).await.unwrap_err();
        assert_eq!(err.backend(), Some(&BackendError::PermissionDenied("no".into())));
        assert_eq!(a.election.state(), ElectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_lost_with_lease() {
        let backend = MemoryBackend::new();
        let a = node(&backend, "leader").await;
        a.election.campaign("A", None).await.unwrap();

        a.lease.grant_lease().await.unwrap();
        assert_eq!(a.election.state(), ElectionState::Idle);
        assert_eq!(a.election.leader().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_is_shared() {
        let backend = MemoryBackend::new();
        let a = node(&backend, "leader").await;

        let observers: Vec<_> = (0..5).map(|_| a.election.observer()).collect();
        for observer in &observers[1..] {
            assert!(Arc::ptr_eq(&observers[0], observer));
        }
        let mut leader = observers[0].subscribe();
        a.election.campaign("A", None).await.unwrap();
        leader.wait_for(|l| l.as_deref() == Some("A")).await.unwrap();

        assert_eq!(observers[0].status(), ObserverStatus::Watching);
        assert_eq!(backend.observe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_retries_recoverable_failures() {
        let backend = MemoryBackend::new();
        let a = node(&backend, "leader").await;
        backend.fail_next(BackendOp::Observe, BackendError::Unavailable("no leader".into()));
        backend.fail_next(BackendOp::Observe, BackendError::Transport("reset".into()));

        let observer = a.election.observer();
        let mut status = observer.subscribe_status();
        status.wait_for(|s| *s == ObserverStatus::Watching).await.unwrap();
        assert_eq!(backend.observe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_terminal_failure_is_reported() {
        let backend = MemoryBackend::new();
        let a = node(&backend, "leader").await;
        backend.fail_next(BackendOp::Observe, BackendError::PermissionDenied("no".into()));

        let observer = a.election.observer();
        let mut status = observer.subscribe_status();
        status
            .wait_for(|s| matches!(s, ObserverStatus::Failed(_)))
            .await
            .unwrap();
        assert_eq!(
            observer.status(),
            ObserverStatus::Failed(BackendError::PermissionDenied("no".into()).into())
        );
    }
}
