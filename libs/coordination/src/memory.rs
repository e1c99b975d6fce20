//! In-process coordination backend.
//!
//! Follows etcd v3 semantics closely enough for the managers to rely on
//! them: leases expire unless kept alive, locks and campaign entries are
//! bound to a lease and vanish with it, and an election's leader is its
//! oldest live candidate. Clones share state, so several clients connected
//! to the same `MemoryBackend` behave like processes sharing a cluster.
//!
//! Lease expiry is evaluated lazily on every call and by waiters blocked in
//! `lock`/`campaign`. Failures can be scripted per operation with
//! [`MemoryBackend::fail_next`] and lease loss with
//! [`MemoryBackend::force_lease_loss`].

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, watch},
    time::Instant,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, trace};

use config::CoordinationConfig;

use crate::backend::{
    Backend, Connector, LeaderKey, LeaderStream, LeaseGrant, LeaseId, LockKey,
};
use crate::error::{BackendError, BackendResult};

/// Host name reported by the in-process backend.
pub const MEMORY_HOST: &str = "memory";

/// Backend operations that can have failures scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Grant,
    KeepAlive,
    Revoke,
    Lock,
    Unlock,
    Campaign,
    Resign,
    Leader,
    Observe,
}

/// Shared in-process cluster. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Cluster>,
}

#[derive(Debug, Default)]
struct Cluster {
    state: Mutex<State>,
    /// woken on every change to locks or elections
    changed: Notify,
    observes: AtomicU64,
}

#[derive(Debug, Default)]
struct State {
    next_lease: i64,
    revision: i64,
    leases: HashMap<LeaseId, LeaseEntry>,
    /// leases whose keepalive reports the stored error
    lost: HashMap<LeaseId, BackendError>,
    locks: HashMap<String, LockEntry>,
    elections: HashMap<String, Election>,
    faults: HashMap<BackendOp, VecDeque<BackendError>>,
    grants: u64,
    unlocks: u64,
}

#[derive(Debug, Clone, Copy)]
struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug, Clone)]
struct LockEntry {
    key: LockKey,
    lease: LeaseId,
}

#[derive(Debug)]
struct Election {
    /// ordered by creation revision; the first entry leads
    candidates: Vec<Candidate>,
    leader: watch::Sender<Option<String>>,
}

#[derive(Debug, Clone)]
struct Candidate {
    key: Vec<u8>,
    revision: i64,
    /// identifies the campaign call currently waiting on this entry
    ticket: i64,
    value: String,
    lease: LeaseId,
}

impl Election {
    fn new() -> Self {
        let (leader, _) = watch::channel(None);
        Self {
            candidates: Vec::new(),
            leader,
        }
    }

    fn publish(&self) {
        let current = self.candidates.first().map(|c| c.value.clone());
        self.leader.send_if_modified(|leader| {
            if *leader != current {
                *leader = current;
                true
            } else {
                false
            }
        });
    }
}

impl State {
    fn take_fault(&mut self, op: BackendOp) -> BackendResult<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(?op, error = %err, "injected backend failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Expire overdue leases. Returns true if anything changed.
    fn sweep(&mut self, now: Instant) -> bool {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            debug!(lease_id = %id, "lease expired");
            self.leases.remove(id);
            self.drop_bound_keys(*id);
        }
        !expired.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.leases.values().map(|lease| lease.deadline).min()
    }

    /// Delete every lock and campaign entry attached to the lease.
    fn drop_bound_keys(&mut self, lease: LeaseId) {
        self.locks.retain(|_, lock| lock.lease != lease);
        for election in self.elections.values_mut() {
            let before = election.candidates.len();
            election.candidates.retain(|c| c.lease != lease);
            if election.candidates.len() != before {
                election.publish();
            }
        }
    }

    fn require_lease(&self, lease: LeaseId) -> BackendResult<()> {
        if self.leases.contains_key(&lease) {
            Ok(())
        } else {
            Err(BackendError::LeaseNotFound(lease))
        }
    }

    fn election(&mut self, name: &str) -> &mut Election {
        self.elections
            .entry(name.to_owned())
            .or_insert_with(Election::new)
    }
}

/// Removes a campaign entry if the campaign future is dropped before the
/// candidate was elected.
struct PendingCandidate<'a> {
    cluster: &'a Cluster,
    election: &'a str,
    key: Vec<u8>,
    ticket: i64,
    armed: bool,
}

impl Drop for PendingCandidate<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.cluster.state.lock();
        if let Some(election) = state.elections.get_mut(self.election) {
            let before = election.candidates.len();
            election
                .candidates
                .retain(|c| c.key != self.key || c.ticket != self.ticket);
            if election.candidates.len() != before {
                debug!(election = self.election, "retracted abandoned campaign entry");
                election.publish();
                drop(state);
                self.cluster.changed.notify_waiters();
            }
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: BackendOp, err: BackendError) {
        self.inner
            .state
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Drop the lease (and everything bound to it) and make every further
    /// keepalive for it fail with `err`, as if the session was lost.
    pub fn force_lease_loss(&self, lease: LeaseId, err: BackendError) {
        let mut state = self.inner.state.lock();
        state.leases.remove(&lease);
        state.drop_bound_keys(lease);
        state.lost.insert(lease, err);
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// Number of leases currently alive.
    pub fn live_leases(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.sweep(Instant::now());
        state.leases.len()
    }

    pub fn is_lease_alive(&self, lease: LeaseId) -> bool {
        let mut state = self.inner.state.lock();
        state.sweep(Instant::now());
        state.leases.contains_key(&lease)
    }

    /// Whether any lease holds the named lock.
    pub fn is_locked(&self, name: &str) -> bool {
        let mut state = self.inner.state.lock();
        state.sweep(Instant::now());
        state.locks.contains_key(name)
    }

    /// Candidate values of an election in campaign order.
    pub fn candidates(&self, election: &str) -> Vec<String> {
        let mut state = self.inner.state.lock();
        state.sweep(Instant::now());
        state
            .elections
            .get(election)
            .map(|e| e.candidates.iter().map(|c| c.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Total successful lease grants.
    pub fn grant_count(&self) -> u64 {
        self.inner.state.lock().grants
    }

    /// Total successful unlocks.
    pub fn unlock_count(&self) -> u64 {
        self.inner.state.lock().unlocks
    }

    /// Total leader watches opened.
    pub fn observe_count(&self) -> u64 {
        self.inner.observes.load(Ordering::SeqCst)
    }

    /// Wait for a change or for the next lease deadline.
    async fn wait_for_change(&self, notified: tokio::sync::futures::Notified<'_>, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => notified.await,
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn host(&self) -> &str {
        MEMORY_HOST
    }

    async fn grant_lease(&self, ttl: Duration) -> BackendResult<LeaseGrant> {
        let mut state = self.inner.state.lock();
        state.take_fault(BackendOp::Grant)?;
        if ttl < Duration::from_secs(1) {
            return Err(BackendError::InvalidArgument(format!(
                "lease ttl must be at least 1s, got {ttl:?}"
            )));
        }
        state.next_lease += 1;
        let id = LeaseId::new(state.next_lease);
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        state.grants += 1;
        trace!(lease_id = %id, ttl_secs = ttl.as_secs(), "lease granted");
        Ok(LeaseGrant { id, ttl })
    }

    async fn keep_alive(&self, lease: LeaseId) -> BackendResult<Duration> {
        let mut state = self.inner.state.lock();
        state.take_fault(BackendOp::KeepAlive)?;
        if let Some(err) = state.lost.get(&lease) {
            return Err(err.clone());
        }
        let now = Instant::now();
        if state.sweep(now) {
            drop(state);
            self.inner.changed.notify_waiters();
            state = self.inner.state.lock();
        }
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.deadline = now + entry.ttl;
                Ok(entry.ttl)
            }
            None => Ok(Duration::ZERO),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> BackendResult<()> {
        let mut state = self.inner.state.lock();
        state.take_fault(BackendOp::Revoke)?;
        state.sweep(Instant::now());
        state.lost.remove(&lease);
        if state.leases.remove(&lease).is_none() {
            return Err(BackendError::LeaseNotFound(lease));
        }
        state.drop_bound_keys(lease);
        drop(state);
        self.inner.changed.notify_waiters();
        trace!(lease_id = %lease, "lease revoked");
        Ok(())
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> BackendResult<LockKey> {
        if name.is_empty() {
            return Err(BackendError::InvalidArgument("empty lock name".into()));
        }
        self.inner.state.lock().take_fault(BackendOp::Lock)?;
        loop {
            let notified = self.inner.changed.notified();
            let deadline = {
                let mut state = self.inner.state.lock();
                if state.sweep(Instant::now()) {
                    self.inner.changed.notify_waiters();
                }
                state.require_lease(lease)?;
                match state.locks.get(name) {
                    Some(held) if held.lease == lease => return Ok(held.key.clone()),
                    Some(_) => state.next_deadline(),
                    None => {
                        let key = LockKey::new(format!("{name}/{:x}", lease.get()));
                        state.locks.insert(
                            name.to_owned(),
                            LockEntry {
                                key: key.clone(),
                                lease,
                            },
                        );
                        trace!(name, lease_id = %lease, "lock acquired");
                        return Ok(key);
                    }
                }
            };
            self.wait_for_change(notified, deadline).await;
        }
    }

    async fn unlock(&self, key: &LockKey) -> BackendResult<()> {
        let mut state = self.inner.state.lock();
        state.take_fault(BackendOp::Unlock)?;
        let before = state.locks.len();
        state.locks.retain(|_, lock| lock.key != *key);
        // deleting a key that is already gone is not an error, as in etcd
        if state.locks.len() != before {
            state.unlocks += 1;
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn campaign(
        &self,
        election: &str,
        candidate: &str,
        lease: LeaseId,
    ) -> BackendResult<LeaderKey> {
        let (key, revision, ticket) = {
            let mut state = self.inner.state.lock();
            state.take_fault(BackendOp::Campaign)?;
            state.sweep(Instant::now());
            state.require_lease(lease)?;
            let key = format!("{election}/{:x}", lease.get()).into_bytes();
            state.revision += 1;
            let ticket = state.revision;
            let entry = state.election(election);
            let revision = match entry.candidates.iter_mut().find(|c| c.key == key) {
                // same lease campaigning again keeps its place in line
                Some(existing) => {
                    existing.value = candidate.to_owned();
                    existing.ticket = ticket;
                    existing.revision
                }
                None => {
                    entry.candidates.push(Candidate {
                        key: key.clone(),
                        revision: ticket,
                        ticket,
                        value: candidate.to_owned(),
                        lease,
                    });
                    ticket
                }
            };
            entry.publish();
            (key, revision, ticket)
        };
        self.inner.changed.notify_waiters();

        let mut pending = PendingCandidate {
            cluster: &self.inner,
            election,
            key: key.clone(),
            ticket,
            armed: true,
        };
        loop {
            let notified = self.inner.changed.notified();
            let deadline = {
                let mut state = self.inner.state.lock();
                if state.sweep(Instant::now()) {
                    self.inner.changed.notify_waiters();
                }
                let entry = state.election(election);
                match entry.candidates.iter().position(|c| c.key == key) {
                    Some(0) => {
                        pending.armed = false;
                        return Ok(LeaderKey {
                            election: election.to_owned(),
                            key,
                            revision,
                            lease,
                        });
                    }
                    Some(_) => state.next_deadline(),
                    None => {
                        pending.armed = false;
                        return Err(BackendError::LeaseNotFound(lease));
                    }
                }
            };
            self.wait_for_change(notified, deadline).await;
        }
    }

    async fn resign(&self, leader: &LeaderKey) -> BackendResult<()> {
        let mut state = self.inner.state.lock();
        state.take_fault(BackendOp::Resign)?;
        if let Some(election) = state.elections.get_mut(&leader.election) {
            election.candidates.retain(|c| c.key != leader.key);
            election.publish();
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn leader(&self, election: &str) -> BackendResult<Option<String>> {
        let mut state = self.inner.state.lock();
        state.take_fault(BackendOp::Leader)?;
        state.sweep(Instant::now());
        Ok(state
            .elections
            .get(election)
            .and_then(|e| e.candidates.first())
            .map(|c| c.value.clone()))
    }

    async fn observe(&self, election: &str) -> BackendResult<LeaderStream> {
        let mut state = self.inner.state.lock();
        state.take_fault(BackendOp::Observe)?;
        state.sweep(Instant::now());
        let rx = state.election(election).leader.subscribe();
        self.inner.observes.fetch_add(1, Ordering::SeqCst);
        Ok(WatchStream::new(rx).map(Ok).boxed())
    }

    async fn close(&self) {
        // state is shared with other clients of the same cluster
        trace!("memory backend connection closed");
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self, _config: &CoordinationConfig) -> BackendResult<Arc<dyn Backend>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keepalive() {
        let backend = MemoryBackend::new();
        let grant = backend.grant_lease(TTL).await.unwrap();
        assert!(backend.is_lease_alive(grant.id));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(backend.keep_alive(grant.id).await.unwrap(), TTL);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(backend.is_lease_alive(grant.id));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!backend.is_lease_alive(grant.id));
        assert_eq!(backend.keep_alive(grant.id).await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_grant_rejects_sub_second_ttl() {
        let backend = MemoryBackend::new();
        let err = backend
            .grant_lease(Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_revoke_releases_bound_lock() {
        let backend = MemoryBackend::new();
        let grant = backend.grant_lease(TTL).await.unwrap();
        backend.lock("lock/a", grant.id).await.unwrap();
        assert!(backend.is_locked("lock/a"));

        backend.revoke_lease(grant.id).await.unwrap();
        assert!(!backend.is_locked("lock/a"));
        assert_eq!(
            backend.revoke_lease(grant.id).await.unwrap_err(),
            BackendError::LeaseNotFound(grant.id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_waits_for_holder() {
        let backend = MemoryBackend::new();
        let a = backend.grant_lease(TTL).await.unwrap();
        let b = backend.grant_lease(TTL).await.unwrap();
        let key = backend.lock("lock/a", a.id).await.unwrap();

        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.lock("lock/a", b.id).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        backend.unlock(&key).await.unwrap();
        let key_b = waiter.await.unwrap().unwrap();
        assert_ne!(key, key_b);
        assert_eq!(backend.unlock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_freed_when_holder_lease_expires() {
        let backend = MemoryBackend::new();
        let a = backend.grant_lease(Duration::from_secs(1)).await.unwrap();
        let b = backend.grant_lease(Duration::from_secs(60)).await.unwrap();
        backend.lock("lock/a", a.id).await.unwrap();

        // nobody keeps `a` alive, so the waiter gets the lock after ~1s
        let started = Instant::now();
        backend.lock("lock/a", b.id).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_lock_requires_live_lease() {
        let backend = MemoryBackend::new();
        let err = backend.lock("lock/a", LeaseId::new(99)).await.unwrap_err();
        assert_eq!(err, BackendError::LeaseNotFound(LeaseId::new(99)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_queue_and_resign() {
        let backend = MemoryBackend::new();
        let a = backend.grant_lease(TTL).await.unwrap();
        let b = backend.grant_lease(TTL).await.unwrap();

        let leader_a = backend.campaign("leader", "A", a.id).await.unwrap();
        assert_eq!(backend.leader("leader").await.unwrap().as_deref(), Some("A"));

        let campaign_b = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.campaign("leader", "B", b.id).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!campaign_b.is_finished());
        assert_eq!(backend.candidates("leader"), vec!["A", "B"]);

        backend.resign(&leader_a).await.unwrap();
        let leader_b = campaign_b.await.unwrap().unwrap();
        assert_eq!(leader_b.lease, b.id);
        assert_eq!(backend.leader("leader").await.unwrap().as_deref(), Some("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_campaign_retracts_entry() {
        let backend = MemoryBackend::new();
        let a = backend.grant_lease(TTL).await.unwrap();
        let b = backend.grant_lease(TTL).await.unwrap();
        backend.campaign("leader", "A", a.id).await.unwrap();

        let pending = backend.campaign("leader", "B", b.id);
        let timed_out = tokio::time::timeout(Duration::from_millis(100), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(backend.candidates("leader"), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_yields_current_then_changes() {
        let backend = MemoryBackend::new();
        let a = backend.grant_lease(TTL).await.unwrap();
        let mut stream = backend.observe("leader").await.unwrap();
        assert_eq!(stream.next().await, Some(Ok(None)));

        let leader = backend.campaign("leader", "A", a.id).await.unwrap();
        assert_eq!(stream.next().await, Some(Ok(Some("A".to_owned()))));

        backend.resign(&leader).await.unwrap();
        assert_eq!(stream.next().await, Some(Ok(None)));
        assert_eq!(backend.observe_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let backend = MemoryBackend::new();
        backend.fail_next(BackendOp::Leader, BackendError::Timeout("1".into()));
        backend.fail_next(BackendOp::Leader, BackendError::Transport("2".into()));
        assert_eq!(
            backend.leader("x").await.unwrap_err(),
            BackendError::Timeout("1".into())
        );
        assert_eq!(
            backend.leader("x").await.unwrap_err(),
            BackendError::Transport("2".into())
        );
        assert_eq!(backend.leader("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_forced_loss_reports_error_on_keepalive() {
        let backend = MemoryBackend::new();
        let grant = backend.grant_lease(TTL).await.unwrap();
        backend.lock("lock/a", grant.id).await.unwrap();

        backend.force_lease_loss(grant.id, BackendError::WatchClosed("watch closed".into()));
        assert!(!backend.is_locked("lock/a"));
        assert_eq!(
            backend.keep_alive(grant.id).await.unwrap_err(),
            BackendError::WatchClosed("watch closed".into())
        );
    }
}
