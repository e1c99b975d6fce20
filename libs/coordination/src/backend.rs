//! Backend interface for the coordination service and the fault-handling
//! [`Connection`] wrapped around it.
//!
//! `Backend` is the only seam to the outside world: lease grant, keepalive
//! and revoke, lease-bound named locks, and named elections. The managers
//! never talk to a backend directly; they go through a `Connection`, which
//! applies the per-host circuit breaker and the global retry policy.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use config::CoordinationConfig;

use crate::error::{BackendResult, CoordinationError, CoordinationResult};
use crate::policy::FaultHandling;

/// Backend-assigned lease identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(i64);

impl LeaseId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a successful lease grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    /// TTL the backend actually granted, which may differ from the request.
    pub ttl: Duration,
}

/// Ownership key of an acquired lock; handed back to `unlock`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(Vec<u8>);

impl LockKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Identity of an elected campaign; handed back to `resign`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderKey {
    pub election: String,
    pub key: Vec<u8>,
    pub revision: i64,
    pub lease: LeaseId,
}

/// Stream of leader changes for an election. `None` means the seat is empty.
pub type LeaderStream = BoxStream<'static, BackendResult<Option<String>>>;

/// Client handle to the coordination service.
///
/// Implementations map their transport errors onto
/// [`BackendError`](crate::error::BackendError) so the fault policies can
/// classify them.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug + 'static {
    /// Host the calls are issued against, keys the per-host breaker.
    fn host(&self) -> &str;

    /// Grant a lease with the requested TTL.
    async fn grant_lease(&self, ttl: Duration) -> BackendResult<LeaseGrant>;

    /// Renew a lease once. Returns the remaining TTL; zero means the
    /// backend no longer knows the lease.
    async fn keep_alive(&self, lease: LeaseId) -> BackendResult<Duration>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> BackendResult<()>;

    /// Acquire the named lock on behalf of `lease`, waiting while another
    /// lease holds it.
    async fn lock(&self, name: &str, lease: LeaseId) -> BackendResult<LockKey>;

    /// Release a lock acquired with [`Backend::lock`].
    async fn unlock(&self, key: &LockKey) -> BackendResult<()>;

    /// Enter the election as `candidate`, resolving once elected.
    async fn campaign(
        &self,
        election: &str,
        candidate: &str,
        lease: LeaseId,
    ) -> BackendResult<LeaderKey>;

    /// Give up leadership held under `leader`.
    async fn resign(&self, leader: &LeaderKey) -> BackendResult<()>;

    /// Current leader of the election, if any.
    async fn leader(&self, election: &str) -> BackendResult<Option<String>>;

    /// Watch leadership of the election. The stream yields the current
    /// leader first, then every change.
    async fn observe(&self, election: &str) -> BackendResult<LeaderStream>;

    /// Release transport resources.
    async fn close(&self);
}

/// Builds a backend when the client connects.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    async fn connect(&self, config: &CoordinationConfig) -> BackendResult<Arc<dyn Backend>>;
}

/// Slot holding the live connection; written only by the client.
pub(crate) type ConnectionSlot = Arc<RwLock<Option<Connection>>>;

/// Clone the live connection out of the slot or fail with `NotConnected`.
pub(crate) async fn current_connection(
    slot: &ConnectionSlot,
    context: &str,
) -> CoordinationResult<Connection> {
    slot.read()
        .await
        .clone()
        .ok_or_else(|| CoordinationError::NotConnected(format!("{context}: client not connected")))
}

/// A backend composed with the fault policies. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    backend: Arc<dyn Backend>,
    faults: FaultHandling,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(backend: Arc<dyn Backend>, faults: FaultHandling) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                backend,
                faults,
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn host(&self) -> &str {
        self.inner.backend.host()
    }

    pub fn faults(&self) -> &FaultHandling {
        &self.inner.faults
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Cancelled when the connection is closed.
    pub fn closed(&self) -> &CancellationToken {
        &self.inner.closed
    }

    fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    pub async fn grant_lease(&self, ttl: Duration) -> CoordinationResult<LeaseGrant> {
        let backend = self.backend();
        self.inner
            .faults
            .execute(self.host(), "grant_lease", &self.inner.closed, move || {
                backend.grant_lease(ttl)
            })
            .await
    }

    /// Single renewal, outside the retry policy: the keepalive loop owns
    /// its own tolerance for failures.
    pub async fn keep_alive(&self, lease: LeaseId) -> BackendResult<Duration> {
        self.backend().keep_alive(lease).await
    }

    pub async fn revoke_lease(&self, lease: LeaseId) -> CoordinationResult<()> {
        let backend = self.backend();
        self.inner
            .faults
            .execute(self.host(), "revoke_lease", &self.inner.closed, move || {
                backend.revoke_lease(lease)
            })
            .await
    }

    /// Single revoke, outside the breaker and the retry policy. Used when
    /// releasing leases that expire on their own anyway.
    pub async fn release_lease(&self, lease: LeaseId) -> BackendResult<()> {
        self.backend().revoke_lease(lease).await
    }

    /// Blocks while another holder owns `name`.
    pub async fn lock(&self, name: &str, lease: LeaseId) -> CoordinationResult<LockKey> {
        let backend = self.backend();
        self.inner
            .faults
            .execute_wait(self.host(), "lock", &self.inner.closed, move || {
                backend.lock(name, lease)
            })
            .await
    }

    pub async fn unlock(&self, key: &LockKey) -> CoordinationResult<()> {
        let backend = self.backend();
        self.inner
            .faults
            .execute(self.host(), "unlock", &self.inner.closed, move || {
                backend.unlock(key)
            })
            .await
    }

    /// Blocks until elected.
    pub async fn campaign(
        &self,
        election: &str,
        candidate: &str,
        lease: LeaseId,
    ) -> CoordinationResult<LeaderKey> {
        let backend = self.backend();
        self.inner
            .faults
            .execute_wait(self.host(), "campaign", &self.inner.closed, move || {
                backend.campaign(election, candidate, lease)
            })
            .await
    }

    pub async fn resign(&self, leader: &LeaderKey) -> CoordinationResult<()> {
        let backend = self.backend();
        self.inner
            .faults
            .execute(self.host(), "resign", &self.inner.closed, move || {
                backend.resign(leader)
            })
            .await
    }

    pub async fn leader(&self, election: &str) -> CoordinationResult<Option<String>> {
        let backend = self.backend();
        self.inner
            .faults
            .execute(self.host(), "leader", &self.inner.closed, move || {
                backend.leader(election)
            })
            .await
    }

    /// Open a leader watch, outside the retry policy: re-establishment is
    /// governed by the watch backoff.
    pub async fn observe(&self, election: &str) -> BackendResult<LeaderStream> {
        self.backend().observe(election).await
    }

    /// Cancel in-flight retries and release the backend.
    pub async fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        self.inner.backend.close().await;
        debug!(host = self.host(), "connection closed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
