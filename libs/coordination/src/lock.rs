//! Named distributed locks around a critical section.
//!
//! Each acquisition grants its own lock lease with the requested TTL and
//! binds the lock to it, so a crashed holder frees the lock once the TTL
//! runs out. The lock is released when the critical section returns,
//! whatever it returns. If the critical section panics or its future is
//! dropped, the release runs on a spawned task instead.

use std::{future::Future, time::Duration};

use tracing::{debug, trace, warn};

use crate::backend::{Connection, ConnectionSlot, LeaseId, LockKey, current_connection};
use crate::error::{BackendError, CoordinationError, CoordinationResult};
use crate::lease::LeaseManager;
use crate::metrics;

/// Smallest TTL the backend can hold a lease for.
const MIN_LOCK_TTL: Duration = Duration::from_secs(1);

/// Runs critical sections under named locks. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LockManager {
    slot: ConnectionSlot,
    lease: LeaseManager,
    prefix: String,
    default_ttl: Duration,
}

/// An acquired lock, handed to the critical section.
#[derive(Debug, Clone)]
pub struct LockHandle {
    name: String,
    key: LockKey,
    lease: LeaseId,
    ttl: Duration,
    conn: Connection,
}

impl LockHandle {
    /// Full lock name, `prefix/key`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ownership key returned by the backend.
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Lease the lock is bound to.
    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Extend the lock lease by one TTL. The lock is not renewed
    /// automatically; long critical sections call this themselves.
    pub async fn keep_alive(&self) -> CoordinationResult<Duration> {
        let ttl = self.conn.keep_alive(self.lease).await?;
        if ttl.is_zero() {
            return Err(BackendError::LeaseExpired(self.lease).into());
        }
        trace!(lock = %self.name, ttl_secs = ttl.as_secs(), "lock lease extended");
        Ok(ttl)
    }
}

impl LockManager {
    pub(crate) fn new(
        slot: ConnectionSlot,
        lease: LeaseManager,
        prefix: impl Into<String>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            slot,
            lease,
            prefix: prefix.into(),
            default_ttl,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Lock name for `key` under the configured prefix.
    pub fn lock_name(&self, key: &str) -> CoordinationResult<String> {
        if key.is_empty() {
            return Err(BackendError::InvalidArgument("lock key must not be empty".into()).into());
        }
        Ok(format!("{}/{key}", self.prefix.trim_end_matches('/')))
    }

    /// [`with_lock_ttl`](Self::with_lock_ttl) with the configured default TTL.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, critical: F) -> Result<T, E>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordinationError>,
    {
        self.with_lock_ttl(key, self.default_ttl, critical).await
    }

    /// Acquire `prefix/key`, waiting while another holder has it, and run
    /// `critical` while holding it. Fails fast with `NotConnected` while the
    /// session has no lease.
    ///
    /// The critical section's result is returned unchanged. Failing to
    /// release is logged and never replaces that result; the TTL bounds
    /// how long a stuck lock survives.
    pub async fn with_lock_ttl<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        critical: F,
    ) -> Result<T, E>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordinationError>,
    {
        let conn = current_connection(&self.slot, "with_lock").await?;
        let session = self.lease.current()?;
        let name = self.lock_name(key)?;
        if ttl < MIN_LOCK_TTL {
            return Err(CoordinationError::from(BackendError::InvalidArgument(format!(
                "lock ttl must be at least 1s, got {ttl:?}"
            )))
            .into());
        }

        let grant = conn.grant_lease(ttl).await?;
        let mut guard = ReleaseGuard {
            release: Some(Release {
                conn: conn.clone(),
                name: name.clone(),
                lease: grant.id,
                key: None,
            }),
        };

        let key = match conn.lock(&name, grant.id).await {
            Ok(key) => key,
            Err(err) => {
                guard.release().await;
                return Err(err.into());
            }
        };
        guard.acquired(key.clone());
        metrics::LOCK_ACQUIRED.inc();
        debug!(
            lock = %name,
            lease_id = %grant.id,
            session_lease_id = %session.id(),
            ttl_ms = ttl.as_millis(),
            "lock acquired"
        );

        let handle = LockHandle {
            name,
            key,
            lease: grant.id,
            ttl: grant.ttl,
            conn,
        };
        let result = critical(handle).await;
        guard.release().await;
        result
    }
}

/// Work needed to give a lock back.
struct Release {
    conn: Connection,
    name: String,
    lease: LeaseId,
    /// set once the lock is held
    key: Option<LockKey>,
}

impl Release {
    async fn run(self) {
        if let Some(key) = &self.key {
            metrics::LOCK_HELD.dec();
            if let Err(err) = self.conn.unlock(key).await {
                metrics::LOCK_RELEASE_ERRORS.inc();
                warn!(lock = %self.name, error = %err, "failed to release lock, it expires with its lease");
            }
        }
        // the lease only ever carried this lock; revoked outside the breaker
        if let Err(err) = self.conn.release_lease(self.lease).await {
            debug!(lock = %self.name, lease_id = %self.lease, error = %err, "lock lease not revoked");
        }
        trace!(lock = %self.name, "lock released");
    }
}

/// Releases exactly once: inline through [`ReleaseGuard::release`], or from
/// a spawned task when dropped armed.
struct ReleaseGuard {
    release: Option<Release>,
}

impl ReleaseGuard {
    fn acquired(&mut self, key: LockKey) {
        if let Some(release) = self.release.as_mut() {
            release.key = Some(key);
            metrics::LOCK_HELD.inc();
        }
    }

    async fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release.run().await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(lock = %release.name, "critical section abandoned, releasing in background");
                handle.spawn(release.run());
            }
            Err(_) => {
                metrics::LOCK_RELEASE_ERRORS.inc();
                warn!(lock = %release.name, "no runtime to release lock, it expires with its lease");
            }
        }
    }
}
