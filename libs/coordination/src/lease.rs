//! Session lease lifecycle.
//!
//! The [`LeaseManager`] owns the single renewable lease of a client session.
//! Each granted lease gets its own keepalive task; when that task gives up
//! it reports a [`LeaseLoss`] to the session supervisor, which publishes
//! [`CoordinationEvent::LeaseLost`] and drives [`LeaseManager::reconnect`]
//! until a replacement is granted or the session ends.
//!
//! Two retry layers are involved: every grant goes through the connection's
//! retry policy, and the reconnect loop re-issues whole grants after a
//! quiescence delay when that is not enough.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{Connection, ConnectionSlot, LeaseId, current_connection};
use crate::error::{BackendError, CoordinationError, CoordinationResult};
use crate::event::{CoordinationEvent, EventSender};
use crate::metrics;

/// Floor for the keepalive interval.
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// A granted session lease. Replaced wholesale on reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    id: LeaseId,
    ttl: Duration,
    granted_at: Instant,
}

impl Lease {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// TTL granted by the backend.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }
}

/// Report sent by a keepalive task that gave up on its lease.
#[derive(Debug, Clone)]
pub(crate) struct LeaseLoss {
    pub(crate) lease: Lease,
    pub(crate) error: BackendError,
}

/// Owns the session lease. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    inner: Arc<LeaseInner>,
}

#[derive(Debug)]
struct LeaseInner {
    slot: ConnectionSlot,
    ttl: Duration,
    reconnect_delay: Duration,
    events: EventSender,
    current: RwLock<Option<ActiveLease>>,
    session: Mutex<Option<Session>>,
    reconnecting: AtomicBool,
}

#[derive(Debug)]
struct ActiveLease {
    lease: Lease,
    /// stops the lease's keepalive task
    stop: CancellationToken,
}

#[derive(Debug, Clone)]
struct Session {
    shutdown: CancellationToken,
    losses: mpsc::UnboundedSender<LeaseLoss>,
}

/// Clears the reconnecting flag when the reconnect attempt ends.
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl LeaseManager {
    pub(crate) fn new(
        slot: ConnectionSlot,
        ttl: Duration,
        reconnect_delay: Duration,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                slot,
                ttl,
                reconnect_delay,
                events,
                current: RwLock::new(None),
                session: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// Start the loss supervisor for a new session. No-op if one is running.
    pub(crate) fn start_session(&self) {
        let mut session = self.inner.session.lock();
        if session.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let (losses, rx) = mpsc::unbounded_channel();
        *session = Some(Session {
            shutdown: shutdown.clone(),
            losses,
        });
        drop(session);

        tokio::spawn(self.clone().supervise(shutdown, rx));
        debug!("lease session started");
    }

    fn session(&self) -> Option<Session> {
        self.inner.session.lock().clone()
    }

    /// The current lease, or `NotConnected` if there is none.
    pub fn current(&self) -> CoordinationResult<Lease> {
        self.inner
            .current
            .read()
            .as_ref()
            .map(|active| active.lease)
            .ok_or_else(|| CoordinationError::NotConnected("no active lease".into()))
    }

    /// Returns true while a reconnect loop is running.
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    /// Grant a fresh session lease and start keeping it alive.
    ///
    /// The previous lease, if any, is retired first: its keepalive is
    /// stopped and it is revoked best-effort.
    pub async fn grant_lease(&self) -> CoordinationResult<Lease> {
        let conn = current_connection(&self.inner.slot, "grant_lease").await?;
        let session = self
            .session()
            .ok_or_else(|| CoordinationError::NotConnected("lease session not started".into()))?;

        let previous = self.inner.current.write().take();
        if let Some(previous) = previous {
            self.retire(&conn, previous).await;
        }

        let grant = conn.grant_lease(self.inner.ttl).await?;
        let lease = Lease {
            id: grant.id,
            ttl: grant.ttl,
            granted_at: Instant::now(),
        };

        let stop = session.shutdown.child_token();
        // checked under the write lock so a racing disconnect either sees
        // this lease or is seen here
        let stored = {
            let mut current = self.inner.current.write();
            if session.shutdown.is_cancelled() {
                None
            } else {
                Some(current.replace(ActiveLease {
                    lease,
                    stop: stop.clone(),
                }))
            }
        };
        let Some(displaced) = stored else {
            debug!(lease_id = %lease.id, "disconnected during grant, revoking fresh lease");
            if let Err(err) = conn.revoke_lease(lease.id).await {
                debug!(lease_id = %lease.id, error = %err, "fresh lease left to expire");
            }
            return Err(CoordinationError::NotConnected(
                "disconnected while granting lease".into(),
            ));
        };
        // a concurrent grant finished first
        if let Some(displaced) = displaced {
            self.retire(&conn, displaced).await;
        }

        tokio::spawn(keep_alive(conn, lease, stop, session.losses));
        metrics::LEASE_GRANTED.inc();
        info!(
            lease_id = %lease.id,
            ttl_secs = lease.ttl.as_secs(),
            "session lease granted"
        );
        Ok(lease)
    }

    async fn retire(&self, conn: &Connection, active: ActiveLease) {
        active.stop.cancel();
        match conn.revoke_lease(active.lease.id).await {
            Ok(()) => debug!(lease_id = %active.lease.id, "previous lease revoked"),
            Err(err) => debug!(
                lease_id = %active.lease.id,
                error = %err,
                "could not revoke previous lease, leaving it to expire"
            ),
        }
    }

    /// Re-establish the session lease after `cause` took the old one.
    ///
    /// Waits the quiescence delay, then grants; failures repeat the cycle
    /// until a lease is granted or the session shuts down. Exactly one
    /// [`CoordinationEvent::LeaseReconnect`] is published on success. A
    /// call made while another reconnect is running returns immediately.
    pub async fn reconnect(&self, cause: BackendError) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            debug!(error = %cause, "reconnect already in progress");
            return;
        }
        let _guard = ReconnectGuard(&self.inner.reconnecting);

        let Some(session) = self.session() else {
            debug!("no lease session, skipping reconnect");
            return;
        };
        let shutdown = session.shutdown;
        let mut attempts = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("session shut down, reconnect abandoned");
                    return;
                }
                _ = tokio::time::sleep(self.inner.reconnect_delay) => {}
            }
            attempts = attempts.saturating_add(1);

            match self.grant_lease().await {
                Ok(lease) => {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    metrics::LEASE_RECONNECTED.inc();
                    info!(
                        lease_id = %lease.id,
                        attempts,
                        cause = %cause,
                        "session lease re-established"
                    );
                    self.inner.events.emit(CoordinationEvent::LeaseReconnect {
                        lease,
                        cause: cause.clone(),
                    });
                    return;
                }
                Err(_) if shutdown.is_cancelled() => return,
                Err(err) => {
                    metrics::LEASE_RECONNECT_FAILURES.inc();
                    warn!(
                        attempts,
                        error = %err,
                        cause = %cause,
                        retry_in_ms = self.inner.reconnect_delay.as_millis(),
                        "lease re-grant failed"
                    );
                }
            }
        }
    }

    /// Stop the session, stop the keepalive and revoke the current lease.
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.shutdown.cancel();
        }

        let active = self.inner.current.write().take();
        let Some(active) = active else {
            return;
        };
        active.stop.cancel();
        match current_connection(&self.inner.slot, "revoke_lease").await {
            Ok(conn) => match conn.revoke_lease(active.lease.id).await {
                Ok(()) => info!(lease_id = %active.lease.id, "session lease revoked"),
                Err(err) => warn!(
                    lease_id = %active.lease.id,
                    error = %err,
                    "failed to revoke session lease"
                ),
            },
            Err(err) => debug!(error = %err, "no connection to revoke session lease"),
        }
    }

    /// Serializes loss handling for one session.
    async fn supervise(self, shutdown: CancellationToken, mut losses: mpsc::UnboundedReceiver<LeaseLoss>) {
        loop {
            let loss = tokio::select! {
                _ = shutdown.cancelled() => break,
                loss = losses.recv() => match loss {
                    Some(loss) => loss,
                    None => break,
                },
            };
            self.handle_loss(loss).await;
        }
        trace!("lease supervisor stopped");
    }

    async fn handle_loss(&self, loss: LeaseLoss) {
        {
            let mut current = self.inner.current.write();
            let is_current = current
                .as_ref()
                .is_some_and(|active| active.lease.id == loss.lease.id);
            if !is_current {
                debug!(lease_id = %loss.lease.id, "ignoring loss of stale lease");
                return;
            }
            if let Some(active) = current.take() {
                active.stop.cancel();
            }
        }

        metrics::LEASE_LOST.inc();
        error!(
            lease_id = %loss.lease.id,
            error = %loss.error,
            "session lease lost"
        );
        self.inner.events.emit(CoordinationEvent::LeaseLost {
            lease_id: loss.lease.id,
            cause: loss.error.clone(),
        });
        self.reconnect(loss.error).await;
    }
}

/// Renews `lease` every ttl/3 until stopped or until the lease is lost.
///
/// Recoverable failures are tolerated while the lease could still be alive
/// on the backend; past its deadline the loss is reported with the first
/// error of the failure run.
async fn keep_alive(
    conn: Connection,
    lease: Lease,
    stop: CancellationToken,
    losses: mpsc::UnboundedSender<LeaseLoss>,
) {
    let interval = (lease.ttl / 3).max(MIN_KEEPALIVE_INTERVAL);
    let mut deadline = Instant::now() + lease.ttl;
    let mut first_error: Option<BackendError> = None;

    let error = loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = conn.closed().cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let renewed = tokio::select! {
            _ = stop.cancelled() => return,
            renewed = conn.keep_alive(lease.id) => renewed,
        };

        match renewed {
            Ok(ttl) if ttl.is_zero() => break BackendError::LeaseExpired(lease.id),
            Ok(ttl) => {
                deadline = Instant::now() + ttl;
                if first_error.take().is_some() {
                    info!(lease_id = %lease.id, "keepalive recovered");
                }
                trace!(lease_id = %lease.id, "lease renewed");
            }
            Err(err) if err.is_recoverable() => {
                let first = first_error.get_or_insert_with(|| err.clone());
                if Instant::now() >= deadline {
                    break first.clone();
                }
                warn!(lease_id = %lease.id, error = %err, "keepalive failed, lease still within ttl");
            }
            Err(err) => break err,
        }
    };

    if stop.is_cancelled() {
        return;
    }
    if losses.send(LeaseLoss { lease, error }).is_err() {
        debug!(lease_id = %lease.id, "lease lost after session ended");
    }
}
