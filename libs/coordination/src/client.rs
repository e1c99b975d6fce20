//! Composition root: owns the connection and the managers built on it.
//!
//! `connect` establishes the backend connection (retrying with exponential
//! delay), starts the lease session and grants the initial session lease
//! before returning. `disconnect` tears all of that down in reverse.
//! Every operation issued while disconnected fails fast with
//! `NotConnected`.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use config::{CoordinationConfig, wire::BackendMode};

use crate::backend::{Connection, ConnectionSlot, Connector};
use crate::election::ElectionManager;
use crate::error::{BackendError, CoordinationError, CoordinationResult};
use crate::event::{CoordinationEvent, EventSender};
use crate::lease::{Lease, LeaseManager};
use crate::lock::{LockHandle, LockManager};
use crate::memory::MemoryBackend;
use crate::policy::{ExponentialBackoff, FaultHandling};

/// Base delay for retrying the initial backend connection.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for the initial connection retry delay.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Resilient lease / lock / election client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CoordinationClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    config: CoordinationConfig,
    connector: Arc<dyn Connector>,
    slot: ConnectionSlot,
    events: EventSender,
    lease: LeaseManager,
    locks: LockManager,
    elections: Mutex<HashMap<String, ElectionManager>>,
    /// serializes connect and disconnect
    lifecycle: tokio::sync::Mutex<()>,
}

impl CoordinationClient {
    /// Create a client that builds its backend with `connector`. Nothing
    /// is contacted until [`connect`](Self::connect).
    pub fn new(config: CoordinationConfig, connector: Arc<dyn Connector>) -> Self {
        let slot: ConnectionSlot = Arc::new(RwLock::new(None));
        let events = EventSender::new();
        let lease = LeaseManager::new(
            slot.clone(),
            config.lease_ttl(),
            config.reconnect_delay(),
            events.clone(),
        );
        let locks = LockManager::new(
            slot.clone(),
            lease.clone(),
            config.lock_prefix(),
            config.lock_ttl(),
        );
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                slot,
                events,
                lease,
                locks,
                elections: Mutex::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a client for the backend selected by `backend_mode`.
    pub fn from_config(config: CoordinationConfig) -> CoordinationResult<Self> {
        match config.backend_mode() {
            BackendMode::Standalone => Ok(Self::new(config, Arc::new(MemoryBackend::new()))),
            #[cfg(feature = "etcd")]
            BackendMode::Etcd => Ok(Self::new(config, Arc::new(crate::etcd::EtcdConnector))),
            #[cfg(not(feature = "etcd"))]
            BackendMode::Etcd => Err(CoordinationError::Config(
                "etcd backend mode requires the `etcd` feature".into(),
            )),
        }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.inner.config
    }

    /// Connect to the backend and grant the initial session lease.
    ///
    /// The backend connection is attempted `connect_retry_max + 1` times
    /// with exponential delay. A no-op when already connected.
    pub async fn connect(&self) -> CoordinationResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.slot.read().await.is_some() {
            debug!("coordination client already connected, skipping connect");
            return Ok(());
        }

        let config = &self.inner.config;
        info!(
            backend_mode = ?config.backend_mode(),
            endpoints = ?config.endpoints(),
            connect_retry_max = config.connect_retry_max(),
            "connecting to coordination service"
        );

        let backend = self.connect_backend().await?;
        let conn = Connection::new(backend, FaultHandling::from_config(config));
        let host = conn.host().to_owned();
        *self.inner.slot.write().await = Some(conn);

        self.inner.lease.start_session();
        if let Err(err) = self.inner.lease.grant_lease().await {
            error!(%host, error = %err, "failed to grant initial session lease");
            self.teardown().await;
            return Err(err);
        }
        info!(%host, "coordination client connected");
        Ok(())
    }

    async fn connect_backend(&self) -> CoordinationResult<Arc<dyn crate::backend::Backend>> {
        let config = &self.inner.config;
        let total_attempts = config.connect_retry_max().saturating_add(1);
        let mut backoff = ExponentialBackoff::new(CONNECT_RETRY_BASE_DELAY, MAX_CONNECT_RETRY_DELAY);
        let mut attempt = 0u32;
        loop {
            let err = match tokio::time::timeout(
                config.connect_timeout(),
                self.inner.connector.connect(config),
            )
            .await
            {
                Ok(Ok(backend)) => {
                    info!(
                        attempt = attempt + 1,
                        total_attempts,
                        host = backend.host(),
                        "backend connection established"
                    );
                    return Ok(backend);
                }
                Ok(Err(err)) => err,
                Err(_) => BackendError::Timeout(format!(
                    "connect did not complete within {:?}",
                    config.connect_timeout()
                )),
            };

            attempt += 1;
            if attempt >= total_attempts || !err.is_recoverable() {
                error!(
                    attempts = attempt,
                    error = %err,
                    "backend connection failed"
                );
                return Err(err.into());
            }
            let delay = backoff.next_delay();
            warn!(
                attempt,
                total_attempts,
                retry_in_ms = delay.as_millis(),
                error = %err,
                "backend connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Revoke the session lease, stop observers and campaigns, and close
    /// the connection. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.teardown().await;
    }

    async fn teardown(&self) {
        let elections: Vec<ElectionManager> =
            self.inner.elections.lock().values().cloned().collect();
        for election in elections {
            election.shutdown();
        }
        self.inner.lease.disconnect().await;
        let conn = self.inner.slot.write().await.take();
        if let Some(conn) = conn {
            conn.close().await;
            info!(host = conn.host(), "coordination client disconnected");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.slot.read().await.is_some()
    }

    /// Current session lease.
    pub fn lease(&self) -> CoordinationResult<Lease> {
        self.inner.lease.current()
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.inner.lease
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Run `critical` under the lock `prefix/key` with the default TTL.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, critical: F) -> Result<T, E>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordinationError>,
    {
        self.inner.locks.with_lock(key, critical).await
    }

    /// Run `critical` under the lock `prefix/key` held with `ttl`.
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
        self.inner.locks.with_lock_ttl(key, ttl, critical).await
    }

    /// The manager for the named election; one per name per client.
    pub fn election(&self, name: &str) -> ElectionManager {
        self.inner
            .elections
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| {
                ElectionManager::new(name, self.inner.slot.clone(), self.inner.lease.clone())
            })
            .clone()
    }

    /// Subscribe to lease loss and reconnect notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.inner.events.subscribe()
    }
}
