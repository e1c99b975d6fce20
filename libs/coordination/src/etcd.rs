//! Backend over an etcd v3 cluster.
//!
//! Locks and elections use etcd's lock and election services, so their
//! keys are bound to leases server-side exactly as with the in-process
//! backend. Keepalives reuse one bidirectional stream per lease.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, Error as EtcdError, LeaseKeepAliveStream, LeaseKeeper, LockOptions,
    ObserveStream, ResignOptions,
};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use config::CoordinationConfig;

use crate::backend::{
    Backend, Connector, LeaderKey, LeaderStream, LeaseGrant, LeaseId, LockKey,
};
use crate::error::{BackendError, BackendResult};

// gRPC status codes, see `tonic::Code`
const CANCELLED: i32 = 1;
const INVALID_ARGUMENT: i32 = 3;
const DEADLINE_EXCEEDED: i32 = 4;
const NOT_FOUND: i32 = 5;
const PERMISSION_DENIED: i32 = 7;
const RESOURCE_EXHAUSTED: i32 = 8;
const FAILED_PRECONDITION: i32 = 9;
const ABORTED: i32 = 10;
const UNAVAILABLE: i32 = 14;
const UNAUTHENTICATED: i32 = 16;

/// Connects an [`EtcdBackend`] to the configured endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct EtcdConnector;

#[async_trait]
impl Connector for EtcdConnector {
    async fn connect(&self, config: &CoordinationConfig) -> BackendResult<Arc<dyn Backend>> {
        Ok(Arc::new(EtcdBackend::connect(config).await?))
    }
}

/// etcd clients plus the keepalive streams of the leases it renews.
pub struct EtcdBackend {
    /// unary calls, bounded by the request timeout
    client: Client,
    /// lock, campaign and observe, which wait on other holders without a
    /// deadline
    waiting: Client,
    host: String,
    keepers: Mutex<HashMap<LeaseId, (LeaseKeeper, LeaseKeepAliveStream)>>,
}

impl fmt::Debug for EtcdBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdBackend")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl EtcdBackend {
    pub async fn connect(config: &CoordinationConfig) -> BackendResult<Self> {
        let client = Self::connect_client(config, Some(config.request_timeout())).await?;
        let waiting = Self::connect_client(config, None).await?;
        let host = config.endpoints().join(",");
        info!(%host, "connected to etcd");
        Ok(Self {
            client,
            waiting,
            host,
            keepers: Mutex::new(HashMap::new()),
        })
    }

    async fn connect_client(
        config: &CoordinationConfig,
        request_timeout: Option<Duration>,
    ) -> BackendResult<Client> {
        let mut opts = ConnectOptions::new().with_connect_timeout(config.connect_timeout());
        if let Some(timeout) = request_timeout {
            opts = opts.with_timeout(timeout);
        }
        if let Some(creds) = config.credentials() {
            opts = opts.with_user(creds.username, creds.password);
        }
        Client::connect(config.endpoints(), Some(opts))
            .await
            .map_err(|err| map_error(err, None))
    }

    fn client(&self) -> Client {
        self.client.clone()
    }

    fn waiting_client(&self) -> Client {
        self.waiting.clone()
    }
}

/// etcd TTLs are whole seconds; round partial seconds up.
fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn leader_value(kv: Option<&etcd_client::KeyValue>) -> Option<String> {
    kv.map(|kv| String::from_utf8_lossy(kv.value()).into_owned())
}

/// Classify an etcd client error. `lease` names the lease the call was
/// about, for `NotFound` answers.
fn map_error(err: EtcdError, lease: Option<LeaseId>) -> BackendError {
    match err {
        EtcdError::GRpcStatus(status) => {
            let message = status.message().to_owned();
            match status.code() as i32 {
                CANCELLED => BackendError::Transport(message),
                DEADLINE_EXCEEDED => BackendError::Timeout(message),
                UNAVAILABLE if message.contains("leader") => BackendError::LeaderChanged(message),
                UNAVAILABLE | ABORTED | RESOURCE_EXHAUSTED => BackendError::Unavailable(message),
                PERMISSION_DENIED | UNAUTHENTICATED => BackendError::PermissionDenied(message),
                INVALID_ARGUMENT => BackendError::InvalidArgument(message),
                NOT_FOUND if message.contains("lease not found") => match lease {
                    Some(lease) => BackendError::LeaseNotFound(lease),
                    None => BackendError::Other(message),
                },
                _ => BackendError::Other(format!("{status}")),
            }
        }
        EtcdError::TransportError(err) => BackendError::Transport(err.to_string()),
        EtcdError::IoError(err) => BackendError::Transport(err.to_string()),
        EtcdError::LeaseKeepAliveError(msg) | EtcdError::WatchError(msg) => {
            BackendError::WatchClosed(msg)
        }
        EtcdError::InvalidArgs(msg) => BackendError::InvalidArgument(msg),
        other => BackendError::Other(other.to_string()),
    }
}

fn is_no_leader(err: &EtcdError) -> bool {
    matches!(
        err,
        EtcdError::GRpcStatus(status)
            if status.code() as i32 == FAILED_PRECONDITION
                && status.message().contains("no leader")
    )
}

#[async_trait]
impl Backend for EtcdBackend {
    fn host(&self) -> &str {
        &self.host
    }

    async fn grant_lease(&self, ttl: Duration) -> BackendResult<LeaseGrant> {
        let resp = self
            .client()
            .lease_grant(ttl_secs(ttl), None)
            .await
            .map_err(|err| map_error(err, None))?;
        Ok(LeaseGrant {
            id: LeaseId::new(resp.id()),
            ttl: Duration::from_secs(resp.ttl().max(0) as u64),
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> BackendResult<Duration> {
        let mut keepers = self.keepers.lock().await;
        if !keepers.contains_key(&lease) {
            let pair = self
                .client()
                .lease_keep_alive(lease.get())
                .await
                .map_err(|err| map_error(err, Some(lease)))?;
            keepers.insert(lease, pair);
        }
        let Some((keeper, stream)) = keepers.get_mut(&lease) else {
            return Err(BackendError::Other("keepalive stream missing".into()));
        };

        let renewed = match keeper.keep_alive().await {
            Ok(()) => stream.message().await,
            Err(err) => Err(err),
        };
        match renewed {
            Ok(Some(resp)) => Ok(Duration::from_secs(resp.ttl().max(0) as u64)),
            Ok(None) => {
                keepers.remove(&lease);
                Err(BackendError::WatchClosed("keepalive stream closed".into()))
            }
            Err(err) => {
                keepers.remove(&lease);
                Err(map_error(err, Some(lease)))
            }
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> BackendResult<()> {
        self.keepers.lock().await.remove(&lease);
        self.client()
            .lease_revoke(lease.get())
            .await
            .map_err(|err| map_error(err, Some(lease)))?;
        Ok(())
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> BackendResult<LockKey> {
        let resp = self
            .waiting_client()
            .lock(name, Some(LockOptions::new().with_lease(lease.get())))
            .await
            .map_err(|err| map_error(err, Some(lease)))?;
        Ok(LockKey::new(resp.key()))
    }

    async fn unlock(&self, key: &LockKey) -> BackendResult<()> {
        self.client()
            .unlock(key.as_bytes())
            .await
            .map_err(|err| map_error(err, None))?;
        Ok(())
    }

    async fn campaign(
        &self,
        election: &str,
        candidate: &str,
        lease: LeaseId,
    ) -> BackendResult<LeaderKey> {
        let resp = self
            .waiting_client()
            .campaign(election, candidate, lease.get())
            .await
            .map_err(|err| map_error(err, Some(lease)))?;
        let leader = resp
            .leader()
            .ok_or_else(|| BackendError::Other("campaign response without leader key".into()))?;
        Ok(LeaderKey {
            election: String::from_utf8_lossy(leader.name()).into_owned(),
            key: leader.key().to_vec(),
            revision: leader.rev(),
            lease: LeaseId::new(leader.lease()),
        })
    }

    async fn resign(&self, leader: &LeaderKey) -> BackendResult<()> {
        let key = etcd_client::LeaderKey::new()
            .with_name(leader.election.as_str())
            .with_key(leader.key.as_slice())
            .with_rev(leader.revision)
            .with_lease(leader.lease.get());
        self.client()
            .resign(Some(ResignOptions::new().with_leader(key)))
            .await
            .map_err(|err| map_error(err, Some(leader.lease)))?;
        Ok(())
    }

    async fn leader(&self, election: &str) -> BackendResult<Option<String>> {
        match self.client().leader(election).await {
            Ok(resp) => Ok(leader_value(resp.kv())),
            Err(err) if is_no_leader(&err) => Ok(None),
            Err(err) => Err(map_error(err, None)),
        }
    }

    /// etcd only reports elected leaders, so an emptied seat shows up as
    /// the next leader rather than `None`.
    async fn observe(&self, election: &str) -> BackendResult<LeaderStream> {
        let current = self.leader(election).await?;
        let stream = self
            .waiting_client()
            .observe(election)
            .await
            .map_err(|err| map_error(err, None))?;

        let initial = futures::stream::once(async move { Ok(current) });
        let changes = futures::stream::unfold(Some(stream), |state: Option<ObserveStream>| async move {
            let Some(mut stream) = state else {
                return None;
            };
            match stream.message().await {
                Ok(Some(resp)) => Some((Ok(leader_value(resp.kv())), Some(stream))),
                Ok(None) => None,
                // report the failure, then end the stream
                Err(err) => Some((Err(map_error(err, None)), None)),
            }
        });
        Ok(initial.chain(changes).boxed())
    }

    async fn close(&self) {
        let mut keepers = self.keepers.lock().await;
        debug!(host = %self.host, streams = keepers.len(), "closing etcd keepalive streams");
        keepers.clear();
    }
}
