//! Configuration for the tether coordination client.
//!
//! The on-disk format lives in [`wire`]; [`CoordinationConfig`] is the
//! validated form handed to the client.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

pub use wire::BackendMode;

/// validated coordination config
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoordinationConfig {
    inner: wire::Config,
    path: Option<PathBuf>,
}

/// credentials for the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

impl CoordinationConfig {
    /// validate a wire config
    pub fn new(mut inner: wire::Config) -> Result<Self> {
        // "lock/" + "/" + key would otherwise produce an empty path segment
        let trimmed = inner.lock.prefix.trim_end_matches('/').to_owned();
        inner.lock.prefix = trimmed;
        validate(&inner)?;
        Ok(Self { inner, path: None })
    }

    /// attempts to decode the config as YAML (which also accepts JSON)
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::parse_str(s)
            .with_context(|| format!("invalid config at {}", &path.display()))?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config as YAML (which also accepts JSON)
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let inner: wire::Config = serde_yaml::from_str(s.as_ref())?;
        debug!(?inner);
        Self::new(inner)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn backend_mode(&self) -> BackendMode {
        self.inner.backend_mode
    }

    pub fn endpoints(&self) -> &[String] {
        &self.inner.endpoints
    }

    /// both username and password must be set for credentials to apply
    pub fn credentials(&self) -> Option<Credentials<'_>> {
        match (&self.inner.username, &self.inner.password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.inner.connect_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub fn connect_retry_max(&self) -> u32 {
        self.inner.connect_retry_max
    }

    /// session lease TTL, always a whole number of seconds >= 1
    pub fn lease_ttl(&self) -> Duration {
        self.inner.lease.ttl
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.inner.lease.reconnect_delay
    }

    /// lock namespace, without a trailing separator
    pub fn lock_prefix(&self) -> &str {
        &self.inner.lock.prefix
    }

    pub fn lock_ttl(&self) -> Duration {
        self.inner.lock.ttl
    }

    pub fn breaker(&self) -> wire::Breaker {
        self.inner.fault_handling.breaker
    }

    pub fn retry(&self) -> wire::Retry {
        self.inner.fault_handling.retry
    }

    pub fn watch_backoff(&self) -> wire::Backoff {
        self.inner.fault_handling.watch_backoff
    }

    pub fn wire(&self) -> &wire::Config {
        &self.inner
    }
}

fn validate(cfg: &wire::Config) -> Result<()> {
    if cfg.backend_mode == BackendMode::Etcd && cfg.endpoints.is_empty() {
        bail!("etcd backend mode requires at least one endpoint");
    }
    if cfg.username.is_some() != cfg.password.is_some() {
        bail!("'username' and 'password' must be set together");
    }
    if cfg.lease.ttl < Duration::from_secs(1) || cfg.lease.ttl.subsec_nanos() != 0 {
        bail!(
            "lease ttl must be a whole number of seconds >= 1s, got {:?}",
            cfg.lease.ttl
        );
    }
    if cfg.lock.ttl < Duration::from_secs(1) || cfg.lock.ttl.subsec_nanos() != 0 {
        bail!(
            "lock ttl must be a whole number of seconds >= 1s, got {:?}",
            cfg.lock.ttl
        );
    }
    if cfg.lock.prefix.is_empty() {
        bail!("lock prefix cannot be empty");
    }
    let faults = &cfg.fault_handling;
    if faults.breaker.threshold == 0 {
        bail!("breaker threshold must be at least 1");
    }
    if faults.retry.base_delay > faults.retry.max_delay {
        bail!("retry base_delay cannot exceed max_delay");
    }
    if faults.retry.max_attempts == Some(0) {
        bail!("retry max_attempts must be at least 1 when set");
    }
    if faults.watch_backoff.initial.is_zero() || faults.watch_backoff.initial > faults.watch_backoff.max
    {
        bail!("watch_backoff initial must be non-zero and no larger than max");
    }
    Ok(())
}
