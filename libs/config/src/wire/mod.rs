use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// default etcd endpoint
pub static DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
/// default namespace for lock names
pub static DEFAULT_LOCK_PREFIX: &str = "lock";

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub backend_mode: BackendMode,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub request_timeout: Duration,
    #[serde(default = "default_connect_retry_max")]
    pub connect_retry_max: u32,
    #[serde(default)]
    pub lease: Lease,
    #[serde(default)]
    pub lock: Lock,
    #[serde(default)]
    pub fault_handling: FaultHandling,
}

/// Which backend the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// in-process backend, single node
    #[default]
    Standalone,
    /// etcd v3 cluster
    Etcd,
}

/// session lease settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Lease {
    #[serde(
        default = "default_lease_ttl",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub ttl: Duration,
    /// pause before re-granting a lost lease
    #[serde(
        default = "default_reconnect_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Lock {
    #[serde(default = "default_lock_prefix")]
    pub prefix: String,
    #[serde(
        default = "default_lock_ttl",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct FaultHandling {
    #[serde(default)]
    pub breaker: Breaker,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub watch_backoff: Backoff,
}

/// per-host circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Breaker {
    /// consecutive recoverable failures before the breaker opens
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(
        default = "default_breaker_cool_down",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub cool_down: Duration,
}

/// global retry policy, `max_attempts: None` retries until cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Retry {
    #[serde(
        default = "default_retry_base_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub base_delay: Duration,
    #[serde(
        default = "default_retry_max_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_delay: Duration,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// watch re-establishment backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Backoff {
    #[serde(
        default = "default_backoff_initial",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub initial: Duration,
    #[serde(
        default = "default_backoff_max",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max: Duration,
}

pub fn default_endpoints() -> Vec<String> {
    vec![DEFAULT_ENDPOINT.to_owned()]
}

pub const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_request_timeout() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_connect_retry_max() -> u32 {
    2
}

pub const fn default_lease_ttl() -> Duration {
    Duration::from_secs(10)
}

pub const fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

pub fn default_lock_prefix() -> String {
    DEFAULT_LOCK_PREFIX.to_owned()
}

pub const fn default_lock_ttl() -> Duration {
    Duration::from_secs(1)
}

pub const fn default_breaker_threshold() -> u32 {
    3
}

pub const fn default_breaker_cool_down() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_retry_base_delay() -> Duration {
    Duration::from_millis(50)
}

pub const fn default_retry_max_delay() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_backoff_initial() -> Duration {
    Duration::from_millis(128)
}

pub const fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_mode: BackendMode::default(),
            endpoints: default_endpoints(),
            username: None,
            password: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            connect_retry_max: default_connect_retry_max(),
            lease: Lease::default(),
            lock: Lock::default(),
            fault_handling: FaultHandling::default(),
        }
    }
}

impl Default for Lease {
    fn default() -> Self {
        Self {
            ttl: default_lease_ttl(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self {
            prefix: default_lock_prefix(),
            ttl: default_lock_ttl(),
        }
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            cool_down: default_breaker_cool_down(),
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            base_delay: default_retry_base_delay(),
            max_delay: default_retry_max_delay(),
            max_attempts: None,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: default_backoff_initial(),
            max: default_backoff_max(),
        }
    }
}

/// Parse a duration string with optional time units
/// Accepts: "5", "5s", "500ms", "2m", "1h"
/// If no unit is specified, assumes seconds
pub(crate) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::Error::msg("empty duration string"));
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis_per_unit = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match WireDuration::deserialize(de)? {
        WireDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        WireDuration::String(s) => parse_duration(&s).map_err(de::Error::custom),
    }
}

fn serialize_duration<S>(dur: &Duration, ser: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if dur.subsec_millis() == 0 {
        ser.serialize_str(&format!("{}s", dur.as_secs()))
    } else {
        ser.serialize_str(&format!("{}ms", dur.as_millis()))
    }
}
