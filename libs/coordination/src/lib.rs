//! # coordination
//!
//! Resilient client for an etcd-style lease / lock / election service.
//!
//! This library provides:
//! - **Session lease** with keepalive, loss detection and automatic
//!   reconnection ([`LeaseManager`]).
//! - **Distributed locks** around a critical section, released on every
//!   exit path ([`LockManager`]).
//! - **Leader election** with cancellable campaigns and a live leader
//!   observer ([`ElectionManager`], [`LeaderObserver`]).
//! - **Fault handling** on every backend call: a per-host circuit breaker,
//!   a global retry policy and a watch-reconnect backoff ([`policy`]).
//!
//! [`CoordinationClient`] composes all of the above over a [`Backend`]. The
//! in-process [`MemoryBackend`] is always available; the etcd backend is
//! behind the `etcd` feature.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backend;
pub mod client;
pub mod election;
pub mod error;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod event;
pub mod lease;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod policy;

pub use backend::{Backend, Connection, Connector, LeaderKey, LeaseGrant, LeaseId, LockKey};
pub use client::CoordinationClient;
pub use election::{ElectionManager, ElectionState, LeaderObserver, ObserverStatus};
pub use error::{BackendError, BackendResult, CoordinationError, CoordinationResult};
#[cfg(feature = "etcd")]
pub use etcd::{EtcdBackend, EtcdConnector};
pub use event::CoordinationEvent;
pub use lease::{Lease, LeaseManager};
pub use lock::{LockHandle, LockManager};
pub use memory::{BackendOp, MemoryBackend};
pub use policy::{CircuitBreaker, CircuitState, ExponentialBackoff, FaultHandling, RetryPolicy};

pub use config::CoordinationConfig;
pub use tokio_util::sync::CancellationToken;
