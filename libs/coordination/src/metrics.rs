//! Coordination client metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered with the default prometheus registry. Registration failures
//! are fatal (`.unwrap()`): they only happen on duplicate metric names.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    // --- session lease ---

    /// Count of session leases granted (initial grants and re-grants)
    pub static ref LEASE_GRANTED: IntCounter = register_int_counter!(
        "coordination_lease_granted",
        "count of session leases granted"
    ).unwrap();

    /// Count of session leases reported lost by the keepalive
    pub static ref LEASE_LOST: IntCounter = register_int_counter!(
        "coordination_lease_lost",
        "count of session leases lost"
    ).unwrap();

    /// Count of completed lease reconnections
    pub static ref LEASE_RECONNECTED: IntCounter = register_int_counter!(
        "coordination_lease_reconnected",
        "count of session leases re-established after loss"
    ).unwrap();

    /// Count of failed grant attempts inside the reconnect loop
    pub static ref LEASE_RECONNECT_FAILURES: IntCounter = register_int_counter!(
        "coordination_lease_reconnect_failures",
        "count of failed lease grant attempts while reconnecting"
    ).unwrap();

    // --- locks ---

    /// Count of locks acquired
    pub static ref LOCK_ACQUIRED: IntCounter = register_int_counter!(
        "coordination_lock_acquired",
        "count of distributed locks acquired"
    ).unwrap();

    /// Count of lock releases that failed (the lock TTL bounds the hold)
    pub static ref LOCK_RELEASE_ERRORS: IntCounter = register_int_counter!(
        "coordination_lock_release_errors",
        "count of distributed lock releases that failed"
    ).unwrap();

    /// Number of critical sections currently running
    pub static ref LOCK_HELD: IntGauge = register_int_gauge!(
        "coordination_lock_held",
        "number of distributed locks currently held by this process"
    ).unwrap();

    // --- elections ---

    /// Count of campaigns that ended with this process elected
    pub static ref ELECTION_WON: IntCounter = register_int_counter!(
        "coordination_election_won",
        "count of campaigns won"
    ).unwrap();

    /// Count of campaigns aborted by cancellation
    pub static ref ELECTION_ABORTED: IntCounter = register_int_counter!(
        "coordination_election_aborted",
        "count of campaigns aborted by cancellation"
    ).unwrap();

    /// Count of leader observation watch restarts
    pub static ref WATCH_RESTARTS: IntCounter = register_int_counter!(
        "coordination_watch_restarts",
        "count of leader observation watch re-establishments"
    ).unwrap();

    // --- fault handling ---

    /// Count of circuit breaker transitions to open
    pub static ref CIRCUIT_OPENED: IntCounter = register_int_counter!(
        "coordination_circuit_opened",
        "count of per-host circuit breaker openings"
    ).unwrap();
}
