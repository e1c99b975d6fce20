mod common;

use std::time::Duration;

use anyhow::Result;
use common::{connected, next_event};
use coordination::{
    BackendError, BackendOp, CoordinationClient, CoordinationConfig, CoordinationEvent,
    CoordinationError, MemoryBackend,
};
use tokio::time::Instant;
use tracing_test::traced_test;

#[tokio::test(start_paused = true)]
#[traced_test]
/// a 5s lease lost with "watch closed" is replaced after the 1s quiescence
/// delay, with exactly one reconnect notification
async fn test_lease_loss_reconnects() -> Result<()> {
    let backend = MemoryBackend::new();
    let client = connected(&backend).await;
    let mut events = client.subscribe();
    let lease = client.lease()?;
    assert_eq!(lease.ttl(), Duration::from_secs(5));

    let cause = BackendError::WatchClosed("watch closed".into());
    backend.force_lease_loss(lease.id(), cause.clone());

    let lost = next_event(&mut events).await;
    assert_eq!(
        lost,
        CoordinationEvent::LeaseLost {
            lease_id: lease.id(),
            cause: cause.clone(),
        }
    );
    let lost_at = Instant::now();

    match next_event(&mut events).await {
        CoordinationEvent::LeaseReconnect { lease: next, cause: reported } => {
            assert!(lost_at.elapsed() >= Duration::from_secs(1));
            assert_ne!(next.id(), lease.id());
            assert_eq!(reported, cause);
            assert_eq!(client.lease()?, next);
        }
        other => panic!("expected reconnect, got {other:?}"),
    }

    // exactly one notification
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(backend.live_leases(), 1);
    assert!(logs_contain("coordination client connected"));
    Ok(())
}

#[tokio::test(start_paused = true)]
/// repeated losses always end with exactly one live session lease
async fn test_repeated_losses_keep_one_lease() -> Result<()> {
    let backend = MemoryBackend::new();
    let client = connected(&backend).await;
    let mut events = client.subscribe();

    for round in 0..3 {
        let lease = client.lease()?;
        backend.force_lease_loss(lease.id(), BackendError::Transport(format!("reset {round}")));
        assert!(matches!(
            next_event(&mut events).await,
            CoordinationEvent::LeaseLost { .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            CoordinationEvent::LeaseReconnect { .. }
        ));
        assert_eq!(backend.live_leases(), 1);
        assert_ne!(client.lease()?.id(), lease.id());
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
/// the reconnect loop keeps re-granting until the backend accepts
async fn test_reconnect_survives_failed_grants() -> Result<()> {
    let backend = MemoryBackend::new();
    let client = connected(&backend).await;
    let mut events = client.subscribe();
    let lease = client.lease()?;

    for _ in 0..3 {
        backend.fail_next(BackendOp::Grant, BackendError::PermissionDenied("auth".into()));
    }
    backend.force_lease_loss(lease.id(), BackendError::PermissionDenied("auth".into()));

    next_event(&mut events).await;
    let reconnect = next_event(&mut events).await;
    assert!(matches!(reconnect, CoordinationEvent::LeaseReconnect { .. }));
    // initial grant, three rejected, one accepted
    assert_eq!(backend.grant_count(), 2);
    assert!(client.lease().is_ok());
    Ok(())
}

#[tokio::test(start_paused = true)]
/// a disconnect during reconnection stops it without notifying
async fn test_disconnect_during_reconnect() -> Result<()> {
    let backend = MemoryBackend::new();
    let client = connected(&backend).await;
    let mut events = client.subscribe();
    let lease = client.lease()?;

    backend.force_lease_loss(lease.id(), BackendError::PermissionDenied("revoked".into()));
    assert!(matches!(
        next_event(&mut events).await,
        CoordinationEvent::LeaseLost { .. }
    ));
    client.disconnect().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(backend.live_leases(), 0);
    assert!(client.lease().unwrap_err().is_not_connected());
    Ok(())
}

#[tokio::test(start_paused = true)]
#[traced_test]
/// the session lease comes back once the breaker for its host cools down
async fn test_reconnect_waits_out_open_breaker() -> Result<()> {
    let backend = MemoryBackend::new();
    let client = connected(&backend).await;
    let mut events = client.subscribe();
    let lease = client.lease()?;

    let election = client.election("leader");
    for _ in 0..3 {
        backend.fail_next(BackendOp::Leader, BackendError::Transport("reset".into()));
    }
    assert!(matches!(
        election.leader().await.unwrap_err(),
        CoordinationError::CircuitOpen { .. }
    ));
    let opened = Instant::now();

    backend.force_lease_loss(lease.id(), BackendError::PermissionDenied("revoked".into()));
    assert!(matches!(
        next_event(&mut events).await,
        CoordinationEvent::LeaseLost { .. }
    ));
    let CoordinationEvent::LeaseReconnect { lease: fresh, .. } = next_event(&mut events).await
    else {
        panic!("expected a reconnect event");
    };
    assert!(opened.elapsed() >= Duration::from_secs(5));
    assert!(logs_contain("lease re-grant failed"));
    assert!(backend.is_lease_alive(fresh.id()));
    assert_eq!(client.lease()?, fresh);
    assert_eq!(election.leader().await?, None);
    Ok(())
}

#[tokio::test]
/// every operation fails fast before connect
async fn test_not_connected_before_connect() -> Result<()> {
    let client = CoordinationClient::new(
        CoordinationConfig::default(),
        std::sync::Arc::new(MemoryBackend::new()),
    );
    let err = client
        .with_lock("jobs/1", |_| async { Ok::<_, CoordinationError>(()) })
        .await
        .unwrap_err();
    assert!(err.is_not_connected());
    assert!(client.lease().unwrap_err().is_not_connected());
    assert!(
        client
            .election("leader")
            .campaign("A", None)
            .await
            .unwrap_err()
            .is_not_connected()
    );
    Ok(())
}
