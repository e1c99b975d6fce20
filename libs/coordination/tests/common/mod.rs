#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use coordination::{CoordinationClient, CoordinationConfig, CoordinationEvent, MemoryBackend};
use tokio::sync::broadcast;

/// Upper bound for any single wait in a scenario (virtual time).
pub const WAIT: Duration = Duration::from_secs(120);

pub static CONFIG: &str = r#"
lease:
  ttl: 5s
  reconnect_delay: 1s
lock:
  prefix: "app/"
  ttl: 1
"#;

pub fn config() -> CoordinationConfig {
    CoordinationConfig::parse_str(CONFIG).expect("test config is valid")
}

/// A client over `backend`, already connected.
pub async fn connected(backend: &MemoryBackend) -> CoordinationClient {
    let client = CoordinationClient::new(config(), Arc::new(backend.clone()));
    client.connect().await.expect("connect to memory backend");
    client
}

pub async fn next_event(rx: &mut broadcast::Receiver<CoordinationEvent>) -> CoordinationEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for coordination event")
        .expect("event channel closed")
}
