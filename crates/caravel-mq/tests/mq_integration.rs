//! End-to-end tests for the MQ runtime over a mock relay transport.
//!
//! The mock records every `/send` and `/ack` call and can be switched
//! to fail sends; relay push events are injected through the channel
//! that `MqClient::spawn_with` accepts in place of the HTTP stream.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use caravel_mq::{
    AckRequest, MqClient, MqConfig, MqError, MqHandle, RelayEvent, RelayTransport, SendRequest,
    SendStatus, WireMessage,
};

// ── Mock transport ────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct MockRelay {
    sent: Arc<Mutex<Vec<SendRequest>>>,
    acks: Arc<Mutex<Vec<AckRequest>>>,
    fail_sends: Arc<AtomicBool>,
}

impl MockRelay {
    fn new() -> Self {
        Self::default()
    }

    fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().unwrap().clone()
    }

    fn acks(&self) -> Vec<AckRequest> {
        self.acks.lock().unwrap().clone()
    }

    fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RelayTransport for MockRelay {
    async fn send_once(&self, request: &SendRequest) -> Result<(), MqError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(MqError::RelayStatus { status: 503 });
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn acknowledge(&self, ack: &AckRequest) -> Result<(), MqError> {
        self.acks.lock().unwrap().push(ack.clone());
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

fn spawn_client(config: MqConfig) -> (MqHandle, MockRelay, mpsc::Sender<RelayEvent>) {
    let mock = MockRelay::new();
    let (event_tx, event_rx) = mpsc::channel(64);
    let handle = MqClient::spawn_with(config, mock.clone(), event_rx);
    (handle, mock, event_tx)
}

fn test_config() -> MqConfig {
    MqConfig::new().memory_only()
}

fn message(from: &str, seq: u64, topic: &str, payload: serde_json::Value) -> RelayEvent {
    RelayEvent::Message {
        from: from.to_string(),
        msg: WireMessage {
            id: format!("{from}-{seq}"),
            seq,
            topic: topic.to_string(),
            payload,
        },
    }
}

/// Poll until `check` passes or a 3s deadline expires.
async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Send / delivery confirmation ──────────────────────────────────────

#[tokio::test]
async fn delivered_event_removes_outbox_entry() {
    init_tracing();
    let (handle, mock, events) = spawn_client(test_config());

    let receipt = handle
        .send("peerA", "chat", json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(receipt.status, SendStatus::InFlight);

    // The relay accepted the hand-off, but the entry must survive
    // until an explicit delivery confirmation arrives.
    wait_until("send to reach the relay", || {
        let mock = mock.clone();
        async move { mock.sent().len() == 1 }
    })
    .await;
    let outbox = handle.outbox_entries().await.unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].id, receipt.message_id);
    assert_eq!(outbox[0].attempts, 1);

    events
        .send(RelayEvent::Delivered {
            msg_id: receipt.message_id.clone(),
        })
        .await
        .unwrap();

    wait_until("outbox entry removal", || {
        let handle = handle.clone();
        async move { handle.outbox_entries().await.unwrap().is_empty() }
    })
    .await;
}

#[tokio::test]
async fn failed_first_attempt_stays_pending() {
    init_tracing();
    let (handle, mock, _events) = spawn_client(test_config());
    mock.set_fail_sends(true);

    let receipt = handle.send("peerA", "chat", json!({})).await.unwrap();
    assert_eq!(receipt.status, SendStatus::Pending);

    wait_until("entry to revert to pending", || {
        let handle = handle.clone();
        async move {
            let outbox = handle.outbox_entries().await.unwrap();
            outbox.len() == 1 && outbox[0].status == SendStatus::Pending
        }
    })
    .await;
}

// ── Inbound dispatch / dedup ──────────────────────────────────────────

#[tokio::test]
async fn duplicate_seq_is_dispatched_once_but_acked_twice() {
    init_tracing();
    let (handle, mock, events) = spawn_client(test_config());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handle
        .subscribe("chat", move |d| {
            sink.lock().unwrap().push(d.payload.clone());
            d.ack.fire();
            Ok(())
        })
        .await
        .unwrap();

    events
        .send(message("peerB", 5, "chat", json!({"n": 1})))
        .await
        .unwrap();
    events
        .send(message("peerB", 5, "chat", json!({"n": 2})))
        .await
        .unwrap();

    wait_until("both envelopes to be acked", || {
        let mock = mock.clone();
        async move { mock.acks().len() == 2 }
    })
    .await;

    // Only the first payload reached the handler.
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![json!({"n": 1})]);
}

#[tokio::test]
async fn wildcard_subscription_and_unsubscribe() {
    init_tracing();
    let (handle, _mock, events) = spawn_client(test_config());

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let sub = handle
        .subscribe("group:*", move |d| {
            counter.fetch_add(1, Ordering::SeqCst);
            d.ack.fire();
            Ok(())
        })
        .await
        .unwrap();

    events
        .send(message("peerB", 1, "group:g1:welcome", json!({})))
        .await
        .unwrap();
    wait_until("handler hit", || {
        let hits = hits.clone();
        async move { hits.load(Ordering::SeqCst) == 1 }
    })
    .await;

    handle.unsubscribe(sub).await.unwrap();

    // Same topic, new sequence: must not reach the removed handler.
    events
        .send(message("peerB", 2, "group:g1:welcome", json!({})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unclaimed_topic_is_acked_automatically() {
    init_tracing();
    let (_handle, mock, events) = spawn_client(test_config());

    events
        .send(message("peerB", 1, "nobody-listens", json!({})))
        .await
        .unwrap();

    wait_until("auto-ack", || {
        let mock = mock.clone();
        async move { mock.acks().iter().any(|a| a.message_id == "peerB-1") }
    })
    .await;
}

#[tokio::test]
async fn handler_ack_reaches_the_relay() {
    init_tracing();
    let (handle, mock, events) = spawn_client(test_config());

    handle
        .subscribe("chat", move |d| {
            d.ack.fire();
            Ok(())
        })
        .await
        .unwrap();

    events
        .send(message("peerB", 9, "chat", json!({})))
        .await
        .unwrap();

    wait_until("handler ack", || {
        let mock = mock.clone();
        async move {
            mock.acks()
                .iter()
                .any(|a| a.message_id == "peerB-9" && a.from == "peerB")
        }
    })
    .await;
}

// ── Retry / permanent failure ─────────────────────────────────────────

#[tokio::test]
async fn retry_stops_at_attempt_cap_and_reports_once() {
    init_tracing();
    let config = test_config()
        .retry_interval(Duration::from_millis(50))
        .max_attempts(3);
    let (handle, mock, _events) = spawn_client(config);
    mock.set_fail_sends(true);

    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    handle
        .on_delivery_failed(move |entry| {
            sink.lock().unwrap().push(entry.clone());
        })
        .await
        .unwrap();

    handle.send("peerA", "chat", json!({})).await.unwrap();

    wait_until("failure callback", || {
        let failures = failures.clone();
        async move { !failures.lock().unwrap().is_empty() }
    })
    .await;

    // Let further sweeps run; the callback must not fire again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 3);
    assert_eq!(failures[0].status, SendStatus::Failed);
}

#[tokio::test]
async fn failed_entries_remain_until_cleared() {
    init_tracing();
    let config = test_config()
        .retry_interval(Duration::from_millis(50))
        .max_attempts(2);
    let (handle, mock, _events) = spawn_client(config);
    mock.set_fail_sends(true);

    let receipt = handle.send("peerA", "chat", json!({})).await.unwrap();

    wait_until("entry to fail", || {
        let handle = handle.clone();
        async move { !handle.failed_entries().await.unwrap().is_empty() }
    })
    .await;

    assert!(handle.clear_failed(receipt.message_id.clone()).await.unwrap());
    assert!(!handle.clear_failed(receipt.message_id).await.unwrap());
    assert!(handle.failed_entries().await.unwrap().is_empty());
}

// ── Peer directory / broadcast ────────────────────────────────────────

#[tokio::test]
async fn peer_directory_follows_announce_and_gone() {
    init_tracing();
    let (handle, mock, events) = spawn_client(test_config());

    events
        .send(message("peerX", 1, "peer-announce", json!({"name": "x"})))
        .await
        .unwrap();
    events
        .send(message("peerY", 1, "peer-announce", json!({"name": "y"})))
        .await
        .unwrap();
    wait_until("two peers known", || {
        let handle = handle.clone();
        async move { handle.peers().len() == 2 }
    })
    .await;

    let receipts = handle
        .broadcast("room:update", json!({"v": 1}))
        .await
        .unwrap();
    assert_eq!(receipts.len(), 2);
    wait_until("both fan-out sends", || {
        let mock = mock.clone();
        async move { mock.sent().len() == 2 }
    })
    .await;
    let mut destinations: Vec<String> =
        mock.sent().iter().map(|r| r.destination.clone()).collect();
    destinations.sort();
    assert_eq!(destinations, vec!["peerX".to_string(), "peerY".to_string()]);

    events
        .send(message("peerX", 2, "peer-gone", json!({})))
        .await
        .unwrap();
    wait_until("peerX removed", || {
        let handle = handle.clone();
        async move { handle.peers().len() == 1 }
    })
    .await;
    assert_eq!(handle.peers()[0].id, "peerY");
}

// ── Restart semantics ─────────────────────────────────────────────────

#[tokio::test]
async fn restart_discards_pending_sends() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mq.db");

    let config = MqConfig::new()
        .store_path(&path)
        .retry_interval(Duration::from_secs(60));
    let (handle, mock, _events) = spawn_client(config.clone());
    mock.set_fail_sends(true);

    handle.send("peerA", "chat", json!({})).await.unwrap();
    wait_until("pending entry", || {
        let handle = handle.clone();
        async move { handle.outbox_entries().await.unwrap().len() == 1 }
    })
    .await;
    handle.shutdown().await.unwrap();

    // Simulated restart against the same store path: nothing resumes.
    let (handle, _mock, _events) = spawn_client(config);
    assert!(handle.outbox_entries().await.unwrap().is_empty());
}
