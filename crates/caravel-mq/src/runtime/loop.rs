/// The MQ runtime event loop.
///
/// A single async task that owns the store, the router, and the retry
/// timer, multiplexing over application commands, relay events, and
/// feedback from spawned I/O tasks. Attempts and acks run as their own
/// tasks so one slow send never serializes dispatch of other messages.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::config::MqConfig;
use crate::peers::{PeerDirectory, PEER_ANNOUNCE_TOPIC, PEER_GONE_TOPIC};
use crate::relay::{event_stream_task, RelayTransport};
use crate::retry::{plan_sweep, SweepAction};
use crate::router::{AckHandle, Delivery, TopicPattern, TopicRouter};
use crate::store::{InboxRecord, OutboxEntry, Store};
use crate::types::{now_ms, MessageId, PeerId, SendStatus};
use crate::wire::{AckRequest, RelayEvent, SendRequest, WireMessage};

use super::{FailureCallback, LoopEvent, MqCommand, SendReceipt};

/// Buffer for feedback events from spawned tasks. Large enough that
/// `try_send` from an ack handle never realistically fails.
const LOOP_EVENT_BUFFER: usize = 4096;

// ── Event stream control ──────────────────────────────────────────────

/// Idempotent "ensure the push stream is open" switch.
///
/// `Lazy` spawns the HTTP stream task on the first send or subscribe;
/// `External` means the caller already wired an event source in.
pub(crate) enum StreamControl {
    Lazy {
        http: reqwest::Client,
        url: Url,
        tx: mpsc::Sender<RelayEvent>,
        delay: Duration,
        started: bool,
    },
    External,
}

impl StreamControl {
    pub(crate) fn lazy(
        http: reqwest::Client,
        url: Url,
        tx: mpsc::Sender<RelayEvent>,
        delay: Duration,
    ) -> Self {
        StreamControl::Lazy {
            http,
            url,
            tx,
            delay,
            started: false,
        }
    }

    pub(crate) fn external() -> Self {
        StreamControl::External
    }

    fn ensure_open(&mut self) {
        if let StreamControl::Lazy {
            http,
            url,
            tx,
            delay,
            started,
        } = self
        {
            if !*started {
                *started = true;
                tokio::spawn(event_stream_task(
                    http.clone(),
                    url.clone(),
                    tx.clone(),
                    *delay,
                ));
            }
        }
    }
}

// ── The loop ──────────────────────────────────────────────────────────

pub(crate) async fn mq_loop<T: RelayTransport>(
    transport: Arc<T>,
    config: MqConfig,
    mut cmd_rx: mpsc::Receiver<MqCommand>,
    mut event_rx: mpsc::Receiver<RelayEvent>,
    peers: Arc<Mutex<PeerDirectory>>,
    mut stream: StreamControl,
) {
    let mut store = Store::initialize(config.store_path.as_deref());
    let mut router = TopicRouter::new();
    let mut failure_callbacks: Vec<FailureCallback> = Vec::new();

    let (internal_tx, mut internal_rx) = mpsc::channel::<LoopEvent>(LOOP_EVENT_BUFFER);

    install_peer_subscriptions(&mut router, &peers);

    let mut retry_tick = tokio::time::interval(config.retry_interval);
    // Skip the immediate first tick
    retry_tick.tick().await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(MqCommand::Send { destination, topic, payload, reply }) => {
                        stream.ensure_open();
                        start_send(&transport, &mut store, &internal_tx, destination, topic, payload, Some(reply));
                    }
                    Some(MqCommand::Subscribe { pattern, handler, reply }) => {
                        stream.ensure_open();
                        let id = router.subscribe(pattern, handler);
                        let _ = reply.send(id);
                    }
                    Some(MqCommand::Unsubscribe { id }) => {
                        router.unsubscribe(id);
                    }
                    Some(MqCommand::Broadcast { topic, payload, reply }) => {
                        stream.ensure_open();
                        let destinations = peers
                            .lock()
                            .map(|dir| dir.ids())
                            .unwrap_or_default();
                        let receivers: Vec<_> = destinations
                            .into_iter()
                            .map(|dest| {
                                let (tx, rx) = oneshot::channel();
                                start_send(
                                    &transport,
                                    &mut store,
                                    &internal_tx,
                                    dest,
                                    topic.clone(),
                                    payload.clone(),
                                    Some(tx),
                                );
                                rx
                            })
                            .collect();
                        tokio::spawn(async move {
                            let mut receipts = Vec::with_capacity(receivers.len());
                            for rx in receivers {
                                if let Ok(receipt) = rx.await {
                                    receipts.push(receipt);
                                }
                            }
                            let _ = reply.send(receipts);
                        });
                    }
                    Some(MqCommand::OnDeliveryFailed { callback }) => {
                        failure_callbacks.push(callback);
                    }
                    Some(MqCommand::OutboxEntries { reply }) => {
                        let _ = reply.send(store.outbox_entries());
                    }
                    Some(MqCommand::FailedEntries { reply }) => {
                        let _ = reply.send(store.failed_entries());
                    }
                    Some(MqCommand::ClearFailed { id, reply }) => {
                        let _ = reply.send(store.clear_failed(&id));
                    }
                    Some(MqCommand::Shutdown) | None => {
                        tracing::debug!("mq runtime shutting down");
                        break;
                    }
                }
            }

            // A closed event channel disables this branch; commands and
            // retries keep working.
            Some(event) = event_rx.recv() => {
                match event {
                    RelayEvent::Message { from, msg } => {
                        handle_inbound(&transport, &mut store, &router, &internal_tx, from, msg);
                    }
                    RelayEvent::Delivered { msg_id } => {
                        if store.delete_outbox(&msg_id) {
                            tracing::debug!("delivery of {msg_id} confirmed, outbox entry removed");
                        }
                    }
                }
            }

            Some(event) = internal_rx.recv() => {
                match event {
                    LoopEvent::SendOutcome { message_id, ok } => {
                        if !ok {
                            if let Some(entry) = store.get_outbox(&message_id) {
                                if entry.status == SendStatus::InFlight {
                                    let mut entry = entry.clone();
                                    entry.status = SendStatus::Pending;
                                    store.put_outbox(&entry);
                                }
                            }
                        }
                    }
                    LoopEvent::Acknowledged { from, seq, message_id } => {
                        store.mark_inbox_processed(&from, seq);
                        spawn_ack(&transport, message_id, from);
                    }
                }
            }

            _ = retry_tick.tick() => {
                run_sweep(&transport, &mut store, &internal_tx, &failure_callbacks, &config);
            }
        }
    }
}

// ── Send path ─────────────────────────────────────────────────────────

/// Create the outbox entry and spawn the first (or a fresh) attempt.
///
/// The entry goes in-flight *before* the attempt task runs, so a retry
/// sweep racing with a slow send leaves it alone until it goes stale.
fn start_send<T: RelayTransport>(
    transport: &Arc<T>,
    store: &mut Store,
    internal_tx: &mpsc::Sender<LoopEvent>,
    destination: PeerId,
    topic: String,
    payload: Value,
    reply: Option<oneshot::Sender<SendReceipt>>,
) -> MessageId {
    let mut entry = OutboxEntry::new(destination, topic, payload);
    entry.attempts = 1;
    entry.status = SendStatus::InFlight;
    entry.last_attempt_at = Some(now_ms());
    store.put_outbox(&entry);

    let request = SendRequest {
        destination: entry.destination.clone(),
        topic: entry.topic.clone(),
        payload: entry.payload.clone(),
        message_id: entry.id.clone(),
    };
    spawn_attempt(transport, internal_tx, request, reply);
    entry.id
}

/// Run one delivery attempt as an independent task.
fn spawn_attempt<T: RelayTransport>(
    transport: &Arc<T>,
    internal_tx: &mpsc::Sender<LoopEvent>,
    request: SendRequest,
    reply: Option<oneshot::Sender<SendReceipt>>,
) {
    let transport = transport.clone();
    let internal = internal_tx.clone();
    tokio::spawn(async move {
        let ok = match transport.send_once(&request).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("send attempt for {} failed: {e}", request.message_id);
                false
            }
        };
        if let Some(reply) = reply {
            let status = if ok {
                SendStatus::InFlight
            } else {
                SendStatus::Pending
            };
            let _ = reply.send(SendReceipt {
                message_id: request.message_id.clone(),
                status,
            });
        }
        let _ = internal
            .send(LoopEvent::SendOutcome {
                message_id: request.message_id,
                ok,
            })
            .await;
    });
}

// ── Inbound path ──────────────────────────────────────────────────────

/// Dedup-check, record, and dispatch one inbound message.
fn handle_inbound<T: RelayTransport>(
    transport: &Arc<T>,
    store: &mut Store,
    router: &TopicRouter,
    internal_tx: &mpsc::Sender<LoopEvent>,
    from: PeerId,
    msg: WireMessage,
) {
    if store.inbox_contains(&from, msg.seq) {
        // Already delivered (or being delivered) — re-ack so the sender
        // stops retrying, but never redispatch. First payload wins.
        tracing::debug!("duplicate message from {from} seq {}, re-acking", msg.seq);
        spawn_ack(transport, msg.id, from);
        return;
    }

    store.put_inbox(&InboxRecord {
        from: from.clone(),
        seq: msg.seq,
        id: msg.id.clone(),
        topic: msg.topic.clone(),
        payload: msg.payload.clone(),
        processed: false,
        received_at: now_ms(),
    });

    let ack = {
        let tx = internal_tx.clone();
        let from = from.clone();
        let message_id = msg.id.clone();
        let seq = msg.seq;
        AckHandle::new(move || {
            if tx
                .try_send(LoopEvent::Acknowledged {
                    from: from.clone(),
                    seq,
                    message_id: message_id.clone(),
                })
                .is_err()
            {
                tracing::warn!("ack for {message_id} dropped: runtime busy or gone");
            }
        })
    };

    router.dispatch(&from, &msg.topic, &msg.payload, ack);
}

/// Fire-and-forget receipt confirmation. Failures are logged only —
/// the sender redelivers into our dedup guard if the ack is lost.
fn spawn_ack<T: RelayTransport>(transport: &Arc<T>, message_id: MessageId, from: PeerId) {
    let transport = transport.clone();
    tokio::spawn(async move {
        let ack = AckRequest { message_id, from };
        if let Err(e) = transport.acknowledge(&ack).await {
            tracing::debug!("ack for {} failed (sender will redeliver): {e}", ack.message_id);
        }
    });
}

// ── Retry sweep ───────────────────────────────────────────────────────

fn run_sweep<T: RelayTransport>(
    transport: &Arc<T>,
    store: &mut Store,
    internal_tx: &mpsc::Sender<LoopEvent>,
    failure_callbacks: &[FailureCallback],
    config: &MqConfig,
) {
    let now = now_ms();
    let actions = plan_sweep(
        &store.outbox_entries(),
        now,
        config.retry_interval.as_millis() as u64,
        config.max_attempts,
    );

    for action in actions {
        match action {
            SweepAction::Fail(id) => {
                let Some(mut entry) = store.get_outbox(&id).cloned() else {
                    continue;
                };
                entry.status = SendStatus::Failed;
                store.put_outbox(&entry);
                tracing::warn!(
                    "delivery of {} to {} permanently failed after {} attempts",
                    entry.id,
                    entry.destination,
                    entry.attempts
                );
                for callback in failure_callbacks {
                    callback(&entry);
                }
            }
            SweepAction::Retry(id) => {
                let Some(mut entry) = store.get_outbox(&id).cloned() else {
                    continue;
                };
                entry.attempts += 1;
                entry.status = SendStatus::InFlight;
                entry.last_attempt_at = Some(now);
                store.put_outbox(&entry);

                let request = SendRequest {
                    destination: entry.destination.clone(),
                    topic: entry.topic.clone(),
                    payload: entry.payload.clone(),
                    message_id: entry.id.clone(),
                };
                spawn_attempt(transport, internal_tx, request, None);
            }
        }
    }
}

// ── Built-in consumers ────────────────────────────────────────────────

/// The peer directory is an ordinary router consumer: two exact-topic
/// subscriptions, acking each message after applying it.
fn install_peer_subscriptions(router: &mut TopicRouter, peers: &Arc<Mutex<PeerDirectory>>) {
    let announce_dir = peers.clone();
    router.subscribe(
        TopicPattern::Exact(PEER_ANNOUNCE_TOPIC.to_string()),
        Arc::new(move |d: Delivery| {
            if let Ok(mut dir) = announce_dir.lock() {
                dir.apply_announce(&d.from, d.payload.clone(), now_ms());
            }
            d.ack.fire();
            Ok(())
        }),
    );

    let gone_dir = peers.clone();
    router.subscribe(
        TopicPattern::Exact(PEER_GONE_TOPIC.to_string()),
        Arc::new(move |d: Delivery| {
            if let Ok(mut dir) = gone_dir.lock() {
                dir.apply_gone(&d.from);
            }
            d.ack.fire();
            Ok(())
        }),
    );
}
