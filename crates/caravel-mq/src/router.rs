/// Topic router — subscription registry and inbound dispatch.
///
/// Pure in-process state, nothing persisted: subscriptions survive
/// stream reconnects but not a restart. Dispatch fans one message out
/// to every matching handler; a message nobody claims is acknowledged
/// on the spot so unclaimed topics never stall the sender's retries.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::types::PeerId;

// ── Topic patterns ─────────────────────────────────────────────────────

/// Exact topic string, or a trailing-`*` prefix wildcard.
///
/// `"call:*"` matches `"call:abc"` and `"call:abc:def"` but not
/// `"call"` or `"calls:abc"`. Namespacing is the caller's business —
/// no semantic interpretation happens here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    Exact(String),
    Prefix(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => TopicPattern::Prefix(prefix.to_string()),
            None => TopicPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact(s) => topic == s,
            TopicPattern::Prefix(p) => topic.starts_with(p.as_str()),
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::Exact(s) => write!(f, "{s}"),
            TopicPattern::Prefix(p) => write!(f, "{p}*"),
        }
    }
}

// ── Acknowledgement handle ─────────────────────────────────────────────

/// Idempotent, single-fire acknowledgement.
///
/// Cloned into every handler for one message; the first `fire` wins and
/// every later call is a no-op. Dropping without firing is legal — the
/// sender redelivers, guarded by the receiver's dedup check.
#[derive(Clone)]
pub struct AckHandle {
    fired: Arc<AtomicBool>,
    action: Arc<dyn Fn() + Send + Sync>,
}

impl AckHandle {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            action: Arc::new(action),
        }
    }

    /// Acknowledge the message. Only the first call has an effect.
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.action)();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("fired", &self.is_fired())
            .finish()
    }
}

// ── Subscriptions ──────────────────────────────────────────────────────

/// What a handler receives for one inbound message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: PeerId,
    pub topic: String,
    pub payload: Value,
    pub ack: AckHandle,
}

/// Error a handler may return; logged per-handler, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Inbound message handler.
pub type Handler = Arc<dyn Fn(Delivery) -> Result<(), HandlerError> + Send + Sync>;

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    handler: Handler,
}

// ── Router ─────────────────────────────────────────────────────────────

/// Registry of `(pattern, handler)` pairs plus the dispatch fan-out.
#[derive(Default)]
pub struct TopicRouter {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns the token for `unsubscribe`.
    pub fn subscribe(&mut self, pattern: TopicPattern, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscriptions.push(Subscription {
            id,
            pattern,
            handler,
        });
        id
    }

    /// Remove a subscription from future dispatches.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Dispatch one inbound message to every matching handler.
    ///
    /// A handler error is logged and isolated — it neither stops the
    /// fan-out nor acknowledges. Zero matches ⇒ the router fires `ack`
    /// itself so the sender's retry loop is not left hanging.
    pub fn dispatch(&self, from: &str, topic: &str, payload: &Value, ack: AckHandle) {
        let matching: Vec<&Subscription> = self
            .subscriptions
            .iter()
            .filter(|s| s.pattern.matches(topic))
            .collect();

        if matching.is_empty() {
            tracing::debug!("no subscriber for topic {topic}, auto-acking");
            ack.fire();
            return;
        }

        for sub in matching {
            let delivery = Delivery {
                from: from.to_string(),
                topic: topic.to_string(),
                payload: payload.clone(),
                ack: ack.clone(),
            };
            if let Err(e) = (sub.handler)(delivery) {
                tracing::warn!(
                    "handler for pattern {} failed on topic {topic}: {e}",
                    sub.pattern
                );
            }
        }
    }
}

impl fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRouter")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn counting_handler(count: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_d| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn noop_ack() -> AckHandle {
        AckHandle::new(|| {})
    }

    #[test]
    fn wildcard_matching() {
        let p = TopicPattern::parse("call:*");
        assert!(p.matches("call:abc"));
        assert!(p.matches("call:abc:def"));
        assert!(!p.matches("call"));
        assert!(!p.matches("calls:abc"));

        let exact = TopicPattern::parse("chat");
        assert!(exact.matches("chat"));
        assert!(!exact.matches("chat:x"));
    }

    #[test]
    fn dispatch_reaches_all_matching_handlers() {
        let mut router = TopicRouter::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        router.subscribe(TopicPattern::parse("group:*"), counting_handler(a.clone()));
        router.subscribe(
            TopicPattern::parse("group:g1:welcome"),
            counting_handler(b.clone()),
        );
        router.subscribe(TopicPattern::parse("other"), counting_handler(Arc::new(AtomicUsize::new(0))));

        router.dispatch("peerB", "group:g1:welcome", &json!({}), noop_ack());
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unclaimed_topic_is_auto_acked() {
        let router = TopicRouter::new();
        let acked = Arc::new(AtomicBool::new(false));
        let flag = acked.clone();
        let ack = AckHandle::new(move || flag.store(true, Ordering::SeqCst));

        router.dispatch("peerB", "nobody-home", &json!({}), ack);
        assert!(acked.load(Ordering::SeqCst));
    }

    #[test]
    fn claimed_topic_is_not_auto_acked() {
        let mut router = TopicRouter::new();
        router.subscribe(
            TopicPattern::parse("chat"),
            Arc::new(|_d| Ok(())), // handler never acks
        );
        let ack = noop_ack();
        router.dispatch("peerB", "chat", &json!({}), ack.clone());
        assert!(!ack.is_fired());
    }

    #[test]
    fn unsubscribe_removes_future_dispatch() {
        let mut router = TopicRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = router.subscribe(TopicPattern::parse("group:*"), counting_handler(count.clone()));

        router.dispatch("peerB", "group:g1", &json!({}), noop_ack());
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        router.dispatch("peerB", "group:g1", &json!({}), noop_ack());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_error_does_not_stop_others() {
        let mut router = TopicRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        router.subscribe(
            TopicPattern::parse("chat"),
            Arc::new(|_d| Err("boom".into())),
        );
        router.subscribe(TopicPattern::parse("chat"), counting_handler(count.clone()));

        let ack = noop_ack();
        router.dispatch("peerB", "chat", &json!({}), ack.clone());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // An erroring handler never acks on its own
        assert!(!ack.is_fired());
    }

    #[test]
    fn ack_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let ack = AckHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        ack.fire();
        ack.fire();
        ack.clone().fire();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(ack.is_fired());
    }

    #[test]
    fn handler_sees_payload_and_sender() {
        let mut router = TopicRouter::new();
        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.subscribe(
            TopicPattern::parse("chat"),
            Arc::new(move |d: Delivery| {
                sink.lock().unwrap().push((d.from.clone(), d.payload.clone()));
                d.ack.fire();
                Ok(())
            }),
        );

        router.dispatch("peerB", "chat", &json!({"text": "hi"}), noop_ack());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "peerB");
        assert_eq!(seen[0].1, json!({"text": "hi"}));
    }
}
