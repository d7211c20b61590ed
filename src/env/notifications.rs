//! Fan-out of unsolicited server messages
//!
//! Handlers subscribe to a notification kind and run in subscription order.
//! A handler that panics is logged and skipped; the remaining handlers for
//! the same notification still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

/// Kind given to the python backend's initial greeting
pub const READY_KIND: &str = "ready";

/// Kind used for environment deltas
pub const DELTA_KIND: &str = "delta";

/// Kind published when a write is refused in read-only mode
pub const PERMISSION_DENIED_KIND: &str = "permissionDenied";

/// Kind published with the outcome of every login attempt
pub const LOGIN_KIND: &str = "login";

/// A push message delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Kind the message was routed by
    pub kind: String,
    /// Message body
    pub payload: Value,
    /// When the router dispatched it
    pub received_at: DateTime<Utc>,
}

/// Opaque handle returned by [`NotificationRouter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Subscription {
    token: SubscriptionToken,
    kind: String,
    handler: Handler,
}

#[derive(Default)]
struct Subscribers {
    next_token: u64,
    entries: Vec<Subscription>,
}

/// Routes push notifications to subscribed handlers
#[derive(Clone, Default)]
pub struct NotificationRouter {
    subscribers: Arc<Mutex<Subscribers>>,
}

/// Work out the kind of a push payload from its shape.
///
/// Python-dialect pushes name themselves with `op`; the greeting carries
/// `ready: true`. Anything else has no kind.
pub fn notification_kind(payload: &Value) -> Option<String> {
    if let Some(op) = payload.get("op").and_then(Value::as_str) {
        return Some(op.to_string());
    }
    if payload.get("ready").and_then(Value::as_bool) == Some(true) {
        return Some(READY_KIND.to_string());
    }
    None
}

impl NotificationRouter {
    /// Create a router with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for notifications of `kind`.
    pub fn subscribe<F>(&self, kind: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.lock();
        subscribers.next_token += 1;
        let token = SubscriptionToken(subscribers.next_token);
        subscribers.entries.push(Subscription {
            token,
            kind: kind.into(),
            handler: Arc::new(handler),
        });
        token
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.entries.len();
        subscribers.entries.retain(|entry| entry.token != token);
        subscribers.entries.len() != before
    }

    /// Number of handlers subscribed to `kind`.
    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.subscribers
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    /// Route a push payload by its shape. Returns how many handlers ran.
    pub fn dispatch(&self, payload: Value) -> usize {
        match notification_kind(&payload) {
            Some(kind) => self.publish(kind, payload),
            None => {
                tracing::warn!("dropping notification of unknown kind: {}", payload);
                0
            }
        }
    }

    /// Deliver a payload whose kind is already known. Returns how many
    /// handlers ran to completion.
    pub fn publish(&self, kind: impl Into<String>, payload: Value) -> usize {
        let notification = Notification {
            kind: kind.into(),
            payload,
            received_at: Utc::now(),
        };
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.kind == notification.kind)
            .map(|entry| entry.handler.clone())
            .collect();

        if handlers.is_empty() {
            tracing::debug!("no subscribers for '{}' notification", notification.kind);
        }

        let mut completed = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&notification))) {
                Ok(()) => completed += 1,
                Err(_) => tracing::error!(
                    "notification handler for '{}' panicked",
                    notification.kind
                ),
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handlers_run_in_subscription_order() {
        let router = NotificationRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["h1", "h2"] {
            let order = order.clone();
            router.subscribe("delta", move |_| order.lock().push(name));
        }
        router.subscribe("other", |_| panic!("wrong kind"));

        assert_eq!(router.dispatch(json!({"op": "delta", "result": []})), 2);
        assert_eq!(*order.lock(), vec!["h1", "h2"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let router = NotificationRouter::new();
        let token = router.subscribe("delta", |_| {});
        assert_eq!(router.subscriber_count("delta"), 1);
        assert!(router.unsubscribe(token));
        assert!(!router.unsubscribe(token));
        assert_eq!(router.dispatch(json!({"op": "delta"})), 0);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let router = NotificationRouter::new();
        let seen = Arc::new(Mutex::new(0));
        router.subscribe("delta", |_| panic!("boom"));
        let counter = seen.clone();
        router.subscribe("delta", move |_| *counter.lock() += 1);

        assert_eq!(router.dispatch(json!({"op": "delta"})), 1);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn kind_comes_from_the_payload_shape() {
        assert_eq!(
            notification_kind(&json!({"ready": true, "provider_type": "ec2"})),
            Some("ready".to_string())
        );
        assert_eq!(
            notification_kind(&json!({"op": "login", "result": true})),
            Some("login".to_string())
        );
        assert_eq!(notification_kind(&json!({"Response": {}})), None);
    }
}
