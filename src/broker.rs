//! Process-wide publish/subscribe hub.
//!
//! The broker is the sole mechanism by which in-flight hardware operations
//! learn that the run was cancelled: every long-running operation subscribes
//! to the `programmer.cancelled` topic (or observes the [`CancelToken`]
//! bridged to it) before starting, and treats delivery as a request to abort
//! at the next safe point.
//!
//! Delivery is synchronous and in subscription order. Subscriptions are
//! values with explicit lifetimes: they stay active until [`Subscription::cancel`]
//! is called, a delivery limit is exhausted, or the owning [`Sandbox`] is
//! destroyed. Cancelling is idempotent and safe from within a handler
//! triggered by the same publish.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;
type Filter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

struct SubShared {
    id: u64,
    scope: Option<u64>,
    topic: String,
    cancelled: AtomicBool,
    /// Deliveries left before auto-cancel. `None` means unlimited.
    remaining: Mutex<Option<u32>>,
    filter: Mutex<Option<Filter>>,
    handler: Mutex<Option<Handler>>,
}

impl SubShared {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Registry {
    subs: Vec<Arc<SubShared>>,
    next_id: u64,
    next_scope: u64,
}

/// Publish/subscribe hub shared by every component of the station.
#[derive(Clone)]
pub struct Broker {
    registry: Arc<Mutex<Registry>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                subs: Vec::new(),
                next_id: 0,
                next_scope: 0,
            })),
        }
    }

    /// Subscribe to a topic. `topic` may end in `.*` to receive every
    /// publish under that scope.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.subscribe_scoped(topic, None)
    }

    fn subscribe_scoped(&self, topic: &str, scope: Option<u64>) -> Subscription {
        let mut registry = self.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;

        let shared = Arc::new(SubShared {
            id,
            scope,
            topic: topic.to_string(),
            cancelled: AtomicBool::new(false),
            remaining: Mutex::new(None),
            filter: Mutex::new(None),
            handler: Mutex::new(None),
        });
        registry.subs.push(Arc::clone(&shared));

        Subscription { shared }
    }

    /// Deliver `payload` synchronously to all current subscribers of `topic`
    /// and of matching wildcard scopes, in subscription order.
    pub fn publish(&self, topic: &str, payload: Value) {
        let matching: Vec<Arc<SubShared>> = {
            let mut registry = self.registry.lock().unwrap();
            registry.subs.retain(|sub| !sub.is_cancelled());
            registry
                .subs
                .iter()
                .filter(|sub| topic_matches(&sub.topic, topic))
                .cloned()
                .collect()
        };

        for sub in matching {
            // A handler earlier in this publish may have cancelled this one.
            if sub.is_cancelled() {
                continue;
            }

            let filter = sub.filter.lock().unwrap().clone();
            if let Some(filter) = filter {
                if !filter(&payload) {
                    continue;
                }
            }

            {
                let mut remaining = sub.remaining.lock().unwrap();
                match remaining.as_mut() {
                    Some(0) => continue,
                    Some(n) => {
                        *n -= 1;
                        if *n == 0 {
                            sub.cancel();
                        }
                    }
                    None => {}
                }
            }

            let handler = sub.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler(&payload);
            }
        }
    }

    /// Create a child scope whose subscriptions can all be torn down with one
    /// [`Sandbox::destroy`] call without affecting the parent.
    pub fn sandbox(&self) -> Sandbox {
        let scope = {
            let mut registry = self.registry.lock().unwrap();
            registry.next_scope += 1;
            registry.next_scope
        };
        Sandbox {
            broker: self.clone(),
            scope,
        }
    }

    fn destroy_scope(&self, scope: u64) {
        let mut registry = self.registry.lock().unwrap();
        for sub in registry.subs.iter() {
            if sub.scope == Some(scope) {
                sub.cancel();
            }
        }
        registry.subs.retain(|sub| !sub.is_cancelled());
    }

    #[cfg(test)]
    fn live_subscription_count(&self) -> usize {
        let registry = self.registry.lock().unwrap();
        registry.subs.iter().filter(|s| !s.is_cancelled()).count()
    }
}

fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic || pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => {
            topic.len() > prefix.len()
                && topic.starts_with(prefix)
                && topic.as_bytes()[prefix.len()] == b'.'
        }
        None => false,
    }
}

/// Handle to one live subscription.
pub struct Subscription {
    shared: Arc<SubShared>,
}

impl Subscription {
    /// Attach the delivery handler. Replaces any previous handler.
    pub fn on_message<F>(self, handler: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        *self.shared.handler.lock().unwrap() = Some(Arc::new(handler));
        self
    }

    /// Only deliver payloads accepted by `predicate`.
    pub fn set_filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        *self.shared.filter.lock().unwrap() = Some(Arc::new(predicate));
        self
    }

    /// Auto-cancel after `n` deliveries.
    pub fn set_limit(self, n: u32) -> Self {
        *self.shared.remaining.lock().unwrap() = Some(n);
        self
    }

    /// Cancel this subscription. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Numeric identity, mostly useful in logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }
}

/// Child broker scope with bulk teardown.
pub struct Sandbox {
    broker: Broker,
    scope: u64,
}

impl Sandbox {
    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.broker.subscribe_scoped(topic, Some(self.scope))
    }

    pub fn publish(&self, topic: &str, payload: Value) {
        self.broker.publish(topic, payload);
    }

    /// Cancel every subscription created through this sandbox.
    pub fn destroy(&self) {
        self.broker.destroy_scope(self.scope);
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Observable cancellation context checked at every suspension point.
///
/// All concurrent sub-operations of a run observe the same token; the
/// orchestrator trips it exactly once per run and mirrors the event onto the
/// `programmer.cancelled` broker topic. Uniform use of the token closes the
/// un-cancellable windows that per-site flag checks would leave open.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves when the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Cancelling side of a [`CancelToken`] pair.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Create a fresh cancellation pair for one run.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}
