use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;

type EventHandler = dyn Fn(&Value) + Send + Sync;

/// Subscription handle returned by [`JobEventBus::on`] and
/// [`JobEventBus::once`]; pass it back to [`JobEventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventToken(u64);

#[derive(Clone)]
struct Subscriber {
    token: EventToken,
    once: bool,
    handler: Arc<EventHandler>,
}

/// Named publish/subscribe scoped to one job.
///
/// Handlers fire synchronously in subscription order. The subscriber list
/// is snapshotted before dispatch, so a handler may unsubscribe itself or
/// others without disturbing the delivery already in flight; `once`
/// subscribers are claimed while the snapshot is taken and therefore fire
/// exactly once even when two emissions race.
#[derive(Clone, Default)]
pub struct JobEventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    next_token: AtomicU64,
    channels: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl JobEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, name: &str, handler: F) -> EventToken
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(name, false, Arc::new(handler))
    }

    pub fn once<F>(&self, name: &str, handler: F) -> EventToken
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(name, true, Arc::new(handler))
    }

    pub fn unsubscribe(&self, name: &str, token: EventToken) -> bool {
        let mut channels = self
            .inner
            .channels
            .write()
            .expect("event bus channel lock poisoned");
        let Some(subscribers) = channels.get_mut(name) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.token != token);
        before != subscribers.len()
    }

    pub fn emit(&self, name: &str, payload: &Value) {
        let snapshot = {
            let mut channels = self
                .inner
                .channels
                .write()
                .expect("event bus channel lock poisoned");
            let Some(subscribers) = channels.get_mut(name) else {
                return;
            };
            let snapshot = subscribers.clone();
            subscribers.retain(|subscriber| !subscriber.once);
            snapshot
        };

        for subscriber in snapshot {
            (subscriber.handler)(payload);
        }
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        let channels = self
            .inner
            .channels
            .read()
            .expect("event bus channel lock poisoned");
        channels.get(name).map_or(0, Vec::len)
    }

    fn subscribe(&self, name: &str, once: bool, handler: Arc<EventHandler>) -> EventToken {
        let token = EventToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        let mut channels = self
            .inner
            .channels
            .write()
            .expect("event bus channel lock poisoned");
        channels.entry(name.to_owned()).or_default().push(Subscriber {
            token,
            once,
            handler,
        });
        token
    }
}
