use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::Envelope;

pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Registration returned by [`Channel::on`]. `off` (or drop) removes the handler.
pub struct Subscription {
    off: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(off: impl FnOnce() + Send + 'static) -> Self {
        Self {
            off: Some(Box::new(off)),
        }
    }

    pub fn off(mut self) {
        if let Some(f) = self.off.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.off.take() {
            f();
        }
    }
}

pub trait Channel: Send + Sync + 'static {
    /// Fire-and-forget emission towards the dashboard.
    fn emit(&self, event: &str, payload: Value);

    fn on(&self, event: &str, handler: Handler) -> Subscription;
}

type HandlerTable = DashMap<String, Vec<(u64, Handler)>>;

#[derive(Clone)]
pub struct LocalChannel {
    handlers: Arc<HandlerTable>,
    outbound: mpsc::UnboundedSender<Envelope>,
    next_id: Arc<AtomicU64>,
}

impl LocalChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            handlers: Arc::new(DashMap::new()),
            outbound: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (channel, rx)
    }

    /// Dispatches an inbound frame to the handlers of `event`, in registration order.
    pub fn deliver(&self, event: &str, payload: Value) {
        let handlers: Vec<Handler> = match self.handlers.get(event) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                debug!(event, "no handler for inbound event");
                return;
            }
        };
        for handler in handlers {
            handler(payload.clone());
        }
    }

    pub fn deliver_envelope(&self, envelope: Envelope) {
        self.deliver(&envelope.event, envelope.data);
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map(|list| list.len()).unwrap_or(0)
    }

    pub fn total_handlers(&self) -> usize {
        self.handlers.iter().map(|r| r.value().len()).sum()
    }
}

impl Channel for LocalChannel {
    fn emit(&self, event: &str, payload: Value) {
        if self.outbound.send(Envelope::new(event, payload)).is_err() {
            warn!(event, "outbound channel closed, dropping emission");
        }
    }

    fn on(&self, event: &str, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));

        let handlers = self.handlers.clone();
        let event = event.to_string();
        Subscription::new(move || {
            if let Some(mut list) = handlers.get_mut(&event) {
                list.retain(|(hid, _)| *hid != id);
            }
            handlers.remove_if(&event, |_, list| list.is_empty());
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    #[test]
    fn off_removes_only_its_handler() {
        let (channel, _rx) = LocalChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let first = channel.on("ping", Arc::new(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        }));
        let h2 = hits.clone();
        let _second = channel.on("ping", Arc::new(move |_| {
            h2.fetch_add(10, Ordering::SeqCst);
        }));

        channel.deliver("ping", json!(null));
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        first.off();
        channel.deliver("ping", json!(null));
        assert_eq!(hits.load(Ordering::SeqCst), 21);
        assert_eq!(channel.handler_count("ping"), 1);
    }

    #[test]
    fn emit_reaches_receiver() {
        let (channel, mut rx) = LocalChannel::new();
        channel.emit("query-sync", json!({"a": 1}));
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.event, "query-sync");
        assert_eq!(envelope.data, json!({"a": 1}));
    }
}
