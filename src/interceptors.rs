use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{NetworkRequestRecord, RequestKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TapKind {
    Fetch,
    Xhr,
    WebSocket,
}

impl TapKind {
    pub const ALL: [TapKind; 3] = [TapKind::Fetch, TapKind::Xhr, TapKind::WebSocket];

    pub fn request_kind(self) -> RequestKind {
        match self {
            TapKind::Fetch => RequestKind::Fetch,
            TapKind::Xhr => RequestKind::Xhr,
            TapKind::WebSocket => RequestKind::Websocket,
        }
    }
}

impl fmt::Display for TapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TapKind::Fetch => f.write_str("fetch"),
            TapKind::Xhr => f.write_str("xhr"),
            TapKind::WebSocket => f.write_str("websocket"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TapError {
    #[error("{0} tap already installed")]
    AlreadyInstalled(TapKind),
    #[error("failed to remove {kind} tap: {message}")]
    Dispose { kind: TapKind, message: String },
}

pub type RecordSink = Arc<dyn Fn(NetworkRequestRecord) + Send + Sync>;

/// Removes one installed tap.
pub struct Disposer(Box<dyn FnOnce() -> Result<(), TapError> + Send>);

impl Disposer {
    pub fn new(f: impl FnOnce() -> Result<(), TapError> + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn dispose(self) -> Result<(), TapError> {
        (self.0)()
    }
}

pub trait TapHost: Send + Sync {
    /// Installs a tap for `kind`. Installing twice without disposing is a
    /// caller error.
    fn install(&self, kind: TapKind, sink: RecordSink) -> Result<Disposer, TapError>;
}

/// Default tap host. Instrumented clients report through it; records reach
/// a sink only while that kind is installed.
#[derive(Clone, Default)]
pub struct TapRegistry {
    sinks: Arc<DashMap<TapKind, RecordSink>>,
}

impl TapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tapped(&self, kind: TapKind) -> bool {
        self.sinks.contains_key(&kind)
    }

    /// Forwards a record to the installed tap of `kind`, if any.
    pub fn report(&self, kind: TapKind, record: NetworkRequestRecord) {
        let sink = self.sinks.get(&kind).map(|r| r.value().clone());
        if let Some(sink) = sink {
            sink(record);
        }
    }

    /// Reports one socket frame or lifecycle event as a completed record.
    pub fn report_socket_event(&self, url: &str, event: &str) {
        if !self.is_tapped(TapKind::WebSocket) {
            return;
        }
        let mut record = NetworkRequestRecord::started(RequestKind::Websocket, "WS", url);
        record.socket_event = Some(event.to_string());
        record.finish(crate::types::RequestStatus::Success);
        self.report(TapKind::WebSocket, record);
    }
}

impl TapHost for TapRegistry {
    fn install(&self, kind: TapKind, sink: RecordSink) -> Result<Disposer, TapError> {
        if self.sinks.contains_key(&kind) {
            return Err(TapError::AlreadyInstalled(kind));
        }
        self.sinks.insert(kind, sink);
        let sinks = self.sinks.clone();
        Ok(Disposer::new(move || {
            sinks.remove(&kind);
            Ok(())
        }))
    }
}

pub struct InterceptorManager {
    host: Arc<dyn TapHost>,
    active: Mutex<HashMap<TapKind, Disposer>>,
}

impl InterceptorManager {
    pub fn new(host: Arc<dyn TapHost>) -> Self {
        Self {
            host,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.active.lock().is_empty()
    }

    pub fn installed_kinds(&self) -> Vec<TapKind> {
        let mut kinds: Vec<TapKind> = self.active.lock().keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Installs `kind` unless it is already active. Returns whether a new tap
    /// was installed.
    pub fn install(&self, kind: TapKind, sink: RecordSink) -> Result<bool, TapError> {
        let mut active = self.active.lock();
        if active.contains_key(&kind) {
            return Ok(false);
        }
        let disposer = self.host.install(kind, sink)?;
        active.insert(kind, disposer);
        debug!(%kind, "tap installed");
        Ok(true)
    }

    pub fn enable_all(&self, sink: RecordSink) -> usize {
        let mut installed = 0;
        for kind in TapKind::ALL {
            match self.install(kind, sink.clone()) {
                Ok(true) => installed += 1,
                Ok(false) => {}
                Err(e) => warn!(%kind, error = %e, "failed to install tap"),
            }
        }
        installed
    }

    pub fn remove(&self, kind: TapKind) -> Result<(), TapError> {
        let disposer = self.active.lock().remove(&kind);
        match disposer {
            Some(disposer) => run_disposer(kind, disposer),
            None => Ok(()),
        }
    }

    /// Removes every tap. Each disposer runs even if an earlier one failed or
    /// panicked; the failures are returned.
    pub fn disable_all(&self) -> Vec<TapError> {
        let drained: Vec<(TapKind, Disposer)> = self.active.lock().drain().collect();
        let mut failures = Vec::new();
        for (kind, disposer) in drained {
            if let Err(e) = run_disposer(kind, disposer) {
                warn!(%kind, error = %e, "tap disposer failed");
                failures.push(e);
            }
        }
        failures
    }
}

fn run_disposer(kind: TapKind, disposer: Disposer) -> Result<(), TapError> {
    match panic::catch_unwind(AssertUnwindSafe(|| disposer.dispose())) {
        Ok(result) => result,
        Err(_) => Err(TapError::Dispose {
            kind,
            message: "disposer panicked".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::RequestStatus;

    fn counting_sink() -> (RecordSink, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let sink: RecordSink = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (sink, count)
    }

    /// Host whose disposers for one kind fail.
    struct FlakyHost {
        inner: TapRegistry,
        broken: TapKind,
        disposed: Arc<AtomicUsize>,
    }

    impl TapHost for FlakyHost {
        fn install(&self, kind: TapKind, sink: RecordSink) -> Result<Disposer, TapError> {
            let inner = self.inner.install(kind, sink)?;
            let broken = self.broken;
            let disposed = self.disposed.clone();
            Ok(Disposer::new(move || {
                if kind == broken {
                    panic!("disposer exploded");
                }
                disposed.fetch_add(1, Ordering::SeqCst);
                inner.dispose()
            }))
        }
    }

    #[test]
    fn enabling_twice_installs_one_tap_per_kind() {
        let registry = TapRegistry::new();
        let manager = InterceptorManager::new(Arc::new(registry.clone()));
        let (sink, count) = counting_sink();

        assert_eq!(manager.enable_all(sink.clone()), 3);
        assert_eq!(manager.enable_all(sink), 0);
        assert_eq!(manager.installed_kinds().len(), 3);

        registry.report(TapKind::Fetch, NetworkRequestRecord::started(RequestKind::Fetch, "GET", "http://x"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabling_when_absent_is_a_noop() {
        let manager = InterceptorManager::new(Arc::new(TapRegistry::new()));
        assert!(manager.disable_all().is_empty());
        assert!(manager.remove(TapKind::Xhr).is_ok());
        assert!(!manager.is_enabled());
    }

    #[test]
    fn disabled_tap_stops_reporting() {
        let registry = TapRegistry::new();
        let manager = InterceptorManager::new(Arc::new(registry.clone()));
        let (sink, count) = counting_sink();
        manager.enable_all(sink);
        manager.disable_all();

        registry.report_socket_event("ws://x", "open");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!registry.is_tapped(TapKind::WebSocket));
    }

    #[test]
    fn failing_disposer_does_not_block_the_rest() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let host = FlakyHost {
            inner: TapRegistry::new(),
            broken: TapKind::Xhr,
            disposed: disposed.clone(),
        };
        let manager = InterceptorManager::new(Arc::new(host));
        let (sink, _) = counting_sink();
        manager.enable_all(sink);

        let failures = manager.disable_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
        assert!(!manager.is_enabled());
    }

    #[test]
    fn socket_events_are_complete_records() {
        let registry = TapRegistry::new();
        let manager = InterceptorManager::new(Arc::new(registry.clone()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = seen.clone();
        manager
            .install(TapKind::WebSocket, Arc::new(move |r| store.lock().push(r)))
            .unwrap();

        registry.report_socket_event("ws://host/feed", "message");
        let records = seen.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RequestStatus::Success);
        assert_eq!(records[0].socket_event.as_deref(), Some("message"));
    }
}
