use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheSubscription, FetchSource, QueryCache, QueryOptions};
use crate::channel::{Channel, Subscription};
use crate::commands::{self, CommandRegistry, NoDevTools};
use crate::config::SyncConfig;
use crate::interceptors::{InterceptorManager, RecordSink, TapHost, TapRegistry};
use crate::serializer;
use crate::storage::{self, AsyncStorage, StorageError};
use crate::targeting::should_process;
use crate::tasks::{spawn_detached, spawn_fetch};
use crate::types::{
    events, now_millis, ActionMessage, CommandRequest, DeviceInfo, FetchStatus,
    NetworkMonitoringAction, NetworkMonitoringMessage, NetworkSyncMessage, OnlineManagerMessage,
    QueryAction, QueryState, QueryStatus, QuerySyncMessage, StorageAction, StorageActionMessage,
    StorageStateMessage, TargetedRequest,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("persistent device id must not be empty")]
    MissingDeviceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    ConnectedIdle,
    ConnectedActive,
}

/// External collaborators a coordinator drives.
pub struct Collaborators {
    pub cache: Arc<dyn QueryCache>,
    pub channel: Arc<dyn Channel>,
    pub commands: Arc<CommandRegistry>,
    pub storage: Option<Arc<dyn AsyncStorage>>,
    pub taps: Arc<dyn TapHost>,
}

impl Collaborators {
    pub fn new(cache: Arc<dyn QueryCache>, channel: Arc<dyn Channel>) -> Self {
        Self {
            cache,
            channel,
            commands: Arc::new(CommandRegistry::new(Arc::new(NoDevTools))),
            storage: None,
            taps: Arc::new(TapRegistry::new()),
        }
    }

    pub fn with_commands(mut self, commands: Arc<CommandRegistry>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn AsyncStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_taps(mut self, taps: Arc<dyn TapHost>) -> Self {
        self.taps = taps;
        self
    }
}

/// State stashed before a forced error or loading state, consumed on restore.
#[derive(Debug, Clone)]
struct SavedQueryState {
    options: QueryOptions,
    state: QueryState,
}

struct Session {
    subscriptions: Vec<Subscription>,
    cache_subscription: CacheSubscription,
}

enum Phase {
    Disconnected,
    Idle,
    Active(Session),
}

struct Inner {
    device: DeviceInfo,
    enabled: bool,
    network_monitoring: bool,
    cache: Arc<dyn QueryCache>,
    channel: Arc<dyn Channel>,
    commands: Arc<CommandRegistry>,
    storage: Option<Arc<dyn AsyncStorage>>,
    interceptors: InterceptorManager,
    saved: DashMap<String, SavedQueryState>,
    phase: Mutex<Phase>,
    sequence: AtomicU64,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Fails fast on an empty device id, before anything is installed.
    pub fn new(config: SyncConfig, collaborators: Collaborators) -> Result<Self, SyncError> {
        if config.device.device_id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        let inner = Inner {
            device: config.device,
            enabled: config.enabled,
            network_monitoring: config.network_monitoring,
            cache: collaborators.cache,
            channel: collaborators.channel,
            commands: collaborators.commands,
            storage: collaborators.storage,
            interceptors: InterceptorManager::new(collaborators.taps),
            saved: DashMap::new(),
            phase: Mutex::new(Phase::Disconnected),
            sequence: AtomicU64::new(0),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device.device_id
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.inner.phase.lock() {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Idle => ConnectionState::ConnectedIdle,
            Phase::Active(_) => ConnectionState::ConnectedActive,
        }
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.inner.commands
    }

    pub fn interceptors(&self) -> &InterceptorManager {
        &self.inner.interceptors
    }

    /// Socket connected. Installs every handler from scratch, tearing down any
    /// session that was still active.
    pub fn handle_connected(&self) {
        self.teardown();

        if !self.inner.enabled {
            *self.inner.phase.lock() = Phase::Idle;
            info!(device_id = %self.inner.device.device_id, "connected, sync disabled");
            return;
        }

        let session = Inner::install(&self.inner);
        *self.inner.phase.lock() = Phase::Active(session);

        if self.inner.network_monitoring {
            self.inner.enable_network_monitoring();
        }

        self.inner.emit(events::DEVICE_INFO, &self.inner.device);
        info!(device_id = %self.inner.device.device_id, "sync session active");
    }

    /// Socket closed. Removes every subscription and tap in one pass.
    pub fn handle_disconnected(&self) {
        self.teardown();
        info!(device_id = %self.inner.device.device_id, "sync session closed");
    }

    fn teardown(&self) {
        let previous = std::mem::replace(&mut *self.inner.phase.lock(), Phase::Disconnected);
        if let Phase::Active(session) = previous {
            for subscription in session.subscriptions {
                subscription.off();
            }
            session.cache_subscription.unsubscribe();
        }
        for e in self.inner.interceptors.disable_all() {
            warn!(error = %e, "failed to remove network tap");
        }
    }
}

impl Inner {
    fn install(this: &Arc<Self>) -> Session {
        let weak: Weak<Inner> = Arc::downgrade(this);

        let subscriptions = events::INBOUND
            .iter()
            .map(|&event| {
                let weak = weak.clone();
                this.channel.on(
                    event,
                    Arc::new(move |payload| {
                        if let Some(inner) = weak.upgrade() {
                            inner.dispatch(event, payload);
                        }
                    }),
                )
            })
            .collect();

        let cache_subscription = this.cache.subscribe(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.sync_snapshot();
            }
        }));

        Session {
            subscriptions,
            cache_subscription,
        }
    }

    fn device_id(&self) -> &str {
        &self.device.device_id
    }

    fn targets_me(&self, event: &str, target_device_id: &str) -> bool {
        let accepted = should_process(target_device_id, self.device_id());
        if !accepted {
            debug!(event, target_device_id, "message addressed to another device");
        }
        accepted
    }

    fn emit<T: Serialize>(&self, event: &str, message: &T) {
        match serde_json::to_value(message) {
            Ok(payload) => self.channel.emit(event, payload),
            Err(e) => error!(event, "failed to serialize outbound message: {e}"),
        }
    }

    fn dispatch(self: &Arc<Self>, event: &'static str, payload: Value) {
        match event {
            events::REQUEST_INITIAL_STATE => {
                if let Some(req) = parse_request(event, &payload) {
                    if self.targets_me(event, &req.target_device_id) {
                        self.sync_snapshot();
                    }
                }
            }
            events::QUERY_ACTION => {
                if let Some(msg) = parse::<ActionMessage>(event, &payload) {
                    self.handle_query_action(msg);
                }
            }
            events::ONLINE_MANAGER => {
                if let Some(msg) = parse::<OnlineManagerMessage>(event, &payload) {
                    self.handle_online_manager(msg);
                }
            }
            events::ASYNC_STORAGE_ACTION => {
                if let Some(msg) = parse::<StorageActionMessage>(event, &payload) {
                    self.handle_storage_action(msg, payload);
                }
            }
            events::REQUEST_ASYNC_STORAGE => {
                if let Some(req) = parse_request(event, &payload) {
                    self.handle_storage_request(req, payload);
                }
            }
            events::NETWORK_MONITORING_ACTION => {
                if let Some(msg) = parse::<NetworkMonitoringMessage>(event, &payload) {
                    self.handle_network_monitoring(msg);
                }
            }
            events::REQUEST_NETWORK_MONITORING => {
                if let Some(req) = parse_request(event, &payload) {
                    if self.targets_me(event, &req.target_device_id) {
                        self.emit_network_status();
                    }
                }
            }
            events::EXPO_COMMAND_ACTION => {
                if let Some(req) = parse::<CommandRequest>(event, &payload) {
                    self.handle_command(req);
                }
            }
            events::REQUEST_EXPO_DEVTOOLS_STATUS => {
                if let Some(req) = parse_request(event, &payload) {
                    if self.targets_me(event, &req.target_device_id) {
                        commands::emit_result(
                            self.channel.as_ref(),
                            &commands::status_message(self.device_id()),
                        );
                    }
                }
            }
            _ => debug!(event, "unhandled event"),
        }
    }

    // ==================== Query sync ====================

    fn sync_snapshot(&self) {
        let snapshot = serializer::dehydrate(self.cache.as_ref());
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = QuerySyncMessage::DehydratedState {
            state: snapshot,
            is_online_manager_online: self.cache.is_online(),
            persistent_device_id: self.device.device_id.clone(),
            sequence,
        };
        self.emit(events::QUERY_SYNC, &message);
    }

    fn handle_query_action(&self, msg: ActionMessage) {
        if !self.targets_me(events::QUERY_ACTION, &msg.target_device_id) {
            return;
        }

        match msg.action {
            QueryAction::ClearMutationCache => {
                self.cache.clear_mutations();
                return;
            }
            QueryAction::ClearQueryCache => {
                self.saved.clear();
                self.cache.clear_queries();
                return;
            }
            _ => {}
        }

        let hash = msg.query_hash;
        let Some(active) = self.cache.query(&hash) else {
            debug!(query_hash = %hash, action = ?msg.action, "query not found, dropping action");
            return;
        };

        let result = match msg.action {
            QueryAction::DataUpdate => {
                self.end_forced_loading(&hash);
                self.cache
                    .set_query_data(&hash, msg.data.unwrap_or(Value::Null), now_millis())
            }
            QueryAction::TriggerError => {
                self.end_forced_loading(&hash);
                self.stash(&hash, &active.options, &active.state);
                let mut state = active.state;
                state.status = QueryStatus::Error;
                state.fetch_status = FetchStatus::Idle;
                state.error = Some(json!({ "message": "Unknown error from devtools" }));
                state.error_updated_at = now_millis();
                self.cache.set_query_state(&hash, state)
            }
            QueryAction::RestoreError => {
                self.saved.remove(&hash);
                spawn_fetch("restore-error", hash.clone(), self.cache.reset_query(&hash));
                Ok(())
            }
            QueryAction::TriggerLoading => {
                self.stash(&hash, &active.options, &active.state);
                spawn_fetch(
                    "forced-loading",
                    hash.clone(),
                    self.cache.fetch(&hash, FetchSource::Suspended),
                );
                let mut state = active.state;
                state.status = QueryStatus::Pending;
                state.fetch_status = FetchStatus::Fetching;
                state.data = None;
                self.cache.set_query_state(&hash, state)
            }
            QueryAction::RestoreLoading => self.restore_loading(&hash),
            QueryAction::Reset => {
                self.saved.remove(&hash);
                spawn_fetch("reset", hash.clone(), self.cache.reset_query(&hash));
                Ok(())
            }
            QueryAction::Remove => {
                self.saved.remove(&hash);
                self.cache.remove_query(&hash);
                Ok(())
            }
            QueryAction::Refetch => {
                spawn_fetch("refetch", hash.clone(), self.cache.fetch(&hash, FetchSource::Current));
                Ok(())
            }
            QueryAction::Invalidate => {
                spawn_fetch("invalidate", hash.clone(), self.cache.invalidate_query(&hash));
                Ok(())
            }
            QueryAction::OnlineManagerOnline => {
                self.cache.set_online(true);
                Ok(())
            }
            QueryAction::OnlineManagerOffline => {
                self.cache.set_online(false);
                Ok(())
            }
            QueryAction::Unknown => {
                debug!(query_hash = %hash, "unknown query action ignored");
                Ok(())
            }
            QueryAction::ClearMutationCache | QueryAction::ClearQueryCache => Ok(()),
        };

        if let Err(e) = result {
            warn!(query_hash = %hash, action = ?msg.action, error = %e, "query action failed");
        }
    }

    /// Keeps the first stash: forcing twice must still restore the natural state.
    fn stash(&self, hash: &str, options: &QueryOptions, state: &QueryState) {
        self.saved
            .entry(hash.to_string())
            .or_insert_with(|| SavedQueryState {
                options: options.clone(),
                state: state.clone(),
            });
    }

    /// A forced loading state parks a suspended fetch; overwriting the state
    /// must release it or the query stays `fetching`.
    fn end_forced_loading(&self, hash: &str) {
        if self.saved.contains_key(hash) {
            self.cache.cancel(hash, false);
        }
    }

    fn restore_loading(&self, hash: &str) -> Result<(), crate::cache::CacheError> {
        let saved = self.saved.remove(hash).map(|(_, saved)| saved);
        self.cache.cancel(hash, true);

        match saved {
            Some(saved) => {
                let mut state = saved.state;
                state.fetch_status = FetchStatus::Idle;
                self.cache.set_query_state(hash, state)?;
                spawn_fetch(
                    "restore-loading",
                    hash.to_string(),
                    self.cache.fetch(hash, FetchSource::Options(saved.options)),
                );
                Ok(())
            }
            None => match self.cache.query(hash) {
                Some(entry) => {
                    let mut state = entry.state;
                    state.fetch_status = FetchStatus::Idle;
                    self.cache.set_query_state(hash, state)
                }
                None => Ok(()),
            },
        }
    }

    fn handle_online_manager(&self, msg: OnlineManagerMessage) {
        if !self.targets_me(events::ONLINE_MANAGER, &msg.target_device_id) {
            return;
        }
        match msg.action {
            QueryAction::OnlineManagerOnline => self.cache.set_online(true),
            QueryAction::OnlineManagerOffline => self.cache.set_online(false),
            other => debug!(action = ?other, "ignoring non online-manager action"),
        }
    }

    // ==================== Async storage ====================

    fn handle_storage_action(self: &Arc<Self>, msg: StorageActionMessage, payload: Value) {
        if !self.targets_me(events::ASYNC_STORAGE_ACTION, &msg.target_device_id) {
            return;
        }
        let Some(storage) = self.storage.clone() else {
            self.channel
                .emit(&events::received(events::ASYNC_STORAGE_ACTION), payload);
            return;
        };

        let inner = self.clone();
        spawn_detached("async-storage-action", async move {
            match msg.action {
                StorageAction::Refresh => {}
                StorageAction::SetItem => {
                    let key = msg.key.as_deref().ok_or(StorageError::MissingKey("ACTION-SET-ITEM"))?;
                    storage
                        .set_item(key, msg.value.as_deref().unwrap_or_default())
                        .await?;
                }
                StorageAction::RemoveItem => {
                    let key = msg
                        .key
                        .as_deref()
                        .ok_or(StorageError::MissingKey("ACTION-REMOVE-ITEM"))?;
                    storage.remove_item(key).await?;
                }
                StorageAction::Clear => storage.clear().await?,
                StorageAction::Unknown => {
                    debug!("unknown storage action ignored");
                    return Ok(());
                }
            }
            inner.emit_storage_state(storage.as_ref()).await
        });
    }

    fn handle_storage_request(self: &Arc<Self>, req: TargetedRequest, payload: Value) {
        if !self.targets_me(events::REQUEST_ASYNC_STORAGE, &req.target_device_id) {
            return;
        }
        let Some(storage) = self.storage.clone() else {
            self.channel
                .emit(&events::received(events::REQUEST_ASYNC_STORAGE), payload);
            return;
        };

        let inner = self.clone();
        spawn_detached("request-async-storage", async move {
            inner.emit_storage_state(storage.as_ref()).await
        });
    }

    async fn emit_storage_state(&self, storage: &dyn AsyncStorage) -> Result<(), StorageError> {
        let entries = storage::read_all(storage).await?;
        self.emit(
            events::ASYNC_STORAGE_STATE,
            &StorageStateMessage::AsyncStorageState {
                state: entries,
                persistent_device_id: self.device.device_id.clone(),
            },
        );
        Ok(())
    }

    // ==================== Network monitoring ====================

    fn record_sink(self: &Arc<Self>) -> RecordSink {
        let weak = Arc::downgrade(self);
        Arc::new(move |record| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(
                    events::NETWORK_REQUEST_SYNC,
                    &NetworkSyncMessage::Request {
                        request: record,
                        persistent_device_id: inner.device.device_id.clone(),
                    },
                );
            }
        })
    }

    fn enable_network_monitoring(self: &Arc<Self>) {
        let installed = self.interceptors.enable_all(self.record_sink());
        debug!(installed, "network monitoring enabled");
    }

    fn handle_network_monitoring(self: &Arc<Self>, msg: NetworkMonitoringMessage) {
        if !self.targets_me(events::NETWORK_MONITORING_ACTION, &msg.target_device_id) {
            return;
        }
        match msg.action {
            NetworkMonitoringAction::Enable => self.enable_network_monitoring(),
            NetworkMonitoringAction::Disable => {
                for e in self.interceptors.disable_all() {
                    warn!(error = %e, "failed to remove network tap");
                }
            }
            NetworkMonitoringAction::Unknown => {
                debug!("unknown network monitoring action ignored");
                return;
            }
        }
        self.emit_network_status();
    }

    fn emit_network_status(&self) {
        self.emit(
            events::NETWORK_REQUEST_SYNC,
            &NetworkSyncMessage::Status {
                enabled: self.interceptors.is_enabled(),
                persistent_device_id: self.device.device_id.clone(),
            },
        );
    }

    // ==================== Commands ====================

    fn handle_command(self: &Arc<Self>, req: CommandRequest) {
        if !self.targets_me(events::EXPO_COMMAND_ACTION, &req.target_device_id) {
            return;
        }
        debug!(command = %req.command, command_id = %req.command_id, "executing command");
        let inner = self.clone();
        tokio::spawn(async move {
            inner
                .commands
                .execute(&req, inner.channel.as_ref(), inner.device_id())
                .await;
        });
    }
}

fn parse<T: DeserializeOwned>(event: &str, payload: &Value) -> Option<T> {
    match T::deserialize(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(event, error = %e, "malformed payload, dropping");
            None
        }
    }
}

fn parse_request(event: &str, payload: &Value) -> Option<TargetedRequest> {
    if payload.is_null() {
        return Some(TargetedRequest::default());
    }
    parse(event, payload)
}
