use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::targeting::ALL_DEVICES;

/// Socket event names shared by devices, the hub and dashboards.
pub mod events {
    pub const DEVICE_INFO: &str = "device-info";
    pub const DEVICES_UPDATED: &str = "devices-updated";

    pub const REQUEST_INITIAL_STATE: &str = "request-initial-state";
    pub const QUERY_SYNC: &str = "query-sync";
    pub const QUERY_ACTION: &str = "query-action";
    pub const ONLINE_MANAGER: &str = "online-manager";

    pub const ASYNC_STORAGE_ACTION: &str = "async-storage-action";
    pub const REQUEST_ASYNC_STORAGE: &str = "request-async-storage";
    pub const ASYNC_STORAGE_STATE: &str = "async-storage-state";

    pub const NETWORK_MONITORING_ACTION: &str = "network-monitoring-action";
    pub const REQUEST_NETWORK_MONITORING: &str = "request-network-monitoring";
    pub const NETWORK_REQUEST_SYNC: &str = "network-request-sync";

    pub const EXPO_COMMAND_ACTION: &str = "expo-command-action";
    pub const EXPO_COMMAND_RESULT: &str = "expo-command-result";
    pub const REQUEST_EXPO_DEVTOOLS_STATUS: &str = "request-expo-devtools-status";

    /// Inbound events the device listens to once a session is active.
    pub const INBOUND: [&str; 9] = [
        REQUEST_INITIAL_STATE,
        QUERY_ACTION,
        ONLINE_MANAGER,
        ASYNC_STORAGE_ACTION,
        REQUEST_ASYNC_STORAGE,
        NETWORK_MONITORING_ACTION,
        REQUEST_NETWORK_MONITORING,
        EXPO_COMMAND_ACTION,
        REQUEST_EXPO_DEVTOOLS_STATUS,
    ];

    /// Name under which an unhandled inbound event is handed back to the host app.
    pub fn received(event: &str) -> String {
        format!("{event}-received")
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn all_devices() -> String {
    ALL_DEVICES.to_string()
}

// ==================== Devices ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
    Windows,
    Macos,
    Linux,
    #[serde(other)]
    Unknown,
}

/// Identity a device announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Persistent id, stable across restarts. The caller owns its persistence.
    pub device_id: String,
    pub display_name: String,
    pub platform: Platform,
    #[serde(default)]
    pub extra_info: BTreeMap<String, String>,
}

/// A device as tracked by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub platform: Platform,
    #[serde(default)]
    pub extra_info: BTreeMap<String, String>,
    pub connected: bool,
}

impl Device {
    pub fn connected(info: DeviceInfo) -> Self {
        Self {
            id: info.device_id,
            display_name: info.display_name,
            platform: info.platform,
            extra_info: info.extra_info,
            connected: true,
        }
    }
}

// ==================== Cache snapshot ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Idle,
    Fetching,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub data_updated_at: i64,
    pub error_updated_at: i64,
    pub data_update_count: u32,
    pub error_update_count: u32,
    pub fetch_failure_count: u32,
    pub is_invalidated: bool,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            data_updated_at: 0,
            error_updated_at: 0,
            data_update_count: 0,
            error_update_count: 0,
            fetch_failure_count: 0,
            is_invalidated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub query_hash: String,
    pub query_key: Vec<Value>,
    pub state: QueryState,
    pub observer_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationState {
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub submitted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub mutation_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_key: Option<Vec<Value>>,
    pub state: MutationState,
}

/// Dehydrated cache. Always a full replacement of the previous one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub queries: Vec<QueryRecord>,
    pub mutations: Vec<MutationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum QuerySyncMessage {
    DehydratedState {
        state: CacheSnapshot,
        is_online_manager_online: bool,
        persistent_device_id: String,
        /// Monotonic per device session owner; lets receivers discard stale snapshots.
        sequence: u64,
    },
}

impl QuerySyncMessage {
    pub fn sequence(&self) -> u64 {
        match self {
            QuerySyncMessage::DehydratedState { sequence, .. } => *sequence,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            QuerySyncMessage::DehydratedState {
                persistent_device_id,
                ..
            } => persistent_device_id,
        }
    }
}

// ==================== Query actions ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryAction {
    #[serde(rename = "ACTION-CLEAR-MUTATION-CACHE")]
    ClearMutationCache,
    #[serde(rename = "ACTION-CLEAR-QUERY-CACHE")]
    ClearQueryCache,
    #[serde(rename = "ACTION-DATA-UPDATE")]
    DataUpdate,
    #[serde(rename = "ACTION-TRIGGER-ERROR")]
    TriggerError,
    #[serde(rename = "ACTION-RESTORE-ERROR")]
    RestoreError,
    #[serde(rename = "ACTION-TRIGGER-LOADING")]
    TriggerLoading,
    #[serde(rename = "ACTION-RESTORE-LOADING")]
    RestoreLoading,
    #[serde(rename = "ACTION-RESET")]
    Reset,
    #[serde(rename = "ACTION-REMOVE")]
    Remove,
    #[serde(rename = "ACTION-REFETCH")]
    Refetch,
    #[serde(rename = "ACTION-INVALIDATE")]
    Invalidate,
    #[serde(rename = "ACTION-ONLINE-MANAGER-ONLINE")]
    OnlineManagerOnline,
    #[serde(rename = "ACTION-ONLINE-MANAGER-OFFLINE")]
    OnlineManagerOffline,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMessage {
    #[serde(default)]
    pub query_hash: String,
    #[serde(default)]
    pub query_key: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub action: QueryAction,
    pub target_device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineManagerMessage {
    pub action: QueryAction,
    pub target_device_id: String,
}

/// Payload of the `request-*` events. An absent target means every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetedRequest {
    #[serde(default = "all_devices")]
    pub target_device_id: String,
}

impl Default for TargetedRequest {
    fn default() -> Self {
        Self {
            target_device_id: all_devices(),
        }
    }
}

// ==================== Commands ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    Reload,
    ToggleInspector,
    TogglePerformanceMonitor,
    ToggleElementInspector,
    ClearCache,
    ToggleRemoteDebugging,
    OpenDevMenu,
    TakeScreenshot,
    ShakeDevice,
}

impl CommandType {
    pub const ALL: [CommandType; 9] = [
        CommandType::Reload,
        CommandType::ToggleInspector,
        CommandType::TogglePerformanceMonitor,
        CommandType::ToggleElementInspector,
        CommandType::ClearCache,
        CommandType::ToggleRemoteDebugging,
        CommandType::OpenDevMenu,
        CommandType::TakeScreenshot,
        CommandType::ShakeDevice,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Reload => "reload",
            CommandType::ToggleInspector => "toggle-inspector",
            CommandType::TogglePerformanceMonitor => "toggle-performance-monitor",
            CommandType::ToggleElementInspector => "toggle-element-inspector",
            CommandType::ClearCache => "clear-cache",
            CommandType::ToggleRemoteDebugging => "toggle-remote-debugging",
            CommandType::OpenDevMenu => "open-dev-menu",
            CommandType::TakeScreenshot => "take-screenshot",
            CommandType::ShakeDevice => "shake-device",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command type: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for CommandType {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandType::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// Command type reported for the synthetic availability probe.
pub const STATUS_CHECK: &str = "status-check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Success,
    Error,
}

/// Inbound `expo-command-action`. `command` stays a raw string so unknown
/// types can still be answered with their original name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    pub target_device_id: String,
    pub command_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub status: CommandStatus,
    pub timestamp: i64,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandMessage {
    pub fn success(command_id: &str, command_type: &str, device_id: &str, result: Option<Value>) -> Self {
        Self {
            command_id: command_id.to_string(),
            command_type: command_type.to_string(),
            status: CommandStatus::Success,
            timestamp: now_millis(),
            device_id: device_id.to_string(),
            result,
            error: None,
        }
    }

    pub fn failure(command_id: &str, command_type: &str, device_id: &str, error: String) -> Self {
        Self {
            command_id: command_id.to_string(),
            command_type: command_type.to_string(),
            status: CommandStatus::Error,
            timestamp: now_millis(),
            device_id: device_id.to_string(),
            result: None,
            error: Some(error),
        }
    }
}

// ==================== Network monitoring ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Fetch,
    Xhr,
    Websocket,
    Graphql,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequestRecord {
    pub id: String,
    pub url: String,
    pub method: String,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub status: RequestStatus,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NetworkRequestRecord {
    pub fn started(kind: RequestKind, method: &str, url: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            method: method.to_string(),
            kind,
            status: RequestStatus::Pending,
            start_time: now_millis(),
            end_time: None,
            duration: None,
            status_code: None,
            request_headers: BTreeMap::new(),
            response_size: None,
            operation_name: None,
            socket_event: None,
            error: None,
        }
    }

    /// Moves the record to a terminal status and stamps its timing.
    pub fn finish(&mut self, status: RequestStatus) {
        let end = now_millis();
        self.status = status;
        self.end_time = Some(end);
        self.duration = Some(end - self.start_time);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMonitoringAction {
    #[serde(rename = "ACTION-ENABLE-NETWORK-MONITORING")]
    Enable,
    #[serde(rename = "ACTION-DISABLE-NETWORK-MONITORING")]
    Disable,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMonitoringMessage {
    pub action: NetworkMonitoringAction,
    pub target_device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum NetworkSyncMessage {
    Request {
        request: NetworkRequestRecord,
        persistent_device_id: String,
    },
    Status {
        enabled: bool,
        persistent_device_id: String,
    },
}

// ==================== Async storage ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageAction {
    #[serde(rename = "ACTION-REFRESH")]
    Refresh,
    #[serde(rename = "ACTION-SET-ITEM")]
    SetItem,
    #[serde(rename = "ACTION-REMOVE-ITEM")]
    RemoveItem,
    #[serde(rename = "ACTION-CLEAR")]
    Clear,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageActionMessage {
    pub action: StorageAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub target_device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StorageStateMessage {
    AsyncStorageState {
        state: Vec<StorageEntry>,
        persistent_device_id: String,
    },
}

// ==================== Hub wire frames ====================

/// One socket emission on the wire: event name plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// First frame a peer sends to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Hello {
    Device,
    Dashboard,
}
