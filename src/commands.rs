use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::types::{events, CommandMessage, CommandRequest, CommandType, STATUS_CHECK};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("unknown command type: {0}")]
    UnknownCommand(String),
    #[error("{method} failed: {message}")]
    Host { method: String, message: String },
    #[error("{0}")]
    Failed(String),
    #[error("command panicked: {0}")]
    Panicked(String),
}

/// Which family of runtime API a probe targets, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiTier {
    /// Platform dev-tooling API for the exact capability.
    DevTools,
    /// Generic dev-settings API with an equivalent switch.
    DevSettings,
    /// Lower-level native module bridge.
    NativeModule,
}

/// The runtime's native developer APIs, as seen from Rust.
#[async_trait]
pub trait DevToolsHost: Send + Sync {
    fn provides(&self, tier: ApiTier, method: &str) -> bool;

    async fn invoke(&self, tier: ApiTier, method: &str) -> Result<Value, CommandError>;
}

/// Host exposing no native APIs. Every default chain ends in its notice.
pub struct NoDevTools;

#[async_trait]
impl DevToolsHost for NoDevTools {
    fn provides(&self, _tier: ApiTier, _method: &str) -> bool {
        false
    }

    async fn invoke(&self, _tier: ApiTier, method: &str) -> Result<Value, CommandError> {
        Err(CommandError::Host {
            method: method.to_string(),
            message: "not available".into(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub tier: ApiTier,
    pub method: &'static str,
}

const fn probe(tier: ApiTier, method: &'static str) -> Probe {
    Probe { tier, method }
}

const RELOAD: &[Probe] = &[
    probe(ApiTier::DevTools, "reloadAppAsync"),
    probe(ApiTier::DevSettings, "reload"),
    probe(ApiTier::NativeModule, "DevSettings.reload"),
];
const TOGGLE_INSPECTOR: &[Probe] = &[
    probe(ApiTier::DevTools, "toggleInspector"),
    probe(ApiTier::DevSettings, "toggleElementInspector"),
    probe(ApiTier::NativeModule, "DevSettings.toggleElementInspector"),
];
const TOGGLE_PERFORMANCE_MONITOR: &[Probe] = &[
    probe(ApiTier::DevTools, "togglePerformanceMonitor"),
    probe(ApiTier::DevSettings, "togglePerformanceMonitor"),
    probe(ApiTier::NativeModule, "DevSettings.toggleShowPerfMonitor"),
];
const TOGGLE_ELEMENT_INSPECTOR: &[Probe] = &[
    probe(ApiTier::DevTools, "toggleElementInspector"),
    probe(ApiTier::DevSettings, "toggleElementInspector"),
    probe(ApiTier::NativeModule, "DevSettings.toggleElementInspector"),
];
const CLEAR_CACHE: &[Probe] = &[probe(ApiTier::DevTools, "clearCache")];
const TOGGLE_REMOTE_DEBUGGING: &[Probe] = &[
    probe(ApiTier::DevTools, "toggleRemoteDebugging"),
    probe(ApiTier::DevSettings, "setIsDebuggingRemotely"),
    probe(ApiTier::NativeModule, "DevSettings.setIsDebuggingRemotely"),
];
const OPEN_DEV_MENU: &[Probe] = &[
    probe(ApiTier::DevTools, "openDevMenu"),
    probe(ApiTier::DevSettings, "show"),
    probe(ApiTier::NativeModule, "DevMenu.show"),
];
const TAKE_SCREENSHOT: &[Probe] = &[probe(ApiTier::DevTools, "takeScreenshotAsync")];
const SHAKE_DEVICE: &[Probe] = &[
    probe(ApiTier::DevTools, "simulateShake"),
    probe(ApiTier::NativeModule, "DevMenu.show"),
];

pub fn default_probes(command: CommandType) -> &'static [Probe] {
    match command {
        CommandType::Reload => RELOAD,
        CommandType::ToggleInspector => TOGGLE_INSPECTOR,
        CommandType::TogglePerformanceMonitor => TOGGLE_PERFORMANCE_MONITOR,
        CommandType::ToggleElementInspector => TOGGLE_ELEMENT_INSPECTOR,
        CommandType::ClearCache => CLEAR_CACHE,
        CommandType::ToggleRemoteDebugging => TOGGLE_REMOTE_DEBUGGING,
        CommandType::OpenDevMenu => OPEN_DEV_MENU,
        CommandType::TakeScreenshot => TAKE_SCREENSHOT,
        CommandType::ShakeDevice => SHAKE_DEVICE,
    }
}

pub type CommandImpl =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<Value>, CommandError>> + Send + Sync>;

/// Runs the first probe the host provides. Failures of that API are reported,
/// not masked by later probes.
pub async fn run_chain(
    command: CommandType,
    probes: &[Probe],
    host: &dyn DevToolsHost,
) -> Result<Option<Value>, CommandError> {
    for probe in probes {
        if host.provides(probe.tier, probe.method) {
            debug!(%command, tier = ?probe.tier, method = probe.method, "running command via probe");
            return host.invoke(probe.tier, probe.method).await.map(Some);
        }
    }

    let notice = format!(
        "no native API available for `{command}`; supply one with CommandRegistry::set_implementations"
    );
    info!(%command, "{notice}");
    Ok(Some(json!({ "handled": false, "notice": notice })))
}

pub fn fallback_chain(command: CommandType, host: Arc<dyn DevToolsHost>) -> CommandImpl {
    Arc::new(move || {
        let host = host.clone();
        async move { run_chain(command, default_probes(command), host.as_ref()).await }.boxed()
    })
}

/// Current implementation per command type.
pub struct CommandRegistry {
    implementations: RwLock<HashMap<CommandType, CommandImpl>>,
}

impl CommandRegistry {
    pub fn new(host: Arc<dyn DevToolsHost>) -> Self {
        let implementations = CommandType::ALL
            .into_iter()
            .map(|command| (command, fallback_chain(command, host.clone())))
            .collect();
        Self {
            implementations: RwLock::new(implementations),
        }
    }

    /// Replaces the given entries; every other command keeps what it had.
    pub fn set_implementations(
        &self,
        overrides: impl IntoIterator<Item = (CommandType, CommandImpl)>,
    ) {
        let mut implementations = self.implementations.write();
        for (command, implementation) in overrides {
            debug!(%command, "command implementation overridden");
            implementations.insert(command, implementation);
        }
    }

    pub fn resolve(&self, command: CommandType) -> Option<CommandImpl> {
        self.implementations.read().get(&command).cloned()
    }

    /// Runs the requested command and returns its terminal message. Never
    /// fails: errors and panics become `status: error`.
    pub async fn run(&self, request: &CommandRequest, device_id: &str) -> CommandMessage {
        let outcome = match request.command.parse::<CommandType>() {
            Ok(command) => match self.resolve(command) {
                Some(implementation) => {
                    AssertUnwindSafe(async move { implementation().await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(CommandError::Panicked(panic_message(panic))))
                }
                None => Err(CommandError::UnknownCommand(request.command.clone())),
            },
            Err(e) => Err(CommandError::UnknownCommand(e.0)),
        };

        match outcome {
            Ok(result) => {
                CommandMessage::success(&request.command_id, &request.command, device_id, result)
            }
            Err(e) => {
                warn!(command = %request.command, command_id = %request.command_id, error = %e, "command failed");
                CommandMessage::failure(
                    &request.command_id,
                    &request.command,
                    device_id,
                    e.to_string(),
                )
            }
        }
    }

    /// Runs the command and emits exactly one `expo-command-result`.
    pub async fn execute(&self, request: &CommandRequest, channel: &dyn Channel, device_id: &str) {
        let message = self.run(request, device_id).await;
        emit_result(channel, &message);
    }
}

/// Synthetic `status-check` result confirming command support.
pub fn status_message(device_id: &str) -> CommandMessage {
    let available: Vec<&str> = CommandType::ALL.iter().map(|c| c.as_str()).collect();
    CommandMessage::success(
        &uuid::Uuid::new_v4().to_string(),
        STATUS_CHECK,
        device_id,
        Some(json!({ "available": true, "commands": available })),
    )
}

pub fn emit_result(channel: &dyn Channel, message: &CommandMessage) {
    match serde_json::to_value(message) {
        Ok(payload) => channel.emit(events::EXPO_COMMAND_RESULT, payload),
        Err(e) => error!(command_id = %message.command_id, "failed to serialize command result: {e}"),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::channel::LocalChannel;
    use crate::types::CommandStatus;

    struct FakeHost {
        available: HashSet<(ApiTier, &'static str)>,
        calls: parking_lot::Mutex<Vec<&'static str>>,
    }

    impl FakeHost {
        fn with(available: &[(ApiTier, &'static str)]) -> Arc<Self> {
            Arc::new(Self {
                available: available.iter().copied().collect(),
                calls: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DevToolsHost for FakeHost {
        fn provides(&self, tier: ApiTier, method: &str) -> bool {
            self.available.iter().any(|(t, m)| *t == tier && *m == method)
        }

        async fn invoke(&self, tier: ApiTier, method: &str) -> Result<Value, CommandError> {
            let (_, name) = self
                .available
                .iter()
                .find(|(t, m)| *t == tier && *m == method)
                .copied()
                .ok_or_else(|| CommandError::Failed(method.to_string()))?;
            self.calls.lock().push(name);
            if name == "reload" {
                return Err(CommandError::Host {
                    method: name.into(),
                    message: "bridge gone".into(),
                });
            }
            Ok(json!(name))
        }
    }

    fn explode() -> Result<Option<Value>, CommandError> {
        panic!("kaboom")
    }

    fn request(command: &str) -> CommandRequest {
        CommandRequest {
            command: command.into(),
            target_device_id: "dev-A".into(),
            command_id: "cmd-1".into(),
        }
    }

    #[tokio::test]
    async fn first_provided_probe_wins() {
        let host = FakeHost::with(&[
            (ApiTier::DevSettings, "toggleElementInspector"),
            (ApiTier::NativeModule, "DevSettings.toggleElementInspector"),
        ]);
        let registry = CommandRegistry::new(host.clone());

        let msg = registry.run(&request("toggle-inspector"), "dev-A").await;
        assert_eq!(msg.status, CommandStatus::Success);
        assert_eq!(msg.result, Some(json!("toggleElementInspector")));
        assert_eq!(*host.calls.lock(), vec!["toggleElementInspector"]);
    }

    #[tokio::test]
    async fn missing_api_is_a_successful_notice() {
        let registry = CommandRegistry::new(Arc::new(NoDevTools));
        let msg = registry.run(&request("take-screenshot"), "dev-A").await;
        assert_eq!(msg.status, CommandStatus::Success);
        let notice = msg.result.unwrap()["notice"].as_str().unwrap().to_string();
        assert!(notice.contains("set_implementations"));
    }

    #[tokio::test]
    async fn host_failure_becomes_error_result() {
        let host = FakeHost::with(&[(ApiTier::DevSettings, "reload")]);
        let registry = CommandRegistry::new(host);
        let msg = registry.run(&request("reload"), "dev-A").await;
        assert_eq!(msg.status, CommandStatus::Error);
        assert_eq!(msg.command_id, "cmd-1");
        assert!(msg.error.unwrap().contains("bridge gone"));
    }

    #[tokio::test]
    async fn unknown_command_is_an_error_result() {
        let registry = CommandRegistry::new(Arc::new(NoDevTools));
        let msg = registry.run(&request("format-disk"), "dev-A").await;
        assert_eq!(msg.status, CommandStatus::Error);
        assert_eq!(msg.command_type, "format-disk");
    }

    #[tokio::test]
    async fn panicking_override_is_caught() {
        let registry = CommandRegistry::new(Arc::new(NoDevTools));
        let exploding: CommandImpl = Arc::new(|| async { explode() }.boxed());
        registry.set_implementations([(CommandType::ClearCache, exploding)]);

        let msg = registry.run(&request("clear-cache"), "dev-A").await;
        assert_eq!(msg.status, CommandStatus::Error);
        assert!(msg.error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn override_only_replaces_its_entry() {
        let registry = CommandRegistry::new(Arc::new(NoDevTools));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let custom: CommandImpl = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Option<Value>, _>(CommandError::Failed("custom reload refused".into())) }
                .boxed()
        });
        registry.set_implementations([(CommandType::Reload, custom)]);

        let reload = registry.run(&request("reload"), "dev-A").await;
        assert_eq!(reload.status, CommandStatus::Error);
        assert_eq!(reload.error.as_deref(), Some("custom reload refused"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let inspector = registry.run(&request("toggle-inspector"), "dev-A").await;
        assert_eq!(inspector.status, CommandStatus::Success);
        assert_eq!(inspector.result.unwrap()["handled"], false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execute_emits_exactly_one_result() {
        let (channel, mut rx) = LocalChannel::new();
        let registry = CommandRegistry::new(Arc::new(NoDevTools));

        registry.execute(&request("shake-device"), &channel, "dev-A").await;

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.event, events::EXPO_COMMAND_RESULT);
        assert_eq!(envelope.data["commandId"], "cmd-1");
        assert_eq!(envelope.data["status"], "success");
        assert!(rx.try_recv().is_err());
    }
}
