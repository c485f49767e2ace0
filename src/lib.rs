pub mod cache;
pub mod channel;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod http_tap;
pub mod hub;
pub mod interceptors;
pub mod memory_cache;
pub mod ordering;
pub mod serializer;
pub mod storage;
pub mod targeting;
pub mod tasks;
pub mod types;
pub mod ws_gateway;

pub use coordinator::{Collaborators, ConnectionState, SyncCoordinator, SyncError};

/// Shared state of the hub server.
pub struct AppState {
    pub hub: hub::Hub,
    pub ws_send_buffer: usize,
}

impl AppState {
    pub fn initialize(config: &config::HubConfig) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            hub: hub::Hub::new(),
            ws_send_buffer: config.ws_send_buffer,
        })
    }
}
