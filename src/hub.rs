use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ordering::{SnapshotDecision, SnapshotOrdering};
use crate::types::{events, Device, DeviceInfo, Envelope, Hello};

pub type PeerId = Uuid;

struct Peer {
    role: Hello,
    sender: mpsc::Sender<Envelope>,
    /// Cancelled when the peer is dropped from the hub; the gateway closes the socket.
    closed: CancellationToken,
    /// Set once a device peer has announced itself.
    device_id: Option<String>,
}

/// Relay between device sockets and dashboard sockets.
#[derive(Clone)]
pub struct Hub {
    peers: Arc<DashMap<PeerId, Peer>>,
    devices: Arc<DashMap<String, Device>>,
    ordering: Arc<SnapshotOrdering>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            devices: Arc::new(DashMap::new()),
            ordering: Arc::new(SnapshotOrdering::new()),
        }
    }

    /// Returns a token cancelled once the hub drops the peer, whether the
    /// socket closed or the peer was evicted.
    pub fn register_peer(
        &self,
        peer_id: PeerId,
        role: Hello,
        sender: mpsc::Sender<Envelope>,
    ) -> CancellationToken {
        let closed = CancellationToken::new();
        self.peers.insert(
            peer_id,
            Peer {
                role,
                sender,
                closed: closed.clone(),
                device_id: None,
            },
        );
        debug!(%peer_id, ?role, "peer registered");

        if role == Hello::Dashboard {
            self.send_to(peer_id, self.devices_envelope());
        }
        closed
    }

    pub fn is_registered(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Drops the peer. A device peer's device is kept but marked disconnected.
    pub fn unregister_peer(&self, peer_id: &PeerId) {
        let Some((_, peer)) = self.peers.remove(peer_id) else {
            return;
        };
        peer.closed.cancel();
        debug!(%peer_id, role = ?peer.role, "peer unregistered");

        if let Some(device_id) = peer.device_id {
            let still_attached = self
                .peers
                .iter()
                .any(|p| p.device_id.as_deref() == Some(device_id.as_str()));
            if !still_attached {
                if let Some(mut device) = self.devices.get_mut(&device_id) {
                    device.connected = false;
                }
                info!(%device_id, "device disconnected");
                self.publish_devices();
            }
        }
    }

    /// Records the device behind `peer_id` and re-baselines its snapshot ordering.
    pub fn register_device(&self, peer_id: PeerId, info: DeviceInfo) {
        let device_id = info.device_id.clone();
        match self.peers.get_mut(&peer_id) {
            Some(mut peer) => peer.device_id = Some(device_id.clone()),
            None => {
                debug!(%peer_id, %device_id, "device-info from unregistered peer ignored");
                return;
            }
        }
        self.ordering.reset(&device_id);
        self.devices
            .insert(device_id.clone(), Device::connected(info));
        info!(%device_id, %peer_id, "device connected");
        self.publish_devices();
    }

    /// Known devices, connected or not, sorted by id.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn peer_count(&self, role: Hello) -> usize {
        self.peers.iter().filter(|p| p.role == role).count()
    }

    /// Routes a frame sent by a device peer to every dashboard.
    pub fn from_device(&self, peer_id: PeerId, envelope: Envelope) -> usize {
        if !self.is_registered(&peer_id) {
            debug!(%peer_id, event = %envelope.event, "frame from unregistered peer dropped");
            return 0;
        }
        match envelope.event.as_str() {
            events::DEVICE_INFO => {
                match serde_json::from_value::<DeviceInfo>(envelope.data.clone()) {
                    Ok(info) if !info.device_id.trim().is_empty() => {
                        self.register_device(peer_id, info)
                    }
                    Ok(_) => warn!(%peer_id, "device-info without a device id"),
                    Err(e) => warn!(%peer_id, error = %e, "malformed device-info"),
                }
            }
            events::QUERY_SYNC => {
                if !self.accept_snapshot(&envelope.data) {
                    return 0;
                }
            }
            _ => {}
        }
        self.fan_out(Hello::Dashboard, &envelope)
    }

    /// Routes a frame sent by a dashboard peer to every device.
    pub fn from_dashboard(&self, peer_id: PeerId, envelope: Envelope) -> usize {
        if !self.is_registered(&peer_id) {
            debug!(%peer_id, event = %envelope.event, "frame from unregistered peer dropped");
            return 0;
        }
        self.fan_out(Hello::Device, &envelope)
    }

    fn accept_snapshot(&self, data: &Value) -> bool {
        let device_id = data.get("persistentDeviceId").and_then(Value::as_str);
        let sequence = data.get("sequence").and_then(Value::as_u64);
        let (Some(device_id), Some(sequence)) = (device_id, sequence) else {
            return true;
        };

        match self.ordering.classify(device_id, sequence) {
            SnapshotDecision::Forward => true,
            SnapshotDecision::ForwardAfterGap { expected, got } => {
                debug!(%device_id, expected, got, "snapshot sequence gap");
                true
            }
            SnapshotDecision::DropStale { last } => {
                debug!(%device_id, sequence, last, "dropping stale snapshot");
                false
            }
        }
    }

    fn devices_envelope(&self) -> Envelope {
        let devices = serde_json::to_value(self.devices()).unwrap_or(Value::Array(Vec::new()));
        Envelope::new(events::DEVICES_UPDATED, devices)
    }

    fn publish_devices(&self) {
        let envelope = self.devices_envelope();
        self.fan_out(Hello::Dashboard, &envelope);
    }

    fn send_to(&self, peer_id: PeerId, envelope: Envelope) -> bool {
        let Some(sender) = self.peers.get(&peer_id).map(|p| p.sender.clone()) else {
            return false;
        };
        match sender.try_send(envelope) {
            Ok(_) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%peer_id, "send buffer full, disconnecting");
                self.unregister_peer(&peer_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(%peer_id, "channel closed, cleaning up");
                self.unregister_peer(&peer_id);
                false
            }
        }
    }

    fn fan_out(&self, role: Hello, envelope: &Envelope) -> usize {
        let targets: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| p.role == role)
            .map(|p| *p.key())
            .collect();

        targets
            .into_iter()
            .filter(|peer_id| self.send_to(*peer_id, envelope.clone()))
            .count()
    }
}
