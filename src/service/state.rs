use crate::node_api::NodeInfo;
use crate::service::device::{Device, PendingPosition};
use crate::service::hass_gc::PublishedEntity;
use crate::service::mqtt::BridgeClient;
use chrono::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

/// The device registry plus the handles shared between the mqtt event
/// loop, the command handlers and the reconciliation pass.
#[derive(Default)]
pub struct State {
    devices_by_id: Mutex<HashMap<String, Device>>,
    bridge_client: Mutex<Option<BridgeClient>>,
    hass_discovery_prefix: Mutex<String>,
    published_entities: Mutex<HashSet<PublishedEntity>>,
}

pub type StateHandle = Arc<State>;

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_hass_disco_prefix(&self, prefix: String) {
        *self.hass_discovery_prefix.lock().await = prefix;
    }

    pub async fn get_hass_disco_prefix(&self) -> String {
        self.hass_discovery_prefix.lock().await.to_string()
    }

    pub async fn set_bridge_client(&self, client: BridgeClient) {
        self.bridge_client.lock().await.replace(client);
    }

    pub async fn get_bridge_client(&self) -> Option<BridgeClient> {
        self.bridge_client.lock().await.clone()
    }

    /// Record a device announced by a discovery message, replacing any
    /// prior record for the same id. Always succeeds; returns a
    /// snapshot of the stored device.
    pub async fn upsert_device(&self, id: &str, device_type: &str, info: NodeInfo) -> Device {
        let mut devices = self.devices_by_id.lock().await;
        let device = devices
            .entry(id.to_string())
            .or_insert_with(|| Device::new(device_type, id));
        device.apply_discovery(device_type, info);
        device.clone()
    }

    /// Returns an immutable copy of the specified device
    pub async fn device_by_id(&self, id: &str) -> Option<Device> {
        let devices = self.devices_by_id.lock().await;
        devices.get(id).cloned()
    }

    /// Returns a mutable reference to an already-discovered device.
    /// Messages for ids we never saw a discovery for are the caller's
    /// problem; there is nothing to project them onto.
    pub async fn device_mut(&self, id: &str) -> Option<MappedMutexGuard<'_, Device>> {
        let devices = self.devices_by_id.lock().await;
        MutexGuard::try_map(devices, |devices| devices.get_mut(id)).ok()
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.devices_by_id.lock().await.values().cloned().collect()
    }

    /// Resolve a device from the id segment of a command topic, which
    /// is the topic-safe rendering of the device id.
    pub async fn resolve_device(&self, label: &str) -> Option<Device> {
        let devices = self.devices_by_id.lock().await;

        if let Some(device) = devices.get(label) {
            return Some(device.clone());
        }

        devices
            .values()
            .find(|d| crate::service::hass::topic_safe_id(d) == label)
            .cloned()
    }

    /// Mark devices that haven't spoken within the TTL as lost.
    /// Returns snapshots of the devices that just transitioned, so the
    /// caller can flip their availability.
    pub async fn mark_lost_devices(&self, ttl: Duration) -> Vec<Device> {
        let now = chrono::Utc::now();
        let mut devices = self.devices_by_id.lock().await;
        let mut newly_lost = vec![];
        for device in devices.values_mut() {
            if !device.lost && now - device.last_seen > ttl {
                device.lost = true;
                newly_lost.push(device.clone());
            }
        }
        newly_lost
    }

    /// Expire position commands the nodes never acknowledged. Returns
    /// each affected device (post-expiry snapshot) with the command
    /// that was dropped.
    pub async fn expire_pending_positions(
        &self,
        timeout: Duration,
    ) -> Vec<(Device, PendingPosition)> {
        let mut devices = self.devices_by_id.lock().await;
        let mut expired = vec![];
        for device in devices.values_mut() {
            if let Some(pending) = device.expire_pending_position(timeout) {
                expired.push((device.clone(), pending));
            }
        }
        expired
    }

    pub async fn note_published_entity(&self, entity: PublishedEntity) {
        self.published_entities.lock().await.insert(entity);
    }

    pub async fn published_entities(&self) -> HashSet<PublishedEntity> {
        self.published_entities.lock().await.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node_api::from_json;

    #[tokio::test]
    async fn upsert_is_last_write_wins() {
        let state = State::new();
        let device = state
            .upsert_device(
                "shade_001",
                "shades",
                from_json(r#"{"name":"Bedroom Shade","version":"1.2"}"#).unwrap(),
            )
            .await;
        assert_eq!(device.name(), "Bedroom Shade");
        assert_eq!(device.topic().base(), "verme/shades/shade_001");

        let device = state
            .upsert_device(
                "shade_001",
                "shades",
                from_json(r#"{"name":"Kitchen Shade"}"#).unwrap(),
            )
            .await;
        assert_eq!(device.name(), "Kitchen Shade");
        // The replacement had no version; there is no merge
        assert_eq!(device.installed_version(), None);

        assert_eq!(state.devices().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_devices_are_absent() {
        let state = State::new();
        assert!(state.device_by_id("shade_404").await.is_none());
        assert!(state.device_mut("shade_404").await.is_none());
    }

    #[tokio::test]
    async fn lost_devices_are_marked_not_removed() {
        let state = State::new();
        state
            .upsert_device("shade_001", "shades", NodeInfo::default())
            .await;

        // Anything seen within the TTL stays
        assert!(state.mark_lost_devices(Duration::minutes(60)).await.is_empty());

        let lost = state.mark_lost_devices(Duration::seconds(-1)).await;
        assert_eq!(lost.len(), 1);
        assert!(lost[0].lost);

        // Already-lost devices don't transition again
        assert!(state.mark_lost_devices(Duration::seconds(-1)).await.is_empty());

        // The record itself is still present
        assert!(state.device_by_id("shade_001").await.is_some());

        // Hearing from the device clears the marker
        let was_lost = state.device_mut("shade_001").await.unwrap().touch();
        assert!(was_lost);
    }

    #[tokio::test]
    async fn pending_positions_expire_registry_wide() {
        let state = State::new();
        state
            .upsert_device("shade_001", "shades", NodeInfo::default())
            .await;
        {
            let mut device = state.device_mut("shade_001").await.unwrap();
            device.apply_reported_position(10);
            device.note_commanded_position(90);
        }

        let expired = state.expire_pending_positions(Duration::seconds(-1)).await;
        assert_eq!(expired.len(), 1);
        let (device, pending) = &expired[0];
        assert_eq!(pending.position, 90);
        assert_eq!(device.position(), Some(10));
    }
}
