use crate::hass_mqtt::base::EntityConfig;
use crate::hass_mqtt::instance::{publish_entity_config, EntityInstance};
use crate::service::device::Device as ServiceDevice;
use crate::service::hass::{topic_safe_id, update_install_topic, update_state_topic};
use crate::service::hass_gc::PublishedEntity;
use crate::service::mqtt::BridgeClient;
use crate::service::state::StateHandle;
use async_trait::async_trait;
use serde::Serialize;

pub const PAYLOAD_INSTALL: &str = "install";

#[derive(Serialize, Clone, Debug)]
pub struct UpdateConfig {
    #[serde(flatten)]
    pub base: EntityConfig,

    pub state_topic: String,
    /// Same topic as the state; HASS picks up the additional fields
    /// (eg: last_check) as entity attributes
    pub json_attributes_topic: String,
    pub command_topic: String,
    pub payload_install: &'static str,
}

/// The JSON state blob the HASS update entity consumes.
/// HASS derives "update available" by comparing the two versions, so
/// when nothing is pending we report the installed version as latest.
#[derive(Serialize, Clone, Debug)]
pub struct UpdateEntityState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    pub in_progress: bool,
    /// Always serialized; null is what clears the progress bar
    pub update_percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<String>,
}

impl UpdateEntityState {
    pub fn for_device(device: &ServiceDevice) -> Self {
        let installed_version = device.installed_version();
        let latest_version = if device.update_available() {
            device.latest_version()
        } else {
            installed_version.clone()
        };
        Self {
            installed_version,
            latest_version,
            in_progress: device.update_in_progress(),
            update_percentage: device.update_percentage(),
            release_summary: device.release_notes(),
            last_check: device.last_update_check(),
        }
    }
}

/// The firmware update entity projected for every discovered node.
pub struct FirmwareUpdate {
    config: UpdateConfig,
    device_id: String,
    state: StateHandle,
}

impl FirmwareUpdate {
    pub fn new(device: &ServiceDevice, state: &StateHandle) -> Self {
        let id = topic_safe_id(device);
        let unique_id = format!("verme2mqtt-{id}-firmware");

        Self {
            config: UpdateConfig {
                base: EntityConfig {
                    device_class: Some("firmware"),
                    ..EntityConfig::for_device(device, Some("Firmware".to_string()), unique_id)
                },
                state_topic: update_state_topic(&id),
                json_attributes_topic: update_state_topic(&id),
                command_topic: update_install_topic(&id),
                payload_install: PAYLOAD_INSTALL,
            },
            device_id: device.id.to_string(),
            state: state.clone(),
        }
    }
}

#[async_trait]
impl EntityInstance for FirmwareUpdate {
    async fn publish_config(
        &self,
        state: &StateHandle,
        client: &BridgeClient,
    ) -> anyhow::Result<PublishedEntity> {
        publish_entity_config("update", state, client, &self.config.base, &self.config).await
    }

    async fn notify_state(&self, client: &BridgeClient) -> anyhow::Result<()> {
        let device = self
            .state
            .device_by_id(&self.device_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("device '{}' not found", self.device_id))?;

        client
            .publish_obj(
                &self.config.state_topic,
                UpdateEntityState::for_device(&device),
                false,
            )
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node_api::{from_json, UpdateAvailability, UpdateStatus};
    use crate::service::device::Device;

    fn shade() -> Device {
        let mut device = Device::new("shades", "shade_001");
        device.apply_discovery(
            "shades",
            from_json(r#"{"name":"Bedroom Shade","version":"1.2"}"#).unwrap(),
        );
        device
    }

    #[test]
    fn idle_state_reports_installed_as_latest() {
        let payload = serde_json::to_value(UpdateEntityState::for_device(&shade())).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "installed_version": "1.2",
                "latest_version": "1.2",
                "in_progress": false,
                "update_percentage": null,
            })
        );
    }

    #[test]
    fn available_update_is_exposed() {
        let mut device = shade();
        let avail: UpdateAvailability =
            from_json(r#"{"available":true,"version":"2.0","release_notes":"fix"}"#).unwrap();
        device.apply_update_availability(&avail);

        let payload = serde_json::to_value(UpdateEntityState::for_device(&device)).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "installed_version": "1.2",
                "latest_version": "2.0",
                "in_progress": false,
                "update_percentage": null,
                "release_summary": "fix",
            })
        );
    }

    #[test]
    fn busy_state_carries_percentage() {
        let mut device = shade();
        let status: UpdateStatus =
            from_json(r#"{"status":"installing","progress":42}"#).unwrap();
        device.apply_update_status(&status);

        let payload = serde_json::to_value(UpdateEntityState::for_device(&device)).unwrap();
        assert_eq!(payload["in_progress"], serde_json::json!(true));
        assert_eq!(payload["update_percentage"], serde_json::json!(42));
    }
}
