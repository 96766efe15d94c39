use crate::hass_mqtt::base::EntityConfig;
use crate::hass_mqtt::instance::{publish_entity_config, EntityInstance};
use crate::node_api::UPDATE_CHECK_PAYLOAD;
use crate::service::device::Device as ServiceDevice;
use crate::service::hass::{topic_safe_id, update_check_topic};
use crate::service::hass_gc::PublishedEntity;
use crate::service::mqtt::BridgeClient;
use crate::service::state::StateHandle;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Serialize, Clone, Debug)]
pub struct ButtonConfig {
    #[serde(flatten)]
    pub base: EntityConfig,

    pub command_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_press: Option<String>,
}

/// A per-device button that asks the node to look for new firmware.
/// The HASS update entity has no check-for-update service over MQTT,
/// so this is how the check command gets a surface.
pub struct CheckUpdateButton {
    config: ButtonConfig,
}

impl CheckUpdateButton {
    pub fn new(device: &ServiceDevice) -> Self {
        let id = topic_safe_id(device);
        let unique_id = format!("verme2mqtt-{id}-check-update");

        let mut base =
            EntityConfig::for_device(device, Some("Check for update".to_string()), unique_id);
        base.entity_category = Some("diagnostic".to_string());

        Self {
            config: ButtonConfig {
                base,
                command_topic: update_check_topic(&id),
                payload_press: Some(UPDATE_CHECK_PAYLOAD.to_string()),
            },
        }
    }
}

#[async_trait]
impl EntityInstance for CheckUpdateButton {
    async fn publish_config(
        &self,
        state: &StateHandle,
        client: &BridgeClient,
    ) -> anyhow::Result<PublishedEntity> {
        publish_entity_config("button", state, client, &self.config.base, &self.config).await
    }

    async fn notify_state(&self, _client: &BridgeClient) -> anyhow::Result<()> {
        // Buttons have no state
        Ok(())
    }
}
