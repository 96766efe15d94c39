use crate::hass_mqtt::base::EntityConfig;
use crate::hass_mqtt::instance::{publish_entity_config, EntityInstance};
use crate::service::device::Device as ServiceDevice;
use crate::service::hass::{
    cover_command_topic, cover_position_topic, cover_set_position_topic, topic_safe_id,
};
use crate::service::hass_gc::PublishedEntity;
use crate::service::mqtt::BridgeClient;
use crate::service::state::StateHandle;
use async_trait::async_trait;
use serde::Serialize;

pub const PAYLOAD_OPEN: &str = "OPEN";
pub const PAYLOAD_CLOSE: &str = "CLOSE";

#[derive(Serialize, Clone, Debug)]
pub struct CoverConfig {
    #[serde(flatten)]
    pub base: EntityConfig,

    pub command_topic: String,
    pub position_topic: String,
    pub set_position_topic: String,
    pub payload_open: &'static str,
    pub payload_close: &'static str,
    /// Serialized as null: the nodes cannot stop mid-travel, so we
    /// don't want HASS to offer a stop button.
    pub payload_stop: Option<&'static str>,
}

/// The cover entity projected for a shade node.
pub struct ShadeCover {
    config: CoverConfig,
    device_id: String,
    state: StateHandle,
}

impl ShadeCover {
    pub fn new(device: &ServiceDevice, state: &StateHandle) -> Self {
        let id = topic_safe_id(device);
        let unique_id = format!("verme2mqtt-{id}");

        Self {
            config: CoverConfig {
                base: EntityConfig {
                    device_class: Some("shade"),
                    // Leave the entity name empty; the cover IS the device
                    ..EntityConfig::for_device(device, None, unique_id)
                },
                command_topic: cover_command_topic(&id),
                position_topic: cover_position_topic(&id),
                set_position_topic: cover_set_position_topic(&id),
                payload_open: PAYLOAD_OPEN,
                payload_close: PAYLOAD_CLOSE,
                payload_stop: None,
            },
            device_id: device.id.to_string(),
            state: state.clone(),
        }
    }
}

#[async_trait]
impl EntityInstance for ShadeCover {
    async fn publish_config(
        &self,
        state: &StateHandle,
        client: &BridgeClient,
    ) -> anyhow::Result<PublishedEntity> {
        publish_entity_config("cover", state, client, &self.config.base, &self.config).await
    }

    async fn notify_state(&self, client: &BridgeClient) -> anyhow::Result<()> {
        let device = self
            .state
            .device_by_id(&self.device_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("device '{}' not found", self.device_id))?;

        match device.position() {
            Some(position) => {
                client
                    .publish(&self.config.position_topic, position.to_string())
                    .await
            }
            None => {
                // No valid report yet; HASS shows the cover as unknown
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node_api::from_json;
    use std::sync::Arc;

    #[tokio::test]
    async fn cover_config_shape() {
        let state = Arc::new(crate::service::state::State::new());
        let device = state
            .upsert_device(
                "shade_001",
                "shades",
                from_json(r#"{"name":"Bedroom Shade","version":"1.2"}"#).unwrap(),
            )
            .await;
        let cover = ShadeCover::new(&device, &state);

        let config = serde_json::to_value(&cover.config).unwrap();
        k9::snapshot!(
            serde_json::to_string_pretty(&config).unwrap().replace(
                crate::version_info::verme_version(),
                "VERSION"
            ),
            r#"
{
  "availability": [
    {
      "topic": "verme2mqtt/availability"
    },
    {
      "topic": "verme2mqtt/shade_001/availability"
    }
  ],
  "availability_mode": "all",
  "command_topic": "verme2mqtt/cover/shade_001/command",
  "device": {
    "identifiers": [
      "verme2mqtt-shade_001"
    ],
    "manufacturer": "Verme",
    "model": "Verme Shade",
    "name": "Bedroom Shade",
    "sw_version": "1.2",
    "via_device": "verme2mqtt"
  },
  "device_class": "shade",
  "name": null,
  "origin": {
    "name": "verme2mqtt",
    "sw_version": "VERSION",
    "url": "https://github.com/verme-home/verme2mqtt"
  },
  "payload_close": "CLOSE",
  "payload_open": "OPEN",
  "payload_stop": null,
  "position_topic": "verme2mqtt/cover/shade_001/position",
  "set_position_topic": "verme2mqtt/cover/shade_001/set_position",
  "unique_id": "verme2mqtt-shade_001"
}
"#
        );
    }
}
