use crate::hass_mqtt::base::EntityConfig;
use crate::hass_mqtt::instance::{publish_entity_config, EntityInstance};
use crate::service::hass::topic_safe_string;
use crate::service::hass_gc::PublishedEntity;
use crate::service::mqtt::BridgeClient;
use crate::service::state::StateHandle;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Serialize, Clone, Debug)]
pub struct SensorConfig {
    #[serde(flatten)]
    pub base: EntityConfig,

    pub state_topic: String,
}

/// A diagnostic sensor attached to the bridge device whose value never
/// changes for the lifetime of the process, eg: the bridge version.
#[derive(Clone)]
pub struct FixedDiagnostic {
    sensor: SensorConfig,
    value: String,
}

impl FixedDiagnostic {
    pub fn new<NAME: Into<String>, VALUE: Into<String>>(name: NAME, value: VALUE) -> Self {
        let name = name.into();
        let unique_id = format!("verme2mqtt-{}", topic_safe_string(&name));

        let mut base = EntityConfig::for_this_service(Some(name), unique_id.clone());
        base.entity_category = Some("diagnostic".to_string());

        Self {
            sensor: SensorConfig {
                base,
                state_topic: format!("verme2mqtt/sensor/{unique_id}/state"),
            },
            value: value.into(),
        }
    }
}

#[async_trait]
impl EntityInstance for FixedDiagnostic {
    async fn publish_config(
        &self,
        state: &StateHandle,
        client: &BridgeClient,
    ) -> anyhow::Result<PublishedEntity> {
        publish_entity_config("sensor", state, client, &self.sensor.base, &self.sensor).await
    }

    async fn notify_state(&self, client: &BridgeClient) -> anyhow::Result<()> {
        client.publish(&self.sensor.state_topic, &self.value).await
    }
}
