use crate::service::device::Device as ServiceDevice;
use crate::service::hass::{availability_topic, device_availability_topic, topic_safe_id};
use crate::version_info::verme_version;
use serde::Serialize;

const MODEL: &str = "verme2mqtt";
const URL: &str = "https://github.com/verme-home/verme2mqtt";

/// The field block common to every discovery config we publish.
#[derive(Serialize, Clone, Debug, Default)]
pub struct EntityConfig {
    /// The entity is available only while every listed topic says so;
    /// the bridge-level topic covers our last will, the per-device
    /// topic is flipped by the reconciliation pass.
    pub availability: Vec<AvailabilityTopic>,
    pub availability_mode: &'static str,
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    pub origin: Origin,
    pub device: Device,
    pub unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl EntityConfig {
    pub fn for_device(device: &ServiceDevice, name: Option<String>, unique_id: String) -> Self {
        Self {
            availability: vec![
                AvailabilityTopic {
                    topic: availability_topic(),
                },
                AvailabilityTopic {
                    topic: device_availability_topic(&topic_safe_id(device)),
                },
            ],
            availability_mode: "all",
            name,
            device_class: None,
            origin: Origin::default(),
            device: Device::for_device(device),
            unique_id,
            entity_category: None,
            icon: None,
        }
    }

    pub fn for_this_service(name: Option<String>, unique_id: String) -> Self {
        Self {
            availability: vec![AvailabilityTopic {
                topic: availability_topic(),
            }],
            availability_mode: "all",
            name,
            device_class: None,
            origin: Origin::default(),
            device: Device::this_service(),
            unique_id,
            entity_category: None,
            icon: None,
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct AvailabilityTopic {
    pub topic: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct Origin {
    pub name: &'static str,
    pub sw_version: &'static str,
    pub url: &'static str,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            name: MODEL,
            sw_version: verme_version(),
            url: URL,
        }
    }
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct Device {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<String>,
}

impl Device {
    pub fn for_device(device: &ServiceDevice) -> Self {
        Self {
            name: device.name(),
            manufacturer: "Verme".to_string(),
            model: device.model(),
            sw_version: device.installed_version(),
            via_device: Some(MODEL.to_string()),
            identifiers: vec![format!("verme2mqtt-{}", topic_safe_id(device))],
        }
    }

    pub fn this_service() -> Self {
        Self {
            name: "Verme to MQTT".to_string(),
            manufacturer: "Verme".to_string(),
            model: MODEL.to_string(),
            sw_version: Some(verme_version().to_string()),
            via_device: None,
            identifiers: vec![MODEL.to_string()],
        }
    }
}
