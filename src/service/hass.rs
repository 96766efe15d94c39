use crate::hass_mqtt::button::CheckUpdateButton;
use crate::hass_mqtt::cover::ShadeCover;
use crate::hass_mqtt::instance::EntityList;
use crate::hass_mqtt::sensor::FixedDiagnostic;
use crate::hass_mqtt::update::{FirmwareUpdate, UpdateEntityState};
use crate::service::device::Device as ServiceDevice;
use crate::service::hass_gc;
use crate::service::mqtt::BridgeClient;
use crate::service::state::StateHandle;
use crate::version_info::verme_version;
use anyhow::Context;

pub fn topic_safe_string(s: &str) -> String {
    let mut result = String::new();
    for c in s.chars() {
        if c == ':' || c == ' ' || c == '/' {
            result.push('_');
        } else {
            result.push(c.to_ascii_lowercase());
        }
    }
    result
}

pub fn topic_safe_id(device: &ServiceDevice) -> String {
    topic_safe_string(&device.id)
}

/// All entities reference this topic so that our last will can mark
/// the whole bridge unavailable in one shot
pub fn availability_topic() -> String {
    "verme2mqtt/availability".to_string()
}

/// Per-device availability, flipped by the reconciliation pass when a
/// node falls silent past the TTL
pub fn device_availability_topic(id: &str) -> String {
    format!("verme2mqtt/{id}/availability")
}

pub fn cover_command_topic(id: &str) -> String {
    format!("verme2mqtt/cover/{id}/command")
}

pub fn cover_set_position_topic(id: &str) -> String {
    format!("verme2mqtt/cover/{id}/set_position")
}

pub fn cover_position_topic(id: &str) -> String {
    format!("verme2mqtt/cover/{id}/position")
}

pub fn update_state_topic(id: &str) -> String {
    format!("verme2mqtt/update/{id}/state")
}

pub fn update_install_topic(id: &str) -> String {
    format!("verme2mqtt/update/{id}/install")
}

pub fn update_check_topic(id: &str) -> String {
    format!("verme2mqtt/update/{id}/check")
}

fn entities_for_device(device: &ServiceDevice, state: &StateHandle) -> EntityList {
    let mut entities = EntityList::new();
    if device.is_shade() {
        entities.add(ShadeCover::new(device, state));
    }
    entities.add(FirmwareUpdate::new(device, state));
    entities.add(CheckUpdateButton::new(device));
    entities
}

/// Register (or refresh) the entities belonging to a single device.
/// This is invoked once per discovery message, so a new node shows up
/// without touching the entities of any other device.
pub async fn register_device(
    state: &StateHandle,
    client: &BridgeClient,
    device: &ServiceDevice,
) -> anyhow::Result<()> {
    log::info!("Registering {device} with Home Assistant");
    let entities = entities_for_device(device, state);
    entities
        .publish_config(state, client)
        .await
        .with_context(|| format!("publishing configs for {device}"))?;

    client
        .publish_retained(device_availability_topic(&topic_safe_id(device)), "online")
        .await?;

    entities
        .notify_state(client)
        .await
        .with_context(|| format!("publishing state for {device}"))?;

    if let Err(err) = hass_gc::save_published_entities(&state.published_entities().await) {
        log::warn!("Failed to persist published entity list: {err:#}");
    }

    Ok(())
}

/// Register the entities that describe the bridge itself
pub async fn register_bridge(state: &StateHandle, client: &BridgeClient) -> anyhow::Result<()> {
    let mut entities = EntityList::new();
    entities.add(FixedDiagnostic::new("Version", verme_version()));
    entities.publish_config(state, client).await?;

    client
        .publish_retained(availability_topic(), "online")
        .await
        .context("online -> availability_topic")?;

    entities.notify_state(client).await
}

/// Full registration pass: the bridge plus every known device. Used
/// when Home Assistant announces a restart and when we reconnect to
/// the broker.
pub async fn register_everything(state: &StateHandle, client: &BridgeClient) -> anyhow::Result<()> {
    register_bridge(state, client).await?;
    for device in state.devices().await {
        register_device(state, client, &device).await?;
    }
    Ok(())
}

pub async fn advise_hass_of_position(
    device: &ServiceDevice,
    client: &BridgeClient,
) -> anyhow::Result<()> {
    if let Some(position) = device.position() {
        client
            .publish(
                cover_position_topic(&topic_safe_id(device)),
                position.to_string(),
            )
            .await?;
    }
    Ok(())
}

pub async fn advise_hass_of_update_state(
    device: &ServiceDevice,
    client: &BridgeClient,
) -> anyhow::Result<()> {
    client
        .publish_obj(
            update_state_topic(&topic_safe_id(device)),
            UpdateEntityState::for_device(device),
            false,
        )
        .await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn safe_strings() {
        assert_eq!(topic_safe_string("shade_001"), "shade_001");
        assert_eq!(topic_safe_string("AA:BB CC"), "aa_bb_cc");
    }

    #[test]
    fn topics() {
        assert_eq!(
            cover_command_topic("shade_001"),
            "verme2mqtt/cover/shade_001/command"
        );
        assert_eq!(
            device_availability_topic("shade_001"),
            "verme2mqtt/shade_001/availability"
        );
        assert_eq!(
            update_state_topic("shade_001"),
            "verme2mqtt/update/shade_001/state"
        );
    }
}
