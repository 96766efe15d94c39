use crate::node_api::{
    clamp_position, from_json, parse_reported_position, NodeInfo, TopicBase, UpdateAvailability,
    UpdateStatus, UPDATE_CHECK_PAYLOAD, UPDATE_START_PAYLOAD,
};
use crate::opt_env_var;
use crate::service::hass::{self, availability_topic, device_availability_topic, topic_safe_id};
use crate::service::state::StateHandle;
use anyhow::Context;
use async_channel::Receiver;
use mosquitto_rs::router::{MqttRouter, Params, Payload, State};
use mosquitto_rs::{Client, Event, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;

#[derive(clap::Parser, Debug)]
pub struct MqttArguments {
    /// The mqtt broker hostname or address.
    /// You may also set this via the VERME_MQTT_HOST environment variable.
    #[arg(long, global = true)]
    mqtt_host: Option<String>,

    /// The mqtt broker port.
    /// You may also set this via the VERME_MQTT_PORT environment variable.
    /// If unspecified, uses 1883
    #[arg(long, global = true)]
    mqtt_port: Option<u16>,

    /// The username to authenticate against the broker.
    /// You may also set this via the VERME_MQTT_USER environment variable.
    #[arg(long, global = true)]
    mqtt_username: Option<String>,

    /// The password to authenticate against the broker.
    /// You may also set this via the VERME_MQTT_PASSWORD environment variable.
    #[arg(long, global = true)]
    mqtt_password: Option<String>,

    #[arg(long, global = true)]
    mqtt_bind_address: Option<String>,

    #[arg(long, global = true, default_value = "homeassistant")]
    pub hass_discovery_prefix: String,
}

impl MqttArguments {
    pub fn opt_mqtt_host(&self) -> anyhow::Result<Option<String>> {
        match &self.mqtt_host {
            Some(h) => Ok(Some(h.to_string())),
            None => opt_env_var("VERME_MQTT_HOST"),
        }
    }

    pub fn mqtt_host(&self) -> anyhow::Result<String> {
        self.opt_mqtt_host()?.ok_or_else(|| {
            anyhow::anyhow!(
                "Please specify the mqtt broker either via the \
                --mqtt-host parameter or by setting $VERME_MQTT_HOST"
            )
        })
    }

    pub fn mqtt_port(&self) -> anyhow::Result<u16> {
        match self.mqtt_port {
            Some(p) => Ok(p),
            None => Ok(opt_env_var("VERME_MQTT_PORT")?.unwrap_or(1883)),
        }
    }

    pub fn mqtt_username(&self) -> anyhow::Result<String> {
        match self.mqtt_username.clone() {
            Some(u) => Ok(u),
            None => opt_env_var("VERME_MQTT_USER")?.ok_or_else(|| {
                anyhow::anyhow!(
                    "Please specify the broker username either via the \
                    --mqtt-username parameter or by setting $VERME_MQTT_USER"
                )
            }),
        }
    }

    pub fn mqtt_password(&self) -> anyhow::Result<String> {
        match self.mqtt_password.clone() {
            Some(p) => Ok(p),
            None => opt_env_var("VERME_MQTT_PASSWORD")?.ok_or_else(|| {
                anyhow::anyhow!(
                    "Please specify the broker password either via the \
                    --mqtt-password parameter or by setting $VERME_MQTT_PASSWORD"
                )
            }),
        }
    }
}

/// The two conditions the operator can be shown when validating the
/// broker configuration
#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("cannot connect to the mqtt broker: {0:#}")]
    CannotConnect(anyhow::Error),
    #[error("unknown error while validating the mqtt configuration: {0:#}")]
    Unknown(anyhow::Error),
}

/// Validate the broker configuration with a live connect/disconnect
/// probe, without disturbing any retained state.
pub async fn probe_broker(args: &MqttArguments) -> Result<(), SetupError> {
    let mqtt_host = args.mqtt_host().map_err(SetupError::Unknown)?;
    let mqtt_port = args.mqtt_port().map_err(SetupError::Unknown)?;
    let mqtt_username = args.mqtt_username().map_err(SetupError::Unknown)?;
    let mqtt_password = args.mqtt_password().map_err(SetupError::Unknown)?;

    let client = Client::with_auto_id().map_err(|err| SetupError::Unknown(err.into()))?;
    client
        .set_username_and_password(Some(&mqtt_username), Some(&mqtt_password))
        .map_err(|err| SetupError::Unknown(err.into()))?;

    match timeout(
        Duration::from_secs(10),
        client.connect(
            &mqtt_host,
            mqtt_port.into(),
            Duration::from_secs(60),
            None,
        ),
    )
    .await
    {
        Ok(Ok(status)) => {
            log::debug!("Probe connection to {mqtt_host}:{mqtt_port} succeeded: {status}");
            // Dropping the client tears the probe connection down
            Ok(())
        }
        Ok(Err(err)) => Err(SetupError::CannotConnect(err.into())),
        Err(_) => Err(SetupError::CannotConnect(anyhow::anyhow!(
            "timed out connecting to {mqtt_host}:{mqtt_port}"
        ))),
    }
}

/// Connect a client for a one-shot command invocation; no last will,
/// no subscriptions.
pub async fn connect_for_command(args: &MqttArguments) -> anyhow::Result<Client> {
    let mqtt_host = args.mqtt_host()?;
    let mqtt_port = args.mqtt_port()?;
    let mqtt_username = args.mqtt_username()?;
    let mqtt_password = args.mqtt_password()?;

    let client = Client::with_auto_id()?;
    client.set_username_and_password(Some(&mqtt_username), Some(&mqtt_password))?;
    client
        .connect(
            &mqtt_host,
            mqtt_port.into(),
            Duration::from_secs(120),
            args.mqtt_bind_address.as_deref(),
        )
        .await
        .with_context(|| format!("connecting to mqtt broker {mqtt_host}:{mqtt_port}"))?;
    Ok(client)
}

/// Wraps the shared broker connection; both the node-facing command
/// publishes and the HASS-facing discovery/state publishes go through
/// this.
#[derive(Clone)]
pub struct BridgeClient {
    client: Client,
}

impl BridgeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn publish<T: AsRef<str> + std::fmt::Display, P: AsRef<[u8]> + std::fmt::Display>(
        &self,
        topic: T,
        payload: P,
    ) -> anyhow::Result<()> {
        log::trace!("{topic} -> {payload}");
        self.client
            .publish(topic, payload, QoS::AtMostOnce, false)
            .await?;
        Ok(())
    }

    pub async fn publish_retained<
        T: AsRef<str> + std::fmt::Display,
        P: AsRef<[u8]> + std::fmt::Display,
    >(
        &self,
        topic: T,
        payload: P,
    ) -> anyhow::Result<()> {
        log::trace!("{topic} -> {payload} (retained)");
        self.client
            .publish(topic, payload, QoS::AtMostOnce, true)
            .await?;
        Ok(())
    }

    pub async fn publish_obj<T: AsRef<str> + std::fmt::Display, P: Serialize>(
        &self,
        topic: T,
        payload: P,
        retain: bool,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&payload)?;
        log::trace!("{topic} -> {payload}");
        self.client
            .publish(topic, payload, QoS::AtMostOnce, retain)
            .await?;
        Ok(())
    }

    /// Ask a node to move. Retained so that a sleeping battery node
    /// sees the most recent ask on its next wake.
    pub async fn send_position_command(
        &self,
        topic: &TopicBase,
        position: u8,
    ) -> anyhow::Result<()> {
        self.publish_retained(topic.position_topic(), position.to_string())
            .await
    }

    pub async fn send_update_start(&self, topic: &TopicBase) -> anyhow::Result<()> {
        self.publish(topic.update_start_topic(), UPDATE_START_PAYLOAD)
            .await
    }

    pub async fn send_update_check(&self, topic: &TopicBase) -> anyhow::Result<()> {
        self.publish(topic.update_check_topic(), UPDATE_CHECK_PAYLOAD)
            .await
    }
}

async fn get_client(state: &StateHandle) -> anyhow::Result<BridgeClient> {
    state
        .get_bridge_client()
        .await
        .ok_or_else(|| anyhow::anyhow!("bridge client is not set"))
}

#[derive(Deserialize)]
struct NodeParams {
    device_type: String,
    id: String,
}

/// A node announced itself (or refreshed its announcement)
async fn mqtt_node_discovered(
    Payload(payload): Payload<String>,
    Params(NodeParams { device_type, id }): Params<NodeParams>,
    State(state): State<StateHandle>,
) -> anyhow::Result<()> {
    let info: NodeInfo = from_json(&payload)
        .with_context(|| format!("invalid node info from {device_type}/{id}"))?;
    log::info!("Discovered verme node {device_type}/{id}: {info:?}");

    let device = state.upsert_device(&id, &device_type, info).await;
    let client = get_client(&state).await?;
    hass::register_device(&state, &client, &device).await
}

/// A node reported its position
async fn mqtt_shade_state(
    Payload(payload): Payload<String>,
    Params(NodeParams { device_type, id }): Params<NodeParams>,
    State(state): State<StateHandle>,
) -> anyhow::Result<()> {
    let position = parse_reported_position(&payload)
        .with_context(|| format!("state report from {device_type}/{id}"))?;

    let (device, was_lost) = {
        let Some(mut device) = state.device_mut(&id).await else {
            log::trace!("state report for undiscovered device {id}; ignoring");
            return Ok(());
        };
        let was_lost = device.touch();
        device.apply_reported_position(position);
        (device.clone(), was_lost)
    };
    log::trace!(
        "{device} position now {position} closed={closed:?}",
        closed = device.is_closed()
    );

    let client = get_client(&state).await?;
    if was_lost {
        client
            .publish_retained(device_availability_topic(&topic_safe_id(&device)), "online")
            .await?;
    }
    hass::advise_hass_of_position(&device, &client).await
}

async fn mqtt_update_status(
    Payload(payload): Payload<String>,
    Params(NodeParams { device_type, id }): Params<NodeParams>,
    State(state): State<StateHandle>,
) -> anyhow::Result<()> {
    let status: UpdateStatus = from_json(&payload)
        .with_context(|| format!("invalid update status from {device_type}/{id}"))?;

    let (device, was_lost) = {
        let Some(mut device) = state.device_mut(&id).await else {
            log::trace!("update status for undiscovered device {id}; ignoring");
            return Ok(());
        };
        let was_lost = device.touch();
        device.apply_update_status(&status);
        (device.clone(), was_lost)
    };

    let client = get_client(&state).await?;
    if was_lost {
        client
            .publish_retained(device_availability_topic(&topic_safe_id(&device)), "online")
            .await?;
    }
    hass::advise_hass_of_update_state(&device, &client).await
}

async fn mqtt_update_available(
    Payload(payload): Payload<String>,
    Params(NodeParams { device_type, id }): Params<NodeParams>,
    State(state): State<StateHandle>,
) -> anyhow::Result<()> {
    let avail: UpdateAvailability = from_json(&payload)
        .with_context(|| format!("invalid update availability from {device_type}/{id}"))?;

    let (device, was_lost) = {
        let Some(mut device) = state.device_mut(&id).await else {
            log::trace!("update availability for undiscovered device {id}; ignoring");
            return Ok(());
        };
        let was_lost = device.touch();
        device.apply_update_availability(&avail);
        (device.clone(), was_lost)
    };

    let client = get_client(&state).await?;
    if was_lost {
        client
            .publish_retained(device_availability_topic(&topic_safe_id(&device)), "online")
            .await?;
    }
    hass::advise_hass_of_update_state(&device, &client).await
}

#[derive(Deserialize)]
struct IdParameter {
    id: String,
}

/// HASS pressed open or close on a cover
async fn mqtt_cover_command(
    Payload(command): Payload<String>,
    Params(IdParameter { id }): Params<IdParameter>,
    State(state): State<StateHandle>,
) -> anyhow::Result<()> {
    log::info!("Cover command for {id}: {command}");
    let target = match command.as_str() {
        "OPEN" | "open" => 100,
        "CLOSE" | "close" => 0,
        _ => anyhow::bail!("invalid cover command {command} for {id}"),
    };
    set_shade_position(&state, &id, target).await
}

/// HASS dragged the position slider
async fn mqtt_set_position(
    Payload(payload): Payload<String>,
    Params(IdParameter { id }): Params<IdParameter>,
    State(state): State<StateHandle>,
) -> anyhow::Result<()> {
    let target: i64 = payload
        .trim()
        .parse()
        .with_context(|| format!("set_position payload {payload:?} for {id}"))?;
    set_shade_position(&state, &id, target).await
}

async fn set_shade_position(state: &StateHandle, id: &str, target: i64) -> anyhow::Result<()> {
    let position = clamp_position(target);
    let device = state
        .resolve_device(id)
        .await
        .ok_or_else(|| anyhow::anyhow!("device '{id}' not found"))?;
    let client = get_client(state).await?;

    log::debug!(
        "Set position {position} for {device} (topic: {topic})",
        topic = device.topic().position_topic()
    );
    client
        .send_position_command(&device.topic(), position)
        .await?;

    // The node may take a while to actually move and report back, so
    // project the commanded position immediately
    let device = {
        let Some(mut device) = state.device_mut(&device.id).await else {
            anyhow::bail!("device '{id}' disappeared while commanding it");
        };
        device.note_commanded_position(position);
        device.clone()
    };
    hass::advise_hass_of_position(&device, &client).await
}

/// HASS asked for the firmware update to be installed
async fn mqtt_install_command(
    Payload(_command): Payload<String>,
    Params(IdParameter { id }): Params<IdParameter>,
    State(state): State<StateHandle>,
) -> anyhow::Result<()> {
    let device = state
        .resolve_device(&id)
        .await
        .ok_or_else(|| anyhow::anyhow!("device '{id}' not found"))?;
    let client = get_client(&state).await?;

    log::info!("Starting firmware update for {device}");
    // Fire and forget; progress arrives via update/status
    client.send_update_start(&device.topic()).await?;

    let device = {
        let Some(mut device) = state.device_mut(&device.id).await else {
            anyhow::bail!("device '{id}' disappeared while commanding it");
        };
        device.note_install_requested();
        device.clone()
    };
    hass::advise_hass_of_update_state(&device, &client).await
}

/// HASS pressed the check-for-update button
async fn mqtt_check_command(
    Payload(_command): Payload<String>,
    Params(IdParameter { id }): Params<IdParameter>,
    State(state): State<StateHandle>,
) -> anyhow::Result<()> {
    let device = state
        .resolve_device(&id)
        .await
        .ok_or_else(|| anyhow::anyhow!("device '{id}' not found"))?;
    let client = get_client(&state).await?;

    log::info!("Checking for updates for {device}");
    // The node answers asynchronously on update/available
    client.send_update_check(&device.topic()).await
}

/// HASS is advising us that its status has changed
async fn mqtt_homeassistant_status(
    Payload(status): Payload<String>,
    State(state): State<StateHandle>,
) -> anyhow::Result<()> {
    log::info!("Home Assistant status changed: {status}");
    let client = get_client(&state).await?;
    hass::register_everything(&state, &client).await
}

async fn rebuild_router(
    client: &Client,
    state: &StateHandle,
) -> anyhow::Result<MqttRouter<StateHandle>> {
    let disco_prefix = state.get_hass_disco_prefix().await;
    let mut router: MqttRouter<StateHandle> = MqttRouter::new(client.clone());

    router
        .route(format!("{disco_prefix}/status"), mqtt_homeassistant_status)
        .await?;

    router
        .route("verme/:device_type/:id/node", mqtt_node_discovered)
        .await?;
    router
        .route("verme/:device_type/:id/state", mqtt_shade_state)
        .await?;
    router
        .route("verme/:device_type/:id/update/status", mqtt_update_status)
        .await?;
    router
        .route(
            "verme/:device_type/:id/update/available",
            mqtt_update_available,
        )
        .await?;

    router
        .route("verme2mqtt/cover/:id/command", mqtt_cover_command)
        .await?;
    router
        .route("verme2mqtt/cover/:id/set_position", mqtt_set_position)
        .await?;
    router
        .route("verme2mqtt/update/:id/install", mqtt_install_command)
        .await?;
    router
        .route("verme2mqtt/update/:id/check", mqtt_check_command)
        .await?;

    let bridge = get_client(state).await?;
    hass::register_everything(state, &bridge)
        .await
        .context("register_everything")?;

    Ok(router)
}

async fn run_mqtt_loop(
    state: StateHandle,
    subscriber: Receiver<Event>,
    client: Client,
) -> anyhow::Result<()> {
    let mut router = rebuild_router(&client, &state).await?;
    let mut need_rebuild = false;

    while let Ok(event) = subscriber.recv().await {
        match event {
            Event::Message(msg) => {
                // Dispatch inline rather than spawning: this loop is
                // the sole mutator of registry and projector state, so
                // messages apply in arrival order and a slow handler
                // cannot race a later message for the same device.
                if let Err(err) = router.dispatch(msg.clone(), state.clone()).await {
                    log::error!("While dispatching {msg:?}: {err:#}");
                }
            }
            Event::Disconnected(reason) => {
                log::warn!("MQTT disconnected with reason={reason}");
                need_rebuild = true;
            }
            Event::Connected(status) => {
                log::info!("MQTT connected with status={status}");
                if need_rebuild {
                    router = rebuild_router(&client, &state).await?;
                }
            }
        }
    }

    log::info!("subscriber.recv loop terminated");

    Ok(())
}

/// Connect to the broker and spawn the bridge event loop
pub async fn spawn_bridge(state: StateHandle, args: &MqttArguments) -> anyhow::Result<()> {
    let client = Client::with_auto_id()?;

    let mqtt_host = args.mqtt_host()?;
    let mqtt_port = args.mqtt_port()?;
    let mqtt_username = args.mqtt_username()?;
    let mqtt_password = args.mqtt_password()?;

    client.set_last_will(availability_topic(), "offline", QoS::AtMostOnce, true)?;
    client.set_username_and_password(Some(&mqtt_username), Some(&mqtt_password))?;
    client
        .connect(
            &mqtt_host,
            mqtt_port.into(),
            Duration::from_secs(120),
            args.mqtt_bind_address.as_deref(),
        )
        .await
        .with_context(|| format!("connecting to mqtt broker {mqtt_host}:{mqtt_port}"))?;
    let subscriber = client.subscriber().expect("to own the subscriber");

    state
        .set_bridge_client(BridgeClient::new(client.clone()))
        .await;
    state
        .set_hass_disco_prefix(args.hass_discovery_prefix.clone())
        .await;

    tokio::spawn(async move {
        let res = run_mqtt_loop(state, subscriber, client).await;
        if let Err(err) = res {
            log::error!("run_mqtt_loop: {err:#}");
            log::error!("FATAL: the bridge will not function.");
            log::error!("Pausing for 30 seconds before terminating.");
            tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
            std::process::exit(1);
        } else {
            log::info!("run_mqtt_loop exited.");
            std::process::exit(0);
        }
    });

    Ok(())
}
