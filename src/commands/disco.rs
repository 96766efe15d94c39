use crate::node_api::{from_json, parse_node_topic, NodeInfo, NODE_DISCOVERY_PATTERN};
use crate::service::mqtt::connect_for_command;
use crate::service::state::State;
use mosquitto_rs::{Event, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Listen for node announcements for a while and print what was heard.
/// Nodes announce with a retained message, so anything the broker
/// already knows about shows up immediately.
#[derive(clap::Parser, Debug)]
pub struct DiscoCommand {
    /// How many seconds to listen for announcements
    #[arg(long, default_value_t = 10)]
    timeout_seconds: u64,
}

impl DiscoCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let state = Arc::new(State::new());
        let client = connect_for_command(&args.mqtt_args).await?;
        let subscriber = client.subscriber().expect("to own the subscriber");
        client
            .subscribe(NODE_DISCOVERY_PATTERN, QoS::AtMostOnce)
            .await?;

        eprintln!(
            "Waiting {} seconds for node announcements...",
            self.timeout_seconds
        );
        let deadline = Instant::now() + Duration::from_secs(self.timeout_seconds);
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, subscriber.recv()).await {
            let Event::Message(msg) = event else {
                continue;
            };
            let Some((device_type, id)) = parse_node_topic(&msg.topic) else {
                continue;
            };
            match from_json::<NodeInfo, _>(&msg.payload) {
                Ok(info) => {
                    state.upsert_device(id, device_type, info).await;
                }
                Err(err) => {
                    log::error!("Ignoring malformed announcement on {}: {err:#}", msg.topic);
                }
            }
        }

        let mut devices = state.devices().await;
        devices.sort_by_key(|d| d.id.clone());

        for d in devices {
            println!(
                "{device_type:<10} {id:<16} {version:<8} {name}",
                device_type = d.device_type,
                id = d.id,
                version = d.installed_version().unwrap_or_default(),
                name = d.name(),
            );
        }

        Ok(())
    }
}
