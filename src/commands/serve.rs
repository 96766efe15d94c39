use crate::service::hass::{self, device_availability_topic, topic_safe_id};
use crate::service::hass_gc;
use crate::service::mqtt::{probe_broker, spawn_bridge};
use crate::service::state::{State, StateHandle};
use crate::version_info::verme_version;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[derive(clap::Parser, Debug)]
pub struct ServeCommand {
    /// How many minutes a node can stay silent before it is marked
    /// offline in Home Assistant
    #[arg(long, default_value_t = 1440)]
    device_ttl_minutes: i64,

    /// Seconds between reconciliation passes
    #[arg(long, default_value_t = 60)]
    reconcile_interval_seconds: u64,

    /// How many seconds to wait for a node to acknowledge a commanded
    /// position before reverting to its last reported value
    #[arg(long, default_value_t = 120)]
    pending_command_timeout_seconds: i64,
}

impl ServeCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        log::info!("Starting service. version {}", verme_version());

        // Validate the configuration before standing anything up
        probe_broker(&args.mqtt_args).await?;

        let state = Arc::new(State::new());

        let previously_published = match hass_gc::load_published_entities() {
            Ok(entities) => entities,
            Err(err) => {
                log::warn!("Failed to load published entity list: {err:#}");
                Default::default()
            }
        };

        spawn_bridge(state.clone(), &args.mqtt_args).await?;

        // Give the broker time to replay retained node announcements
        // before deciding which of last run's entities are stale
        {
            let state = state.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(60)).await;
                let Some(client) = state.get_bridge_client().await else {
                    return;
                };
                if let Err(err) =
                    hass_gc::purge_stale_entities(&state, &client, &previously_published).await
                {
                    log::error!("purge_stale_entities: {err:#}");
                }
            });
        }

        let ttl = ChronoDuration::minutes(self.device_ttl_minutes);
        let command_timeout = ChronoDuration::seconds(self.pending_command_timeout_seconds);

        loop {
            sleep(Duration::from_secs(self.reconcile_interval_seconds)).await;
            if let Err(err) = self.reconcile(&state, ttl, command_timeout).await {
                log::error!("reconciliation pass: {err:#}");
            }
        }
    }

    async fn reconcile(
        &self,
        state: &StateHandle,
        ttl: ChronoDuration,
        command_timeout: ChronoDuration,
    ) -> anyhow::Result<()> {
        let Some(client) = state.get_bridge_client().await else {
            return Ok(());
        };

        for device in state.mark_lost_devices(ttl).await {
            log::warn!(
                "{device} has said nothing for over {} minutes; marking offline",
                self.device_ttl_minutes
            );
            client
                .publish_retained(
                    device_availability_topic(&topic_safe_id(&device)),
                    "offline",
                )
                .await?;
        }

        for (device, pending) in state.expire_pending_positions(command_timeout).await {
            log::warn!(
                "{device} never acknowledged position {} commanded at {}; \
                reverting to its reported state",
                pending.position,
                pending.issued_at
            );
            hass::advise_hass_of_position(&device, &client).await?;
        }

        Ok(())
    }
}
