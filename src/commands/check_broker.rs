use crate::service::mqtt::{probe_broker, SetupError};

/// Run the same connect/disconnect probe that `serve` performs at
/// startup, and report the outcome.
#[derive(clap::Parser, Debug)]
pub struct CheckBrokerCommand {}

impl CheckBrokerCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        match probe_broker(&args.mqtt_args).await {
            Ok(()) => {
                println!(
                    "Connected to {}:{} OK",
                    args.mqtt_args.mqtt_host()?,
                    args.mqtt_args.mqtt_port()?
                );
                Ok(())
            }
            Err(err) => {
                match &err {
                    SetupError::CannotConnect(_) => {
                        log::error!("The broker did not accept our probe; check the host, port and credentials");
                    }
                    SetupError::Unknown(_) => {
                        log::error!("Unexpected failure while validating the configuration");
                    }
                }
                Err(err.into())
            }
        }
    }
}
