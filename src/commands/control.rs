use crate::node_api::{clamp_position, TopicBase};
use crate::service::mqtt::{connect_for_command, BridgeClient};

/// Publish a command directly to a node, bypassing Home Assistant.
/// Handy when standing up new hardware.
#[derive(clap::Parser, Debug)]
pub struct ControlCommand {
    /// The device type segment of the node's topic namespace
    #[arg(long, default_value = "shades")]
    device_type: String,

    /// The device id, eg: shade_001
    #[arg(long)]
    id: String,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(clap::Parser, Debug)]
enum SubCommand {
    /// Fully open the shade
    Open,
    /// Fully close the shade
    Close,
    /// Move the shade to a specific position
    Position {
        /// Target position, 0 (closed) through 100 (open).
        /// Values outside that range are clamped.
        position: i64,
    },
    /// Tell the node to install the published firmware
    Install,
    /// Ask the node to report whether an update is available
    Check,
}

impl ControlCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let client = BridgeClient::new(connect_for_command(&args.mqtt_args).await?);
        let topic = TopicBase::new(&self.device_type, &self.id);

        match &self.cmd {
            SubCommand::Open => client.send_position_command(&topic, 100).await,
            SubCommand::Close => client.send_position_command(&topic, 0).await,
            SubCommand::Position { position } => {
                client
                    .send_position_command(&topic, clamp_position(*position))
                    .await
            }
            SubCommand::Install => client.send_update_start(&topic).await,
            SubCommand::Check => client.send_update_check(&topic).await,
        }
    }
}
