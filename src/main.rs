use crate::commands::check_broker::CheckBrokerCommand;
use crate::commands::control::ControlCommand;
use crate::commands::disco::DiscoCommand;
use crate::commands::serve::ServeCommand;
use crate::service::mqtt::MqttArguments;
use crate::version_info::verme_version;
use clap::Parser;
use std::str::FromStr;

mod commands;
mod hass_mqtt;
mod node_api;
mod service;
mod version_info;

#[derive(clap::Parser, Debug)]
#[command(
    version = verme_version(),
    about = "Bridge Verme shade nodes to Home Assistant over MQTT"
)]
pub struct Args {
    #[command(flatten)]
    pub mqtt_args: MqttArguments,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(clap::Parser, Debug)]
enum SubCommand {
    /// Run the bridge
    Serve(ServeCommand),
    /// Validate the broker configuration and exit
    CheckBroker(CheckBrokerCommand),
    /// Listen for node announcements and print them
    Disco(DiscoCommand),
    /// Send a command directly to a node
    Control(ControlCommand),
}

impl SubCommand {
    pub async fn run(&self, args: &Args) -> anyhow::Result<()> {
        match self {
            SubCommand::Serve(cmd) => cmd.run(args).await,
            SubCommand::CheckBroker(cmd) => cmd.run(args).await,
            SubCommand::Disco(cmd) => cmd.run(args).await,
            SubCommand::Control(cmd) => cmd.run(args).await,
        }
    }
}

pub fn opt_env_var<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(p) => Ok(Some(
            p.parse()
                .map_err(|err| anyhow::anyhow!("parsing ${name}: {err}"))?,
        )),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow::anyhow!("{name}: {err}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    color_backtrace::install();

    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            anyhow::bail!("loading .env: {err:#}");
        }
    }

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("VERME_LOG", "verme2mqtt=info")
            .write_style("VERME_LOG_STYLE"),
    )
    .init();

    let args = Args::parse();
    args.cmd.run(&args).await
}
