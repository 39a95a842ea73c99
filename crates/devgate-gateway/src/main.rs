use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use devgate_gateway::settings::ENV_PREFIX;
use devgate_gateway::{DriverAgent, SettingsBuilder, VERSION};

#[derive(Debug, Parser)]
#[command(name = "devgate", version)]
#[command(about = "Device gateway bridging MQTT and OPC-UA devices onto message buses")]
struct Args {
    /// Settings file layered under the DEVGATE__* environment variables
    #[arg(short, long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Directory holding config.yaml, drivers.yaml and devices.yaml
    #[arg(short, long, value_name = "DIR")]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut builder = SettingsBuilder::new().with_environment_prefix(ENV_PREFIX);
    if let Some(path) = &args.settings {
        builder = builder.with_settings_file(path);
    }
    let mut settings = builder.build().context("failed to load settings")?;
    if let Some(dir) = args.config_dir {
        settings.agent.config_dir = dir;
    }

    devgate_core::logging::init_with_filter(&settings.logging.level, settings.logging.json)
        .context("failed to initialize logging")?;
    info!(
        "devgate {} starting, protocols {:?}",
        VERSION,
        devgate_devices::available_protocols()
    );

    let agent = DriverAgent::new(&settings.agent.config_dir);
    agent
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal, {}", e);
            }
        })
        .await
        .with_context(|| format!("driver agent failed, config dir {}", settings.agent.config_dir.display()))?;

    Ok(())
}
