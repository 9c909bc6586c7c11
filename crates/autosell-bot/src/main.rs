use clap::Parser;
use tracing::info;

use autosell_bot::{AppConfig, Application, Secrets};
use autosell_telemetry::init_logging;

#[derive(Parser, Debug)]
#[command(name = "autosell-bot")]
#[command(about = "Brokerage fill detection and auto-sell engine")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var("AUTOSELL_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config = %config_path, "Loading configuration");
    let config = AppConfig::from_file(&config_path)?;
    let secrets = Secrets::from_env()?;

    let app = Application::new(config, secrets)?;
    app.run().await?;

    Ok(())
}
