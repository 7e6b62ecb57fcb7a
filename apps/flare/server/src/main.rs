use anyhow::Result;
use clap::Parser;
use flare_server::{
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::try_from(Cli::parse())?;
    let telemetry = Telemetry::init(config.log_filter.as_deref(), config.otel_stdout)?;

    info!(
        listen_addr = %config.listen_addr,
        ephemeral = config.ephemeral,
        history_limit = config.relay.history_limit,
        "starting flare server"
    );

    flare_server::run(config, Some(telemetry.metrics_handle())).await
}
