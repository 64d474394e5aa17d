use anyhow::{Context, Result};
use clap::ArgMatches;
use std::path::PathBuf;

use crate::{
    api::{CommandValue, GatewayBuilder},
    core::config::{GatewayConfig, TransportMode},
};

fn load_config(matches: &ArgMatches) -> Result<GatewayConfig> {
    let path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .context("--config is required")?;
    let mut config = GatewayConfig::load(&path)?;
    if matches.try_get_one::<bool>("mock").ok().flatten() == Some(&true) {
        log::info!("Simulated bus forced from the command line");
        config.transport.mode = TransportMode::Mock;
    }
    Ok(config)
}

/// Parse a command-line value the way a JSON API caller would send it.
pub fn parse_value(raw: &str) -> CommandValue {
    serde_json::from_str(raw).unwrap_or_else(|_| CommandValue::Text(raw.to_string()))
}

/// Run the daemon until Ctrl-C.
pub async fn run(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let gateway = GatewayBuilder::new(config).build()?;
    gateway.launch().await?;
    log::info!("Gateway running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Ctrl-C received, shutting down");

    let metrics = gateway.orchestrator().metrics();
    log::info!(
        "Final metrics: {} polls ({} ok, {} failed), avg {:.1} ms",
        metrics.total_polling_calls,
        metrics.successful_polls,
        metrics.failed_polls,
        metrics.average_response_time_ms
    );
    gateway.shutdown().await;
    Ok(())
}

/// Send one direct command. Returns whether it succeeded.
pub async fn exec(matches: &ArgMatches) -> Result<bool> {
    let config = load_config(matches)?;
    let port = matches
        .get_one::<String>("port")
        .context("port is required")?;
    let command = matches
        .get_one::<String>("command")
        .context("command is required")?;
    let raw = matches
        .get_one::<String>("value")
        .context("value is required")?;

    let gateway = GatewayBuilder::new(config).build()?;
    let result = gateway.execute(port, command, parse_value(raw)).await;
    gateway.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

pub fn check_config(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    println!("{}", config.to_json()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_parse_like_json() {
        assert_eq!(parse_value("true"), CommandValue::Bool(true));
        assert_eq!(parse_value("12"), CommandValue::Number(12.0));
        assert_eq!(parse_value("on"), CommandValue::Text("on".into()));
        assert_eq!(parse_value("\"7\""), CommandValue::Text("7".into()));
    }
}
