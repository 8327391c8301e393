use anyhow::Context;
use clap::Parser;
use dxstream::cli::Cli;
use dxstream::config::AppConfig;
use dxstream::dxtrade::{DualStreamClient, DualStreamEvent};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

mod main_runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("loading configuration from {}", cli.config_dir))?;
    cli.apply(&mut config);

    let _log_guard = main_runtime::init_logging(&config.logging, config.logging.json);

    let credentials = config.session.credentials()?;
    let client = Arc::new(DualStreamClient::new(config.dxtrade.clone(), credentials)?);
    info!(
        "Starting dxstream (market data: {}, portfolio: {})",
        config.dxtrade.enable_market_data, config.dxtrade.enable_portfolio
    );

    let logger = tokio::spawn(log_events(client.subscribe(), cli.raw));

    if config.dxtrade.enable_market_data {
        client.subscribe_to_market_data(&[]).await?;
    }
    if config.dxtrade.enable_portfolio {
        client.subscribe_to_portfolio_data().await?;
    }
    if !client.connect().await {
        warn!("Not every stream connected; retrying in the background");
    }

    match cli.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("Run duration of {}s elapsed", secs);
                }
                _ = signal::ctrl_c() => info!("Received Ctrl-C"),
            }
        }
        None => {
            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Received Ctrl-C");
        }
    }

    let status = client.get_status().await;
    client.destroy().await;
    logger.abort();

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<DualStreamEvent>, raw: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event logger lagged, skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            DualStreamEvent::Connected { stream } => info!("{} connected", stream),
            DualStreamEvent::Reconnected { stream } => info!("{} reconnected", stream),
            DualStreamEvent::Disconnected {
                stream,
                code,
                reason,
            } => warn!("{} disconnected ({}): {}", stream, code, reason),
            DualStreamEvent::Authenticated { stream } => info!("{} authenticated", stream),
            DualStreamEvent::Reconnecting {
                stream,
                attempt,
                delay,
            } => info!("{} reconnect attempt {} in {:?}", stream, attempt, delay),
            DualStreamEvent::Error {
                stream,
                kind,
                message,
            } => error!("{} {:?} error: {}", stream, kind, message),
            DualStreamEvent::ReadyChanged { ready } => info!("Ready: {}", ready),
            DualStreamEvent::SubscriptionResponse { stream, response } => info!(
                "{} subscription {} success={}",
                stream, response.request_id, response.success
            ),
            DualStreamEvent::MarketData(data) => info!("MarketData {}", data.payload),
            DualStreamEvent::Portfolio(data) => info!("AccountPortfolios {}", data.payload),
            DualStreamEvent::PositionUpdate(data) => info!("PositionUpdate {}", data.payload),
            DualStreamEvent::OrderUpdate(data) => info!("OrderUpdate {}", data.payload),
            DualStreamEvent::PingRequest {
                stream,
                timestamp,
                responded,
            } => debug!("{} PingRequest {} responded={}", stream, timestamp, responded),
            DualStreamEvent::Raw { stream, text } => {
                if raw {
                    debug!("{} <- {}", stream, text);
                }
            }
        }
    }
}
