//! Policy gateway server.
//!
//! Usage: `gateway-server [config.toml]`. Environment variables prefixed
//! with `GATEWAY_` override file values.

use std::path::PathBuf;

use anyhow::Context;
use gateway_api::{AppState, serve};
use gateway_config::GatewayConfig;
use gateway_kernel::GatewayContext;
use gateway_telemetry::{LogFormat, init_tracing, install_prometheus};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = GatewayConfig::load(path.as_deref()).context("loading configuration")?;

    let format: LogFormat = config.logging.format.parse()?;
    init_tracing(&config.logging.level, format)?;

    let bind = config.server.bind;
    let (context, worker) = GatewayContext::builder(config)
        .build()
        .await
        .context("building gateway context")?;
    let worker = worker.spawn();

    let mut state = AppState::new(context.clone());
    match install_prometheus() {
        Ok(handle) => state = state.with_prometheus(handle),
        Err(err) => warn!(error = %err, "prometheus exporter disabled"),
    }

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "policy gateway listening");

    serve(listener, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    info!("draining audit queue");
    context.shutdown();
    if let Err(err) = worker.await {
        warn!(error = %err, "audit worker ended abnormally");
    }
    Ok(())
}
