//! The device shadow stream node.

mod app;
mod bus;
#[cfg(test)]
mod bus_test;
mod config;
#[cfg(test)]
mod config_test;
mod database;
mod directory;
#[cfg(test)]
mod directory_test;
mod error;
#[cfg(test)]
mod fixtures;
mod group;
mod grpc;
mod models;
mod mqtt;
mod pipeline;
mod router;
#[cfg(test)]
mod router_test;
mod server;
mod shadow;
mod stream;
mod utils;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let recorder: &'static PrometheusRecorder = Box::leak(Box::new(PrometheusBuilder::new().add_global_label("pod", cfg.pod_name.clone()).build()));
    let metrics_handle = recorder.handle();
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;

    tracing::info!(
        pod_name = %cfg.pod_name,
        mqtt_port = %cfg.mqtt_port,
        grpc_port = %cfg.grpc_port,
        partitions = %cfg.partitions,
        storage_data_path = %cfg.storage_data_path,
        "starting shadow stream node",
    );
    if let Err(err) = App::new(cfg, metrics_handle).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
