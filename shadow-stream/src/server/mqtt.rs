use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::mqtt::{BasicAuthenticator, Session, SessionContext};

const METRIC_CONNECTIONS_ACCEPTED: &str = "mqtt_bridge_basic_auth_accepted_total";

/// The plain TCP MQTT listener, authenticating devices with basic credentials.
pub struct MqttServer {
    listener: TcpListener,
    ctx: SessionContext,
    shutdown: broadcast::Receiver<()>,
}

impl MqttServer {
    /// Bind the listener to the given port on every interface.
    pub async fn bind(port: u16, ctx: SessionContext, shutdown: broadcast::Receiver<()>) -> Result<Self> {
        metrics::register_counter!(METRIC_CONNECTIONS_ACCEPTED, metrics::Unit::Count, "the number of accepted device connections");
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("error binding MQTT listener to port {}", port))?;
        Ok(Self { listener, ctx, shutdown })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("error reading MQTT listener address")
    }

    /// Spawn the accept loop, each connection being served by its own session task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(%addr, "MQTT listener is accepting connections");
        }
        let auth = BasicAuthenticator::new();
        loop {
            let (stream, addr) = tokio::select! {
                res = self.listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::error!(error = ?err, "error accepting MQTT connection");
                        continue;
                    }
                },
                _ = self.shutdown.recv() => break,
            };
            metrics::increment_counter!(METRIC_CONNECTIONS_ACCEPTED);
            tracing::debug!(%addr, "accepted MQTT connection");
            let ctx = self.ctx.clone();
            tokio::spawn(async move { Session::handle(ctx, stream, &auth).await });
        }
        tracing::debug!("MQTT listener has shutdown");
    }
}
