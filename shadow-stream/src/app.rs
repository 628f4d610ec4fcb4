use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::database::Database;
use crate::directory::StaticDirectory;
use crate::group::Coordinator;
use crate::mqtt::SessionContext;
use crate::pipeline::{ensure_topics, spawn_stages, TOPIC_DLQ};
use crate::router::Router;
use crate::server::{spawn_prom_server, AppServer, MqttServer};
use crate::shadow::{Persister, ShadowBus, ShadowService, StateStore};
use crate::stream::Broker;

/// The interval at which expired shadow states are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The application object, owning every long running task of the node.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handles of the pipeline stages.
    stage_handles: Vec<JoinHandle<Result<()>>>,
    /// The join handle of the topic compactor.
    compactor_handle: JoinHandle<Result<()>>,
    /// The join handle of the expired state sweeper.
    sweeper_handle: JoinHandle<()>,
    /// The join handle of the shadow persister.
    persister_handle: JoinHandle<()>,
    /// The join handle of the device registry reloader, if the registry is file backed.
    reloader_handle: Option<JoinHandle<()>>,
    /// The join handle of the MQTT listener.
    mqtt_server: JoinHandle<()>,
    /// The join handle of the shadow API gRPC server.
    client_server: JoinHandle<()>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics_handle: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this node's storage & topics.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let broker = Broker::new(db.clone()).await.context("error opening topic log")?;
        ensure_topics(&broker, config.partitions).await.context("error creating pipeline topics")?;
        let store = StateStore::new(&db).await.context("error opening shadow state store")?;
        let bus = ShadowBus::new(config.bus_capacity, config.bus_publish_timeout());

        // Spawn the shadow side-channel.
        let persister_handle = Persister::new(store.clone(), &bus, config.connection_state_ttl(), shutdown_tx.subscribe()).spawn();
        let sweeper_handle = store.spawn_sweeper(SWEEP_INTERVAL, shutdown_tx.subscribe());

        // Load the device registry.
        let (directory, reloader_handle) = match &config.devices_path {
            Some(path) => {
                let directory = Arc::new(
                    StaticDirectory::from_file(&config.token_hmac_key, path)
                        .await
                        .context("error loading device registry")?,
                );
                let handle = directory.clone().spawn_reloader(path.clone(), shutdown_tx.subscribe());
                (directory, Some(handle))
            }
            None => {
                tracing::warn!("no device registry configured, every device connection will be refused");
                (Arc::new(StaticDirectory::new(&config.token_hmac_key, Vec::new())), None)
            }
        };

        // Spawn the stream processing pipeline.
        let router = Arc::new(Router::new(TOPIC_DLQ, config.routes.clone()));
        let stage_handles = spawn_stages(broker.clone(), Coordinator::new(), &config.pod_name, router.clone(), shutdown_tx.clone());
        let compactor_handle = broker.spawn_compactor(config.compaction_interval(), shutdown_tx.clone());

        // Spawn the network servers.
        let service = ShadowService::new(store.clone(), bus.clone(), broker.clone(), config.bus_capacity);
        let ctx = SessionContext::new(directory, bus, broker, store, router).with_max_packet_size(config.max_packet_size);
        let mqtt_server = MqttServer::bind(config.mqtt_port, ctx, shutdown_tx.subscribe())
            .await
            .context("error setting up MQTT listener")?
            .spawn();
        let client_server = AppServer::new(config.clone(), service, shutdown_tx.clone()).spawn();
        let metrics_server = spawn_prom_server(&config, metrics_handle, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            stage_handles,
            compactor_handle,
            sweeper_handle,
            persister_handle,
            reloader_handle,
            mqtt_server,
            client_server,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("shadow stream node is shutting down");
        if let Err(err) = self.mqtt_server.await {
            tracing::error!(error = ?err, "error joining MQTT listener task");
        }
        for handle in self.stage_handles {
            if let Err(err) = handle.await.context("error joining pipeline stage handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down pipeline stage");
            }
        }
        if let Err(err) = self.compactor_handle.await.context("error joining compactor handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down topic compactor");
        }
        if let Err(err) = self.persister_handle.await {
            tracing::error!(error = ?err, "error joining shadow persister task");
        }
        if let Err(err) = self.sweeper_handle.await {
            tracing::error!(error = ?err, "error joining shadow state sweeper task");
        }
        if let Some(handle) = self.reloader_handle {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, "error joining device registry reloader task");
            }
        }
        if let Err(err) = self.client_server.await {
            tracing::error!(error = ?err, "error joining shadow API gRPC server task");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("shadow stream node shutdown complete");
        Ok(())
    }
}
