use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use shadow_core::models::{Shadow, StateKey};
use shadow_core::{BUS_TOPIC_INCOMING, BUS_TOPIC_OUTGOING};

use crate::bus::SubscriptionGuard;
use crate::shadow::{ShadowBus, ShadowEvent, StateStore};
use crate::utils;

const METRIC_PERSISTER_WRITES: &str = "shadow_persister_writes";
const METRIC_PERSISTER_ERRORS: &str = "shadow_persister_errors";

/// A bus subscriber storing every shadow update not already stored by its publisher.
///
/// Storage is best effort: a failed write is logged and the update dropped, the changelog topics
/// of the pipeline being the authoritative record.
pub struct Persister {
    store: StateStore,
    connection_ttl: Duration,
    events: mpsc::Receiver<ShadowEvent>,
    _guard: SubscriptionGuard<ShadowEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl Persister {
    /// Create a new instance, subscribing to the bus immediately.
    pub fn new(store: StateStore, bus: &ShadowBus, connection_ttl: Duration, shutdown: broadcast::Receiver<()>) -> Self {
        metrics::register_counter!(METRIC_PERSISTER_WRITES, metrics::Unit::Count, "the number of shadow states written by the persister");
        metrics::register_counter!(METRIC_PERSISTER_ERRORS, metrics::Unit::Count, "the number of shadow updates dropped by the persister on error");
        let (guard, events) = bus.sub(&[BUS_TOPIC_INCOMING, BUS_TOPIC_OUTGOING]);
        Self {
            store,
            connection_ttl,
            events,
            _guard: guard,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!("shadow persister started");
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = self.shutdown.recv() => break,
                else => break,
            }
        }
        tracing::debug!("shadow persister has shutdown");
    }

    /// Store the states carried by the given event.
    #[tracing::instrument(level = "debug", skip(self, event), fields(device = %event.shadow.device))]
    pub async fn handle_event(&self, event: ShadowEvent) {
        if event.persisted {
            return;
        }
        match self.store_shadow(&event.shadow).await {
            Ok(0) => (),
            Ok(writes) => {
                metrics::counter!(METRIC_PERSISTER_WRITES, writes);
                if let Err(err) = self.store.touch_modified(&event.shadow.device).await {
                    tracing::warn!(error = ?err, "error touching device last modified marker");
                }
            }
            Err(err) => {
                metrics::increment_counter!(METRIC_PERSISTER_ERRORS);
                tracing::error!(error = ?err, "error storing shadow update, dropping it");
            }
        }
    }

    /// Store each state of the shadow, returning the number of states written.
    async fn store_shadow(&self, shadow: &Shadow) -> Result<u64> {
        let mut writes = 0;
        if let Some(reported) = &shadow.reported {
            self.store.merge_and_store(&shadow.device, StateKey::Reported, reported).await?;
            writes += 1;
        }
        if let Some(desired) = &shadow.desired {
            self.store.merge_and_store(&shadow.device, StateKey::Desired, desired).await?;
            writes += 1;
        }
        if let Some(connection) = &shadow.connection {
            let data = utils::encode_json(connection)?;
            self.store
                .set(&shadow.device, StateKey::Connection, data, Some(self.connection_ttl))
                .await?;
            writes += 1;
        }
        Ok(writes)
    }
}
