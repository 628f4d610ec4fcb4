//! The shadow service & its persistence.
//!
//! Shadow updates travel over the fan-out bus as `ShadowEvent`s. Reported & connection states are
//! published to `mqtt.incoming` and desired states to `mqtt.outgoing`, each also under the
//! per-device variant of the topic. The persister stores every event not already stored by its
//! publisher.

mod persister;
#[cfg(test)]
mod persister_test;
mod store;
#[cfg(test)]
mod mod_test;

use std::collections::BTreeSet;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use shadow_core::models::{DeviceStateMessage, Shadow, State, StateKey};
use shadow_core::{device_topic, BUS_TOPIC_INCOMING, BUS_TOPIC_OUTGOING};

use crate::bus::Bus;
use crate::error::{AppError, AppErrorExt, RpcResult};
use crate::pipeline::{TOPIC_DESIRED_DELTA, TOPIC_REPORTED_DELTA};
use crate::stream::Broker;
use crate::utils;

pub use persister::Persister;
pub use store::StateStore;

const METRIC_SHADOW_PATCHES: &str = "shadow_service_patches";

/// A shadow update carried over the fan-out bus.
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowEvent {
    pub shadow: Shadow,
    /// Whether the publisher has already stored this update.
    pub persisted: bool,
}

/// The fan-out bus carrying shadow updates.
pub type ShadowBus = Bus<ShadowEvent>;

impl ShadowEvent {
    /// Create a new event which still needs to be stored.
    pub fn new(shadow: Shadow) -> Self {
        Self { shadow, persisted: false }
    }

    /// The bus topics on which this event is to be published.
    pub fn topics(&self) -> Vec<String> {
        let device = self.shadow.device.as_str();
        let mut topics = Vec::with_capacity(4);
        if self.shadow.reported.is_some() || self.shadow.connection.is_some() {
            topics.push(BUS_TOPIC_INCOMING.to_string());
            topics.push(device_topic(BUS_TOPIC_INCOMING, device));
        }
        if self.shadow.desired.is_some() {
            topics.push(BUS_TOPIC_OUTGOING.to_string());
            topics.push(device_topic(BUS_TOPIC_OUTGOING, device));
        }
        topics
    }

    /// Publish this event on its topics, waiting on slow subscribers up to the bus timeout.
    pub async fn publish(self, bus: &ShadowBus) -> usize {
        let topics = self.topics();
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        bus.publish(self, &topics).await
    }
}

/// The shadow API.
#[derive(Clone)]
pub struct ShadowService {
    store: StateStore,
    bus: ShadowBus,
    broker: Broker,
    stream_buffer: usize,
}

impl ShadowService {
    /// Create a new instance.
    pub fn new(store: StateStore, bus: ShadowBus, broker: Broker, stream_buffer: usize) -> Self {
        metrics::register_counter!(METRIC_SHADOW_PATCHES, metrics::Unit::Count, "the number of shadow patches applied");
        Self {
            store,
            bus,
            broker,
            stream_buffer: stream_buffer.max(1),
        }
    }

    /// Fetch the shadows of every device of the pool.
    ///
    /// Absent states are absent fields of the returned shadows, never errors.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get(&self, pool: &[String]) -> RpcResult<Vec<Shadow>> {
        if pool.is_empty() {
            return Err(Status::invalid_argument("no devices specified"));
        }
        let mut shadows = Vec::with_capacity(pool.len());
        for device in pool {
            shadows.push(self.store.get_shadow(device).await.map_err(AppError::status)?);
        }
        Ok(shadows)
    }

    /// Merge the reported and/or desired state of the given shadow into the stored shadow.
    ///
    /// The merged states are published on the bus and forwarded to the delta topics of the
    /// pipeline. Returns the merged states.
    #[tracing::instrument(level = "debug", skip(self, patch), fields(device = %patch.device))]
    pub async fn patch(&self, patch: Shadow) -> RpcResult<Shadow> {
        if patch.device.is_empty() {
            return Err(Status::invalid_argument("no device specified"));
        }
        if patch.reported.is_none() && patch.desired.is_none() {
            return Err(Status::invalid_argument("no reported or desired state given"));
        }

        let now = utils::now_millis();
        let mut result = Shadow::new(patch.device.as_str());
        if let Some(reported) = patch.reported {
            result.reported = Some(self.patch_state(&patch.device, StateKey::Reported, reported.data, now).await?);
        }
        if let Some(desired) = patch.desired {
            result.desired = Some(self.patch_state(&patch.device, StateKey::Desired, desired.data, now).await?);
        }
        if let Err(err) = self.store.touch_modified(&patch.device).await {
            tracing::warn!(error = ?err, "error touching device last modified marker");
        }
        metrics::increment_counter!(METRIC_SHADOW_PATCHES);

        ShadowEvent {
            shadow: result.clone(),
            persisted: true,
        }
        .publish(&self.bus)
        .await;
        Ok(result)
    }

    /// Remove a top-level key from the reported or desired state of a device.
    ///
    /// Returns the shadow holding the updated state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove(&self, device: &str, kind: StateKey, key: &str) -> RpcResult<Shadow> {
        if device.is_empty() {
            return Err(Status::invalid_argument("no device specified"));
        }
        if key.is_empty() {
            return Err(Status::invalid_argument("key not specified"));
        }
        if !matches!(kind, StateKey::Reported | StateKey::Desired) {
            return Err(Status::invalid_argument("only reported & desired state keys may be removed"));
        }

        let state = self
            .store
            .remove_field(device, kind, key, utils::now_millis())
            .await
            .map_err(AppError::status)?
            .ok_or_else(|| AppError::ResourceNotFound.into_status())?;
        let mut result = Shadow::new(device);
        match kind {
            StateKey::Reported => result.reported = Some(state),
            _ => result.desired = Some(state),
        }
        Ok(result)
    }

    /// Stream the shadows of the given devices as they change.
    ///
    /// When `sync` is set, the current shadow of every device is sent first. The stream ends when
    /// the receiver is dropped, releasing the bus subscription.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn stream_shadow(&self, devices: Vec<String>, sync: bool) -> RpcResult<ReceiverStream<RpcResult<Shadow>>> {
        if devices.is_empty() {
            return Err(Status::invalid_argument("no devices specified"));
        }
        let topics: Vec<String> = devices
            .iter()
            .flat_map(|device| [device_topic(BUS_TOPIC_INCOMING, device), device_topic(BUS_TOPIC_OUTGOING, device)])
            .collect();
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        // Subscribe before the sync read so that no update falls between the two.
        let (guard, mut events) = self.bus.sub(&topics);
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        let initial = if sync { self.get(&devices).await? } else { Vec::new() };

        let devices: BTreeSet<String> = devices.into_iter().collect();
        tokio::spawn(async move {
            let _guard = guard;
            for shadow in initial {
                if tx.send(Ok(shadow)).await.is_err() {
                    return;
                }
            }
            loop {
                let event = tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = tx.closed() => break,
                };
                if !devices.contains(&event.shadow.device) {
                    continue;
                }
                if tx.send(Ok(event.shadow)).await.is_err() {
                    tracing::debug!("shadow stream receiver dropped");
                    break;
                }
            }
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Merge the given data into the stored state and forward it to the pipeline.
    async fn patch_state(&self, device: &str, kind: StateKey, data: Value, now: i64) -> RpcResult<State> {
        let merged = self
            .store
            .merge_and_store(device, kind, &State::new(data.clone(), now))
            .await
            .map_err(AppError::status)?;

        let topic = match kind {
            StateKey::Reported => TOPIC_REPORTED_DELTA,
            _ => TOPIC_DESIRED_DELTA,
        };
        let msg = DeviceStateMessage {
            version: 0,
            state: data,
            timestamp: now,
        };
        let value = utils::encode_json(&msg).map_err(AppError::status)?;
        self.broker.produce(topic, None, device, value).await.map_err(AppError::status)?;
        Ok(merged)
    }
}
