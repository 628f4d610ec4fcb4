//! The stream processing pipeline.
//!
//! Raw device publishes land on `mqtt.messages.incoming`. The dispatch stage checks topic
//! ownership & routes each publish to the delta topic of its state kind. The delta stages fold
//! deltas into full per-device documents kept on compacted changelog topics, and the document stage
//! joins both changelogs into one versioned document per device on `public.shadow.states`.
//!
//! Every stage is a consumer group handler. Stage state is partition scoped: it is rebuilt from the
//! stage's output topic when a partition is assigned, and discarded when it is revoked.

mod delta;
mod dispatch;
mod document;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use shadow_core::models::StateKey;

use crate::group::{ConsumerGroup, Coordinator, CoPartitionedStrategy, RangeStrategy};
use crate::router::Router;
use crate::stream::Broker;
use crate::utils;

pub use delta::DeltaStage;
pub use dispatch::{device_sub_path, DispatchStage};
pub use document::DocumentStage;

/// Raw publishes received from devices.
pub const TOPIC_INCOMING: &str = "mqtt.messages.incoming";
/// Messages addressed to devices.
pub const TOPIC_OUTGOING: &str = "mqtt.messages.outgoing";
/// Reported state deltas.
pub const TOPIC_REPORTED_DELTA: &str = "shadow.reported-state.delta";
/// Desired state deltas.
pub const TOPIC_DESIRED_DELTA: &str = "shadow.desired-state.delta";
/// The full reported state of each device.
pub const TOPIC_REPORTED_CHANGELOG: &str = "private.changelog.reported-state";
/// The full desired state of each device.
pub const TOPIC_DESIRED_CHANGELOG: &str = "private.changelog.desired-state";
/// The merge patch of each reported state change.
pub const TOPIC_REPORTED_COMPUTED: &str = "shadow.reported-state.delta.computed";
/// The merge patch of each desired state change.
pub const TOPIC_DESIRED_COMPUTED: &str = "shadow.desired-state.delta.computed";
/// The versioned document of each device.
pub const TOPIC_STATES: &str = "public.shadow.states";
/// Publishes which could not be routed.
pub const TOPIC_DLQ: &str = "public.bridge.dlq";

pub const GROUP_DISPATCHER: &str = "dispatcher";
pub const GROUP_DOCUMENT: &str = "document-merger";

/// The maximum number of records handled per batch.
const BATCH_SIZE: usize = 100;

/// The topics of the pipeline, with whether each one is compacted.
const TOPICS: &[(&str, bool)] = &[
    (TOPIC_INCOMING, false),
    (TOPIC_OUTGOING, false),
    (TOPIC_REPORTED_DELTA, false),
    (TOPIC_DESIRED_DELTA, false),
    (TOPIC_REPORTED_CHANGELOG, true),
    (TOPIC_DESIRED_CHANGELOG, true),
    (TOPIC_REPORTED_COMPUTED, false),
    (TOPIC_DESIRED_COMPUTED, false),
    (TOPIC_STATES, true),
    (TOPIC_DLQ, false),
];

/// Create every topic of the pipeline.
///
/// All topics share the same partition count, which keeps the changelogs co-partitioned with
/// their delta topics and with each other.
pub async fn ensure_topics(broker: &Broker, partitions: u32) -> Result<()> {
    for (name, compacted) in TOPICS {
        broker.create_topic(name, partitions, *compacted).await?;
    }
    Ok(())
}

/// The delta, changelog & computed delta topics of a state kind, any kind other than desired
/// being treated as reported.
pub(crate) fn kind_topics(kind: StateKey) -> (&'static str, &'static str, &'static str) {
    match kind {
        StateKey::Desired => (TOPIC_DESIRED_DELTA, TOPIC_DESIRED_CHANGELOG, TOPIC_DESIRED_COMPUTED),
        _ => (TOPIC_REPORTED_DELTA, TOPIC_REPORTED_CHANGELOG, TOPIC_REPORTED_COMPUTED),
    }
}

/// Spawn every stage of the pipeline as a member of its consumer group.
pub fn spawn_stages(broker: Broker, coordinator: Coordinator, member: &str, router: Arc<Router>, shutdown_tx: broadcast::Sender<()>) -> Vec<JoinHandle<Result<()>>> {
    let mut handles = Vec::with_capacity(4);

    let group = ConsumerGroup::new(broker.clone(), coordinator.clone(), GROUP_DISPATCHER, member, Arc::new(RangeStrategy));
    handles.push(group.spawn(vec![TOPIC_INCOMING.into()], DispatchStage::new(router), shutdown_tx.clone()));

    for kind in [StateKey::Reported, StateKey::Desired] {
        let stage = DeltaStage::new(kind);
        let group = ConsumerGroup::new(broker.clone(), coordinator.clone(), stage.group(), member, Arc::new(RangeStrategy));
        handles.push(group.spawn(vec![stage.source().into()], stage, shutdown_tx.clone()));
    }

    let group = ConsumerGroup::new(broker, coordinator, GROUP_DOCUMENT, member, Arc::new(CoPartitionedStrategy));
    handles.push(group.spawn(
        vec![TOPIC_REPORTED_CHANGELOG.into(), TOPIC_DESIRED_CHANGELOG.into()],
        DocumentStage::new(),
        shutdown_tx,
    ));
    handles
}

/// Rebuild the latest value of every key of a topic partition.
///
/// The replay stops at the high water mark observed on entry, so records written concurrently are
/// left to normal consumption. Records which fail to decode are logged & skipped.
pub(crate) async fn replay_partition<T: DeserializeOwned>(broker: &Broker, topic: &str, partition: u32) -> Result<HashMap<String, T>> {
    let hwm = broker.high_water_mark(topic, partition)?;
    let mut state = HashMap::new();
    let mut next = 0;
    while next < hwm {
        let records = broker.fetch(topic, partition, next, BATCH_SIZE).await?;
        let last = match records.last() {
            Some(last) => last.offset,
            None => break,
        };
        for record in records.into_iter().filter(|record| record.offset < hwm) {
            match utils::decode_json::<T>(&record.value) {
                Ok(val) => {
                    state.insert(record.key, val);
                }
                Err(err) => tracing::warn!(error = ?err, topic, partition, offset = record.offset, "skipping undecodable record during replay"),
            }
        }
        next = last + 1;
    }
    tracing::debug!(topic, partition, hwm, keys = state.len(), "partition state recovered");
    Ok(state)
}
