use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use shadow_core::merge;
use shadow_core::models::{DeviceStateMessage, OutgoingMessage, StateKey};

use crate::group::{Claim, ClaimRecord, ClaimWorker, GroupHandler, GroupSession};
use crate::pipeline::{kind_topics, replay_partition, BATCH_SIZE, TOPIC_OUTGOING};
use crate::utils;

const METRIC_DELTAS_APPLIED: &str = "shadow_pipeline_deltas_applied";
const METRIC_DELTAS_SKIPPED: &str = "shadow_pipeline_deltas_skipped";

/// The device relative path under which desired state changes are sent to devices.
const DESIRED_DELTA_SUB_PATH: &str = "state/desired/delta";

/// The stage folding the state deltas of one kind into full per-device documents.
///
/// Each full document is written to the kind's changelog on the partition of the source delta,
/// so that a partition's state & its changelog always live together.
pub struct DeltaStage {
    kind: StateKey,
    group: String,
    source: &'static str,
    changelog: &'static str,
    computed: &'static str,
}

impl DeltaStage {
    /// Create the stage of the given state kind.
    ///
    /// Only the reported & desired kinds have delta topics, any other kind is treated as reported.
    pub fn new(kind: StateKey) -> Self {
        metrics::register_counter!(METRIC_DELTAS_APPLIED, metrics::Unit::Count, "the number of state deltas merged into a changed document");
        metrics::register_counter!(METRIC_DELTAS_SKIPPED, metrics::Unit::Count, "the number of state deltas which were invalid or changed nothing");
        let (kind, (source, changelog, computed)) = match kind {
            StateKey::Desired => (kind, kind_topics(StateKey::Desired)),
            _ => (StateKey::Reported, kind_topics(StateKey::Reported)),
        };
        Self {
            kind,
            group: format!("delta-merger-{}", kind.as_str()),
            source,
            changelog,
            computed,
        }
    }

    /// The consumer group of this stage.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The delta topic consumed by this stage.
    pub fn source(&self) -> &'static str {
        self.source
    }
}

#[async_trait]
impl GroupHandler for DeltaStage {
    type Worker = DeltaWorker;

    /// Recover the full documents of the partition from the changelog.
    async fn setup(&self, session: &GroupSession, partition: u32) -> Result<DeltaWorker> {
        let states = replay_partition::<DeviceStateMessage>(session.broker(), self.changelog, partition)
            .await
            .with_context(|| format!("error replaying changelog {} partition {}", self.changelog, partition))?;
        tracing::debug!(
            group = session.group(),
            member = session.member(),
            generation = session.generation(),
            partition,
            devices = states.len(),
            "delta partition assigned"
        );
        Ok(DeltaWorker {
            kind: self.kind,
            partition,
            changelog: self.changelog,
            computed: self.computed,
            states,
        })
    }
}

/// The delta worker of a single partition.
pub struct DeltaWorker {
    kind: StateKey,
    partition: u32,
    changelog: &'static str,
    computed: &'static str,
    /// The latest changelog record of each device of the partition.
    states: HashMap<String, DeviceStateMessage>,
}

#[async_trait]
impl ClaimWorker for DeltaWorker {
    async fn consume_claim(&mut self, session: &GroupSession, claim: &mut Claim) -> Result<()> {
        while let Some(batch) = claim.next_batch(BATCH_SIZE).await? {
            for rec in batch.iter() {
                self.apply(session, rec).await?;
            }
            // Offsets are only committed once every changelog write of the batch has landed.
            session.commit_batch(&batch).await?;
        }
        Ok(())
    }

    async fn cleanup(&mut self, _session: &GroupSession) -> Result<()> {
        self.states.clear();
        tracing::debug!(kind = self.kind.as_str(), partition = self.partition, "delta partition revoked");
        Ok(())
    }
}

impl DeltaWorker {
    /// Merge a single delta record, returning an error only if a produce failed.
    async fn apply(&mut self, session: &GroupSession, rec: &ClaimRecord) -> Result<()> {
        let device = rec.record.key.as_str();
        let delta = match utils::decode_json::<DeviceStateMessage>(&rec.record.value) {
            Ok(delta) => delta,
            Err(err) => {
                metrics::increment_counter!(METRIC_DELTAS_SKIPPED);
                tracing::warn!(error = ?err, device, offset = rec.record.offset, "skipping undecodable delta");
                return Ok(());
            }
        };

        let (old_version, old_state) = match self.states.get(device) {
            Some(current) => (current.version, current.state.to_string()),
            None => (0, String::new()),
        };
        let merged = match merge::apply_delta(&old_state, &delta.state.to_string()) {
            Ok(merged) => merged,
            Err(err) => {
                metrics::increment_counter!(METRIC_DELTAS_SKIPPED);
                tracing::warn!(error = ?err, device, "skipping delta which failed to merge");
                return Ok(());
            }
        };
        let new_state: Value = serde_json::from_str(&merged).context("error decoding merged state")?;
        if self.states.get(device).map(|current| current.state == new_state).unwrap_or(false) {
            metrics::increment_counter!(METRIC_DELTAS_SKIPPED);
            return Ok(());
        }

        let full = DeviceStateMessage {
            version: old_version + 1,
            state: new_state,
            timestamp: delta.timestamp,
        };
        let broker = session.broker();
        broker
            .produce(self.changelog, Some(self.partition), device, utils::encode_json(&full)?)
            .await?;

        let patch: Value = serde_json::from_str(&merge::calculate_delta(if old_state.is_empty() { "{}" } else { &old_state }, &merged))
            .context("error decoding computed delta")?;
        let computed = DeviceStateMessage {
            version: full.version,
            state: patch.clone(),
            timestamp: full.timestamp,
        };
        broker
            .produce(self.computed, Some(self.partition), device, utils::encode_json(&computed)?)
            .await?;
        if self.kind == StateKey::Desired {
            let outgoing = OutgoingMessage {
                device_id: device.to_string(),
                sub_path: DESIRED_DELTA_SUB_PATH.into(),
                data: patch,
            };
            broker.produce(TOPIC_OUTGOING, None, device, utils::encode_json(&outgoing)?).await?;
        }

        metrics::increment_counter!(METRIC_DELTAS_APPLIED, "kind" => self.kind.as_str());
        self.states.insert(device.to_string(), full);
        Ok(())
    }
}
