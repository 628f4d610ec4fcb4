use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use shadow_core::models::{DeviceStateMessage, IncomingMessage};

use crate::group::{Claim, ClaimRecord, ClaimWorker, GroupHandler, GroupSession};
use crate::pipeline::BATCH_SIZE;
use crate::router::Router;
use crate::utils;

const METRIC_DISPATCHED: &str = "shadow_pipeline_records_dispatched";
const METRIC_DEAD_LETTERED: &str = "shadow_pipeline_records_dead_lettered";

/// The topic namespaces under which a device may publish.
const DEVICE_NAMESPACES: &[&str] = &["devices", "shadows"];

/// Extract the device relative path of the given publish topic.
///
/// The topic must be `devices/<id>/<path>` or `shadows/<id>/<path>`, with an optional leading
/// slash, where `<id>` is the publishing device. Returns `None` for any other topic.
pub fn device_sub_path<'a>(topic: &'a str, device: &str) -> Option<&'a str> {
    let mut segments = topic.strip_prefix('/').unwrap_or(topic).splitn(3, '/');
    let namespace = segments.next()?;
    let owner = segments.next()?;
    if !DEVICE_NAMESPACES.contains(&namespace) || owner.is_empty() || owner != device {
        return None;
    }
    segments.next()
}

/// The stage routing raw device publishes to the delta topic of their state kind.
pub struct DispatchStage {
    router: Arc<Router>,
}

impl DispatchStage {
    pub fn new(router: Arc<Router>) -> Self {
        metrics::register_counter!(METRIC_DISPATCHED, metrics::Unit::Count, "the number of device publishes routed to a pipeline topic");
        metrics::register_counter!(METRIC_DEAD_LETTERED, metrics::Unit::Count, "the number of device publishes sent to the dead letter topic");
        Self { router }
    }
}

#[async_trait]
impl GroupHandler for DispatchStage {
    type Worker = DispatchWorker;

    async fn setup(&self, session: &GroupSession, partition: u32) -> Result<DispatchWorker> {
        tracing::debug!(member = session.member(), generation = session.generation(), partition, "dispatch partition assigned");
        Ok(DispatchWorker {
            router: self.router.clone(),
            partition,
        })
    }
}

/// The dispatch worker of a single partition, which holds no state.
pub struct DispatchWorker {
    router: Arc<Router>,
    partition: u32,
}

#[async_trait]
impl ClaimWorker for DispatchWorker {
    async fn consume_claim(&mut self, session: &GroupSession, claim: &mut Claim) -> Result<()> {
        while let Some(batch) = claim.next_batch(BATCH_SIZE).await? {
            for rec in batch.iter() {
                self.dispatch(session, rec).await?;
            }
            session.commit_batch(&batch).await?;
        }
        Ok(())
    }

    async fn cleanup(&mut self, _session: &GroupSession) -> Result<()> {
        tracing::debug!(partition = self.partition, "dispatch partition revoked");
        Ok(())
    }
}

impl DispatchWorker {
    /// Route a single raw publish, returning an error only if a produce failed.
    async fn dispatch(&self, session: &GroupSession, rec: &ClaimRecord) -> Result<()> {
        let msg = match utils::decode_json::<IncomingMessage>(&rec.record.value) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(error = ?err, offset = rec.record.offset, "undecodable incoming message");
                return self.dead_letter(session, rec).await;
            }
        };
        let sub_path = match device_sub_path(&msg.source_topic, &msg.source_device) {
            Some(sub_path) => sub_path,
            None => {
                tracing::debug!(device = %msg.source_device, topic = %msg.source_topic, "publish outside of the device's own namespace");
                return self.dead_letter(session, rec).await;
            }
        };
        let destination = self.router.route(sub_path);
        if destination == self.router.default_route() {
            return self.dead_letter(session, rec).await;
        }
        let state: Value = match serde_json::from_slice(&msg.data) {
            Ok(state) => state,
            Err(_) => {
                tracing::debug!(device = %msg.source_device, "publish payload is not JSON");
                return self.dead_letter(session, rec).await;
            }
        };

        let out = DeviceStateMessage {
            version: 0,
            state,
            timestamp: rec.record.timestamp,
        };
        session
            .broker()
            .produce(destination, None, &msg.source_device, utils::encode_json(&out)?)
            .await?;
        metrics::increment_counter!(METRIC_DISPATCHED, "topic" => destination.to_string());
        Ok(())
    }

    async fn dead_letter(&self, session: &GroupSession, rec: &ClaimRecord) -> Result<()> {
        session
            .broker()
            .produce(self.router.default_route(), None, &rec.record.key, rec.record.value.clone())
            .await?;
        metrics::increment_counter!(METRIC_DEAD_LETTERED);
        Ok(())
    }
}
