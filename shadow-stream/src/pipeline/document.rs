use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;

use shadow_core::models::{DeviceStateMessage, DocumentState};

use crate::group::{Claim, ClaimRecord, ClaimWorker, GroupHandler, GroupSession};
use crate::pipeline::{replay_partition, BATCH_SIZE, TOPIC_DESIRED_CHANGELOG, TOPIC_STATES};
use crate::utils;

const METRIC_DOCUMENTS_PRODUCED: &str = "shadow_pipeline_documents_produced";

/// The stage joining the reported & desired changelogs into one versioned document per device.
///
/// The stage must consume both changelogs with a co-partitioned strategy, so that the reported &
/// desired states of a device are always handled by the same worker.
#[derive(Default)]
pub struct DocumentStage;

impl DocumentStage {
    pub fn new() -> Self {
        metrics::register_counter!(METRIC_DOCUMENTS_PRODUCED, metrics::Unit::Count, "the number of versioned shadow documents produced");
        Self
    }
}

#[async_trait]
impl GroupHandler for DocumentStage {
    type Worker = DocumentWorker;

    async fn setup(&self, session: &GroupSession, partition: u32) -> Result<DocumentWorker> {
        let documents = replay_partition::<DocumentState>(session.broker(), TOPIC_STATES, partition)
            .await
            .with_context(|| format!("error replaying {} partition {}", TOPIC_STATES, partition))?;
        tracing::debug!(
            group = session.group(),
            member = session.member(),
            generation = session.generation(),
            partition,
            devices = documents.len(),
            "document partition assigned"
        );
        Ok(DocumentWorker { partition, documents })
    }
}

pub struct DocumentWorker {
    partition: u32,
    documents: HashMap<String, DocumentState>,
}

#[async_trait]
impl ClaimWorker for DocumentWorker {
    async fn consume_claim(&mut self, session: &GroupSession, claim: &mut Claim) -> Result<()> {
        while let Some(batch) = claim.next_batch(BATCH_SIZE).await? {
            for rec in batch.iter() {
                self.merge(session, rec).await?;
                session.commit(rec).await?;
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self, _session: &GroupSession) -> Result<()> {
        self.documents.clear();
        tracing::debug!(partition = self.partition, "document partition revoked");
        Ok(())
    }
}

impl DocumentWorker {
    /// Fold a changelog record into the document of its device.
    ///
    /// The document is only updated in memory once its produce has been acknowledged, so a failed
    /// produce leaves the record to be redelivered against unchanged state.
    async fn merge(&mut self, session: &GroupSession, rec: &ClaimRecord) -> Result<()> {
        let device = rec.record.key.as_str();
        let state = match utils::decode_json::<DeviceStateMessage>(&rec.record.value) {
            Ok(msg) => msg.state,
            Err(err) => {
                tracing::warn!(error = ?err, device, topic = %rec.topic, offset = rec.record.offset, "skipping undecodable changelog record");
                return Ok(());
            }
        };

        let mut document = self.documents.get(device).cloned().unwrap_or_default();
        if rec.topic.as_str() == TOPIC_DESIRED_CHANGELOG {
            document.desired = Some(state);
        } else {
            document.reported = Some(state);
        }
        document.version += 1;

        session
            .broker()
            .produce(TOPIC_STATES, Some(rec.partition), device, utils::encode_json(&document)?)
            .await?;
        metrics::increment_counter!(METRIC_DOCUMENTS_PRODUCED);
        self.documents.insert(device.to_string(), document);
        Ok(())
    }
}
