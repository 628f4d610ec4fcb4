use anyhow::{Context, Result};

use crate::database::Database;
use crate::error::{ShutdownError, ERR_DB_FLUSH};
use crate::models::stream::Record;
use crate::stream::{Broker, KEY_NEXT_OFFSET, METRIC_RECORDS_PRODUCED, PREFIX_RECORD};
use crate::utils;

impl Broker {
    /// Write a record to the given topic, returning the partition & offset it was written to.
    ///
    /// When no partition is given, the partition is derived from the record key. The returned
    /// future resolves once the record has been flushed to disk.
    #[tracing::instrument(level = "trace", skip(self, value))]
    pub async fn produce(&self, topic: &str, partition: Option<u32>, key: &str, value: Vec<u8>) -> Result<(u32, u64)> {
        let topic_meta = self.topic(topic)?;
        let partition_id = match partition {
            Some(partition) => partition,
            None => partition_for_key(key, topic_meta.partitions.len() as u32),
        };
        let partition = self.partition(topic, partition_id)?;

        // Hold the offset lock across the write so that offsets are assigned in write order.
        let mut next_offset = partition.next_offset.lock().await;
        let offset = *next_offset;
        let record = Record {
            offset,
            key: key.into(),
            value,
            timestamp: utils::now_millis(),
        };
        let encoded = utils::encode_model(&record).context("error encoding record for storage")?;
        let tree = partition.tree.clone();
        Database::spawn_blocking(move || -> Result<()> {
            let mut batch = sled::Batch::default();
            batch.insert(&utils::encode_byte_prefix(PREFIX_RECORD, offset), encoded);
            batch.insert(KEY_NEXT_OFFSET, &utils::encode_u64(offset + 1));
            tree.apply_batch(batch).context("error applying write batch")?;
            Ok(())
        })
        .await?
        .map_err(ShutdownError::from)?;
        partition
            .tree
            .flush_async()
            .await
            .context(ERR_DB_FLUSH)
            .map_err(ShutdownError::from)?;

        *next_offset = offset + 1;
        let _ = partition.offset_signal.send(offset + 1);
        metrics::increment_counter!(METRIC_RECORDS_PRODUCED, "topic" => topic_meta.name.clone());
        tracing::trace!(partition = partition_id, offset, "record written");
        Ok((partition_id, offset))
    }
}

/// Map a record key onto one of the given number of partitions.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    (seahash::hash(key.as_bytes()) % u64::from(partitions.max(1))) as u32
}
