use anyhow::{Context, Result};

use crate::database::Database;
use crate::error::{ShutdownError, ERR_ITER_FAILURE};
use crate::models::stream::Record;
use crate::stream::{Broker, METRIC_OFFSETS_COMMITTED, PREFIX_RECORD};
use crate::utils;

impl Broker {
    /// Fetch up to `max` records of the given partition, starting at offset `from`.
    ///
    /// Records are returned in offset order. Offsets removed by compaction are skipped.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn fetch(&self, topic: &str, partition: u32, from: u64, max: usize) -> Result<Vec<Record>> {
        let tree = self.partition(topic, partition)?.tree.clone();
        let records = Database::spawn_blocking(move || -> Result<Vec<Record>> {
            let start = utils::encode_byte_prefix(PREFIX_RECORD, from);
            let stop = utils::encode_byte_prefix(PREFIX_RECORD, u64::MAX);
            let mut records = Vec::new();
            for kv_res in tree.range(start..stop).take(max) {
                let (_, val) = kv_res.context(ERR_ITER_FAILURE)?;
                records.push(utils::decode_model::<Record>(&val)?);
            }
            Ok(records)
        })
        .await?
        .map_err(ShutdownError::from)?;
        Ok(records)
    }

    /// The next offset to be written to the given partition.
    pub fn high_water_mark(&self, topic: &str, partition: u32) -> Result<u64> {
        Ok(*self.partition(topic, partition)?.offset_rx.borrow())
    }

    /// Record `next_offset` as the next offset to be consumed by the group on the given partition.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn commit_offset(&self, group: &str, topic: &str, partition: u32, next_offset: u64) -> Result<()> {
        let (tree, key) = (self.inner.offsets.clone(), offsets_key(group, topic, partition));
        Database::spawn_blocking(move || -> Result<()> {
            tree.insert(key.as_bytes(), &utils::encode_u64(next_offset))
                .context("error writing consumer group offset")?;
            Ok(())
        })
        .await?
        .map_err(ShutdownError::from)?;
        metrics::increment_counter!(METRIC_OFFSETS_COMMITTED, "group" => group.to_string());
        Ok(())
    }

    /// The next offset to be consumed by the group on the given partition, if any was committed.
    pub async fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Result<Option<u64>> {
        let (tree, key) = (self.inner.offsets.clone(), offsets_key(group, topic, partition));
        let offset = Database::spawn_blocking(move || -> Result<Option<u64>> {
            tree.get(key.as_bytes())
                .context("error reading consumer group offset")?
                .map(|val| utils::decode_u64(&val).context("error decoding consumer group offset, data corrupted"))
                .transpose()
        })
        .await??;
        Ok(offset)
    }
}

fn offsets_key(group: &str, topic: &str, partition: u32) -> String {
    format!("{}/{}/{}", group, topic, partition)
}
