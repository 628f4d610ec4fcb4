//! Embedded topic log.
//!
//! ## Layout
//! Every topic is split into a fixed number of partitions, and each partition lives in its own
//! database tree named `stream/<topic>/<partition>`. Records are keyed by their offset behind the
//! `PREFIX_RECORD` byte, so range scans iterate in offset order. The next offset to be written is
//! stored under `KEY_NEXT_OFFSET` in the same tree and is updated atomically with each write.
//!
//! Topic metadata lives in its own tree, and topics found there are re-opened on startup.
//!
//! ## Compaction
//! Topics flagged as compacted only need to retain the latest record of each key. A compaction
//! pass removes every record shadowed by a later record with the same key. Offsets are never
//! reused, so readers must tolerate gaps.

mod publisher;
mod subscriber;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use sled::Tree;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::database::Database;
use crate::error::{AppError, ShutdownError, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::models::stream::{Record, TopicMetadata};
use crate::utils;

pub use publisher::partition_for_key;

/// The key prefix used for storing partition records.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_byte_prefix` method.
pub const PREFIX_RECORD: &[u8; 1] = b"r";
/// The key used to store the next offset to be written to a partition.
pub const KEY_NEXT_OFFSET: &[u8; 1] = b"n";

pub(self) const METRIC_RECORDS_PRODUCED: &str = "shadow_stream_records_produced";
pub(self) const METRIC_OFFSETS_COMMITTED: &str = "shadow_stream_offsets_committed";
pub(self) const METRIC_RECORDS_COMPACTED: &str = "shadow_stream_records_compacted";

/// A handle to the node's topic log.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    /// The application's database system.
    db: Database,
    /// The tree holding topic metadata.
    metadata: Tree,
    /// The tree holding consumer group offsets.
    offsets: Tree,
    /// All open topics, by name.
    topics: ArcSwap<HashMap<String, Arc<Topic>>>,
    /// Serializes topic creation.
    create_lock: Mutex<()>,
}

/// An open topic.
struct Topic {
    name: String,
    compacted: bool,
    partitions: Vec<Arc<Partition>>,
}

/// An open topic partition.
struct Partition {
    /// This partition's database tree.
    tree: Tree,
    /// The next offset to be written, also serializing writers.
    next_offset: Mutex<u64>,
    /// A channel used for communicating the partition's high water mark.
    offset_signal: watch::Sender<u64>,
    /// Kept so that the signal always has a receiver to clone from.
    offset_rx: watch::Receiver<u64>,
}

impl Broker {
    /// Create a new instance, re-opening all topics recorded on disk.
    pub async fn new(db: Database) -> Result<Self> {
        let metadata = db.get_topics_metadata_tree().await?;
        let offsets = db.get_group_offsets_tree().await?;
        metrics::register_counter!(METRIC_RECORDS_PRODUCED, metrics::Unit::Count, "the number of records written to the topic log");
        metrics::register_counter!(METRIC_OFFSETS_COMMITTED, metrics::Unit::Count, "the number of consumer group offset commits");
        metrics::register_counter!(METRIC_RECORDS_COMPACTED, metrics::Unit::Count, "the number of records removed by compaction");

        let broker = Self {
            inner: Arc::new(BrokerInner {
                db,
                metadata: metadata.clone(),
                offsets,
                topics: ArcSwap::from_pointee(HashMap::new()),
                create_lock: Mutex::new(()),
            }),
        };
        for meta in recover_topics(metadata).await? {
            tracing::debug!(topic = %meta.name, partitions = meta.partitions, "recovered topic");
            broker.open_topic(meta).await?;
        }
        Ok(broker)
    }

    /// Create a topic if it does not already exist.
    ///
    /// Creating an existing topic is a no-op, unless the requested partition count differs from
    /// the existing one, which is an error.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create_topic(&self, name: &str, partitions: u32, compacted: bool) -> Result<()> {
        if partitions == 0 {
            bail!(AppError::InvalidInput(format!("topic {} must have at least 1 partition", name)));
        }
        let _guard = self.inner.create_lock.lock().await;
        if let Some(topic) = self.inner.topics.load().get(name) {
            if topic.partitions.len() != partitions as usize {
                bail!(AppError::InvalidInput(format!(
                    "topic {} already exists with {} partitions, requested {}",
                    name,
                    topic.partitions.len(),
                    partitions
                )));
            }
            return Ok(());
        }

        let meta = TopicMetadata {
            name: name.into(),
            partitions,
            compacted,
        };
        let (tree, key, encoded) = (self.inner.metadata.clone(), name.to_string(), utils::encode_model(&meta)?);
        Database::spawn_blocking(move || -> Result<()> {
            tree.insert(key.as_bytes(), encoded).context("error writing topic metadata")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await?
        .map_err(ShutdownError::from)?;
        self.open_topic(meta).await
    }

    /// Open the partition trees of the given topic & register it.
    async fn open_topic(&self, meta: TopicMetadata) -> Result<()> {
        let mut partitions = Vec::with_capacity(meta.partitions as usize);
        for partition in 0..meta.partitions {
            let tree = self.inner.db.get_partition_tree(&meta.name, partition).await?;
            let next_offset = recover_next_offset(tree.clone()).await?;
            let (offset_signal, offset_rx) = watch::channel(next_offset);
            partitions.push(Arc::new(Partition {
                tree,
                next_offset: Mutex::new(next_offset),
                offset_signal,
                offset_rx,
            }));
        }
        let topic = Arc::new(Topic {
            name: meta.name.clone(),
            compacted: meta.compacted,
            partitions,
        });
        let mut topics = HashMap::clone(&self.inner.topics.load());
        topics.insert(meta.name, topic);
        self.inner.topics.store(Arc::new(topics));
        Ok(())
    }

    /// The number of partitions of the given topic.
    pub fn partitions(&self, topic: &str) -> Result<u32> {
        Ok(self.topic(topic)?.partitions.len() as u32)
    }

    /// Subscribe to the high water mark of the given topic partition.
    pub fn subscribe_offsets(&self, topic: &str, partition: u32) -> Result<watch::Receiver<u64>> {
        Ok(self.partition(topic, partition)?.offset_rx.clone())
    }

    fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        match self.inner.topics.load().get(name) {
            Some(topic) => Ok(topic.clone()),
            None => bail!(AppError::InvalidInput(format!("unknown topic {}", name))),
        }
    }

    fn partition(&self, topic: &str, partition: u32) -> Result<Arc<Partition>> {
        let topic = self.topic(topic)?;
        match topic.partitions.get(partition as usize) {
            Some(partition) => Ok(partition.clone()),
            None => bail!(AppError::InvalidInput(format!(
                "partition {} is out of range for topic {} with {} partitions",
                partition,
                topic.name,
                topic.partitions.len()
            ))),
        }
    }

    /// Spawn the periodic compaction of compacted topics.
    ///
    /// A failed compaction triggers a shutdown of the node.
    pub fn spawn_compactor(&self, interval: Duration, shutdown_tx: broadcast::Sender<()>) -> JoinHandle<Result<()>> {
        let broker = self.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // The first tick fires immediately.
            loop {
                tokio::select! {
                    _ = ticker.tick() => (),
                    _ = shutdown.recv() => break,
                }
                let topics: Vec<_> = broker.inner.topics.load().values().filter(|topic| topic.compacted).cloned().collect();
                for topic in topics {
                    if let Err(err) = broker.compact_topic(&topic.name).await {
                        tracing::error!(error = ?err, topic = %topic.name, "error during compaction routine, shutting down");
                        let _res = shutdown_tx.send(());
                        return Err(err);
                    }
                }
            }
            tracing::debug!("topic compactor has shutdown");
            Ok(())
        })
    }

    /// Compact every partition of the given topic, returning the number of records removed.
    ///
    /// **NOTE: any error returned from this routine should cause a shutdown to be issued.**
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn compact_topic(&self, name: &str) -> Result<u64> {
        let topic = self.topic(name)?;
        let mut total = 0;
        for partition in topic.partitions.iter() {
            let tree = partition.tree.clone();
            total += Database::spawn_blocking(move || compact_partition(&tree))
                .await?
                .map_err(ShutdownError::from)?;
        }
        metrics::counter!(METRIC_RECORDS_COMPACTED, total, "topic" => topic.name.clone());
        tracing::debug!(removed = total, "compacted topic");
        Ok(total)
    }
}

/// Remove every record of the given partition tree shadowed by a later record with the same key.
fn compact_partition(tree: &Tree) -> Result<u64> {
    let mut latest: HashMap<String, u64> = HashMap::new();
    let mut records = Vec::new();
    for kv_res in tree.scan_prefix(PREFIX_RECORD) {
        let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
        let record: Record = utils::decode_model(&val)?;
        latest.insert(record.key.clone(), record.offset);
        records.push((key, record.key, record.offset));
    }

    let mut batch = sled::Batch::default();
    let mut removed = 0;
    for (key, record_key, offset) in records {
        if latest.get(&record_key).map(|latest| *latest > offset).unwrap_or(false) {
            batch.remove(key);
            removed += 1;
        }
    }
    if removed > 0 {
        tree.apply_batch(batch).context("error applying compaction batch to partition tree")?;
        tree.flush().context(ERR_DB_FLUSH)?;
    }
    Ok(removed)
}

/// Recover the metadata of all topics recorded on disk.
async fn recover_topics(tree: Tree) -> Result<Vec<TopicMetadata>> {
    let val = Database::spawn_blocking(move || -> Result<Vec<TopicMetadata>> {
        let mut topics = Vec::new();
        for kv_res in tree.iter() {
            let (_, val) = kv_res.context(ERR_ITER_FAILURE)?;
            topics.push(utils::decode_model(&val).context("error decoding topic metadata from storage")?);
        }
        Ok(topics)
    })
    .await??;
    Ok(val)
}

/// Recover the next offset to be written to the given partition tree.
async fn recover_next_offset(tree: Tree) -> Result<u64> {
    let val = Database::spawn_blocking(move || -> Result<u64> {
        if let Some(val) = tree.get(KEY_NEXT_OFFSET).context("error fetching next offset key during recovery")? {
            return utils::decode_u64(&val).context("error decoding next offset value from storage");
        }
        // Fall back to the last record on disk.
        let last_offset = tree
            .scan_prefix(PREFIX_RECORD)
            .keys()
            .next_back()
            .transpose()
            .context("error fetching last record")?
            .map(|key| utils::decode_u64(&key[1..]))
            .transpose()?;
        Ok(last_offset.map(|offset| offset + 1).unwrap_or(0))
    })
    .await??;
    Ok(val)
}
