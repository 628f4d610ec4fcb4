//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/shadow/db";
/// The DB tree prefix used for topic partitions.
const TREE_STREAM_PREFIX: &str = "stream";
/// The DB tree used for topic metadata.
const TREE_TOPICS_METADATA: &str = "topics_metadata";
/// The DB tree used for consumer group offsets.
const TREE_GROUP_OFFSETS: &str = "group_offsets";
/// The DB tree used for stored shadow states.
const TREE_SHADOW_STATES: &str = "shadow_states";
/// The DB tree used for per-device last modified markers.
const TREE_SHADOW_MODIFIED: &str = "shadow_modified";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the node's database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.pod_name.as_str());
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for shadow database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree of a topic partition.
    pub async fn get_partition_tree(&self, topic: &str, partition: u32) -> ShutdownResult<Tree> {
        self.open_tree(format!("{}/{}/{}", TREE_STREAM_PREFIX, topic, partition)).await
    }

    /// Get a handle to the DB tree of topic metadata.
    pub async fn get_topics_metadata_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_TOPICS_METADATA.into()).await
    }

    /// Get a handle to the DB tree of consumer group offsets.
    pub async fn get_group_offsets_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_GROUP_OFFSETS.into()).await
    }

    /// Get a handle to the DB tree of stored shadow states.
    pub async fn get_shadow_states_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_SHADOW_STATES.into()).await
    }

    /// Get a handle to the DB tree of device last modified markers.
    pub async fn get_shadow_modified_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_SHADOW_MODIFIED.into()).await
    }

    async fn open_tree(&self, name: String) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name.as_str()));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", &name, err))))?;
        Ok(tree)
    }
}
