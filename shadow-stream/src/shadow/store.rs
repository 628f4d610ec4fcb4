//! The shadow state store.
//!
//! One value is stored per `(device, kind)` pair under the key `<device>:<kind>`. Each value is a
//! `StoredValue` wrapping the JSON document with an optional expiry; expired values read as absent
//! until a sweep removes them. Merges are applied with compare-and-swap so that concurrent writers
//! of the same key never lose an update.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use sled::Tree;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use shadow_core::merge;
use shadow_core::models::{self, ConnectionState, Shadow, State, StateKey};

use crate::database::Database;
use crate::error::{ShutdownError, ERR_ITER_FAILURE};
use crate::models::shadow::StoredValue;
use crate::utils;

const METRIC_STATES_EXPIRED: &str = "shadow_states_expired";

/// A handle to the stored shadow states.
#[derive(Clone)]
pub struct StateStore {
    states: Tree,
    modified: Tree,
}

impl StateStore {
    /// Open the state store of the given database.
    pub async fn new(db: &Database) -> Result<Self> {
        let states = db.get_shadow_states_tree().await?;
        let modified = db.get_shadow_modified_tree().await?;
        metrics::register_counter!(METRIC_STATES_EXPIRED, metrics::Unit::Count, "the number of expired shadow states removed");
        Ok(Self { states, modified })
    }

    /// Fetch every state kind of the given device in a single blocking round trip.
    pub async fn get_shadow(&self, device: &str) -> Result<Shadow> {
        let (tree, device) = (self.states.clone(), device.to_string());
        Database::spawn_blocking(move || -> Result<Shadow> {
            let now = utils::now_millis();
            let mut shadow = Shadow::new(device.as_str());
            if let Some(raw) = read_live(&tree, &models::key(&device, StateKey::Reported), now)? {
                shadow.reported = Some(utils::decode_json::<State>(&raw)?);
            }
            if let Some(raw) = read_live(&tree, &models::key(&device, StateKey::Desired), now)? {
                shadow.desired = Some(utils::decode_json::<State>(&raw)?);
            }
            if let Some(raw) = read_live(&tree, &models::key(&device, StateKey::Connection), now)? {
                shadow.connection = Some(utils::decode_json::<ConnectionState>(&raw)?);
            }
            Ok(shadow)
        })
        .await?
    }

    /// Fetch the raw JSON stored for the given device & kind.
    pub async fn get(&self, device: &str, kind: StateKey) -> Result<Option<Vec<u8>>> {
        let (tree, key) = (self.states.clone(), models::key(device, kind));
        Database::spawn_blocking(move || read_live(&tree, &key, utils::now_millis())).await?
    }

    /// Store the given raw JSON for the given device & kind, overwriting any previous value.
    pub async fn set(&self, device: &str, kind: StateKey, data: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let (tree, key) = (self.states.clone(), models::key(device, kind));
        let expires_at = ttl.map(|ttl| utils::now_millis() + ttl.as_millis() as i64).unwrap_or(0);
        let value = utils::encode_model(&StoredValue { data, expires_at })?;
        Database::spawn_blocking(move || -> Result<()> {
            tree.insert(key.as_bytes(), value).context("error writing shadow state")?;
            Ok(())
        })
        .await?
    }

    /// Merge the given state into the state stored for the given device & kind.
    ///
    /// The data is merged as a JSON merge patch; an absent stored value is replaced by the given
    /// data verbatim. The stored version is incremented by one and the given timestamp is kept.
    /// Returns the newly stored state.
    pub async fn merge_and_store(&self, device: &str, kind: StateKey, state: &State) -> Result<State> {
        let patch = state.clone();
        let updated = self
            .update_state(device, kind, move |old| merge_state(old.as_ref(), &patch).map(Some))
            .await?;
        updated.context("merge of a shadow state unexpectedly produced no state")
    }

    /// Remove a top-level key from the data of the state stored for the given device & kind.
    ///
    /// Returns `None` if no state is stored. Otherwise the version is incremented, even when the
    /// key was absent, and the updated state is returned.
    pub async fn remove_field(&self, device: &str, kind: StateKey, field: &str, timestamp: i64) -> Result<Option<State>> {
        let field = field.to_string();
        self.update_state(device, kind, move |old| {
            let mut state = match old {
                Some(state) => state,
                None => return Ok(None),
            };
            if let Some(data) = state.data.as_object_mut() {
                data.remove(&field);
            }
            state.version += 1;
            state.timestamp = timestamp;
            Ok(Some(state))
        })
        .await
    }

    /// Atomically update the state of the given device & kind with the given function.
    ///
    /// The function is called again when racing with a concurrent writer. Returning `None` leaves
    /// the store untouched.
    async fn update_state<F>(&self, device: &str, kind: StateKey, f: F) -> Result<Option<State>>
    where
        F: Fn(Option<State>) -> Result<Option<State>> + Send + 'static,
    {
        let (tree, key) = (self.states.clone(), models::key(device, kind));
        Database::spawn_blocking(move || -> Result<Option<State>> {
            loop {
                let current = tree.get(key.as_bytes()).context("error reading shadow state")?;
                let old = match &current {
                    Some(raw) => {
                        let stored = utils::decode_model::<StoredValue>(raw)?;
                        if stored.is_expired(utils::now_millis()) {
                            None
                        } else {
                            Some(utils::decode_json::<State>(&stored.data)?)
                        }
                    }
                    None => None,
                };
                let updated = match f(old)? {
                    Some(updated) => updated,
                    None => return Ok(None),
                };
                let value = utils::encode_model(&StoredValue {
                    data: utils::encode_json(&updated)?,
                    expires_at: 0,
                })?;
                let swapped = tree
                    .compare_and_swap(key.as_bytes(), current, Some(value))
                    .context("error writing shadow state")?;
                if swapped.is_ok() {
                    return Ok(Some(updated));
                }
                tracing::trace!(%key, "concurrent shadow state update, retrying");
            }
        })
        .await?
    }

    /// Record the current time as the last modification of the given device.
    pub async fn touch_modified(&self, device: &str) -> Result<()> {
        let (tree, key) = (self.modified.clone(), device.to_string());
        let now = utils::now_millis();
        Database::spawn_blocking(move || -> Result<()> {
            tree.insert(key.as_bytes(), &now.to_be_bytes()).context("error writing last modified marker")?;
            Ok(())
        })
        .await?
    }

    /// The unix timestamp in milliseconds of the last modification of the given device.
    pub async fn last_modified(&self, device: &str) -> Result<Option<i64>> {
        let (tree, key) = (self.modified.clone(), device.to_string());
        Database::spawn_blocking(move || -> Result<Option<i64>> {
            let raw = tree.get(key.as_bytes()).context("error reading last modified marker")?;
            raw.map(|val| utils::decode_u64(&val).map(|ts| ts as i64)).transpose()
        })
        .await?
    }

    /// Remove every expired state, returning the number of states removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let tree = self.states.clone();
        let removed = Database::spawn_blocking(move || -> Result<u64> {
            let now = utils::now_millis();
            let mut removed = 0;
            for kv_res in tree.iter() {
                let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
                if !utils::decode_model::<StoredValue>(&val)?.is_expired(now) {
                    continue;
                }
                // Only remove the value seen, a concurrent write may have refreshed it.
                if tree.compare_and_swap(&key, Some(&val), None as Option<&[u8]>)?.is_ok() {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await?
        .map_err(ShutdownError::from)?;
        metrics::counter!(METRIC_STATES_EXPIRED, removed);
        Ok(removed)
    }

    /// Spawn a task which periodically removes expired states.
    pub fn spawn_sweeper(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => (),
                    _ = shutdown.recv() => break,
                }
                match store.purge_expired().await {
                    Ok(removed) => tracing::debug!(removed, "expired shadow states removed"),
                    Err(err) => tracing::error!(error = ?err, "error removing expired shadow states"),
                }
            }
            tracing::debug!("shadow state sweeper has shutdown");
        })
    }
}

impl StoredValue {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }
}

/// Read the JSON of the given key, treating an expired value as absent.
fn read_live(tree: &Tree, key: &str, now: i64) -> Result<Option<Vec<u8>>> {
    let raw = match tree.get(key.as_bytes()).context("error reading shadow state")? {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let stored = utils::decode_model::<StoredValue>(&raw)?;
    if stored.is_expired(now) {
        return Ok(None);
    }
    Ok(Some(stored.data))
}

/// Fold the given state into the old one.
fn merge_state(old: Option<&State>, patch: &State) -> Result<State> {
    let old = match old {
        Some(old) => old,
        None => {
            return Ok(State {
                version: 1,
                data: patch.data.clone(),
                timestamp: patch.timestamp,
            })
        }
    };
    let merged = merge::merge_json(&old.data.to_string(), &patch.data.to_string())?;
    let data: Value = serde_json::from_str(&merged).context("error decoding merged state")?;
    Ok(State {
        version: old.version + 1,
        data,
        timestamp: patch.timestamp,
    })
}
