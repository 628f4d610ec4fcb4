use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;
use shadow_core::directory::Device;
use shadow_core::models::DeviceStateMessage;

use crate::config::Config;
use crate::database::Database;
use crate::directory::StaticDirectory;
use crate::models::stream::Record;
use crate::stream::Broker;
use crate::utils;

/// Open a fresh database & broker for the given test config.
pub async fn setup_broker(config: Arc<Config>) -> Result<(Database, Broker)> {
    let db = Database::new(config).await?;
    let broker = Broker::new(db.clone()).await?;
    Ok((db, broker))
}

/// Write the given number of records to a topic partition, keyed by `key`, returning the offset
/// of the last record written.
pub async fn setup_topic_data(broker: &Broker, topic: &str, partition: u32, key: &str, count: u64) -> Result<u64> {
    let mut last_offset = 0;
    for idx in 0..count {
        let (_, offset) = broker.produce(topic, Some(partition), key, idx.to_string().into_bytes()).await?;
        last_offset = offset;
    }
    Ok(last_offset)
}

/// Write a device state message carrying the given state to a topic.
pub async fn produce_state(broker: &Broker, topic: &str, partition: Option<u32>, device: &str, version: u64, state: Value) -> Result<(u32, u64)> {
    let msg = DeviceStateMessage {
        version,
        state,
        timestamp: utils::now_millis(),
    };
    broker.produce(topic, partition, device, utils::encode_json(&msg)?).await
}

/// Poll a topic partition until it holds at least `count` records, returning the records.
pub async fn wait_for_records(broker: &Broker, topic: &str, partition: u32, count: usize) -> Result<Vec<Record>> {
    for _ in 0..250 {
        let records = broker.fetch(topic, partition, 0, usize::MAX).await?;
        if records.len() >= count {
            return Ok(records);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("timeout waiting for {} records on {}/{}", count, topic, partition)
}

/// A test device, enabled for both auth methods.
pub fn device(id: &str, title: &str, fingerprint: &[u8]) -> (Device, Vec<u8>) {
    let device = Device {
        id: id.into(),
        title: title.into(),
        enabled: true,
        basic_enabled: true,
        ..Default::default()
    };
    (device, fingerprint.to_vec())
}

/// Build a static directory holding the given devices.
pub fn setup_directory(config: &Config, devices: Vec<(Device, Vec<u8>)>) -> Arc<StaticDirectory> {
    Arc::new(StaticDirectory::new(&config.token_hmac_key, devices))
}
