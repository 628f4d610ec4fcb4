//! Runtime configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::pipeline::{TOPIC_DESIRED_DELTA, TOPIC_REPORTED_DELTA};

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,
    /// The name of the pod on which this instance is running.
    ///
    /// This doubles as the node's consumer group member ID.
    #[serde(default = "Config::default_pod_name")]
    pub pod_name: String,
    /// The port on which the MQTT listener accepts device connections.
    #[serde(default = "Config::default_mqtt_port")]
    pub mqtt_port: u16,
    /// The port on which Prometheus metrics are served.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,
    /// The port of the shadow API gRPC server.
    #[serde(default = "Config::default_grpc_port")]
    pub grpc_port: u16,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The partition count of every pipeline topic.
    #[serde(default = "Config::default_partitions")]
    pub partitions: u32,
    /// The interval at which compacted topics are compacted.
    #[serde(default = "Config::default_compaction_interval_seconds")]
    pub compaction_interval_seconds: u64,
    /// The expiry of stored connection states.
    #[serde(default = "Config::default_connection_state_ttl_seconds")]
    pub connection_state_ttl_seconds: u64,

    /// The buffer size of each fan-out bus subscription.
    #[serde(default = "Config::default_bus_capacity")]
    pub bus_capacity: usize,
    /// The maximum time a bus publication waits on a full subscriber buffer.
    #[serde(default = "Config::default_bus_publish_timeout_ms")]
    pub bus_publish_timeout_ms: u64,
    /// The largest MQTT packet, in bytes, accepted from an authenticated device.
    #[serde(default = "Config::default_max_packet_size")]
    pub max_packet_size: usize,

    /// The topic prefix routes of the dispatch stage, as a JSON object of prefix to topic.
    #[serde(default = "Config::default_routes", deserialize_with = "Config::parse_routes")]
    pub routes: BTreeMap<String, String>,

    /// The HMAC key used for device bearer tokens.
    #[serde(deserialize_with = "Config::parse_hmac_key")]
    pub token_hmac_key: Vec<u8>,
    /// The path of the JSON device registry.
    #[serde(default)]
    pub devices_path: Option<String>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints which serde can not express.
    fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            anyhow::bail!("PARTITIONS must be greater than 0");
        }
        if self.bus_capacity == 0 {
            anyhow::bail!("BUS_CAPACITY must be greater than 0");
        }
        if self.max_packet_size == 0 {
            anyhow::bail!("MAX_PACKET_SIZE must be greater than 0");
        }
        Ok(())
    }

    /// The bus publish timeout as a duration.
    pub fn bus_publish_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_publish_timeout_ms)
    }

    /// The compaction interval as a duration.
    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_seconds)
    }

    /// The connection state TTL as a duration.
    pub fn connection_state_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_state_ttl_seconds)
    }

    fn default_pod_name() -> String {
        "shadow-0".into()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_metrics_port() -> u16 {
        9090
    }

    fn default_grpc_port() -> u16 {
        7000
    }

    fn default_partitions() -> u32 {
        4
    }

    fn default_compaction_interval_seconds() -> u64 {
        1800
    }

    fn default_connection_state_ttl_seconds() -> u64 {
        60 * 60 * 24
    }

    fn default_bus_capacity() -> usize {
        10
    }

    fn default_bus_publish_timeout_ms() -> u64 {
        1000
    }

    fn default_max_packet_size() -> usize {
        crate::mqtt::codec::DEFAULT_MAX_PACKET_SIZE
    }

    /// The default dispatch routes, relative to a device's topic namespace.
    pub fn default_routes() -> BTreeMap<String, String> {
        let mut routes = BTreeMap::new();
        routes.insert("state/reported".into(), TOPIC_REPORTED_DELTA.into());
        routes.insert("state/desired".into(), TOPIC_DESIRED_DELTA.into());
        routes
    }

    /// Parse the routes table from its JSON config source.
    fn parse_routes<'de, D: Deserializer<'de>>(val: D) -> Result<BTreeMap<String, String>, D::Error> {
        let json: String = Deserialize::deserialize(val)?;
        serde_json::from_str(&json).map_err(|err| DeError::custom(format!("invalid ROUTES json: {}", err)))
    }

    /// Parse the HMAC key from its base64 config source.
    fn parse_hmac_key<'de, D: Deserializer<'de>>(val: D) -> Result<Vec<u8>, D::Error> {
        let b64_bytes: String = Deserialize::deserialize(val)?;
        let bytes = base64::decode(&b64_bytes).map_err(|err| DeError::custom(err.to_string()))?;
        if bytes.is_empty() {
            return Err(DeError::custom("TOKEN_HMAC_KEY must not be empty"));
        }
        Ok(bytes)
    }

    /// Build a config for tests, backed by a fresh temp dir which must outlive the config.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir")?;
        let config = Self {
            rust_log: "".into(),
            pod_name: "shadow-test-0".into(),
            mqtt_port: 0,
            metrics_port: 0,
            grpc_port: 0,
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            partitions: 2,
            compaction_interval_seconds: Self::default_compaction_interval_seconds(),
            connection_state_ttl_seconds: Self::default_connection_state_ttl_seconds(),
            bus_capacity: 10,
            bus_publish_timeout_ms: 50,
            max_packet_size: Self::default_max_packet_size(),
            routes: Self::default_routes(),
            token_hmac_key: b"test-hmac-key".to_vec(),
            devices_path: None,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
