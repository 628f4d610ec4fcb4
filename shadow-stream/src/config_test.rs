use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::pipeline::{TOPIC_DESIRED_DELTA, TOPIC_REPORTED_DELTA};

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("POD_NAME".into(), "shadow-3".into()),
        ("MQTT_PORT".into(), "8883".into()),
        ("METRICS_PORT".into(), "9100".into()),
        ("GRPC_PORT".into(), "7100".into()),
        ("STORAGE_DATA_PATH".into(), "/usr/local/shadow/data".into()),
        ("PARTITIONS".into(), "8".into()),
        ("BUS_CAPACITY".into(), "32".into()),
        ("BUS_PUBLISH_TIMEOUT_MS".into(), "250".into()),
        ("MAX_PACKET_SIZE".into(), "4096".into()),
        ("COMPACTION_INTERVAL_SECONDS".into(), "60".into()),
        ("CONNECTION_STATE_TTL_SECONDS".into(), "3600".into()),
        ("ROUTES".into(), r#"{"telemetry/":"public.telemetry"}"#.into()),
        ("TOKEN_HMAC_KEY".into(), base64::encode(b"secret")),
        ("DEVICES_PATH".into(), "/etc/shadow/devices.json".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.pod_name == "shadow-3", "unexpected value parsed for POD_NAME, got {}, expected {}", config.pod_name, "shadow-3");
    assert!(config.mqtt_port == 8883, "unexpected value parsed for MQTT_PORT, got {}, expected {}", config.mqtt_port, 8883);
    assert!(config.metrics_port == 9100, "unexpected value parsed for METRICS_PORT, got {}, expected {}", config.metrics_port, 9100);
    assert!(config.grpc_port == 7100, "unexpected value parsed for GRPC_PORT, got {}, expected {}", config.grpc_port, 7100);
    assert!(
        config.storage_data_path == "/usr/local/shadow/data",
        "unexpected value parsed for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/usr/local/shadow/data"
    );
    assert!(config.partitions == 8, "unexpected value parsed for PARTITIONS, got {}, expected {}", config.partitions, 8);
    assert!(config.bus_capacity == 32, "unexpected value parsed for BUS_CAPACITY, got {}, expected {}", config.bus_capacity, 32);
    assert_eq!(config.bus_publish_timeout(), Duration::from_millis(250));
    assert_eq!(config.max_packet_size, 4096);
    assert_eq!(config.compaction_interval(), Duration::from_secs(60));
    assert_eq!(config.connection_state_ttl(), Duration::from_secs(3600));
    assert_eq!(config.routes.len(), 1);
    assert_eq!(config.routes.get("telemetry/").map(String::as_str), Some("public.telemetry"));
    assert_eq!(config.token_hmac_key, b"secret".to_vec());
    assert_eq!(config.devices_path.as_deref(), Some("/etc/shadow/devices.json"));

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![("TOKEN_HMAC_KEY".into(), base64::encode(b"secret"))])?;

    assert!(config.pod_name == "shadow-0", "unexpected default for POD_NAME, got {}, expected {}", config.pod_name, "shadow-0");
    assert!(config.mqtt_port == 1883, "unexpected default for MQTT_PORT, got {}, expected {}", config.mqtt_port, 1883);
    assert!(config.grpc_port == 7000, "unexpected default for GRPC_PORT, got {}, expected {}", config.grpc_port, 7000);
    assert!(config.partitions == 4, "unexpected default for PARTITIONS, got {}, expected {}", config.partitions, 4);
    assert!(config.bus_capacity == 10, "unexpected default for BUS_CAPACITY, got {}, expected {}", config.bus_capacity, 10);
    assert_eq!(config.bus_publish_timeout(), Duration::from_millis(1000));
    assert_eq!(config.max_packet_size, 1024 * 1024);
    assert_eq!(config.connection_state_ttl(), Duration::from_secs(86400));
    assert_eq!(config.routes.get("state/reported").map(String::as_str), Some(TOPIC_REPORTED_DELTA));
    assert_eq!(config.routes.get("state/desired").map(String::as_str), Some(TOPIC_DESIRED_DELTA));
    assert!(config.devices_path.is_none());

    Ok(())
}

#[test]
fn config_rejects_missing_or_invalid_hmac_key() {
    let res: Result<Config, _> = envy::from_iter(vec![("PARTITIONS".into(), "2".into())]);
    assert!(res.is_err(), "expected config without TOKEN_HMAC_KEY to be rejected");

    let res: Result<Config, _> = envy::from_iter(vec![("TOKEN_HMAC_KEY".into(), "%%%".into())]);
    assert!(res.is_err(), "expected config with invalid base64 TOKEN_HMAC_KEY to be rejected");
}

#[test]
fn config_rejects_invalid_routes_json() {
    let res: Result<Config, _> = envy::from_iter(vec![
        ("TOKEN_HMAC_KEY".into(), base64::encode(b"secret")),
        ("ROUTES".into(), "[1,2".into()),
    ]);
    assert!(res.is_err(), "expected invalid ROUTES json to be rejected");
}
