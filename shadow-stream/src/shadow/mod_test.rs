use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::json;
use shadow_core::models::{DeviceStateMessage, Shadow, State, StateKey};
use tonic::Code;

use crate::config::Config;
use crate::fixtures;
use crate::pipeline::{ensure_topics, TOPIC_DESIRED_DELTA, TOPIC_REPORTED_DELTA};
use crate::shadow::{ShadowBus, ShadowEvent, ShadowService, StateStore};
use crate::stream::partition_for_key;
use crate::utils;
use shadow_core::{device_topic, BUS_TOPIC_OUTGOING};

struct Fixture {
    service: ShadowService,
    store: StateStore,
    bus: ShadowBus,
    broker: crate::stream::Broker,
    partitions: u32,
    _tmpdir: tempfile::TempDir,
}

async fn setup() -> Result<Fixture> {
    let (config, tmpdir) = Config::new_test()?;
    let (db, broker) = fixtures::setup_broker(config.clone()).await?;
    ensure_topics(&broker, config.partitions).await?;
    let store = StateStore::new(&db).await?;
    let bus = ShadowBus::new(config.bus_capacity, config.bus_publish_timeout());
    let service = ShadowService::new(store.clone(), bus.clone(), broker.clone(), 10);
    Ok(Fixture {
        service,
        store,
        bus,
        broker,
        partitions: config.partitions,
        _tmpdir: tmpdir,
    })
}

fn patch(device: &str, reported: Option<serde_json::Value>, desired: Option<serde_json::Value>) -> Shadow {
    Shadow {
        reported: reported.map(|data| State::new(data, 0)),
        desired: desired.map(|data| State::new(data, 0)),
        ..Shadow::new(device)
    }
}

#[tokio::test]
async fn get_requires_devices_and_reports_absent_states_as_absent() -> Result<()> {
    let fx = setup().await?;

    let err = fx.service.get(&[]).await.err().context("expected an empty pool to fail")?;
    let shadows = fx.service.get(&["dev-1".to_string()]).await?;

    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(shadows, vec![Shadow::new("dev-1")]);
    Ok(())
}

#[tokio::test]
async fn patch_stores_publishes_and_forwards_to_the_pipeline() -> Result<()> {
    let fx = setup().await?;
    let (_guard, mut events) = fx.bus.sub(&[&device_topic(BUS_TOPIC_OUTGOING, "dev-1")]);

    fx.service.patch(patch("dev-1", None, Some(json!({"led": "on", "fan": 1})))).await?;
    let result = fx.service.patch(patch("dev-1", None, Some(json!({"fan": null})))).await?;

    let desired = result.desired.clone().context("expected a desired state")?;
    assert_eq!((desired.version, desired.data), (2, json!({"led": "on"})));
    assert!(result.reported.is_none());
    assert_eq!(fx.store.get_shadow("dev-1").await?.desired.map(|state| state.data), Some(json!({"led": "on"})));
    assert!(fx.store.last_modified("dev-1").await?.is_some());

    let first = tokio::time::timeout(Duration::from_secs(1), events.recv()).await?.context("bus closed")?;
    assert!(first.persisted, "expected API writes to be marked as persisted");

    let partition = partition_for_key("dev-1", fx.partitions);
    let deltas = fixtures::wait_for_records(&fx.broker, TOPIC_DESIRED_DELTA, partition, 2).await?;
    let last: DeviceStateMessage = utils::decode_json(&deltas[1].value)?;
    assert_eq!(last.state, json!({"fan": null}), "expected the raw patch to be forwarded");
    assert_eq!(fx.broker.high_water_mark(TOPIC_REPORTED_DELTA, partition)?, 0);
    Ok(())
}

#[tokio::test]
async fn patch_rejects_empty_input() -> Result<()> {
    let fx = setup().await?;

    let no_device = fx.service.patch(patch("", Some(json!({"a": 1})), None)).await.err().context("expected failure")?;
    let no_state = fx.service.patch(Shadow::new("dev-1")).await.err().context("expected failure")?;

    assert_eq!(no_device.code(), Code::InvalidArgument);
    assert_eq!(no_state.code(), Code::InvalidArgument);
    Ok(())
}

#[tokio::test]
async fn remove_strips_a_key_or_reports_not_found() -> Result<()> {
    let fx = setup().await?;
    fx.service.patch(patch("dev-1", Some(json!({"a": 1, "b": 2})), None)).await?;

    let removed = fx.service.remove("dev-1", StateKey::Reported, "a").await?;
    let missing = fx.service.remove("dev-1", StateKey::Desired, "a").await.err().context("expected failure")?;
    let bad_kind = fx.service.remove("dev-1", StateKey::Connection, "a").await.err().context("expected failure")?;

    assert_eq!(removed.reported.map(|state| (state.version, state.data)), Some((2, json!({"b": 2}))));
    assert_eq!(missing.code(), Code::NotFound);
    assert_eq!(bad_kind.code(), Code::InvalidArgument);
    Ok(())
}

#[tokio::test]
async fn stream_shadow_syncs_then_follows_requested_devices() -> Result<()> {
    let fx = setup().await?;
    fx.service.patch(patch("dev-1", Some(json!({"temp": 20})), None)).await?;

    let mut stream = fx.service.stream_shadow(vec!["dev-1".into()], true).await?;
    let initial = tokio::time::timeout(Duration::from_secs(1), stream.next()).await?.context("stream ended")??;
    assert_eq!(initial.reported.map(|state| state.data), Some(json!({"temp": 20})));

    ShadowEvent::new(patch("dev-2", Some(json!({"temp": 1})), None)).publish(&fx.bus).await;
    fx.service.patch(patch("dev-1", None, Some(json!({"led": "on"})))).await?;
    let live = tokio::time::timeout(Duration::from_secs(1), stream.next()).await?.context("stream ended")??;

    assert_eq!(live.device, "dev-1");
    assert_eq!(live.desired.map(|state| state.data), Some(json!({"led": "on"})));
    Ok(())
}

#[tokio::test]
async fn stream_shadow_requires_devices() -> Result<()> {
    let fx = setup().await?;

    let err = fx.service.stream_shadow(Vec::new(), false).await.err().context("expected failure")?;

    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}
