use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::broadcast;
use tonic::{Code, Request};

use crate::config::Config;
use crate::fixtures;
use crate::grpc::{GetRequest, PatchRequest, RemoveRequest, ShadowDocument, ShadowState, Shadows, StateKind, StreamShadowRequest};
use crate::pipeline::ensure_topics;
use crate::server::AppServer;
use crate::shadow::{ShadowBus, ShadowService, StateStore};

async fn setup() -> Result<(AppServer, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let (db, broker) = fixtures::setup_broker(config.clone()).await?;
    ensure_topics(&broker, config.partitions).await?;
    let store = StateStore::new(&db).await?;
    let bus = ShadowBus::new(config.bus_capacity, config.bus_publish_timeout());
    let service = ShadowService::new(store, bus, broker, config.bus_capacity);
    let (shutdown_tx, _) = broadcast::channel(1);
    Ok((AppServer::new(config, service, shutdown_tx), tmpdir))
}

fn desired_patch(device: &str, data: &str) -> Request<PatchRequest> {
    Request::new(PatchRequest {
        shadow: Some(ShadowDocument {
            device: device.into(),
            desired: Some(ShadowState {
                data: data.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    })
}

#[tokio::test]
async fn patch_and_get_round_trip_json_documents() -> Result<()> {
    let (server, _tmpdir) = setup().await?;

    let patched = server.patch(desired_patch("dev-1", r#"{"led":"on","fan":1}"#)).await?.into_inner();
    let desired = patched.desired.context("expected desired state")?;
    assert_eq!(desired.version, 1);
    assert_eq!(serde_json::from_str::<serde_json::Value>(&desired.data)?, serde_json::json!({"led": "on", "fan": 1}));

    let res = server.get(Request::new(GetRequest { devices: vec!["dev-1".into(), "dev-2".into()] })).await?.into_inner();
    assert_eq!(res.shadows.len(), 2);
    assert_eq!(res.shadows[0].desired.as_ref().map(|state| state.version), Some(1));
    assert_eq!(res.shadows[1], ShadowDocument { device: "dev-2".into(), ..Default::default() });
    Ok(())
}

#[tokio::test]
async fn invalid_requests_are_rejected() -> Result<()> {
    let (server, _tmpdir) = setup().await?;

    let err = server.patch(Request::new(PatchRequest { shadow: None })).await.err().context("expected missing shadow to fail")?;
    assert_eq!(err.code(), Code::InvalidArgument);
    let err = server.patch(desired_patch("dev-1", "{not json")).await.err().context("expected invalid JSON to fail")?;
    assert_eq!(err.code(), Code::InvalidArgument);
    let err = server.get(Request::new(GetRequest { devices: vec![] })).await.err().context("expected empty pool to fail")?;
    assert_eq!(err.code(), Code::InvalidArgument);
    let err = server
        .remove(Request::new(RemoveRequest { device: "dev-1".into(), kind: 42, key: "led".into() }))
        .await
        .err()
        .context("expected unknown kind to fail")?;
    assert_eq!(err.code(), Code::InvalidArgument);
    let err = server
        .remove(Request::new(RemoveRequest { device: "dev-1".into(), kind: StateKind::Desired as i32, key: "led".into() }))
        .await
        .err()
        .context("expected absent state to fail")?;
    assert_eq!(err.code(), Code::NotFound);
    Ok(())
}

#[tokio::test]
async fn remove_strips_a_key_of_the_given_kind() -> Result<()> {
    let (server, _tmpdir) = setup().await?;
    server.patch(desired_patch("dev-1", r#"{"led":"on","fan":1}"#)).await?;

    let doc = server
        .remove(Request::new(RemoveRequest { device: "dev-1".into(), kind: StateKind::Desired as i32, key: "fan".into() }))
        .await?
        .into_inner();
    let desired = doc.desired.context("expected desired state")?;
    assert_eq!(serde_json::from_str::<serde_json::Value>(&desired.data)?, serde_json::json!({"led": "on"}));
    Ok(())
}

#[tokio::test]
async fn stream_shadow_syncs_then_follows_changes() -> Result<()> {
    let (server, _tmpdir) = setup().await?;
    server.patch(desired_patch("dev-1", r#"{"led":"on"}"#)).await?;

    let mut stream = server
        .stream_shadow(Request::new(StreamShadowRequest { devices: vec!["dev-1".into()], sync: true }))
        .await?
        .into_inner();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next()).await?.context("stream ended")??;
    assert_eq!(first.desired.map(|state| state.version), Some(1));

    server.patch(desired_patch("dev-1", r#"{"led":"off"}"#)).await?;
    let next = tokio::time::timeout(Duration::from_secs(5), stream.next()).await?.context("stream ended")??;
    let desired = next.desired.context("expected desired state")?;
    assert_eq!((desired.version, desired.data.as_str()), (2, r#"{"led":"off"}"#));
    Ok(())
}
