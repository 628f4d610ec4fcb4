use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use shadow_core::models::{ConnectionState, Shadow, State};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::database::Database;
use crate::shadow::{Persister, ShadowBus, ShadowEvent, StateStore};

struct Fixture {
    store: StateStore,
    bus: ShadowBus,
    _tmpdir: tempfile::TempDir,
}

async fn setup() -> Result<Fixture> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = StateStore::new(&db).await?;
    let bus = ShadowBus::new(config.bus_capacity, config.bus_publish_timeout());
    Ok(Fixture { store, bus, _tmpdir: tmpdir })
}

fn reported(device: &str, data: serde_json::Value, timestamp: i64) -> Shadow {
    Shadow {
        reported: Some(State::new(data, timestamp)),
        ..Shadow::new(device)
    }
}

#[tokio::test]
async fn persister_merges_states_and_touches_modified() -> Result<()> {
    let fx = setup().await?;
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let persister = Persister::new(fx.store.clone(), &fx.bus, Duration::from_secs(60), shutdown_rx);

    persister.handle_event(ShadowEvent::new(reported("dev-1", json!({"temp": 20}), 1))).await;
    persister.handle_event(ShadowEvent::new(reported("dev-1", json!({"hum": 50}), 2))).await;

    let shadow = fx.store.get_shadow("dev-1").await?;
    assert_eq!(shadow.reported, Some(State { version: 2, data: json!({"temp": 20, "hum": 50}), timestamp: 2 }));
    assert!(fx.store.last_modified("dev-1").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn persister_skips_events_stored_by_their_publisher() -> Result<()> {
    let fx = setup().await?;
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let persister = Persister::new(fx.store.clone(), &fx.bus, Duration::from_secs(60), shutdown_rx);

    persister
        .handle_event(ShadowEvent {
            shadow: reported("dev-1", json!({"temp": 20}), 1),
            persisted: true,
        })
        .await;

    assert!(fx.store.get_shadow("dev-1").await?.reported.is_none());
    assert!(fx.store.last_modified("dev-1").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn persister_overwrites_connection_state_with_expiry() -> Result<()> {
    let fx = setup().await?;
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let persister = Persister::new(fx.store.clone(), &fx.bus, Duration::from_millis(50), shutdown_rx);
    let connected = ConnectionState { connected: true, client_id: "c1".into(), timestamp: 1 };
    let disconnected = ConnectionState { connected: false, client_id: "c1".into(), timestamp: 2 };

    for connection in [connected, disconnected.clone()] {
        persister
            .handle_event(ShadowEvent::new(Shadow {
                connection: Some(connection),
                ..Shadow::new("dev-1")
            }))
            .await;
    }

    assert_eq!(fx.store.get_shadow("dev-1").await?.connection, Some(disconnected));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.store.get_shadow("dev-1").await?.connection.is_none(), "expected connection state to expire");
    Ok(())
}

#[tokio::test]
async fn persister_drops_updates_failing_to_merge() -> Result<()> {
    let fx = setup().await?;
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let persister = Persister::new(fx.store.clone(), &fx.bus, Duration::from_secs(60), shutdown_rx);
    fx.store.set("dev-1", shadow_core::models::StateKey::Desired, b"garbage".to_vec(), None).await?;

    persister
        .handle_event(ShadowEvent::new(Shadow {
            desired: Some(State::new(json!({"a": 1}), 1)),
            ..Shadow::new("dev-1")
        }))
        .await;

    assert!(fx.store.last_modified("dev-1").await?.is_none(), "expected the failed update to be dropped");
    Ok(())
}

#[tokio::test]
async fn spawned_persister_consumes_the_bus_until_shutdown() -> Result<()> {
    let fx = setup().await?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = Persister::new(fx.store.clone(), &fx.bus, Duration::from_secs(60), shutdown_rx).spawn();

    let delivered = ShadowEvent::new(reported("dev-1", json!({"temp": 20}), 1)).publish(&fx.bus).await;
    assert_eq!(delivered, 1);
    let mut stored = None;
    for _ in 0..50 {
        stored = fx.store.get_shadow("dev-1").await?.reported;
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), handle).await.context("timeout waiting for persister shutdown")??;

    assert_eq!(stored.map(|state| state.data), Some(json!({"temp": 20})));
    Ok(())
}
