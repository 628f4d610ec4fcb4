use std::time::Duration;

use anyhow::Result;

use crate::bus::Bus;

fn bus(capacity: usize) -> Bus<u32> {
    Bus::new(capacity, Duration::from_millis(20))
}

#[tokio::test]
async fn publish_reaches_every_subscriber_of_any_topic_once() -> Result<()> {
    let bus = bus(10);
    let (_a, mut rx_a) = bus.sub(&["incoming", "incoming/dev-1"]);
    let (_b, mut rx_b) = bus.sub(&["incoming/dev-2"]);
    let (_c, mut rx_c) = bus.sub(&["outgoing"]);

    let delivered = bus.publish(7, &["incoming", "incoming/dev-1"]).await;

    assert_eq!(delivered, 1, "expected a single delivery to the deduplicated subscriber");
    assert_eq!(rx_a.try_recv().ok(), Some(7));
    assert!(rx_a.try_recv().is_err(), "expected no duplicate delivery");
    assert!(rx_b.try_recv().is_err());
    assert!(rx_c.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn add_sub_extends_topics() -> Result<()> {
    let bus = bus(10);
    let (guard, mut rx) = bus.sub(&["a"]);
    bus.add_sub(&guard, &["b"])?;

    bus.publish(1, &["b"]).await;

    assert_eq!(rx.recv().await, Some(1));
    Ok(())
}

#[tokio::test]
async fn unsub_from_last_topic_closes_the_channel() -> Result<()> {
    let bus = bus(10);
    let (guard, mut rx) = bus.sub(&["a", "b"]);

    bus.unsub(&guard, &["a"]);
    assert!(bus.is_subscribed(&guard));
    bus.publish(1, &["b"]).await;
    bus.unsub(&guard, &["b"]);

    assert!(!bus.is_subscribed(&guard));
    assert_eq!(rx.recv().await, Some(1), "expected buffered messages to drain");
    assert_eq!(rx.recv().await, None, "expected the channel to be closed");
    assert!(bus.add_sub(&guard, &["a"]).is_err(), "expected a closed subscription not to be reusable");
    Ok(())
}

#[tokio::test]
async fn dropping_guard_unsubscribes() -> Result<()> {
    let bus = bus(10);
    let (guard, mut rx) = bus.sub(&["a"]);

    drop(guard);

    assert_eq!(bus.publish(1, &["a"]).await, 0);
    assert_eq!(rx.recv().await, None);
    Ok(())
}

#[tokio::test]
async fn publish_drops_for_slow_subscriber_after_timeout() -> Result<()> {
    let bus = bus(1);
    let (_slow, mut slow_rx) = bus.sub(&["a"]);
    let (_fast, mut fast_rx) = bus.sub(&["a"]);

    assert_eq!(bus.publish(1, &["a"]).await, 2);
    let _ = fast_rx.recv().await;
    let started = std::time::Instant::now();
    let delivered = bus.publish(2, &["a"]).await;

    assert_eq!(delivered, 1, "expected only the subscriber with buffer space to receive");
    assert!(started.elapsed() >= Duration::from_millis(20), "expected publish to wait for the timeout");
    assert_eq!(slow_rx.recv().await, Some(1));
    assert!(slow_rx.try_recv().is_err(), "expected the second message to be dropped for the slow subscriber");
    assert_eq!(fast_rx.recv().await, Some(2));
    Ok(())
}

#[tokio::test]
async fn try_publish_never_waits() -> Result<()> {
    let bus = bus(1);
    let (_guard, mut rx) = bus.sub(&["a"]);

    assert_eq!(bus.try_publish(1, &["a"]), 1);
    assert_eq!(bus.try_publish(2, &["a"]), 0);

    assert_eq!(rx.recv().await, Some(1));
    assert!(rx.try_recv().is_err());
    Ok(())
}
