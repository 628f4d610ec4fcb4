//! The MQTT session state machine.
//!
//! A session reads the Connect packet, authenticates the device, acknowledges the connection and
//! then serves packets until the device disconnects, the connection fails, the keep alive expires
//! or the device is disabled in the directory.
//!
//! All writes to the connection go through a single writer task fed by a channel, which is shared
//! by the read loop & the back-channel task delivering desired state to the device.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use shadow_core::directory::{Device, DeviceDirectory};
use shadow_core::models::{ConnectionState, IncomingMessage, Shadow, State};
use shadow_core::{device_topic, BUS_TOPIC_OUTGOING};

use crate::bus::SubscriptionGuard;
use crate::mqtt::codec::{
    self, AckPacket, CodecError, ConnAckPacket, ConnectPacket, ControlPacket, PublishPacket, Qos, SubscribePacket, UnsubscribePacket, LEVEL_V5,
};
use crate::mqtt::Authenticator;
use crate::pipeline::{device_sub_path, TOPIC_INCOMING, TOPIC_REPORTED_DELTA};
use crate::router::Router;
use crate::shadow::{ShadowBus, ShadowEvent, StateStore};
use crate::stream::Broker;
use crate::utils;

const METRIC_ACTIVE_CONNECTIONS: &str = "mqtt_bridge_active_connections_total";
const METRIC_NOT_AN_MQTT_PACKET: &str = "mqtt_bridge_conn_not_an_mqtt_packet_total";
const METRIC_PUBLISHES_RECEIVED: &str = "mqtt_bridge_publishes_received_total";

/// The ConnAck code sent when a connection is refused, at protocol level 5.
const CONNACK_REFUSED_V5: u8 = 0x80;
/// The ConnAck code sent when a connection is refused, below protocol level 5.
const CONNACK_REFUSED: u8 = 0x03;
/// The SubAck code granting QoS 0.
const SUBACK_GRANTED_QOS0: u8 = 0x00;
/// The SubAck code refusing a subscription.
const SUBACK_FAILURE: u8 = 0x80;
/// The UnsubAck code of a successful unsubscription.
const UNSUBACK_SUCCESS: u8 = 0x00;
/// The buffer size of a session's outbound packet channel.
const WRITER_BUFFER: usize = 32;

/// The collaborators shared by every session of a listener.
#[derive(Clone)]
pub struct SessionContext {
    pub directory: Arc<dyn DeviceDirectory>,
    pub bus: ShadowBus,
    pub broker: Broker,
    pub store: StateStore,
    pub router: Arc<Router>,
    max_packet_size: usize,
}

impl SessionContext {
    pub fn new(directory: Arc<dyn DeviceDirectory>, bus: ShadowBus, broker: Broker, store: StateStore, router: Arc<Router>) -> Self {
        metrics::register_gauge!(METRIC_ACTIVE_CONNECTIONS, metrics::Unit::Count, "the number of active device connections");
        metrics::register_counter!(
            METRIC_NOT_AN_MQTT_PACKET,
            metrics::Unit::Count,
            "the number of connections closed because the first packet is not an MQTT Connect packet or is malformed"
        );
        metrics::register_counter!(METRIC_PUBLISHES_RECEIVED, metrics::Unit::Count, "the number of publishes received from devices");
        Self {
            directory,
            bus,
            broker,
            store,
            router,
            max_packet_size: codec::DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Set the largest packet accepted from an authenticated device.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }
}

/// An authenticated device session.
pub struct Session<S> {
    ctx: SessionContext,
    device: Device,
    client_id: String,
    protocol_level: u8,
    keep_alive: Option<Duration>,
    reader: ReadHalf<S>,
    outbound: mpsc::Sender<ControlPacket>,
    writer: JoinHandle<()>,
    back_channel: BackChannel,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Serve a fresh connection until it is closed.
    ///
    /// Refused connections get a best effort ConnAck without any detail on the refusal, and are
    /// then closed. Returns once the connection has been closed.
    #[tracing::instrument(level = "debug", skip(ctx, stream, auth))]
    pub async fn handle<A: Authenticator>(ctx: SessionContext, mut stream: S, auth: &A) {
        let connect = match codec::read_connect(&mut stream).await {
            Ok(connect) => connect,
            Err(CodecError::Closed) => return,
            Err(err) => {
                metrics::increment_counter!(METRIC_NOT_AN_MQTT_PACKET);
                tracing::warn!(error = ?err, "error reading connect packet, closing connection");
                refuse(&mut stream, 4).await;
                return;
            }
        };
        let device = match auth.authenticate(ctx.directory.as_ref(), &connect).await {
            Ok(device) => device,
            Err(err) => {
                tracing::warn!(error = ?err, client = %connect.client_id, "device authentication failed, closing connection");
                refuse(&mut stream, connect.protocol_level).await;
                return;
            }
        };

        let session = Session::start(ctx, stream, connect, device).await;
        session.run().await;
    }

    /// Acknowledge the connection & start the writer task.
    async fn start(ctx: SessionContext, stream: S, connect: ConnectPacket, device: Device) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(WRITER_BUFFER);
        let writer = tokio::spawn(run_writer(writer, outbound_rx, connect.protocol_level));

        let (client_id, assigned_client_id) = if connect.client_id.is_empty() {
            (device.id.clone(), Some(device.id.clone()))
        } else {
            (connect.client_id.clone(), None)
        };
        let connack = ConnAckPacket {
            session_present: false,
            code: 0,
            assigned_client_id,
        };
        let back_channel = BackChannel::open(&ctx.bus, &device.id, outbound.clone());
        let _ = outbound.send(ControlPacket::ConnAck(connack)).await;
        tracing::info!(device = %device.id, client = %client_id, level = connect.protocol_level, "client connected");

        Self {
            ctx,
            device,
            client_id,
            protocol_level: connect.protocol_level,
            // Clients must send a packet within one and a half keep alive intervals.
            keep_alive: match connect.keep_alive {
                0 => None,
                secs => Some(Duration::from_millis(u64::from(secs) * 1500)),
            },
            reader,
            outbound,
            writer,
            back_channel,
        }
    }

    async fn run(mut self) {
        metrics::increment_gauge!(METRIC_ACTIVE_CONNECTIONS, 1.0);
        self.publish_connection_state(true).await;

        if let Err(err) = self.read_loop().await {
            tracing::warn!(error = ?err, device = %self.device.id, "closing session on error");
        }

        self.publish_connection_state(false).await;
        let Self { back_channel, outbound, writer, .. } = self;
        drop(back_channel);
        drop(outbound);
        // The writer drains what was queued, then closes the connection.
        let _ = writer.await;
        metrics::decrement_gauge!(METRIC_ACTIVE_CONNECTIONS, 1.0);
        tracing::info!("client disconnected");
    }

    /// Serve packets until the session ends, returning an error only for unexpected failures.
    async fn read_loop(&mut self) -> Result<()> {
        loop {
            match self.ctx.directory.get_by_token(&self.device.token).await {
                Ok(device) if device.enabled => (),
                Ok(_) => {
                    tracing::debug!(device = %self.device.id, "device is disabled, disconnecting");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(error = ?err, device = %self.device.id, "can not retrieve device status, disconnecting");
                    return Ok(());
                }
            }

            let read = codec::read_packet_limited(&mut self.reader, self.protocol_level, self.ctx.max_packet_size);
            let res = match self.keep_alive {
                Some(keep_alive) => match tokio::time::timeout(keep_alive, read).await {
                    Ok(res) => res,
                    Err(_) => {
                        tracing::info!(device = %self.device.id, "keep alive expired, disconnecting");
                        return Ok(());
                    }
                },
                None => read.await,
            };
            let packet = match res {
                Ok(packet) => packet,
                Err(CodecError::Closed) => {
                    tracing::info!(client = %self.client_id, "client closed connection");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            match packet {
                ControlPacket::PingReq => self.send(ControlPacket::PingResp).await?,
                ControlPacket::Publish(publish) => self.handle_publish(publish).await?,
                ControlPacket::Subscribe(subscribe) => self.handle_subscribe(subscribe).await?,
                ControlPacket::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await?,
                ControlPacket::Disconnect => {
                    tracing::debug!(client = %self.client_id, "client disconnected gracefully");
                    return Ok(());
                }
                ControlPacket::PubAck(_) => (),
                other => anyhow::bail!("unexpected packet of type {} from client", other.packet_type()),
            }
        }
    }

    /// Forward a device publish to the pipeline, and to the bus when it carries reported state.
    ///
    /// A QoS 1 publish is acknowledged only once it is stored in the pipeline. A failed produce
    /// ends the session without acknowledgement, so the device sends it again.
    async fn handle_publish(&mut self, publish: PublishPacket) -> Result<()> {
        metrics::increment_counter!(METRIC_PUBLISHES_RECEIVED);
        let ack = match (publish.qos, publish.packet_id) {
            (Qos::AtLeastOnce, Some(packet_id)) => Some(ControlPacket::PubAck(packet_id)),
            _ => None,
        };
        let data: Value = match serde_json::from_slice(&publish.payload) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(error = ?err, device = %self.device.id, topic = %publish.topic, "publish payload is not JSON, skipping");
                if let Some(ack) = ack {
                    self.send(ack).await?;
                }
                return Ok(());
            }
        };

        let is_reported = device_sub_path(&publish.topic, &self.device.id)
            .map(|sub_path| self.ctx.router.route(sub_path) == TOPIC_REPORTED_DELTA)
            .unwrap_or(false);
        let msg = IncomingMessage {
            proto_level: self.protocol_level,
            source_topic: publish.topic,
            source_device: self.device.id.clone(),
            data: publish.payload,
        };
        let value = utils::encode_json(&msg)?;
        self.ctx
            .broker
            .produce(TOPIC_INCOMING, None, &self.device.id, value)
            .await
            .context("error forwarding publish to the pipeline")?;
        if let Some(ack) = ack {
            self.send(ack).await?;
        }

        if is_reported {
            let shadow = Shadow {
                reported: Some(State::new(data, utils::now_millis())),
                ..Shadow::new(self.device.id.as_str())
            };
            ShadowEvent::new(shadow).publish(&self.ctx.bus).await;
        }
        Ok(())
    }

    /// Acknowledge a subscription & register its topics with the back-channel.
    async fn handle_subscribe(&mut self, subscribe: SubscribePacket) -> Result<()> {
        let mut codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut topics = Vec::with_capacity(subscribe.subscriptions.len());
        for sub in subscribe.subscriptions.iter() {
            match namespace_topic(&sub.topic, &self.device.id) {
                Some(topic) => {
                    tracing::info!(device = %self.device.id, topic = %topic, "added subscription");
                    codes.push(SUBACK_GRANTED_QOS0);
                    topics.push(topic);
                }
                None => {
                    tracing::debug!(device = %self.device.id, topic = %sub.topic, "refusing subscription outside of a device namespace");
                    codes.push(SUBACK_FAILURE);
                }
            }
        }
        self.send(ControlPacket::SubAck(AckPacket {
            packet_id: subscribe.packet_id,
            codes,
        }))
        .await?;
        if topics.is_empty() {
            return Ok(());
        }

        self.back_channel.add_topics(topics);
        self.push_desired_state().await;
        Ok(())
    }

    /// Remove topics from the back-channel, then acknowledge the unsubscription.
    async fn handle_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> Result<()> {
        let device = self.device.id.as_str();
        self.back_channel
            .remove_topics(unsubscribe.topics.iter().filter_map(|topic| namespace_topic(topic, device)));
        for topic in unsubscribe.topics.iter() {
            tracing::info!(device = %device, topic = %topic, "removed subscription");
        }
        self.send(ControlPacket::UnsubAck(AckPacket {
            packet_id: unsubscribe.packet_id,
            codes: vec![UNSUBACK_SUCCESS; unsubscribe.topics.len()],
        }))
        .await
    }

    /// Deliver the stored desired state of the device to its back-channel.
    async fn push_desired_state(&self) {
        let shadow = match self.ctx.store.get_shadow(&self.device.id).await {
            Ok(shadow) => shadow,
            Err(err) => {
                tracing::warn!(error = ?err, device = %self.device.id, "error fetching desired state for new subscription");
                return;
            }
        };
        if shadow.desired.is_none() {
            return;
        }
        let event = ShadowEvent {
            shadow: Shadow {
                desired: shadow.desired,
                ..Shadow::new(self.device.id.as_str())
            },
            persisted: true,
        };
        let topic = device_topic(BUS_TOPIC_OUTGOING, &self.device.id);
        self.ctx.bus.publish(event, &[topic.as_str()]).await;
    }

    async fn publish_connection_state(&self, connected: bool) {
        let shadow = Shadow {
            connection: Some(ConnectionState {
                connected,
                client_id: self.client_id.clone(),
                timestamp: utils::now_millis(),
            }),
            ..Shadow::new(self.device.id.as_str())
        };
        ShadowEvent::new(shadow).publish(&self.ctx.bus).await;
    }

    async fn send(&self, packet: ControlPacket) -> Result<()> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| anyhow::anyhow!("connection writer has shutdown"))
    }
}

/// The back-channel of a session, delivering desired state changes of the device.
///
/// It is opened with the session and delivers nothing until a topic is subscribed. Dropping it
/// removes its bus subscription & stops its delivery task.
struct BackChannel {
    _guard: SubscriptionGuard<ShadowEvent>,
    topics: watch::Sender<BTreeSet<String>>,
    task: JoinHandle<()>,
}

impl BackChannel {
    fn open(bus: &ShadowBus, device: &str, outbound: mpsc::Sender<ControlPacket>) -> Self {
        let (guard, events) = bus.sub(&[device_topic(BUS_TOPIC_OUTGOING, device).as_str()]);
        let (topics_tx, topics_rx) = watch::channel(BTreeSet::new());
        let task = tokio::spawn(run_back_channel(events, topics_rx, outbound));
        Self {
            _guard: guard,
            topics: topics_tx,
            task,
        }
    }

    fn add_topics(&mut self, topics: Vec<String>) {
        self.topics.send_modify(|current| current.extend(topics));
    }

    fn remove_topics(&mut self, topics: impl Iterator<Item = String>) {
        self.topics.send_modify(|current| {
            for topic in topics {
                current.remove(&topic);
            }
        });
    }
}

impl Drop for BackChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Deliver the desired state of every bus event to every subscribed topic.
///
/// Events without desired state, and desired states older than the last one delivered, are skipped.
/// Events arriving while no topic is subscribed are dropped.
async fn run_back_channel(mut events: mpsc::Receiver<ShadowEvent>, topics: watch::Receiver<BTreeSet<String>>, outbound: mpsc::Sender<ControlPacket>) {
    let mut last_timestamp = 0;
    while let Some(event) = events.recv().await {
        if topics.borrow().is_empty() {
            continue;
        }
        let desired = match event.shadow.desired {
            Some(desired) => desired,
            None => {
                tracing::trace!(device = %event.shadow.device, "skipping event without desired state");
                continue;
            }
        };
        if desired.timestamp < last_timestamp {
            tracing::debug!(device = %event.shadow.device, "skipping stale desired state");
            continue;
        }
        last_timestamp = desired.timestamp;
        let payload = match serde_json::to_vec(&desired.data) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = ?err, "error encoding desired state");
                continue;
            }
        };
        let targets: Vec<String> = topics.borrow().iter().cloned().collect();
        for topic in targets {
            let publish = ControlPacket::Publish(PublishPacket::new(topic, payload.clone()));
            if outbound.send(publish).await.is_err() {
                return;
            }
        }
    }
}

/// Write every queued packet to the connection, closing it once the queue is closed.
async fn run_writer<S: AsyncWrite>(mut writer: WriteHalf<S>, mut packets: mpsc::Receiver<ControlPacket>, protocol_level: u8) {
    while let Some(packet) = packets.recv().await {
        if let Err(err) = codec::write_packet(&mut writer, &packet, protocol_level).await {
            tracing::warn!(error = ?err, packet_type = packet.packet_type(), "error writing packet, closing connection");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Send a best effort refusal ConnAck & close the connection.
async fn refuse<S: AsyncWrite + Unpin>(stream: &mut S, protocol_level: u8) {
    let code = if protocol_level >= LEVEL_V5 { CONNACK_REFUSED_V5 } else { CONNACK_REFUSED };
    let connack = ControlPacket::ConnAck(ConnAckPacket {
        session_present: false,
        code,
        assigned_client_id: None,
    });
    if let Err(err) = codec::write_packet(stream, &connack, protocol_level).await {
        tracing::debug!(error = ?err, "error writing refusal connack");
    }
    let _ = stream.shutdown().await;
}

/// Rewrite a subscription topic into the namespace of the given device.
///
/// The second segment of the topic, after an optional leading slash, is replaced by the device ID.
/// Returns `None` for topics with fewer than two segments.
pub fn namespace_topic(topic: &str, device: &str) -> Option<String> {
    let (slash, rest) = match topic.strip_prefix('/') {
        Some(rest) => ("/", rest),
        None => ("", topic),
    };
    let mut segments: Vec<&str> = rest.split('/').collect();
    if segments.len() < 2 || segments[0].is_empty() {
        return None;
    }
    segments[1] = device;
    Some(format!("{}{}", slash, segments.join("/")))
}
