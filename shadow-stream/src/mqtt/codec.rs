//! MQTT packet framing.
//!
//! Every packet is a fixed header byte of `(packet type << 4) | flags`, a remaining length of
//! 1-4 bytes with 7 bits of payload each, and exactly `remaining length` bytes of variable header
//! & payload. Decoding covers both directions so that test clients can speak to a session through
//! the same code path the session uses.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const SUBSCRIBE: u8 = 8;
pub const SUBACK: u8 = 9;
pub const UNSUBSCRIBE: u8 = 10;
pub const UNSUBACK: u8 = 11;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

/// The protocol level of MQTT 5.
pub const LEVEL_V5: u8 = 5;
/// The protocol level to pass to `read_packet` on a fresh connection.
pub const LEVEL_UNKNOWN: u8 = 0;

/// The largest value a 4 byte remaining length can hold.
const MAX_REMAINING_LENGTH: usize = 268_435_455;
/// The largest packet accepted before a connection has sent its Connect packet.
pub const MAX_CONNECT_SIZE: usize = 16 * 1024;
/// The largest packet accepted by `read_packet`.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

const PROP_SESSION_EXPIRY_INTERVAL: u8 = 0x11;
const PROP_ASSIGNED_CLIENT_ID: u8 = 0x12;
const PROP_REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
const PROP_REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
const PROP_RECEIVE_MAXIMUM: u8 = 0x21;
const PROP_TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
const PROP_MAXIMUM_PACKET_SIZE: u8 = 0x27;

/// Errors raised while framing MQTT packets. All of them are terminal for a connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer closed the stream cleanly between two packets.
    #[error("connection closed")]
    Closed,
    /// The stream ended before a whole packet arrived.
    #[error("stream ended before the declared packet length was read")]
    ShortRead,
    #[error("remaining length exceeds 4 bytes")]
    MalformedLength,
    #[error("expected a connect packet, got packet type {0}")]
    ExpectedConnect(u8),
    #[error("unknown protocol name {0:?}")]
    UnknownProtocol(String),
    #[error("unsupported protocol level {0}")]
    UnsupportedLevel(u8),
    #[error("reserved QoS bits set")]
    ReservedQos,
    #[error("unsupported packet type {0}")]
    UnsupportedPacketType(u8),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("packet exceeds the maximum packet size")]
    TooLarge,
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => CodecError::ShortRead,
            _ => CodecError::Io(err),
        }
    }
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Quality of service levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Qos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl Qos {
    /// Decode the two QoS bits, both set being reserved.
    pub fn from_bits(bits: u8) -> CodecResult<Self> {
        match bits & 0x03 {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            _ => Err(CodecError::ReservedQos),
        }
    }
}

/// The set of MQTT control packets this node speaks.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlPacket {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(u16),
    Subscribe(SubscribePacket),
    SubAck(AckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(AckPacket),
    PingReq,
    PingResp,
    Disconnect,
}

impl ControlPacket {
    /// The packet type of this packet.
    pub fn packet_type(&self) -> u8 {
        match self {
            ControlPacket::Connect(_) => CONNECT,
            ControlPacket::ConnAck(_) => CONNACK,
            ControlPacket::Publish(_) => PUBLISH,
            ControlPacket::PubAck(_) => PUBACK,
            ControlPacket::Subscribe(_) => SUBSCRIBE,
            ControlPacket::SubAck(_) => SUBACK,
            ControlPacket::Unsubscribe(_) => UNSUBSCRIBE,
            ControlPacket::UnsubAck(_) => UNSUBACK,
            ControlPacket::PingReq => PINGREQ,
            ControlPacket::PingResp => PINGRESP,
            ControlPacket::Disconnect => DISCONNECT,
        }
    }
}

/// Properties of an MQTT 5 Connect packet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub request_response_information: Option<u8>,
    pub request_problem_information: Option<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectPacket {
    /// Either `MQTT` or, for MQTT 3.1 clients, `MQIsdp`.
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_start: bool,
    /// Keep alive interval in seconds, zero disables it.
    pub keep_alive: u16,
    pub properties: ConnectProperties,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Default for ConnectPacket {
    fn default() -> Self {
        Self {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_start: true,
            keep_alive: 0,
            properties: ConnectProperties::default(),
            client_id: String::new(),
            will: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnAckPacket {
    /// Always written as false, sessions are never resumed.
    pub session_present: bool,
    pub code: u8,
    /// The client ID chosen by the server when the client sent none. Only encoded at level 5.
    pub assigned_client_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PublishPacket {
    pub topic: String,
    /// Present only when `qos` is above `AtMostOnce`.
    pub packet_id: Option<u16>,
    pub qos: Qos,
    pub dup: bool,
    pub retain: bool,
    pub payload: Vec<u8>,
}

impl PublishPacket {
    /// A QoS 0 publish of the given payload.
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            packet_id: None,
            qos: Qos::AtMostOnce,
            dup: false,
            retain: false,
            payload,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: Qos,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// A SubAck or UnsubAck, carrying one reason code per entry of the request.
#[derive(Clone, Debug, PartialEq)]
pub struct AckPacket {
    pub packet_id: u16,
    pub codes: Vec<u8>,
}

/// Read the Connect packet opening a fresh connection.
pub async fn read_connect<S: AsyncRead + Unpin>(stream: &mut S) -> CodecResult<ConnectPacket> {
    match read_packet_limited(stream, LEVEL_UNKNOWN, MAX_CONNECT_SIZE).await? {
        ControlPacket::Connect(connect) => Ok(connect),
        other => Err(CodecError::ExpectedConnect(other.packet_type())),
    }
}

/// Read the next packet from the given stream, accepting up to `DEFAULT_MAX_PACKET_SIZE` bytes.
///
/// `protocol_level` is the level negotiated by the connection's Connect packet, or
/// `LEVEL_UNKNOWN` on a fresh connection, in which case anything but a Connect packet is an error.
pub async fn read_packet<S: AsyncRead + Unpin>(stream: &mut S, protocol_level: u8) -> CodecResult<ControlPacket> {
    read_packet_limited(stream, protocol_level, DEFAULT_MAX_PACKET_SIZE).await
}

/// Read the next packet from the given stream, failing with `TooLarge` before any body is read
/// when its remaining length exceeds `max_size`.
///
/// On a fresh connection the limit is further capped to `MAX_CONNECT_SIZE`.
pub async fn read_packet_limited<S: AsyncRead + Unpin>(stream: &mut S, protocol_level: u8, max_size: usize) -> CodecResult<ControlPacket> {
    let mut first = [0u8; 1];
    if stream.read(&mut first).await? == 0 {
        return Err(CodecError::Closed);
    }
    let packet_type = first[0] >> 4;
    let flags = first[0] & 0x0F;
    if protocol_level == LEVEL_UNKNOWN && packet_type != CONNECT {
        return Err(CodecError::ExpectedConnect(packet_type));
    }

    let remaining_len = read_remaining_length(stream).await?;
    let max_size = match protocol_level {
        LEVEL_UNKNOWN => max_size.min(MAX_CONNECT_SIZE),
        _ => max_size,
    };
    if remaining_len > max_size {
        return Err(CodecError::TooLarge);
    }
    let mut body = vec![0u8; remaining_len];
    stream.read_exact(&mut body).await?;
    decode_body(packet_type, flags, &body, protocol_level)
}

/// Decode the variable header & payload of a packet whose fixed header has already been read.
pub fn decode_body(packet_type: u8, flags: u8, body: &[u8], protocol_level: u8) -> CodecResult<ControlPacket> {
    let mut buf = body;
    let v5 = protocol_level == LEVEL_V5;
    let packet = match packet_type {
        CONNECT => ControlPacket::Connect(decode_connect(&mut buf)?),
        CONNACK => ControlPacket::ConnAck(decode_connack(&mut buf, v5)?),
        PUBLISH => ControlPacket::Publish(decode_publish(flags, &mut buf, v5)?),
        PUBACK => ControlPacket::PubAck(get_u16(&mut buf)?),
        SUBSCRIBE => ControlPacket::Subscribe(decode_subscribe(&mut buf, v5)?),
        SUBACK => ControlPacket::SubAck(decode_ack(&mut buf, v5)?),
        UNSUBSCRIBE => ControlPacket::Unsubscribe(decode_unsubscribe(&mut buf, v5)?),
        UNSUBACK => ControlPacket::UnsubAck(decode_ack(&mut buf, v5)?),
        PINGREQ => ControlPacket::PingReq,
        PINGRESP => ControlPacket::PingResp,
        DISCONNECT => ControlPacket::Disconnect,
        other => return Err(CodecError::UnsupportedPacketType(other)),
    };
    Ok(packet)
}

/// Encode and write the given packet to the stream.
pub async fn write_packet<S: AsyncWrite + Unpin>(stream: &mut S, packet: &ControlPacket, protocol_level: u8) -> CodecResult<()> {
    let frame = encode(packet, protocol_level)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Encode the given packet into a complete frame.
pub fn encode(packet: &ControlPacket, protocol_level: u8) -> CodecResult<Vec<u8>> {
    let v5 = protocol_level == LEVEL_V5;
    let mut body = BytesMut::new();
    let flags = match packet {
        ControlPacket::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            0
        }
        ControlPacket::ConnAck(connack) => {
            body.put_u8(0); // Session present is never set.
            body.put_u8(connack.code);
            if v5 {
                let mut props = BytesMut::new();
                if let Some(client_id) = &connack.assigned_client_id {
                    props.put_u8(PROP_ASSIGNED_CLIENT_ID);
                    put_string(&mut props, client_id)?;
                }
                put_properties(&mut body, &props)?;
            }
            0
        }
        ControlPacket::Publish(publish) => {
            put_string(&mut body, &publish.topic)?;
            if publish.qos > Qos::AtMostOnce {
                body.put_u16(publish.packet_id.unwrap_or(0));
            }
            if v5 {
                body.put_u8(0);
            }
            body.put_slice(&publish.payload);
            (u8::from(publish.dup) << 3) | ((publish.qos as u8) << 1) | u8::from(publish.retain)
        }
        ControlPacket::PubAck(packet_id) => {
            body.put_u16(*packet_id);
            0
        }
        ControlPacket::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            if v5 {
                body.put_u8(0);
            }
            for sub in subscribe.subscriptions.iter() {
                put_string(&mut body, &sub.topic)?;
                body.put_u8(sub.qos as u8);
            }
            0x02
        }
        ControlPacket::SubAck(ack) | ControlPacket::UnsubAck(ack) => {
            body.put_u16(ack.packet_id);
            if v5 {
                body.put_u8(0);
            }
            body.put_slice(&ack.codes);
            0
        }
        ControlPacket::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            if v5 {
                body.put_u8(0);
            }
            for topic in unsubscribe.topics.iter() {
                put_string(&mut body, topic)?;
            }
            0x02
        }
        ControlPacket::PingReq | ControlPacket::PingResp | ControlPacket::Disconnect => 0,
    };

    let mut frame = Vec::with_capacity(body.len() + 5);
    frame.push((packet.packet_type() << 4) | flags);
    frame.extend(encode_remaining_length(body.len())?);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode a remaining length, 7 bits per byte with the high bit marking continuation.
pub fn encode_remaining_length(mut len: usize) -> CodecResult<Vec<u8>> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::TooLarge);
    }
    let mut out = Vec::with_capacity(4);
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    Ok(out)
}

async fn read_remaining_length<S: AsyncRead + Unpin>(stream: &mut S) -> CodecResult<usize> {
    let mut value = 0usize;
    for idx in 0..4 {
        let byte = stream.read_u8().await?;
        value += ((byte & 0x7F) as usize) << (7 * idx);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::MalformedLength)
}

fn decode_connect(buf: &mut &[u8]) -> CodecResult<ConnectPacket> {
    let protocol_name = get_string(buf)?;
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(CodecError::UnknownProtocol(protocol_name));
    }
    let protocol_level = get_u8(buf)?;
    if !(3..=LEVEL_V5).contains(&protocol_level) {
        return Err(CodecError::UnsupportedLevel(protocol_level));
    }
    let flags = get_u8(buf)?;
    if flags & 0x01 != 0 {
        return Err(CodecError::Malformed("reserved connect flag set"));
    }
    let keep_alive = get_u16(buf)?;
    let properties = if protocol_level == LEVEL_V5 {
        decode_connect_properties(buf)?
    } else {
        ConnectProperties::default()
    };

    // The client ID is a regular string, so always carries a 2 byte length.
    let client_id = get_string(buf)?;

    let will = if flags & 0x04 != 0 {
        if protocol_level == LEVEL_V5 {
            skip_properties(buf)?;
        }
        let topic = get_string(buf)?;
        let payload = get_binary(buf)?;
        Some(Will {
            topic,
            payload,
            qos: Qos::from_bits(flags >> 3)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        if flags & 0x38 != 0 {
            return Err(CodecError::Malformed("will qos or retain set without a will"));
        }
        None
    };
    let username = if flags & 0x80 != 0 { Some(get_string(buf)?) } else { None };
    let password = if flags & 0x40 != 0 { Some(get_binary(buf)?) } else { None };

    Ok(ConnectPacket {
        protocol_name,
        protocol_level,
        clean_start: flags & 0x02 != 0,
        keep_alive,
        properties,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_connect_properties(buf: &mut &[u8]) -> CodecResult<ConnectProperties> {
    let len = get_varint(buf)?;
    if buf.remaining() < len {
        return Err(CodecError::Malformed("properties exceed packet"));
    }
    let all: &[u8] = buf;
    let (mut props_buf, rest) = all.split_at(len);
    *buf = rest;

    let mut props = ConnectProperties::default();
    while props_buf.has_remaining() {
        match get_u8(&mut props_buf)? {
            PROP_SESSION_EXPIRY_INTERVAL => props.session_expiry_interval = Some(get_u32(&mut props_buf)?),
            PROP_RECEIVE_MAXIMUM => props.receive_maximum = Some(get_u16(&mut props_buf)?),
            PROP_MAXIMUM_PACKET_SIZE => props.maximum_packet_size = Some(get_u32(&mut props_buf)?),
            PROP_TOPIC_ALIAS_MAXIMUM => props.topic_alias_maximum = Some(get_u16(&mut props_buf)?),
            PROP_REQUEST_RESPONSE_INFORMATION => props.request_response_information = Some(get_u8(&mut props_buf)?),
            PROP_REQUEST_PROBLEM_INFORMATION => props.request_problem_information = Some(get_u8(&mut props_buf)?),
            // The width of an unknown property is unknown, so the rest of the block is skipped.
            _ => break,
        }
    }
    Ok(props)
}

fn decode_connack(buf: &mut &[u8], v5: bool) -> CodecResult<ConnAckPacket> {
    let session_present = get_u8(buf)? & 0x01 != 0;
    let code = get_u8(buf)?;
    let mut assigned_client_id = None;
    if v5 && buf.has_remaining() {
        let len = get_varint(buf)?;
        if buf.remaining() < len {
            return Err(CodecError::Malformed("properties exceed packet"));
        }
        let all: &[u8] = buf;
        let (mut props, rest) = all.split_at(len);
        if props.has_remaining() && get_u8(&mut props)? == PROP_ASSIGNED_CLIENT_ID {
            assigned_client_id = Some(get_string(&mut props)?);
        }
        *buf = rest;
    }
    Ok(ConnAckPacket {
        session_present,
        code,
        assigned_client_id,
    })
}

fn decode_publish(flags: u8, buf: &mut &[u8], v5: bool) -> CodecResult<PublishPacket> {
    let qos = Qos::from_bits(flags >> 1)?;
    let topic = get_string(buf)?;
    let packet_id = match qos {
        Qos::AtMostOnce => None,
        _ => Some(get_u16(buf)?),
    };
    if v5 {
        skip_properties(buf)?;
    }
    Ok(PublishPacket {
        topic,
        packet_id,
        qos,
        dup: flags & 0x08 != 0,
        retain: flags & 0x01 != 0,
        payload: buf.to_vec(),
    })
}

fn decode_subscribe(buf: &mut &[u8], v5: bool) -> CodecResult<SubscribePacket> {
    let packet_id = get_u16(buf)?;
    if v5 {
        skip_properties(buf)?;
    }
    let mut subscriptions = Vec::new();
    while buf.has_remaining() {
        let topic = get_string(buf)?;
        let qos = Qos::from_bits(get_u8(buf)?)?;
        subscriptions.push(Subscription { topic, qos });
    }
    if subscriptions.is_empty() {
        return Err(CodecError::Malformed("subscribe without topic filters"));
    }
    Ok(SubscribePacket { packet_id, subscriptions })
}

fn decode_unsubscribe(buf: &mut &[u8], v5: bool) -> CodecResult<UnsubscribePacket> {
    let packet_id = get_u16(buf)?;
    if v5 {
        skip_properties(buf)?;
    }
    let mut topics = Vec::new();
    while buf.has_remaining() {
        topics.push(get_string(buf)?);
    }
    if topics.is_empty() {
        return Err(CodecError::Malformed("unsubscribe without topic filters"));
    }
    Ok(UnsubscribePacket { packet_id, topics })
}

fn decode_ack(buf: &mut &[u8], v5: bool) -> CodecResult<AckPacket> {
    let packet_id = get_u16(buf)?;
    if v5 {
        skip_properties(buf)?;
    }
    Ok(AckPacket {
        packet_id,
        codes: buf.to_vec(),
    })
}

fn encode_connect(connect: &ConnectPacket, body: &mut BytesMut) -> CodecResult<()> {
    put_string(body, &connect.protocol_name)?;
    body.put_u8(connect.protocol_level);
    let mut flags = 0u8;
    if connect.clean_start {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    if connect.protocol_level == LEVEL_V5 {
        let mut props = BytesMut::new();
        let p = &connect.properties;
        if let Some(val) = p.session_expiry_interval {
            props.put_u8(PROP_SESSION_EXPIRY_INTERVAL);
            props.put_u32(val);
        }
        if let Some(val) = p.receive_maximum {
            props.put_u8(PROP_RECEIVE_MAXIMUM);
            props.put_u16(val);
        }
        if let Some(val) = p.maximum_packet_size {
            props.put_u8(PROP_MAXIMUM_PACKET_SIZE);
            props.put_u32(val);
        }
        if let Some(val) = p.topic_alias_maximum {
            props.put_u8(PROP_TOPIC_ALIAS_MAXIMUM);
            props.put_u16(val);
        }
        if let Some(val) = p.request_response_information {
            props.put_u8(PROP_REQUEST_RESPONSE_INFORMATION);
            props.put_u8(val);
        }
        if let Some(val) = p.request_problem_information {
            props.put_u8(PROP_REQUEST_PROBLEM_INFORMATION);
            props.put_u8(val);
        }
        put_properties(body, &props)?;
    }
    put_string(body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        if connect.protocol_level == LEVEL_V5 {
            body.put_u8(0);
        }
        put_string(body, &will.topic)?;
        put_binary(body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        put_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        put_binary(body, password)?;
    }
    Ok(())
}

fn skip_properties(buf: &mut &[u8]) -> CodecResult<()> {
    let len = get_varint(buf)?;
    if buf.remaining() < len {
        return Err(CodecError::Malformed("properties exceed packet"));
    }
    buf.advance(len);
    Ok(())
}

fn put_properties(body: &mut BytesMut, props: &[u8]) -> CodecResult<()> {
    body.put_slice(&encode_remaining_length(props.len())?);
    body.put_slice(props);
    Ok(())
}

fn put_string(body: &mut BytesMut, val: &str) -> CodecResult<()> {
    put_binary(body, val.as_bytes())
}

fn put_binary(body: &mut BytesMut, val: &[u8]) -> CodecResult<()> {
    let len = u16::try_from(val.len()).map_err(|_| CodecError::TooLarge)?;
    body.put_u16(len);
    body.put_slice(val);
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> CodecResult<u8> {
    if buf.remaining() < 1 {
        return Err(CodecError::Malformed("unexpected end of packet"));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> CodecResult<u16> {
    if buf.remaining() < 2 {
        return Err(CodecError::Malformed("unexpected end of packet"));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> CodecResult<u32> {
    if buf.remaining() < 4 {
        return Err(CodecError::Malformed("unexpected end of packet"));
    }
    Ok(buf.get_u32())
}

fn get_binary(buf: &mut &[u8]) -> CodecResult<Vec<u8>> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Malformed("length prefix exceeds packet"));
    }
    let val = buf[..len].to_vec();
    buf.advance(len);
    Ok(val)
}

fn get_string(buf: &mut &[u8]) -> CodecResult<String> {
    String::from_utf8(get_binary(buf)?).map_err(|_| CodecError::Malformed("invalid utf-8 string"))
}

/// Decode a variable byte integer as used by property lengths.
fn get_varint(buf: &mut &[u8]) -> CodecResult<usize> {
    let mut value = 0usize;
    for idx in 0..4 {
        let byte = get_u8(buf)?;
        value += ((byte & 0x7F) as usize) << (7 * idx);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::MalformedLength)
}
