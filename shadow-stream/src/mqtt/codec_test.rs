use anyhow::Result;

use crate::mqtt::codec::*;

/// Frame the given body behind a fixed header byte.
fn frame(first: u8, body: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![first];
    out.extend(encode_remaining_length(body.len())?);
    out.extend_from_slice(body);
    Ok(out)
}

/// The variable header of an MQTT 3.1.1 Connect packet, up to the client ID.
fn connect_header() -> Vec<u8> {
    vec![0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3c]
}

#[tokio::test]
async fn connect_round_trips_credentials_and_keep_alive() -> Result<()> {
    let connect = ConnectPacket {
        keep_alive: 30,
        client_id: "client-1".into(),
        username: Some("thermostat".into()),
        password: Some(b"AQID".to_vec()),
        ..Default::default()
    };
    let bytes = encode(&ControlPacket::Connect(connect.clone()), LEVEL_UNKNOWN)?;

    let decoded = read_connect(&mut bytes.as_slice()).await?;

    assert_eq!(decoded, connect);
    Ok(())
}

#[tokio::test]
async fn connect_v5_properties_are_decoded_and_unknown_ones_skipped() -> Result<()> {
    let mut body = vec![0x00, 0x04, b'M', b'Q', b'T', b'T', LEVEL_V5, 0x02, 0x00, 0x3c];
    let props: Vec<u8> = vec![
        0x21, 0x00, 0x0a, // receive maximum
        0x27, 0x00, 0x00, 0x10, 0x00, // maximum packet size
        0x11, 0x00, 0x00, 0x00, 0x3c, // session expiry interval
        0x22, 0x00, 0x05, // topic alias maximum
        0x19, 0x01, // request response information
        0x26, 0x00, 0x01, b'k', 0x00, 0x01, b'v', // user property, unknown to the decoder
        0x17, 0x00, // request problem information, hidden behind the unknown property
    ];
    body.push(props.len() as u8);
    body.extend(props);
    body.extend([0x00, 0x02, b'c', b'1']);
    let bytes = frame(0x10, &body)?;

    let connect = read_connect(&mut bytes.as_slice()).await?;

    assert_eq!(connect.protocol_level, LEVEL_V5);
    assert_eq!(connect.keep_alive, 60);
    assert_eq!(connect.client_id, "c1");
    assert_eq!(
        connect.properties,
        ConnectProperties {
            session_expiry_interval: Some(60),
            receive_maximum: Some(10),
            maximum_packet_size: Some(4096),
            topic_alias_maximum: Some(5),
            request_response_information: Some(1),
            request_problem_information: None,
        }
    );
    Ok(())
}

#[tokio::test]
async fn connect_accepts_mqisdp_protocol_name() -> Result<()> {
    let mut body = vec![0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p', 0x03, 0x02, 0x00, 0x00];
    body.extend([0x00, 0x01, b'x']);
    let bytes = frame(0x10, &body)?;

    let connect = read_connect(&mut bytes.as_slice()).await?;

    assert_eq!(connect.protocol_name, "MQIsdp");
    assert_eq!(connect.protocol_level, 3);
    Ok(())
}

#[tokio::test]
async fn connect_rejects_single_byte_client_id_length() -> Result<()> {
    // A 1 byte length prefix is read as the high byte of a 2 byte length and overruns the packet.
    let mut body = connect_header();
    body.extend([0x03, b'a', b'b', b'c']);
    let bytes = frame(0x10, &body)?;

    let err = read_connect(&mut bytes.as_slice()).await.unwrap_err();

    assert!(matches!(err, CodecError::Malformed(_)), "unexpected error {:?}", err);
    Ok(())
}

#[tokio::test]
async fn connect_rejects_unknown_protocol_name() -> Result<()> {
    let mut body = connect_header();
    body[2..6].copy_from_slice(b"HTTP");
    body.extend([0x00, 0x00]);
    let bytes = frame(0x10, &body)?;

    let err = read_connect(&mut bytes.as_slice()).await.unwrap_err();

    assert!(matches!(err, CodecError::UnknownProtocol(name) if name == "HTTP"));
    Ok(())
}

#[tokio::test]
async fn first_packet_must_be_connect() -> Result<()> {
    let bytes = encode(&ControlPacket::PingReq, 4)?;

    let err = read_packet(&mut bytes.as_slice(), LEVEL_UNKNOWN).await.unwrap_err();

    assert!(matches!(err, CodecError::ExpectedConnect(PINGREQ)));
    Ok(())
}

#[tokio::test]
async fn remaining_length_over_four_bytes_is_rejected() {
    let bytes: Vec<u8> = vec![0xC0, 0xff, 0xff, 0xff, 0xff, 0x01];

    let err = read_packet(&mut bytes.as_slice(), 4).await.unwrap_err();

    assert!(matches!(err, CodecError::MalformedLength));
}

#[tokio::test]
async fn oversized_packets_are_rejected_before_the_body_is_read() -> Result<()> {
    // A Connect declaring the largest possible remaining length, followed by a single byte.
    let huge_connect: Vec<u8> = vec![0x10, 0xff, 0xff, 0xff, 0x7f, b'x'];
    let err = read_packet(&mut huge_connect.as_slice(), LEVEL_UNKNOWN).await.unwrap_err();
    assert!(matches!(err, CodecError::TooLarge), "got {:?}", err);
    let err = read_connect(&mut huge_connect.as_slice()).await.unwrap_err();
    assert!(matches!(err, CodecError::TooLarge), "got {:?}", err);

    // A fresh connection is capped even when a larger limit is given.
    let big_connect = frame(0x10, &vec![0u8; MAX_CONNECT_SIZE + 1])?;
    let err = read_packet_limited(&mut big_connect.as_slice(), LEVEL_UNKNOWN, usize::MAX).await.unwrap_err();
    assert!(matches!(err, CodecError::TooLarge), "got {:?}", err);

    // Once connected, the given limit applies.
    let publish = encode(&ControlPacket::Publish(PublishPacket::new("t", vec![0u8; 64])), 4)?;
    let err = read_packet_limited(&mut publish.as_slice(), 4, 32).await.unwrap_err();
    assert!(matches!(err, CodecError::TooLarge), "got {:?}", err);
    let packet = read_packet_limited(&mut publish.as_slice(), 4, 128).await?;
    assert!(matches!(packet, ControlPacket::Publish(_)));
    Ok(())
}

#[tokio::test]
async fn stream_end_is_reported_as_close_or_short_read() {
    let empty: Vec<u8> = vec![];
    let err = read_packet(&mut empty.as_slice(), 4).await.unwrap_err();
    assert!(matches!(err, CodecError::Closed));

    // Declares 10 bytes but carries 3.
    let truncated: Vec<u8> = vec![0x30, 0x0a, 0x00, 0x01, b't'];
    let err = read_packet(&mut truncated.as_slice(), 4).await.unwrap_err();
    assert!(matches!(err, CodecError::ShortRead));
}

#[test]
fn remaining_length_uses_seven_bits_per_byte() -> Result<()> {
    assert_eq!(encode_remaining_length(0)?, vec![0x00]);
    assert_eq!(encode_remaining_length(127)?, vec![0x7f]);
    assert_eq!(encode_remaining_length(128)?, vec![0x80, 0x01]);
    assert_eq!(encode_remaining_length(16_383)?, vec![0xff, 0x7f]);
    assert_eq!(encode_remaining_length(16_384)?, vec![0x80, 0x80, 0x01]);
    assert_eq!(encode_remaining_length(268_435_455)?, vec![0xff, 0xff, 0xff, 0x7f]);
    assert!(encode_remaining_length(268_435_456).is_err());
    Ok(())
}

#[tokio::test]
async fn publish_packet_id_only_present_above_qos_zero() -> Result<()> {
    let qos0 = frame(0x30, &[0x00, 0x01, b't', b'{', b'}'])?;
    let qos1 = frame(0x32, &[0x00, 0x01, b't', 0x00, 0x07, b'{', b'}'])?;

    let qos0 = read_packet(&mut qos0.as_slice(), 4).await?;
    let qos1 = read_packet(&mut qos1.as_slice(), 4).await?;

    assert_eq!(
        qos0,
        ControlPacket::Publish(PublishPacket::new("t", b"{}".to_vec())),
    );
    match qos1 {
        ControlPacket::Publish(publish) => {
            assert_eq!(publish.qos, Qos::AtLeastOnce);
            assert_eq!(publish.packet_id, Some(7));
            assert_eq!(publish.payload, b"{}".to_vec());
        }
        other => panic!("expected publish, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn publish_with_both_qos_bits_is_rejected() -> Result<()> {
    let bytes = frame(0x36, &[0x00, 0x01, b't', 0x00, 0x01])?;

    let err = read_packet(&mut bytes.as_slice(), 4).await.unwrap_err();

    assert!(matches!(err, CodecError::ReservedQos));
    Ok(())
}

#[tokio::test]
async fn subscribe_v5_skips_properties() -> Result<()> {
    let body = vec![
        0x00, 0x2a, // packet id
        0x02, 0x0b, 0x01, // properties: subscription identifier
        0x00, 0x03, b'a', b'/', b'b', 0x01, //
        0x00, 0x01, b'c', 0x00,
    ];
    let bytes = frame(0x82, &body)?;

    let packet = read_packet(&mut bytes.as_slice(), LEVEL_V5).await?;

    assert_eq!(
        packet,
        ControlPacket::Subscribe(SubscribePacket {
            packet_id: 42,
            subscriptions: vec![
                Subscription {
                    topic: "a/b".into(),
                    qos: Qos::AtLeastOnce
                },
                Subscription {
                    topic: "c".into(),
                    qos: Qos::AtMostOnce
                },
            ],
        })
    );
    Ok(())
}

#[tokio::test]
async fn subscribe_with_reserved_qos_is_rejected() -> Result<()> {
    let bytes = frame(0x82, &[0x00, 0x01, 0x00, 0x01, b'a', 0x03])?;

    let err = read_packet(&mut bytes.as_slice(), 4).await.unwrap_err();

    assert!(matches!(err, CodecError::ReservedQos));
    Ok(())
}

#[test]
fn connack_carries_assigned_client_id_only_at_v5() -> Result<()> {
    let connack = ControlPacket::ConnAck(ConnAckPacket {
        session_present: true,
        code: 0,
        assigned_client_id: Some("dev".into()),
    });

    let v5 = encode(&connack, LEVEL_V5)?;
    let v4 = encode(&connack, 4)?;

    assert_eq!(v5, vec![0x20, 0x09, 0x00, 0x00, 0x06, 0x12, 0x00, 0x03, b'd', b'e', b'v']);
    assert_eq!(v4, vec![0x20, 0x02, 0x00, 0x00], "expected session present to never be set");
    Ok(())
}

#[tokio::test]
async fn connack_v5_decodes_assigned_client_id() -> Result<()> {
    let connack = ConnAckPacket {
        session_present: false,
        code: 0,
        assigned_client_id: Some("dev".into()),
    };
    let bytes = encode(&ControlPacket::ConnAck(connack.clone()), LEVEL_V5)?;

    let decoded = read_packet(&mut bytes.as_slice(), LEVEL_V5).await?;

    assert_eq!(decoded, ControlPacket::ConnAck(connack));
    Ok(())
}

#[test]
fn acks_emit_properties_byte_only_at_v5() -> Result<()> {
    let suback = ControlPacket::SubAck(AckPacket {
        packet_id: 1,
        codes: vec![0, 0],
    });
    let unsuback = ControlPacket::UnsubAck(AckPacket { packet_id: 2, codes: vec![0] });

    assert_eq!(encode(&suback, 4)?, vec![0x90, 0x04, 0x00, 0x01, 0x00, 0x00]);
    assert_eq!(encode(&suback, LEVEL_V5)?, vec![0x90, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00]);
    assert_eq!(encode(&unsuback, 4)?, vec![0xB0, 0x03, 0x00, 0x02, 0x00]);
    assert_eq!(encode(&unsuback, LEVEL_V5)?, vec![0xB0, 0x04, 0x00, 0x02, 0x00, 0x00]);
    Ok(())
}

#[test]
fn fixed_size_packets_encode_exactly() -> Result<()> {
    assert_eq!(encode(&ControlPacket::PingResp, 4)?, vec![0xD0, 0x00]);
    assert_eq!(encode(&ControlPacket::PubAck(0x0102), 4)?, vec![0x40, 0x02, 0x01, 0x02]);
    Ok(())
}
