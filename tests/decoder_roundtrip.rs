use bytes::Bytes;
use meshspy::decoder::framing::{encode_frame, FrameError, ProtoVersion};
use meshspy::decoder::{self, DecodeError, DecodedMessage, MessageKind};
use meshspy::protobuf::meshtastic_generated as proto;
use prost::Message;

fn envelope(portnum: proto::PortNum, payload: Vec<u8>) -> Vec<u8> {
    let packet = proto::MeshPacket {
        from: 0x0a0b0c0d,
        to: 0xFFFF_FFFF,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: portnum as i32,
            payload: Bytes::from(payload),
            ..Default::default()
        })),
        ..Default::default()
    };
    proto::FromRadio {
        id: 1,
        payload_variant: Some(proto::from_radio::PayloadVariant::Packet(packet)),
    }
    .encode_to_vec()
}

#[test]
fn text_decodes_bare_and_legacy_framed() {
    let raw = envelope(proto::PortNum::TextMessageApp, b"hello".to_vec());
    assert_eq!(decoder::decode_text(&raw, "latest").unwrap(), "hello");

    let framed = encode_frame(ProtoVersion::Latest, &raw).unwrap();
    assert_eq!(&framed[..2], &[0x94, 0xC3]);
    assert_eq!(
        decoder::decode_text(&framed, "").unwrap(),
        decoder::decode_text(&raw, "latest").unwrap()
    );
}

#[test]
fn v21_header_decodes_like_legacy() {
    let raw = envelope(proto::PortNum::TextMessageApp, b"hello".to_vec());
    let legacy = encode_frame(ProtoVersion::Latest, &raw).unwrap();
    let v21 = encode_frame(ProtoVersion::V2_1, &raw).unwrap();
    assert_eq!(&v21[..2], &[0x44, 0x03]);
    assert_eq!(
        decoder::decode(&v21, "2.1").unwrap(),
        decoder::decode(&legacy, "latest").unwrap()
    );
}

#[test]
fn telemetry_time_survives_pipeline() {
    let telemetry = proto::Telemetry {
        time: 12345,
        variant: Some(proto::telemetry::Variant::EnvironmentMetrics(
            proto::EnvironmentMetrics {
                temperature: Some(21.5),
                ..Default::default()
            },
        )),
    };
    let raw = envelope(proto::PortNum::TelemetryApp, telemetry.encode_to_vec());
    let framed = encode_frame(ProtoVersion::V2_1, &raw).unwrap();
    let decoded = decoder::decode_telemetry(&framed, "2.1").unwrap();
    assert_eq!(decoded.time, 12345);
    assert_eq!(decoded, telemetry);
}

#[test]
fn waypoint_and_admin_round_trip() {
    let waypoint = proto::Waypoint {
        id: 7,
        latitude_i: Some(473_977_000),
        longitude_i: Some(85_391_000),
        name: "trailhead".into(),
        ..Default::default()
    };
    let raw = envelope(proto::PortNum::WaypointApp, waypoint.encode_to_vec());
    let framed = encode_frame(ProtoVersion::Latest, &raw).unwrap();
    assert_eq!(decoder::decode_waypoint(&framed, "latest").unwrap(), waypoint);

    let admin = vec![0x01, 0x02, 0xFE];
    let raw = envelope(proto::PortNum::AdminApp, admin.clone());
    assert_eq!(
        decoder::decode_admin(&raw, "").unwrap(),
        Bytes::from(admin)
    );
}

#[test]
fn alert_decodes_through_unified_entry_point() {
    let raw = envelope(proto::PortNum::AlertApp, b"flood warning".to_vec());
    match decoder::decode(&raw, "latest").unwrap() {
        DecodedMessage::Alert(text) => assert_eq!(text, "flood warning"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn truncated_frame_never_returns_partial_data() {
    let raw = envelope(proto::PortNum::TextMessageApp, b"hello world".to_vec());
    let framed = encode_frame(ProtoVersion::Latest, &raw).unwrap();
    for cut in 4..framed.len() {
        let err = decoder::decode(&framed[..cut], "latest").unwrap_err();
        assert!(
            matches!(err, DecodeError::Frame(FrameError::Incomplete { .. })),
            "cut at {} gave {:?}",
            cut,
            err
        );
    }
}

#[test]
fn unknown_version_rejected_by_every_entry_point() {
    let raw = envelope(proto::PortNum::TextMessageApp, b"hello".to_vec());
    let tag = "3.0";
    let unsupported = |e: DecodeError| matches!(e, DecodeError::UnsupportedVersion(_));
    assert!(unsupported(decoder::decode(&raw, tag).unwrap_err()));
    assert!(unsupported(
        decoder::decode_as(MessageKind::Text, &raw, tag).unwrap_err()
    ));
    assert!(unsupported(decoder::decode_text(&raw, tag).unwrap_err()));
    assert!(unsupported(decoder::decode_alert(&raw, tag).unwrap_err()));
    assert!(unsupported(decoder::decode_telemetry(&raw, tag).unwrap_err()));
    assert!(unsupported(decoder::decode_waypoint(&raw, tag).unwrap_err()));
    assert!(unsupported(decoder::decode_admin(&raw, tag).unwrap_err()));
    assert!(unsupported(decoder::decode_node_info(&raw, tag).unwrap_err()));
    assert!(unsupported(decoder::decode_my_info(&raw, tag).unwrap_err()));
}

#[test]
fn telemetry_request_on_waypoint_port_is_a_mismatch() {
    let waypoint = proto::Waypoint {
        id: 3,
        ..Default::default()
    };
    let raw = envelope(proto::PortNum::WaypointApp, waypoint.encode_to_vec());
    let err = decoder::decode_telemetry(&raw, "latest").unwrap_err();
    assert!(matches!(
        err,
        DecodeError::KindMismatch {
            expected: MessageKind::Telemetry,
            ..
        }
    ));
}
