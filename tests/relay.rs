use bytes::Bytes;
use meshspy::decoder::framing::{encode_frame, ProtoVersion};
use meshspy::mgmtapi::Client;
use meshspy::protobuf::meshtastic_generated as proto;
use meshspy::relay::{self, RelayHandler};
use meshspy::serial::SerialManager;
use prost::Message;
use serde_json::json;
use std::io::{self, Cursor};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn packet(from: u32, portnum: proto::PortNum, payload: Vec<u8>) -> Vec<u8> {
    let env = proto::FromRadio {
        id: 0,
        payload_variant: Some(proto::from_radio::PayloadVariant::Packet(proto::MeshPacket {
            from,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: portnum as i32,
                payload: Bytes::from(payload),
                ..Default::default()
            })),
            ..Default::default()
        })),
    };
    encode_frame(ProtoVersion::Latest, &env.encode_to_vec()).unwrap()
}

async fn relay_stream(client: Client, stream: Vec<u8>) {
    let manager = SerialManager::with_transport(
        "mock0",
        115200,
        ProtoVersion::Latest,
        Box::new(Cursor::new(stream)),
        Box::new(io::sink()),
    );
    let (mut handler, rx) = RelayHandler::channel();
    let relay_task = tokio::spawn(relay::run(client, rx));
    tokio::task::spawn_blocking(move || manager.read_loop(&mut handler))
        .await
        .unwrap()
        .unwrap();
    relay_task.await.unwrap();
}

#[tokio::test]
async fn serial_messages_reach_management_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/telemetry"))
        .and(body_json(json!({"time": 42})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/alerts"))
        .and(body_json(json!({"text": "smoke"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/nodes"))
        .and(body_json(json!({"id": "!0000beef", "name": "Hilltop", "address": "HT"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let telemetry = proto::Telemetry {
        time: 42,
        variant: None,
    };
    let user = proto::User {
        id: "!0000beef".into(),
        long_name: "Hilltop".into(),
        short_name: "HT".into(),
        ..Default::default()
    };
    let mut stream = packet(1, proto::PortNum::TelemetryApp, telemetry.encode_to_vec());
    stream.extend(packet(1, proto::PortNum::AlertApp, b"smoke".to_vec()));
    stream.extend(packet(0xbeef, proto::PortNum::NodeinfoApp, user.encode_to_vec()));
    // Text is only logged
    stream.extend(packet(1, proto::PortNum::TextMessageApp, b"hello".to_vec()));

    let client = Client::new(&server.uri()).unwrap();
    relay_stream(client.clone(), stream).await;
    assert!(client.is_connected());
}

#[tokio::test]
async fn upload_failures_do_not_stop_relaying() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/alerts"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let mut stream = packet(1, proto::PortNum::AlertApp, b"first".to_vec());
    stream.extend(packet(1, proto::PortNum::AlertApp, b"second".to_vec()));

    let client = Client::new(&server.uri()).unwrap();
    relay_stream(client.clone(), stream).await;
    assert!(!client.is_connected());
}
