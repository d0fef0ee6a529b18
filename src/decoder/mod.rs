//! # Frame Decoder
//!
//! Turns a byte buffer read from the device into one typed application message.
//!
//! Decoding is a two-step pipeline:
//!
//! 1. [`framing::deframe`] strips a `0x94 0xC3` / `0x44 0x03` length header when present
//!    (bare payloads pass through untouched).
//! 2. The payload is parsed as a `FromRadio` envelope and the embedded content is mapped to
//!    a [`DecodedMessage`] variant, using the `Data.portnum` of mesh packets as the
//!    discriminant.
//!
//! ```rust,no_run
//! use meshspy::decoder::{decode, DecodedMessage};
//!
//! # fn demo(frame: &[u8]) -> Result<(), meshspy::decoder::DecodeError> {
//! match decode(frame, "latest")? {
//!     DecodedMessage::Text(text) => println!("text: {}", text),
//!     other => println!("{}", other.summary()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Decoding is all-or-nothing: every failure is a [`DecodeError`] and no partially
//! populated message is ever returned.

pub mod framing;

use crate::protobuf::meshtastic_generated as proto;
use bytes::Bytes;
use framing::{FrameError, ProtoVersion, UnsupportedVersion};
use prost::Message;
use std::fmt;
use thiserror::Error;

/// Application message kinds the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Telemetry,
    Waypoint,
    Admin,
    Alert,
    NodeInfo,
    MyNodeInfo,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Telemetry => "telemetry",
            MessageKind::Waypoint => "waypoint",
            MessageKind::Admin => "admin",
            MessageKind::Alert => "alert",
            MessageKind::NodeInfo => "node-info",
            MessageKind::MyNodeInfo => "my-node-info",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded application message.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Text(String),
    Telemetry(proto::Telemetry),
    Waypoint(proto::Waypoint),
    /// Opaque admin payload, passed on unmodified.
    Admin(Bytes),
    Alert(String),
    NodeInfo(proto::NodeInfo),
    MyNodeInfo(proto::MyNodeInfo),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    UnsupportedVersion(#[from] UnsupportedVersion),
    #[error("failed to parse {what}: {source}")]
    Schema {
        what: &'static str,
        #[source]
        source: prost::DecodeError,
    },
    #[error("expected {expected} message, found {found}")]
    KindMismatch {
        expected: MessageKind,
        found: String,
    },
    #[error("envelope carries no application message ({0})")]
    NoMessage(String),
}

fn schema(what: &'static str) -> impl FnOnce(prost::DecodeError) -> DecodeError {
    move |source| DecodeError::Schema { what, source }
}

impl DecodedMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            DecodedMessage::Text(_) => MessageKind::Text,
            DecodedMessage::Telemetry(_) => MessageKind::Telemetry,
            DecodedMessage::Waypoint(_) => MessageKind::Waypoint,
            DecodedMessage::Admin(_) => MessageKind::Admin,
            DecodedMessage::Alert(_) => MessageKind::Alert,
            DecodedMessage::NodeInfo(_) => MessageKind::NodeInfo,
            DecodedMessage::MyNodeInfo(_) => MessageKind::MyNodeInfo,
        }
    }

    /// Single-line description for logs and bridged transports. User text is not escaped here.
    pub fn summary(&self) -> String {
        match self {
            DecodedMessage::Text(text) => format!("text {}", text),
            DecodedMessage::Alert(text) => format!("alert {}", text),
            DecodedMessage::Admin(payload) => format!("admin {} bytes", payload.len()),
            DecodedMessage::Telemetry(t) => summarize_telemetry(t),
            DecodedMessage::Waypoint(wp) => {
                let mut out = format!("waypoint id={} name={}", wp.id, wp.name);
                if let (Some(lat), Some(lon)) = (wp.latitude_i, wp.longitude_i) {
                    out.push_str(&format!(
                        " lat={:.5} lon={:.5}",
                        lat as f64 * 1e-7,
                        lon as f64 * 1e-7
                    ));
                }
                out
            }
            DecodedMessage::NodeInfo(info) => {
                let mut out = format!("node !{:08x}", info.num);
                if let Some(user) = &info.user {
                    let ln = user.long_name.trim();
                    let sn = user.short_name.trim();
                    if !ln.is_empty() {
                        out.push_str(&format!(" {}", ln));
                    }
                    if !sn.is_empty() {
                        out.push_str(&format!(" ({})", sn));
                    }
                }
                out
            }
            DecodedMessage::MyNodeInfo(info) => format!(
                "myinfo !{:08x} reboots={}",
                info.my_node_num, info.reboot_count
            ),
        }
    }
}

fn fmt_percent(val: f32) -> String {
    if val.is_finite() {
        if val <= 1.0 {
            format!("{:.0}%", val * 100.0)
        } else {
            format!("{:.0}%", val)
        }
    } else {
        "na".to_string()
    }
}

fn summarize_telemetry(t: &proto::Telemetry) -> String {
    use proto::telemetry::Variant;
    let mut parts: Vec<String> = Vec::new();
    let label = match &t.variant {
        Some(Variant::DeviceMetrics(dm)) => {
            if let Some(batt) = dm.battery_level {
                parts.push(format!("batt={}%", batt));
            }
            if let Some(v) = dm.voltage {
                parts.push(format!("v={:.2}V", v));
            }
            if let Some(up) = dm.uptime_seconds {
                parts.push(format!("up={}s", up));
            }
            if let Some(util) = dm.channel_utilization {
                parts.push(format!("util={}", fmt_percent(util)));
            }
            if let Some(tx) = dm.air_util_tx {
                parts.push(format!("tx={}", fmt_percent(tx)));
            }
            "telemetry/device"
        }
        Some(Variant::EnvironmentMetrics(env)) => {
            if let Some(t) = env.temperature {
                parts.push(format!("temp={:.1}C", t));
            }
            if let Some(h) = env.relative_humidity {
                parts.push(format!("hum={:.0}%", h));
            }
            if let Some(p) = env.barometric_pressure {
                parts.push(format!("press={:.0}hPa", p));
            }
            "telemetry/env"
        }
        None => "telemetry",
    };
    if parts.is_empty() {
        format!("{} time={}", label, t.time)
    } else {
        format!("{} time={} {}", label, t.time, parts.join(" "))
    }
}

/// Strip framing and validate the version tag.
fn prepare<'a>(raw: &'a [u8], version: &str) -> Result<&'a [u8], DecodeError> {
    // Every supported tag maps onto the one schema generation compiled into this crate.
    version.parse::<ProtoVersion>()?;
    Ok(framing::deframe(raw)?)
}

/// Map a parsed envelope onto a decoded message.
fn from_envelope(envelope: proto::FromRadio) -> Result<DecodedMessage, DecodeError> {
    use proto::from_radio::PayloadVariant as FRPayload;
    use proto::mesh_packet::PayloadVariant as MPPayload;
    use proto::PortNum;

    let packet = match envelope.payload_variant {
        Some(FRPayload::Packet(packet)) => packet,
        Some(FRPayload::MyInfo(info)) => return Ok(DecodedMessage::MyNodeInfo(info)),
        Some(FRPayload::NodeInfo(info)) => return Ok(DecodedMessage::NodeInfo(info)),
        Some(FRPayload::ConfigCompleteId(id)) => {
            return Err(DecodeError::NoMessage(format!("config_complete_id={}", id)))
        }
        Some(FRPayload::Rebooted(_)) => return Err(DecodeError::NoMessage("rebooted".into())),
        None => return Err(DecodeError::NoMessage("empty envelope".into())),
    };
    let data = match packet.payload_variant {
        Some(MPPayload::Decoded(data)) => data,
        Some(MPPayload::Encrypted(_)) => {
            return Err(DecodeError::NoMessage("encrypted packet".into()))
        }
        None => return Err(DecodeError::NoMessage("packet without payload".into())),
    };
    let port = PortNum::try_from(data.portnum).map_err(|_| {
        DecodeError::NoMessage(format!("unknown port number {}", data.portnum))
    })?;
    match port {
        PortNum::TextMessageApp => Ok(DecodedMessage::Text(
            String::from_utf8_lossy(&data.payload).into_owned(),
        )),
        PortNum::AlertApp => Ok(DecodedMessage::Alert(
            String::from_utf8_lossy(&data.payload).into_owned(),
        )),
        PortNum::AdminApp => Ok(DecodedMessage::Admin(data.payload)),
        PortNum::TelemetryApp => proto::Telemetry::decode(data.payload)
            .map(DecodedMessage::Telemetry)
            .map_err(schema("Telemetry")),
        PortNum::WaypointApp => proto::Waypoint::decode(data.payload)
            .map(DecodedMessage::Waypoint)
            .map_err(schema("Waypoint")),
        PortNum::NodeinfoApp => {
            let user = proto::User::decode(data.payload).map_err(schema("User"))?;
            Ok(DecodedMessage::NodeInfo(proto::NodeInfo {
                num: packet.from,
                user: Some(user),
                last_heard: packet.rx_time,
                snr: packet.rx_snr,
                channel: packet.channel,
                ..Default::default()
            }))
        }
        other => Err(DecodeError::NoMessage(format!(
            "port {}",
            other.as_str_name()
        ))),
    }
}

/// Decode one buffer into whichever message kind it carries.
///
/// `version` must be `""`, `"latest"` or `"2.1"`.
pub fn decode(raw: &[u8], version: &str) -> Result<DecodedMessage, DecodeError> {
    let payload = prepare(raw, version)?;
    let envelope = proto::FromRadio::decode(payload).map_err(schema("FromRadio"))?;
    from_envelope(envelope)
}

/// Decode one buffer, requiring it to carry a message of `kind`.
///
/// For node-info and my-node-info a bare (non-enveloped) message is also accepted, but only
/// when its node number is nonzero. Protobuf parses many unrelated byte strings without
/// error, and a zero node number is what such accidental parses usually produce.
pub fn decode_as(
    kind: MessageKind,
    raw: &[u8],
    version: &str,
) -> Result<DecodedMessage, DecodeError> {
    let payload = prepare(raw, version)?;
    let envelope_result = proto::FromRadio::decode(payload)
        .map_err(schema("FromRadio"))
        .and_then(from_envelope);

    let envelope_err = match envelope_result {
        Ok(msg) if msg.kind() == kind => return Ok(msg),
        Ok(msg) => DecodeError::KindMismatch {
            expected: kind,
            found: msg.kind().to_string(),
        },
        Err(e) => e,
    };

    match kind {
        MessageKind::MyNodeInfo => match proto::MyNodeInfo::decode(payload) {
            Ok(info) if info.my_node_num != 0 => Ok(DecodedMessage::MyNodeInfo(info)),
            _ => Err(envelope_err),
        },
        MessageKind::NodeInfo => match proto::NodeInfo::decode(payload) {
            Ok(info) if info.num != 0 => Ok(DecodedMessage::NodeInfo(info)),
            _ => Err(envelope_err),
        },
        _ => Err(envelope_err),
    }
}

/// Text payload of a text-message frame.
pub fn decode_text(raw: &[u8], version: &str) -> Result<String, DecodeError> {
    match decode_as(MessageKind::Text, raw, version)? {
        DecodedMessage::Text(text) => Ok(text),
        other => Err(mismatch(MessageKind::Text, &other)),
    }
}

/// Text payload of an alert frame.
pub fn decode_alert(raw: &[u8], version: &str) -> Result<String, DecodeError> {
    match decode_as(MessageKind::Alert, raw, version)? {
        DecodedMessage::Alert(text) => Ok(text),
        other => Err(mismatch(MessageKind::Alert, &other)),
    }
}

pub fn decode_telemetry(raw: &[u8], version: &str) -> Result<proto::Telemetry, DecodeError> {
    match decode_as(MessageKind::Telemetry, raw, version)? {
        DecodedMessage::Telemetry(t) => Ok(t),
        other => Err(mismatch(MessageKind::Telemetry, &other)),
    }
}

pub fn decode_waypoint(raw: &[u8], version: &str) -> Result<proto::Waypoint, DecodeError> {
    match decode_as(MessageKind::Waypoint, raw, version)? {
        DecodedMessage::Waypoint(wp) => Ok(wp),
        other => Err(mismatch(MessageKind::Waypoint, &other)),
    }
}

pub fn decode_admin(raw: &[u8], version: &str) -> Result<Bytes, DecodeError> {
    match decode_as(MessageKind::Admin, raw, version)? {
        DecodedMessage::Admin(payload) => Ok(payload),
        other => Err(mismatch(MessageKind::Admin, &other)),
    }
}

pub fn decode_node_info(raw: &[u8], version: &str) -> Result<proto::NodeInfo, DecodeError> {
    match decode_as(MessageKind::NodeInfo, raw, version)? {
        DecodedMessage::NodeInfo(info) => Ok(info),
        other => Err(mismatch(MessageKind::NodeInfo, &other)),
    }
}

pub fn decode_my_info(raw: &[u8], version: &str) -> Result<proto::MyNodeInfo, DecodeError> {
    match decode_as(MessageKind::MyNodeInfo, raw, version)? {
        DecodedMessage::MyNodeInfo(info) => Ok(info),
        other => Err(mismatch(MessageKind::MyNodeInfo, &other)),
    }
}

fn mismatch(expected: MessageKind, found: &DecodedMessage) -> DecodeError {
    DecodeError::KindMismatch {
        expected,
        found: found.kind().to_string(),
    }
}
