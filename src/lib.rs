//! # MeshSpy - Meshtastic Serial Gateway
//!
//! MeshSpy sits between a Meshtastic radio on a serial port and a MeshSpy management server.
//! It decodes the device's framed protobuf stream into typed messages, relays them to the
//! server over HTTP/JSON, and can inject text messages into the mesh.
//!
//! ## Features
//!
//! - **Frame Decoding**: Both serial framing generations (`0x94 0xC3` and `0x44 0x03`) with a
//!   single decode entry point returning a tagged message.
//! - **Serial Management**: Serialized writes, an independent read loop with per-kind callbacks.
//! - **Management Client**: Connectivity-tracking HTTP client with a background reconnect probe.
//! - **Relay**: Best-effort forwarding of telemetry, waypoints, admin payloads, alerts and nodes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshspy::config::Config;
//! use meshspy::mgmtapi::Client;
//! use meshspy::relay::{self, RelayHandler};
//! use meshspy::serial::SerialManager;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let manager = Arc::new(SerialManager::open(
//!         &config.serial.port,
//!         config.serial.baud_rate,
//!         config.proto_version()?,
//!     )?);
//!     let client = Client::new(&config.management.url)?;
//!
//!     let (mut handler, rx) = RelayHandler::channel();
//!     tokio::spawn(relay::run(client, rx));
//!     let reader = manager.clone();
//!     tokio::task::spawn_blocking(move || reader.read_loop(&mut handler)).await??;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`decoder`] - frame header handling and protobuf decoding
//! - [`serial`] - serial port ownership, writes and the read loop
//! - [`mgmtapi`] - management server HTTP client
//! - [`relay`] - serial to HTTP bridging
//! - [`config`] - configuration management and validation
//! - [`protobuf`] - generated Meshtastic protocol types
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Meshtastic radio│
//! └─────────────────┘
//!          │ serial frames
//! ┌─────────────────┐
//! │ SerialManager   │ ← read loop + decoder
//! └─────────────────┘
//!          │ DecodedMessage
//! ┌─────────────────┐
//! │ Relay           │ ← best-effort uploads
//! └─────────────────┘
//!          │ HTTP/JSON
//! ┌─────────────────┐
//! │ Management API  │
//! └─────────────────┘
//! ```

pub mod config;
pub mod decoder;
pub mod logutil;
pub mod metrics;
pub mod mgmtapi;
pub mod protobuf;
pub mod relay;
pub mod serial;
