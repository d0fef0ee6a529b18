//! # Serial Port Manager
//!
//! Owns the link to one Meshtastic device and is the only place that writes to it.
//!
//! - **Writes** (`send`, `send_text_message`) and **lifecycle** (`close`) are serialized
//!   through one mutex, so two frames never interleave on the wire and a close cannot race
//!   a write in progress.
//! - **Reads** happen on a cloned handle owned by [`SerialManager::read_loop`], which does
//!   not take the write lock. It is meant to run on its own thread for the lifetime of the
//!   connection.
//!
//! ```rust,no_run
//! # #[cfg(feature = "serial")]
//! # fn demo() -> Result<(), meshspy::serial::SerialError> {
//! use meshspy::decoder::framing::ProtoVersion;
//! use meshspy::serial::SerialManager;
//!
//! let manager = SerialManager::open("/dev/ttyUSB0", 115200, ProtoVersion::Latest)?;
//! manager.send_text_message("hello mesh")?;
//! manager.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Once closed, a manager stays closed: further sends fail with [`SerialError::NotOpen`].

use crate::decoder::framing::{self, FrameAccumulator, FrameError, ProtoVersion};
use crate::decoder::{self, DecodedMessage};
use crate::logutil::{escape_log, hex_snippet, truncate_for_log};
use crate::metrics;
use crate::protobuf::meshtastic_generated as proto;
use crate::protobuf::BROADCAST_ADDR;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use prost::Message;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Serial read timeout. A timed-out read means "no data yet", never an error.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("serial port not open")]
    NotOpen,
    #[cfg(feature = "serial")]
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("read loop already running for {0}")]
    ReaderTaken(String),
}

/// Callbacks invoked by the read loop, one per decoded message kind.
///
/// All methods default to no-ops so implementors only override what they relay.
/// `publish` is called after the kind-specific callback with a one-line summary, for
/// bridging to other transports.
pub trait MessageHandler {
    fn on_node_info(&mut self, _info: proto::NodeInfo) {}
    fn on_my_info(&mut self, _info: proto::MyNodeInfo) {}
    fn on_telemetry(&mut self, _telemetry: proto::Telemetry) {}
    fn on_waypoint(&mut self, _waypoint: proto::Waypoint) {}
    fn on_admin(&mut self, _payload: Bytes) {}
    fn on_alert(&mut self, _text: String) {}
    fn on_text(&mut self, _text: String) {}
    fn publish(&mut self, _summary: &str) {}
}

/// Route a decoded message to the matching handler callback, then publish its summary.
pub fn dispatch<H: MessageHandler + ?Sized>(handler: &mut H, msg: DecodedMessage) {
    let summary = msg.summary();
    match msg {
        DecodedMessage::NodeInfo(info) => handler.on_node_info(info),
        DecodedMessage::MyNodeInfo(info) => handler.on_my_info(info),
        DecodedMessage::Telemetry(t) => handler.on_telemetry(t),
        DecodedMessage::Waypoint(wp) => handler.on_waypoint(wp),
        DecodedMessage::Admin(payload) => handler.on_admin(payload),
        DecodedMessage::Alert(text) => handler.on_alert(text),
        DecodedMessage::Text(text) => handler.on_text(text),
    }
    handler.publish(&summary);
}

type Writer = Box<dyn Write + Send>;
type Reader = Box<dyn Read + Send>;

/// Exclusive owner of one serial device.
pub struct SerialManager {
    name: String,
    baud_rate: u32,
    version: ProtoVersion,
    writer: Mutex<Option<Writer>>,
    reader: Mutex<Option<Reader>>,
    closed: AtomicBool,
}

impl SerialManager {
    /// Open `port_name` at `baud_rate` (8N1, 5 s read timeout).
    #[cfg(feature = "serial")]
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        version: ProtoVersion,
    ) -> Result<Self, SerialError> {
        info!(
            "Opening serial port {} at {} baud (proto {})",
            port_name, baud_rate, version
        );
        let open_err = |source| SerialError::Open {
            port: port_name.to_string(),
            source,
        };
        let mut builder = serialport::new(port_name, baud_rate).timeout(READ_TIMEOUT);
        // Some USB serial adapters need explicit settings
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open().map_err(open_err)?;
        // Assert DTR/RTS so ESP32 based boards wake up
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        std::thread::sleep(Duration::from_millis(150));
        // Clear any existing buffered startup text
        if let Ok(available) = port.bytes_to_read() {
            if available > 0 {
                let mut purge_buf = [0u8; 512];
                let _ = port.read(&mut purge_buf);
                debug!("Purged up to {} stale bytes from {}", available, port_name);
            }
        }
        let reader = port.try_clone().map_err(open_err)?;
        Ok(Self::with_transport(
            port_name,
            baud_rate,
            version,
            Box::new(reader),
            Box::new(port),
        ))
    }

    /// Build a manager over an already-open transport.
    pub fn with_transport(
        name: &str,
        baud_rate: u32,
        version: ProtoVersion,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        SerialManager {
            name: name.to_string(),
            baud_rate,
            version,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn proto_version(&self) -> ProtoVersion {
        self.version
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<Writer>> {
        // A panic while holding the lock leaves the handle itself intact
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Close the port. Closing an already-closed manager is a no-op.
    pub fn close(&self) -> Result<(), SerialError> {
        let mut guard = self.lock_writer();
        let Some(mut writer) = guard.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::SeqCst);
        // Drop an unclaimed reader too; a running read loop notices the flag instead.
        if let Ok(mut reader) = self.reader.lock() {
            reader.take();
        }
        info!("Closing serial port {}", self.name);
        writer.flush()?;
        Ok(())
    }

    fn write_locked(&self, writer: &mut Writer, bytes: &[u8]) -> Result<(), SerialError> {
        writer.write_all(bytes)?;
        writer.flush()?;
        metrics::add_serial_bytes_written(bytes.len());
        Ok(())
    }

    /// Write raw bytes to the device.
    pub fn send(&self, data: &[u8]) -> Result<(), SerialError> {
        let mut guard = self.lock_writer();
        let writer = guard.as_mut().ok_or(SerialError::NotOpen)?;
        debug!(
            "↑ write to {}: {}",
            self.name,
            truncate_for_log(&String::from_utf8_lossy(data), 120)
        );
        self.write_locked(writer, data)
    }

    /// Broadcast `text` as a text message on the primary channel.
    pub fn send_text_message(&self, text: &str) -> Result<(), SerialError> {
        use proto::mesh_packet::PayloadVariant as MPPayload;
        use proto::to_radio::PayloadVariant as TRPayload;

        let mut guard = self.lock_writer();
        let writer = guard.as_mut().ok_or(SerialError::NotOpen)?;

        let packet = proto::MeshPacket {
            to: BROADCAST_ADDR,
            payload_variant: Some(MPPayload::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: Bytes::copy_from_slice(text.as_bytes()),
                ..Default::default()
            })),
            ..Default::default()
        };
        let toradio = proto::ToRadio {
            payload_variant: Some(TRPayload::Packet(packet)),
        };
        let frame = framing::encode_frame(self.version, &toradio.encode_to_vec())?;
        debug!(
            "↑ write text to {} ({} byte frame): '{}'",
            self.name,
            frame.len(),
            escape_log(text)
        );
        trace!("ToRadio frame hex:{}", hex_snippet(&frame, frame.len()));
        self.write_locked(writer, &frame)
    }

    /// Read frames until the port is closed or the stream ends, dispatching every decoded
    /// message to `handler`. Can be started once per manager.
    pub fn read_loop<H: MessageHandler + ?Sized>(&self, handler: &mut H) -> Result<(), SerialError> {
        let mut reader = {
            let mut slot = self.reader.lock().unwrap_or_else(|p| p.into_inner());
            match slot.take() {
                Some(r) => r,
                None if !self.is_open() => return Err(SerialError::NotOpen),
                None => return Err(SerialError::ReaderTaken(self.name.clone())),
            }
        };
        let version = self.version.to_string();
        let mut acc = FrameAccumulator::new();
        let mut buffer = [0u8; READ_CHUNK];
        info!("Starting read loop on {}", self.name);

        while self.is_open() {
            let n = match reader.read(&mut buffer) {
                Ok(0) => {
                    info!("Serial stream on {} ended", self.name);
                    break;
                }
                Ok(n) => n,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    if !self.is_open() {
                        break;
                    }
                    warn!("Serial read error on {}: {}", self.name, e);
                    return Err(SerialError::Io(e));
                }
            };
            let raw = &buffer[..n];
            trace!("RAW {} bytes: {}", n, hex_snippet(raw, 64));
            acc.push(raw);
            while let Some(frame) = acc.next_frame() {
                match decoder::decode(&frame, &version) {
                    Ok(msg) => {
                        metrics::inc_frames_decoded();
                        metrics::record_message(msg.kind().as_str());
                        debug!(
                            "↓ {} from {}",
                            truncate_for_log(&msg.summary(), 160),
                            self.name
                        );
                        dispatch(handler, msg);
                    }
                    Err(e) => {
                        metrics::inc_frames_rejected();
                        debug!("Skipping {} byte frame from {}: {}", frame.len(), self.name, e);
                    }
                }
            }
        }
        info!("Read loop on {} stopped", self.name);
        Ok(())
    }
}

impl Drop for SerialManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing serial port {}: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn manager_with(input: Vec<u8>, out: SharedBuf) -> SerialManager {
        SerialManager::with_transport(
            "test0",
            115200,
            ProtoVersion::Latest,
            Box::new(Cursor::new(input)),
            Box::new(out),
        )
    }

    #[test]
    fn close_is_idempotent_and_blocks_sends() {
        let out = SharedBuf::default();
        let mgr = manager_with(vec![], out.clone());
        assert!(mgr.is_open());
        mgr.close().unwrap();
        mgr.close().unwrap();
        assert!(!mgr.is_open());
        assert!(matches!(mgr.send(b"x"), Err(SerialError::NotOpen)));
        assert!(out.0.lock().unwrap().is_empty());
    }

    #[test]
    fn read_loop_runs_once() {
        let mgr = manager_with(vec![], SharedBuf::default());
        struct Nop;
        impl MessageHandler for Nop {}
        mgr.read_loop(&mut Nop).unwrap();
        assert!(matches!(
            mgr.read_loop(&mut Nop),
            Err(SerialError::ReaderTaken(_))
        ));
    }

    #[test]
    fn read_loop_on_closed_manager_fails() {
        let mgr = manager_with(vec![], SharedBuf::default());
        mgr.close().unwrap();
        struct Nop;
        impl MessageHandler for Nop {}
        assert!(matches!(mgr.read_loop(&mut Nop), Err(SerialError::NotOpen)));
    }
}
