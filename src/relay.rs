//! Bridge from the serial read loop to the management server.
//!
//! The read loop runs on a blocking thread; [`RelayHandler`] only pushes decoded messages
//! into an unbounded channel, and [`run`] performs the HTTP calls on the async side.
//! Upload failures are logged and dropped; the client's probe takes care of reconnecting.

use crate::decoder::DecodedMessage;
use crate::logutil::{escape_log, truncate_for_log};
use crate::mgmtapi::{ApiError, Client, NodeSummary};
use crate::protobuf::meshtastic_generated as proto;
use crate::serial::MessageHandler;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;

/// Forwards every decoded message into a channel.
pub struct RelayHandler {
    tx: mpsc::UnboundedSender<DecodedMessage>,
}

impl RelayHandler {
    pub fn new(tx: mpsc::UnboundedSender<DecodedMessage>) -> Self {
        Self { tx }
    }

    /// Handler plus the receiving end to hand to [`run`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DecodedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn forward(&self, msg: DecodedMessage) {
        if self.tx.send(msg).is_err() {
            debug!("Relay receiver gone; dropping message");
        }
    }
}

impl MessageHandler for RelayHandler {
    fn on_node_info(&mut self, info: proto::NodeInfo) {
        self.forward(DecodedMessage::NodeInfo(info));
    }

    fn on_my_info(&mut self, info: proto::MyNodeInfo) {
        self.forward(DecodedMessage::MyNodeInfo(info));
    }

    fn on_telemetry(&mut self, telemetry: proto::Telemetry) {
        self.forward(DecodedMessage::Telemetry(telemetry));
    }

    fn on_waypoint(&mut self, waypoint: proto::Waypoint) {
        self.forward(DecodedMessage::Waypoint(waypoint));
    }

    fn on_admin(&mut self, payload: Bytes) {
        self.forward(DecodedMessage::Admin(payload));
    }

    fn on_alert(&mut self, text: String) {
        self.forward(DecodedMessage::Alert(text));
    }

    fn on_text(&mut self, text: String) {
        self.forward(DecodedMessage::Text(text));
    }

    fn publish(&mut self, summary: &str) {
        trace!("publish: {}", escape_log(summary));
    }
}

/// Upload one message. Returns the API error, if any, for the caller to log.
pub async fn relay_one(client: &Client, msg: DecodedMessage) -> Result<(), ApiError> {
    match msg {
        DecodedMessage::Telemetry(t) => client.send_telemetry(&t).await,
        DecodedMessage::Waypoint(wp) => client.send_waypoint(&wp).await,
        DecodedMessage::Admin(payload) => client.send_admin(&payload).await,
        DecodedMessage::Alert(text) => client.send_alert(&text).await,
        DecodedMessage::NodeInfo(info) => client.send_node(&NodeSummary::from(&info)).await,
        DecodedMessage::MyNodeInfo(info) => {
            info!("Connected radio is node !{:08x}", info.my_node_num);
            Ok(())
        }
        DecodedMessage::Text(text) => {
            info!("Text message: {}", truncate_for_log(&text, 200));
            Ok(())
        }
    }
}

/// Drain `rx` until every sender is dropped.
pub async fn run(client: Client, mut rx: mpsc::UnboundedReceiver<DecodedMessage>) {
    while let Some(msg) = rx.recv().await {
        let kind = msg.kind();
        if let Err(e) = relay_one(&client, msg).await {
            warn!("Relaying {} to management server failed: {}", kind, e);
        }
    }
    debug!("Relay channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::dispatch;

    #[test]
    fn handler_forwards_dispatched_messages() {
        let (mut handler, mut rx) = RelayHandler::channel();
        dispatch(&mut handler, DecodedMessage::Alert("fire".into()));
        dispatch(&mut handler, DecodedMessage::Text("hi".into()));
        assert_eq!(rx.try_recv().unwrap(), DecodedMessage::Alert("fire".into()));
        assert_eq!(rx.try_recv().unwrap(), DecodedMessage::Text("hi".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handler_survives_closed_receiver() {
        let (mut handler, rx) = RelayHandler::channel();
        drop(rx);
        dispatch(&mut handler, DecodedMessage::Text("lost".into()));
    }
}
