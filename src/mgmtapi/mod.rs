//! # Management Server Client
//!
//! HTTP/JSON client for the MeshSpy management server with built-in connectivity tracking.
//!
//! Every request goes through one internal `execute` step that records whether the server
//! was reachable:
//!
//! - transport failure (refused, timeout) clears the connected flag
//! - a status of 300 or above clears the flag and returns [`ApiError::Status`] with the body
//! - anything else sets the flag
//!
//! A background probe re-checks the server (`GET /nodes`) while the flag is cleared, so a
//! temporary outage heals without any call site having to care. The probe holds only a weak
//! reference and exits once the last [`Client`] clone is dropped.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), meshspy::mgmtapi::ApiError> {
//! use meshspy::mgmtapi::Client;
//!
//! let client = Client::new("http://localhost:8080")?;
//! client.send_alert("low battery on !a1b2c3d4").await?;
//! println!("connected: {}", client.is_connected());
//! # Ok(())
//! # }
//! ```

use crate::metrics;
use crate::protobuf::meshtastic_generated as proto;
use base64::Engine as _;
use log::{debug, info, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Endpoint used by the reconnect probe.
const PROBE_PATH: &str = "/nodes";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("management server URL is empty")]
    EmptyBaseUrl,
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("server returned {status}")]
    Status { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("failed to encode request body: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    /// Per-request timeout.
    pub timeout: Duration,
    /// How often the reconnect probe wakes up.
    pub probe_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

/// Node as the server stores it. On the wire the long name travels as `name` and the short
/// name as `address`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "name", default)]
    pub long_name: String,
    #[serde(rename = "address", default)]
    pub short_name: String,
}

impl From<&proto::NodeInfo> for NodeSummary {
    fn from(info: &proto::NodeInfo) -> Self {
        let user = info.user.as_ref();
        NodeSummary {
            id: format!("!{:08x}", info.num),
            long_name: user.map(|u| u.long_name.clone()).unwrap_or_default(),
            short_name: user.map(|u| u.short_name.clone()).unwrap_or_default(),
        }
    }
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Pending node registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRequest {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub latitude: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub longitude: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub firmware: String,
    #[serde(rename = "longName", skip_serializing_if = "String::is_empty")]
    pub long_name: String,
    #[serde(rename = "shortName", skip_serializing_if = "String::is_empty")]
    pub short_name: String,
}

/// One recorded node position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePosition {
    pub node_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FirmwareUpdate {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub build: bool,
}

/// Protobuf-JSON shape of a telemetry message: the oneof variant appears as a sibling of
/// `time` under its camelCase field name.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryBody<'a> {
    #[serde(skip_serializing_if = "crate::protobuf::is_default")]
    time: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_metrics: Option<&'a proto::DeviceMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    environment_metrics: Option<&'a proto::EnvironmentMetrics>,
}

impl<'a> From<&'a proto::Telemetry> for TelemetryBody<'a> {
    fn from(t: &'a proto::Telemetry) -> Self {
        use proto::telemetry::Variant;
        let (device_metrics, environment_metrics) = match &t.variant {
            Some(Variant::DeviceMetrics(dm)) => (Some(dm), None),
            Some(Variant::EnvironmentMetrics(env)) => (None, Some(env)),
            None => (None, None),
        };
        TelemetryBody {
            time: t.time,
            device_metrics,
            environment_metrics,
        }
    }
}

#[derive(Serialize)]
struct CommandBody<'a> {
    cmd: &'a str,
}

#[derive(Serialize)]
struct AdminBody {
    payload: String,
}

#[derive(Serialize)]
struct AlertBody<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct BackupBody<'a> {
    data: &'a str,
}

struct Inner {
    base_url: String,
    http: reqwest::Client,
    connected: AtomicBool,
}

impl Inner {
    fn set_connected(&self, up: bool) {
        let was = self.connected.swap(up, Ordering::SeqCst);
        if was != up {
            if up {
                info!("Management server {} reachable again", self.base_url);
            } else {
                warn!("Management server {} marked unreachable", self.base_url);
            }
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let started = Instant::now();
        let outcome = request.send().await;
        metrics::observe_api_latency(started);
        let response = match outcome {
            Ok(r) => r,
            Err(e) => {
                self.set_connected(false);
                metrics::inc_api_failed();
                return Err(ApiError::Transport(e));
            }
        };
        let status = response.status();
        if status.as_u16() >= 300 {
            self.set_connected(false);
            metrics::inc_api_failed();
            let body = response.text().await.unwrap_or_default();
            debug!("{} answered {}: {}", self.base_url, status, body);
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        self.set_connected(true);
        metrics::inc_api_ok();
        Ok(response)
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let url = format!("{}{}", self.base_url, PROBE_PATH);
        self.execute(self.http.get(url)).await.map(|_| ())
    }
}

fn spawn_probe(inner: Weak<Inner>, period: Duration) {
    if period.is_zero() {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!("No Tokio runtime; management reconnect probe disabled");
        return;
    };
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.connected.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = inner.ping().await {
                debug!("Management probe failed: {}", e);
            }
        }
    });
}

/// Cheaply cloneable handle to one management server.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Client with the default 5 s timeout and 5 min probe interval.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_settings(base_url, ClientSettings::default())
    }

    pub fn with_settings(base_url: &str, settings: ClientSettings) -> Result<Self, ApiError> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ApiError::EmptyBaseUrl);
        }
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(ApiError::Build)?;
        let inner = Arc::new(Inner {
            base_url: base_url.to_string(),
            http,
            connected: AtomicBool::new(true),
        });
        spawn_probe(Arc::downgrade(&inner), settings.probe_interval);
        Ok(Client { inner })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Whether the last request (or probe) reached the server.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.inner.http.request(method, self.url(path))
    }

    async fn send_empty(&self, method: Method, path: &str) -> Result<(), ApiError> {
        self.inner.execute(self.request(method, path)).await?;
        Ok(())
    }

    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let bytes = serde_json::to_vec(body)?;
        let request = self
            .request(Method::POST, path)
            .header(CONTENT_TYPE, "application/json")
            .body(bytes);
        self.inner.execute(request).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.inner.execute(self.request(Method::GET, path)).await?;
        response.json::<T>().await.map_err(ApiError::Decode)
    }

    /// Upload a node as `{id, name, address}`.
    pub async fn send_node(&self, node: &NodeSummary) -> Result<(), ApiError> {
        self.post_json("/nodes", node).await
    }

    /// Ask the server to publish a command to the mesh.
    pub async fn send_command(&self, cmd: &str) -> Result<(), ApiError> {
        self.post_json("/api/send", &CommandBody { cmd }).await
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeSummary>, ApiError> {
        self.get_json("/nodes").await
    }

    /// `Ok(None)` for an empty id.
    pub async fn get_node(&self, id: &str) -> Result<Option<NodeSummary>, ApiError> {
        if id.is_empty() {
            return Ok(None);
        }
        let path = format!("/nodes/{}", urlencoding::encode(id));
        self.get_json(&path).await.map(Some)
    }

    /// Remove all nodes. Pending registrations are kept.
    pub async fn reset_nodes(&self) -> Result<(), ApiError> {
        self.send_empty(Method::POST, "/nodes/reset").await
    }

    pub async fn register_node(&self, request: &NodeRequest) -> Result<(), ApiError> {
        self.post_json("/node-requests", request).await
    }

    pub async fn list_node_requests(&self) -> Result<Vec<NodeRequest>, ApiError> {
        self.get_json("/node-requests").await
    }

    pub async fn approve_node_request(&self, id: &str) -> Result<(), ApiError> {
        if id.is_empty() {
            return Ok(());
        }
        let path = format!("/node-requests/{}/approve", urlencoding::encode(id));
        self.send_empty(Method::POST, &path).await
    }

    pub async fn reject_node_request(&self, id: &str) -> Result<(), ApiError> {
        if id.is_empty() {
            return Ok(());
        }
        let path = format!("/node-requests/{}", urlencoding::encode(id));
        self.send_empty(Method::DELETE, &path).await
    }

    /// Positions for one node, or for every node when `node_id` is `None` or empty.
    pub async fn list_positions(&self, node_id: Option<&str>) -> Result<Vec<NodePosition>, ApiError> {
        let path = match node_id {
            Some(id) if !id.is_empty() => format!("/api/positions?node={}", urlencoding::encode(id)),
            _ => "/api/positions".to_string(),
        };
        self.get_json(&path).await
    }

    pub async fn send_telemetry(&self, telemetry: &proto::Telemetry) -> Result<(), ApiError> {
        self.post_json("/api/telemetry", &TelemetryBody::from(telemetry))
            .await
    }

    pub async fn send_waypoint(&self, waypoint: &proto::Waypoint) -> Result<(), ApiError> {
        self.post_json("/api/waypoints", waypoint).await
    }

    /// Upload a raw admin payload, base64 encoded.
    pub async fn send_admin(&self, payload: &[u8]) -> Result<(), ApiError> {
        if payload.is_empty() {
            return Ok(());
        }
        let body = AdminBody {
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
        };
        self.post_json("/api/admin", &body).await
    }

    pub async fn send_alert(&self, text: &str) -> Result<(), ApiError> {
        if text.is_empty() {
            return Ok(());
        }
        self.post_json("/api/alerts", &AlertBody { text }).await
    }

    /// Names of the configuration backups stored for a node.
    pub async fn list_backups(&self, id: &str) -> Result<Vec<String>, ApiError> {
        if id.is_empty() {
            return Ok(Vec::new());
        }
        let path = format!("/nodes/{}/backups", urlencoding::encode(id));
        self.get_json(&path).await
    }

    pub async fn add_backup(&self, id: &str, data: &str) -> Result<(), ApiError> {
        if id.is_empty() || data.is_empty() {
            return Ok(());
        }
        let path = format!("/nodes/{}/backup", urlencoding::encode(id));
        self.post_json(&path, &BackupBody { data }).await
    }

    pub async fn restore_backup(&self, id: &str, data: &str) -> Result<(), ApiError> {
        if id.is_empty() || data.is_empty() {
            return Ok(());
        }
        let path = format!("/nodes/{}/restore", urlencoding::encode(id));
        self.post_json(&path, &BackupBody { data }).await
    }

    pub async fn update_firmware(&self, id: &str, update: &FirmwareUpdate) -> Result<(), ApiError> {
        if id.is_empty() {
            return Ok(());
        }
        let path = format!("/nodes/{}/firmware/update", urlencoding::encode(id));
        self.post_json(&path, update).await
    }

    /// Latest firmware version the server knows for a node, whitespace trimmed.
    pub async fn get_firmware(&self, id: &str) -> Result<String, ApiError> {
        if id.is_empty() {
            return Ok(String::new());
        }
        let path = format!("/nodes/{}/firmware", urlencoding::encode(id));
        let response = self.inner.execute(self.request(Method::GET, &path)).await?;
        let text = response.text().await.map_err(ApiError::Decode)?;
        Ok(text.trim().to_string())
    }
}
