//! Printer link: JSON-RPC over the Moonraker WebSocket
//!
//! Maintains a persistent connection to `ws://HOST:7125/websocket`,
//! subscribes to a fixed object set, keeps a [`PrinterSnapshot`] of the last
//! known values, and dispatches G-code. Raw status maps are forwarded to the
//! coordinator unfiltered; the coordinator decides what matters.
//!
//! One manager task owns the connection lifecycle: dial, subscribe, query,
//! then a read loop multiplexed with the periodic re-query tick. On any
//! disconnect the cached print state is cleared, a `Disconnected` event is
//! emitted, and the loop retries at the configured interval until told to
//! stop. All writes go through a single send lock so frames never
//! interleave.

pub mod status;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::common::ShutdownReceiver;
pub use status::{ExtruderStatus, PrintState, PrinterSnapshot, SensorBinding};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Printer link errors
#[derive(Error, Debug)]
pub enum KlipperError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("not connected to Moonraker")]
    NotConnected,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Events surfaced to the coordinator
#[derive(Debug)]
pub enum KlipperEvent {
    /// Raw status map from a notification or query response
    Status(serde_json::Map<String, Value>),
    Connected,
    Disconnected,
}

/// Link configuration
#[derive(Debug, Clone)]
pub struct KlipperLinkConfig {
    /// `ws://…/websocket` endpoint
    pub websocket_url: String,
    /// HTTP base URL for the occasional REST probe
    pub http_url: String,
    /// Periodic status re-query interval
    pub update_interval: Duration,
    /// Delay between reconnect attempts
    pub reconnect_interval: Duration,
    /// Runout sensor objects to subscribe to
    pub sensors: Vec<SensorBinding>,
}

impl KlipperLinkConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            websocket_url: config.klipper.websocket_url(),
            http_url: config.klipper.url.clone(),
            update_interval: Duration::from_secs_f64(config.klipper.update_interval),
            reconnect_interval: Duration::from_secs(5),
            sensors: config
                .filament_runout
                .sensors
                .iter()
                .map(|sensor| SensorBinding {
                    object: sensor.object_name(),
                    name: sensor.name.clone(),
                    extruder: sensor.extruder,
                })
                .collect(),
        }
    }
}

struct Shared {
    config: KlipperLinkConfig,
    snapshot: Mutex<PrinterSnapshot>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    request_id: AtomicU64,
    auto_reconnect: AtomicBool,
}

/// Cloneable handle used by the coordinator to talk to the printer.
#[derive(Clone)]
pub struct KlipperHandle {
    shared: Arc<Shared>,
}

/// The printer link component. `start` spawns the manager task and hands
/// back the handle.
pub struct KlipperLink {
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<KlipperEvent>,
}

impl KlipperLink {
    pub fn new(config: KlipperLinkConfig, event_tx: mpsc::Sender<KlipperEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                snapshot: Mutex::new(PrinterSnapshot::default()),
                writer: tokio::sync::Mutex::new(None),
                request_id: AtomicU64::new(1),
                auto_reconnect: AtomicBool::new(true),
            }),
            event_tx,
        }
    }

    /// Spawn the connection manager and return the control handle.
    pub fn start(self, shutdown: ShutdownReceiver) -> KlipperHandle {
        let handle = KlipperHandle {
            shared: self.shared.clone(),
        };
        tokio::spawn(manager_task(self.shared, self.event_tx, shutdown));
        handle
    }
}

impl KlipperHandle {
    /// Snapshot of the last known printer state
    pub fn snapshot(&self) -> PrinterSnapshot {
        self.shared.snapshot.lock().expect("snapshot lock poisoned").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .snapshot
            .lock()
            .expect("snapshot lock poisoned")
            .connected
    }

    /// Send a G-code script. Returns once the request is on the wire.
    pub async fn send_gcode(&self, script: &str) -> Result<(), KlipperError> {
        info!(script, "sending G-code");
        self.send_rpc("printer.gcode.script", json!({ "script": script }))
            .await
    }

    pub async fn pause(&self) -> Result<(), KlipperError> {
        self.send_gcode("PAUSE").await
    }

    pub async fn resume(&self) -> Result<(), KlipperError> {
        self.send_gcode("RESUME").await
    }

    pub async fn cancel(&self) -> Result<(), KlipperError> {
        self.send_gcode("CANCEL_PRINT").await
    }

    /// Re-issue the subscription and an immediate full query; used after a
    /// CAN reconnect or a detected state divergence to force a fresh burst.
    pub async fn resubscribe(&self) -> Result<(), KlipperError> {
        self.send_rpc(
            "printer.objects.subscribe",
            json!({ "objects": subscription_objects(&self.shared.config.sensors) }),
        )
        .await?;
        self.query_objects().await
    }

    /// One-shot query over the full subscription set
    pub async fn query_objects(&self) -> Result<(), KlipperError> {
        self.send_rpc(
            "printer.objects.query",
            json!({ "objects": subscription_objects(&self.shared.config.sensors) }),
        )
        .await
    }

    /// Check whether a G-code macro is known to Klipper, via the
    /// `printer.gcode.help` REST endpoint.
    pub async fn gcode_macro_exists(&self, macro_name: &str) -> Result<bool, KlipperError> {
        let url = format!("{}/printer/gcode/help", self.shared.config.http_url);
        let response = reqwest::Client::new()
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        let exists = body
            .get("result")
            .and_then(Value::as_object)
            .map(|commands| commands.contains_key(&macro_name.to_uppercase()))
            .unwrap_or(false);
        Ok(exists)
    }

    /// Stop reconnecting and close the connection.
    pub async fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        let mut writer = self.shared.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }

    async fn send_rpc(&self, method: &str, params: Value) -> Result<(), KlipperError> {
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.shared.request_id.fetch_add(1, Ordering::Relaxed),
        });
        let mut writer = self.shared.writer.lock().await;
        let sink = writer.as_mut().ok_or(KlipperError::NotConnected)?;
        sink.send(Message::Text(request.to_string())).await?;
        Ok(())
    }
}

/// The fixed subscription set. The subscribe call and every query use the
/// same objects so first-delivery ordering is unambiguous.
fn subscription_objects(sensors: &[SensorBinding]) -> Value {
    let mut objects = json!({
        "print_stats": null,
        "toolhead": ["extruder", "position"],
        "motion_report": ["live_extruder_velocity", "live_position"],
        "extruder": ["can_extrude", "temperature", "target"],
        "extruder1": ["can_extrude", "temperature", "target"],
        "virtual_sdcard": null,
        "pause_resume": null,
    });
    let map = objects.as_object_mut().expect("literal is an object");
    for sensor in sensors {
        map.insert(sensor.object.clone(), Value::Null);
    }
    objects
}

/// Extract the status map from either accepted message shape: a
/// `notify_status_update` notification or a query response.
fn extract_status(message: &Value) -> Option<serde_json::Map<String, Value>> {
    if message.get("method").and_then(Value::as_str) == Some("notify_status_update") {
        return message
            .get("params")
            .and_then(Value::as_array)
            .and_then(|params| params.first())
            .and_then(Value::as_object)
            .cloned();
    }
    message
        .get("result")
        .and_then(|result| result.get("status"))
        .and_then(Value::as_object)
        .cloned()
}

/// Connection lifecycle: dial, subscribe, pump messages, reconnect.
async fn manager_task(
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<KlipperEvent>,
    mut shutdown: ShutdownReceiver,
) {
    let reconnect_interval = shared.config.reconnect_interval;

    loop {
        if !shared.auto_reconnect.load(Ordering::SeqCst) {
            break;
        }

        match connect_async(&shared.config.websocket_url).await {
            Ok((socket, _)) => {
                info!(url = %shared.config.websocket_url, "connected to Moonraker");
                let (sink, stream) = socket.split();
                *shared.writer.lock().await = Some(sink);
                shared
                    .snapshot
                    .lock()
                    .expect("snapshot lock poisoned")
                    .connected = true;

                let handle = KlipperHandle {
                    shared: shared.clone(),
                };
                if let Err(err) = handle.resubscribe().await {
                    warn!(error = %err, "initial subscribe failed");
                }
                let _ = event_tx.send(KlipperEvent::Connected).await;

                run_connected(&shared, &event_tx, stream, &mut shutdown).await;

                // connection lost or shutting down
                *shared.writer.lock().await = None;
                {
                    let mut snapshot = shared.snapshot.lock().expect("snapshot lock poisoned");
                    snapshot.connected = false;
                    snapshot.reset_print_state();
                }
                let _ = event_tx.send(KlipperEvent::Disconnected).await;
            }
            Err(err) => {
                warn!(error = %err, url = %shared.config.websocket_url, "Moonraker connection failed");
            }
        }

        if !shared.auto_reconnect.load(Ordering::SeqCst) {
            break;
        }
        info!(
            seconds = reconnect_interval.as_secs(),
            "retrying Moonraker connection"
        );
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(reconnect_interval) => {}
        }
    }

    info!("printer link manager stopped");
}

/// Read loop for one established connection, multiplexed with the periodic
/// re-query tick. Returns when the connection drops or shutdown fires.
async fn run_connected(
    shared: &Arc<Shared>,
    event_tx: &mpsc::Sender<KlipperEvent>,
    mut stream: WsStream,
    shutdown: &mut ShutdownReceiver,
) {
    let mut query_tick = tokio::time::interval(shared.config.update_interval);
    query_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    query_tick.reset();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                shared.auto_reconnect.store(false, Ordering::SeqCst);
                return;
            }

            _ = query_tick.tick() => {
                let handle = KlipperHandle { shared: shared.clone() };
                if let Err(err) = handle.query_objects().await {
                    warn!(error = %err, "periodic status query failed");
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => {
                                if let Some(status) = extract_status(&value) {
                                    {
                                        let mut snapshot = shared
                                            .snapshot
                                            .lock()
                                            .expect("snapshot lock poisoned");
                                        snapshot.apply_status(&status, &shared.config.sensors);
                                    }
                                    if event_tx.send(KlipperEvent::Status(status)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(err) => debug!(error = %err, "unparseable WebSocket message"),
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        warn!(?frame, "Moonraker closed the connection");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "WebSocket receive error");
                        return;
                    }
                    None => {
                        warn!("WebSocket stream ended");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sensor_bindings() -> Vec<SensorBinding> {
        vec![SensorBinding {
            object: "filament_switch_sensor Filament_Sensor0".to_string(),
            name: "Filament_Sensor0".to_string(),
            extruder: 0,
        }]
    }

    #[test]
    fn subscription_includes_sensor_objects() {
        let objects = subscription_objects(&sensor_bindings());
        let map = objects.as_object().unwrap();
        assert!(map.contains_key("print_stats"));
        assert!(map.contains_key("extruder1"));
        assert!(map.contains_key("filament_switch_sensor Filament_Sensor0"));
        assert_eq!(map["toolhead"], json!(["extruder", "position"]));
        assert_eq!(
            map["motion_report"],
            json!(["live_extruder_velocity", "live_position"])
        );
    }

    #[test]
    fn extracts_notification_status() {
        let message = json!({
            "jsonrpc": "2.0",
            "method": "notify_status_update",
            "params": [{"print_stats": {"state": "paused"}}, 1234.5]
        });
        let status = extract_status(&message).unwrap();
        assert_eq!(status["print_stats"]["state"], "paused");
    }

    #[test]
    fn extracts_query_response_status() {
        let message = json!({
            "jsonrpc": "2.0",
            "result": {"status": {"extruder": {"temperature": 210.0}}, "eventtime": 99.0},
            "id": 7
        });
        let status = extract_status(&message).unwrap();
        assert_eq!(status["extruder"]["temperature"], 210.0);
    }

    #[test]
    fn ignores_unrelated_messages() {
        assert!(extract_status(&json!({"jsonrpc": "2.0", "result": "ok", "id": 3})).is_none());
        assert!(extract_status(&json!({"method": "notify_proc_stat_update", "params": []})).is_none());
    }

    #[test]
    fn link_config_from_app_config() {
        let config = crate::config::Config::default();
        let link_config = KlipperLinkConfig::from_config(&config);
        assert_eq!(link_config.websocket_url, "ws://localhost:7125/websocket");
        assert_eq!(link_config.update_interval, Duration::from_secs(5));
        assert_eq!(link_config.sensors.len(), 2);
        assert_eq!(
            link_config.sensors[0].object,
            "filament_switch_sensor Filament_Sensor0"
        );
    }
}
