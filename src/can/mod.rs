//! CAN link to the feeder cabinet
//!
//! Owns the SocketCAN socket and everything that keeps it trustworthy: the
//! fixed handshake that precedes all traffic, the receive loop that
//! classifies cabinet frames into typed events, the heartbeat watchdog, and
//! the auto-reconnect driver. Outbound sends are serialized through one
//! send lock and retried briefly; device-gone errors short-circuit straight
//! to reconnect.

pub mod frame;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socketcan::tokio::CanSocket;
use socketcan::{CanFrame, EmbeddedFrame, Id, StandardId};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::common::ShutdownReceiver;
use frame::{
    classify, CabinetCommand, InboundFrame, StatusReport, CABINET_TO_PRINTER, HANDSHAKE_ACK,
    HANDSHAKE_REQUEST, HANDSHAKE_RX, HANDSHAKE_TX, PRINTER_TO_CABINET,
};

/// CAN link errors
#[derive(Error, Debug)]
pub enum CanLinkError {
    #[error("CAN I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CAN socket error: {0}")]
    Socket(#[from] socketcan::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake rejected, response {0:02X?}")]
    HandshakeMismatch(Vec<u8>),

    #[error("not connected to the cabinet")]
    NotConnected,

    #[error("send failed after {attempts} attempts: {last_error}")]
    SendFailed { attempts: u32, last_error: String },
}

/// Events surfaced to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanEvent {
    /// Unsolicited cabinet status frame
    Status(StatusReport),
    /// Cabinet asks for the filament bitmap
    FilamentQuery,
    /// Cabinet pushed a validated mapping assignment
    MappingSet { left: u8, right: u8 },
    /// Raw RFID transfer frame for the reassembler
    Rfid([u8; 8]),
    /// The link came back after a reconnect
    Reconnected,
}

impl From<InboundFrame> for CanEvent {
    fn from(frame: InboundFrame) -> Self {
        match frame {
            InboundFrame::FilamentQuery => CanEvent::FilamentQuery,
            InboundFrame::MappingSet { left, right } => CanEvent::MappingSet { left, right },
            InboundFrame::Rfid(data) => CanEvent::Rfid(data),
            InboundFrame::Status(report) => CanEvent::Status(report),
        }
    }
}

/// Link configuration and protocol timings
#[derive(Debug, Clone)]
pub struct CanLinkConfig {
    pub interface: String,
    pub handshake_timeout: Duration,
    pub heartbeat_period: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_interval: Duration,
    pub send_retries: u32,
    pub send_retry_delay: Duration,
}

impl CanLinkConfig {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_period: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(2),
            reconnect_interval: Duration::from_secs(5),
            send_retries: 3,
            send_retry_delay: Duration::from_millis(50),
        }
    }
}

struct CanShared {
    config: CanLinkConfig,
    socket: tokio::sync::RwLock<Option<Arc<CanSocket>>>,
    /// Send critical section so frames never interleave
    send_lock: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    auto_reconnect: AtomicBool,
    /// Single-entry guard for the reconnect driver
    reconnecting: AtomicBool,
    /// Flipped by any inbound `0x05`-prefixed cabinet frame
    heartbeat_ack: AtomicBool,
    event_tx: mpsc::Sender<CanEvent>,
    shutdown: broadcast::Sender<()>,
}

/// Cloneable handle to the CAN link.
#[derive(Clone)]
pub struct CanLink {
    shared: Arc<CanShared>,
}

impl CanLink {
    pub fn new(
        config: CanLinkConfig,
        event_tx: mpsc::Sender<CanEvent>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            shared: Arc::new(CanShared {
                config,
                socket: tokio::sync::RwLock::new(None),
                send_lock: tokio::sync::Mutex::new(()),
                connected: AtomicBool::new(false),
                auto_reconnect: AtomicBool::new(true),
                reconnecting: AtomicBool::new(false),
                heartbeat_ack: AtomicBool::new(false),
                event_tx,
                shutdown,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Open the socket, perform the handshake, then start the receive and
    /// heartbeat loops. Other traffic is only legal after this succeeds.
    pub async fn connect(&self) -> Result<(), CanLinkError> {
        if self.is_connected() {
            return Ok(());
        }

        info!(interface = %self.shared.config.interface, "connecting to CAN bus");
        let socket = CanSocket::open(&self.shared.config.interface)?;

        self.perform_handshake(&socket).await?;

        let socket = Arc::new(socket);
        *self.shared.socket.write().await = Some(socket.clone());
        self.shared.connected.store(true, Ordering::SeqCst);

        tokio::spawn(receive_task(
            self.clone(),
            socket,
            self.shared.shutdown.subscribe(),
        ));
        tokio::spawn(heartbeat_task(self.clone(), self.shared.shutdown.subscribe()));

        info!(interface = %self.shared.config.interface, "CAN handshake complete, link up");
        Ok(())
    }

    /// Disable auto-reconnect, drop the socket, and let the loops wind down.
    pub async fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        *self.shared.socket.write().await = None;
        info!("CAN link disconnected");
    }

    /// Serialize and transmit a command on the data identifier.
    pub async fn send(&self, command: CabinetCommand) -> Result<(), CanLinkError> {
        debug!(%command, "CAN send");
        self.send_raw(PRINTER_TO_CABINET, command.encode()).await
    }

    async fn send_raw(&self, id: u16, data: [u8; 8]) -> Result<(), CanLinkError> {
        if !self.is_connected() {
            self.trigger_reconnect();
            return Err(CanLinkError::NotConnected);
        }
        let socket = {
            let slot = self.shared.socket.read().await;
            slot.clone().ok_or(CanLinkError::NotConnected)?
        };

        let _guard = self.shared.send_lock.lock().await;
        let mut last_error = String::new();
        for attempt in 1..=self.shared.config.send_retries {
            match socket.write_frame(data_frame(id, &data)).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let message = err.to_string();
                    let lowered = message.to_lowercase();
                    if lowered.contains("no such device") || lowered.contains("network is down") {
                        warn!(error = %message, "CAN device gone, link down");
                        self.declare_down("device unavailable");
                        return Err(CanLinkError::SendFailed {
                            attempts: attempt,
                            last_error: message,
                        });
                    }
                    warn!(
                        attempt,
                        retries = self.shared.config.send_retries,
                        error = %message,
                        "CAN send error"
                    );
                    last_error = message;
                    if attempt < self.shared.config.send_retries {
                        tokio::time::sleep(self.shared.config.send_retry_delay).await;
                    }
                }
            }
        }

        self.declare_down("send retries exhausted");
        Err(CanLinkError::SendFailed {
            attempts: self.shared.config.send_retries,
            last_error,
        })
    }

    async fn perform_handshake(&self, socket: &CanSocket) -> Result<(), CanLinkError> {
        socket
            .write_frame(data_frame(HANDSHAKE_TX, &HANDSHAKE_REQUEST))
            .await?;
        debug!("handshake request sent");

        let wait_for_ack = async {
            loop {
                let received = socket.read_frame().await?;
                if frame_id(&received) != Some(HANDSHAKE_RX) {
                    continue;
                }
                let data = received.data().to_vec();
                if data.first() == Some(&HANDSHAKE_ACK) {
                    return Ok(());
                }
                return Err(CanLinkError::HandshakeMismatch(data));
            }
        };

        match tokio::time::timeout(self.shared.config.handshake_timeout, wait_for_ack).await {
            Ok(result) => result,
            Err(_) => Err(CanLinkError::HandshakeTimeout),
        }
    }

    /// Mark the link down and kick the reconnect driver.
    fn declare_down(&self, reason: &str) {
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            warn!(reason, "CAN link declared down");
        }
        self.trigger_reconnect();
    }

    /// Start the reconnect loop unless one is already in flight.
    pub(crate) fn trigger_reconnect(&self) {
        if !self.shared.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }
        if self.shared.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let link = self.clone();
        tokio::spawn(async move {
            info!("CAN reconnect driver started");
            loop {
                if !link.shared.auto_reconnect.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(link.shared.config.reconnect_interval).await;
                match link.connect().await {
                    Ok(()) => {
                        info!("CAN bus reconnected");
                        let _ = link.shared.event_tx.send(CanEvent::Reconnected).await;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            error = %err,
                            seconds = link.shared.config.reconnect_interval.as_secs(),
                            "CAN reconnect failed, will retry"
                        );
                    }
                }
            }
            link.shared.reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

/// Build a classic data frame; both constants are valid 11-bit identifiers.
fn data_frame(id: u16, data: &[u8]) -> CanFrame {
    let id = StandardId::new(id).expect("identifier fits 11 bits");
    CanFrame::new(id, data).expect("payload fits a classic frame")
}

fn frame_id(frame: &CanFrame) -> Option<u16> {
    match frame.id() {
        Id::Standard(id) => Some(id.as_raw()),
        Id::Extended(_) => None,
    }
}

/// Frame data padded to the full 8 bytes (short frames are legal on the
/// handshake path; data frames are always full).
fn padded_data(frame: &CanFrame) -> [u8; 8] {
    let mut data = [0u8; 8];
    let payload = frame.data();
    let len = payload.len().min(8);
    data[..len].copy_from_slice(&payload[..len]);
    data
}

/// Receive loop for one connection. Drops frames with foreign identifiers,
/// feeds the heartbeat latch, and forwards classified events in arrival
/// order. Exits when the socket dies or the link is replaced.
async fn receive_task(link: CanLink, socket: Arc<CanSocket>, mut shutdown: ShutdownReceiver) {
    info!("CAN receive loop started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            received = socket.read_frame() => {
                match received {
                    Ok(received) => {
                        if frame_id(&received) != Some(CABINET_TO_PRINTER) {
                            continue;
                        }
                        let data = padded_data(&received);
                        if data[0] == HANDSHAKE_ACK {
                            link.shared.heartbeat_ack.store(true, Ordering::SeqCst);
                        }
                        match classify(&data) {
                            Some(inbound) => {
                                debug!(?inbound, "cabinet frame");
                                if link.shared.event_tx.send(CanEvent::from(inbound)).await.is_err() {
                                    break;
                                }
                            }
                            None => warn!(data = ?data, "dropped invalid mapping frame"),
                        }
                    }
                    Err(err) => {
                        if link.is_connected() {
                            warn!(error = %err, "CAN receive error");
                            link.declare_down("receive error");
                        }
                        break;
                    }
                }
            }
        }

        if !link.is_connected() {
            break;
        }
    }
    info!("CAN receive loop stopped");
}

/// Heartbeat watchdog: every period, clear the latch, send a heartbeat and
/// wait for the cabinet's `0x05` reply. Two consecutive misses declare the
/// link down; send failures count as misses.
async fn heartbeat_task(link: CanLink, mut shutdown: ShutdownReceiver) {
    info!("CAN heartbeat loop started");
    let mut misses: u32 = 0;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(link.shared.config.heartbeat_period) => {}
        }
        if !link.is_connected() {
            break;
        }

        link.shared.heartbeat_ack.store(false, Ordering::SeqCst);
        let acked = match link.send(CabinetCommand::Heartbeat).await {
            Ok(()) => wait_for_latch(&link, link.shared.config.heartbeat_timeout).await,
            Err(err) => {
                warn!(error = %err, "heartbeat send failed");
                false
            }
        };

        if acked {
            misses = 0;
        } else {
            misses += 1;
            warn!(misses, "heartbeat response missed");
            if misses >= 2 {
                link.declare_down("two consecutive heartbeats missed");
                break;
            }
        }
    }
    info!("CAN heartbeat loop stopped");
}

async fn wait_for_latch(link: &CanLink, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if link.shared.heartbeat_ack.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    link.shared.heartbeat_ack.load(Ordering::SeqCst)
}
