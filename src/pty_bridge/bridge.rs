//! The per-session byte pump between a client stream and a container PTY.
//!
//! One bridge instance exists per (session, client stream) pair. It runs
//! four tasks: the upstream pump (client frames -> ordered PTY operation
//! queue), the PTY writer, the downstream pump (PTY chunks -> coalesced
//! frames), and the outbound sender that owns the socket sink. A
//! supervisor awaits whichever pump finishes first and tears the rest
//! down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::container_runtime::{PtyHandle, PtyInput, PtyOutput};
use crate::pty_bridge::frames::{
    classify_text, ControlMessage, FloodWindow, InboundFrame, BAD_FRAME_LIMIT, BAD_FRAME_WINDOW,
    COALESCE_WINDOW, MAX_COALESCED_BYTES, MAX_FRAME_BYTES, PUMP_CHANNEL_CAPACITY,
};
use crate::storage::types::{AuditKind, SecuritySeverity};
use crate::storage::MetadataStore;

/// Minimum spacing of `last_activity_at` refreshes driven by traffic.
const TOUCH_INTERVAL: Duration = Duration::from_secs(5);

/// Downstream frame encoding negotiated by the transport path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// `/pty`: raw binary frames.
    Binary,
    /// `/ws`: JSON text frames only.
    Json,
}

impl TransportMode {
    fn encode_output(&self, bytes: Vec<u8>) -> Message {
        match self {
            TransportMode::Binary => Message::binary(bytes),
            TransportMode::Json => Message::text(
                serde_json::json!({
                    "type": "pty_output",
                    "data": String::from_utf8_lossy(&bytes),
                })
                .to_string(),
            ),
        }
    }
}

/// Why the bridge returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Clean close frame from the client.
    ClientClosed,
    /// Transport died without a close handshake.
    ClientGone,
    /// The PTY reached end of stream (shell or container exited).
    PtyEof,
    /// Client silent past the heartbeat budget.
    IdleTimeout,
    /// A frame write exceeded its deadline.
    SendTimeout,
    /// Protocol violation; the session is terminated.
    SecurityViolation(String),
    /// The session manager cancelled the attachment.
    Cancelled,
}

impl BridgeOutcome {
    fn close_frame(&self) -> Option<Message> {
        match self {
            BridgeOutcome::ClientClosed => Some(Message::close()),
            BridgeOutcome::PtyEof => Some(Message::close_with(1000u16, "session detached")),
            BridgeOutcome::Cancelled => Some(Message::close_with(1000u16, "session terminated")),
            BridgeOutcome::IdleTimeout => Some(Message::close_with(4008u16, "idle timeout")),
            BridgeOutcome::SecurityViolation(_) => {
                Some(Message::close_with(4011u16, "security violation"))
            }
            BridgeOutcome::ClientGone | BridgeOutcome::SendTimeout => None,
        }
    }
}

/// Tunables; production uses the defaults, tests shrink them.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub send_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            send_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(100),
        }
    }
}

/// Operations bound for the PTY, sequenced through one queue so resize
/// stays ordered after the writes that preceded it.
enum PtyOp {
    Data(Vec<u8>),
    Resize(u16, u16),
}

pub struct PtyBridge {
    session_id: Uuid,
    user_id: String,
    mode: TransportMode,
    store: Arc<MetadataStore>,
    config: BridgeConfig,
}

impl PtyBridge {
    pub fn new(
        session_id: Uuid,
        user_id: String,
        mode: TransportMode,
        store: Arc<MetadataStore>,
    ) -> Self {
        Self::with_config(session_id, user_id, mode, store, BridgeConfig::default())
    }

    pub fn with_config(
        session_id: Uuid,
        user_id: String,
        mode: TransportMode,
        store: Arc<MetadataStore>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            session_id,
            user_id,
            mode,
            store,
            config,
        }
    }

    /// Pumps until either side ends, the heartbeat budget is spent, or
    /// the manager cancels. Always consumes the socket and the PTY.
    pub async fn run(
        self,
        socket: WebSocket,
        pty: PtyHandle,
        cancel: Arc<Notify>,
    ) -> BridgeOutcome {
        let session_id = self.session_id;
        debug!("Bridge starting for session {}", session_id);

        let (ws_sink, ws_stream) = socket.split();
        let (pty_out, pty_in) = pty.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(PUMP_CHANNEL_CAPACITY);
        let (op_tx, op_rx) = mpsc::channel::<PtyOp>(PUMP_CHANNEL_CAPACITY);

        let mut sender_task = tokio::spawn(sender_loop(ws_sink, out_rx, self.config.send_timeout));
        let mut down_task = tokio::spawn(downstream_pump(
            pty_out,
            out_tx.clone(),
            self.mode,
            self.store.clone(),
            session_id,
        ));
        let mut up_task = tokio::spawn(upstream_pump(
            ws_stream,
            op_tx,
            out_tx.clone(),
            self.config.clone(),
            self.store.clone(),
            session_id,
        ));
        let mut write_task = tokio::spawn(pty_write_loop(op_rx, pty_in));

        let mut sender_done = false;
        let outcome = tokio::select! {
            up = &mut up_task => up.unwrap_or(BridgeOutcome::ClientGone),
            down = &mut down_task => down.unwrap_or(BridgeOutcome::PtyEof),
            send = &mut sender_task => {
                sender_done = true;
                send.unwrap_or(BridgeOutcome::ClientGone)
            }
            _ = cancel.notified() => {
                // Give in-flight PTY writes a moment to drain.
                tokio::time::sleep(self.config.drain_timeout).await;
                BridgeOutcome::Cancelled
            }
        };

        up_task.abort();
        down_task.abort();

        if let BridgeOutcome::SecurityViolation(detail) = &outcome {
            self.record_violation(detail).await;
        }

        if sender_done {
            drop(out_tx);
        } else {
            if let Some(close) = outcome.close_frame() {
                let _ = out_tx.send(close).await;
            }
            drop(out_tx);
            let _ = timeout(Duration::from_secs(1), &mut sender_task).await;
            sender_task.abort();
        }

        // The upstream abort dropped the op sender; let the writer drain
        // what was queued, then cut it loose.
        let _ = timeout(Duration::from_millis(500), &mut write_task).await;
        write_task.abort();

        info!("Bridge for session {} finished: {:?}", session_id, outcome);
        outcome
    }

    async fn record_violation(&self, detail: &str) {
        warn!(
            "Security violation on session {}: {}",
            self.session_id, detail
        );
        let now = Utc::now();
        if let Err(e) = self
            .store
            .append_security(
                Some(self.session_id),
                &self.user_id,
                "stream_violation",
                SecuritySeverity::Critical,
                Some(detail),
                now,
            )
            .await
        {
            debug!("Failed to record security event: {}", e);
        }
        if let Err(e) = self
            .store
            .append_audit(
                Some(self.session_id),
                &self.user_id,
                AuditKind::SecurityViolation,
                serde_json::json!({"detail": detail}),
                now,
            )
            .await
        {
            debug!("Failed to record violation audit: {}", e);
        }
    }
}

/// Owns the socket sink; everything outbound funnels through here.
async fn sender_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    send_timeout: Duration,
) -> BridgeOutcome {
    while let Some(message) = out_rx.recv().await {
        match timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Client send failed: {}", e);
                return BridgeOutcome::ClientGone;
            }
            Err(_) => {
                warn!("Client frame write exceeded {:?}", send_timeout);
                return BridgeOutcome::SendTimeout;
            }
        }
    }
    let _ = sink.close().await;
    BridgeOutcome::ClientClosed
}

/// PTY -> client. Chunks are coalesced when the next one arrives within
/// the coalesce window and the batch stays under the payload ceiling.
async fn downstream_pump(
    mut pty_out: PtyOutput,
    out_tx: mpsc::Sender<Message>,
    mode: TransportMode,
    store: Arc<MetadataStore>,
    session_id: Uuid,
) -> BridgeOutcome {
    let mut carry: Option<Vec<u8>> = None;
    let mut eof = false;
    let mut last_touch = Instant::now();

    loop {
        let first = match carry.take() {
            Some(chunk) => Some(chunk),
            None if eof => None,
            None => pty_out.read_chunk().await,
        };

        let Some(mut batch) = first else {
            if mode == TransportMode::Json {
                let _ = out_tx
                    .send(Message::text(r#"{"type":"exit_interactive"}"#.to_string()))
                    .await;
            }
            return BridgeOutcome::PtyEof;
        };

        while !eof && batch.len() < MAX_COALESCED_BYTES {
            match timeout(COALESCE_WINDOW, pty_out.read_chunk()).await {
                Ok(Some(next)) => {
                    if batch.len() + next.len() > MAX_COALESCED_BYTES {
                        carry = Some(next);
                        break;
                    }
                    batch.extend_from_slice(&next);
                }
                Ok(None) => eof = true,
                Err(_) => break,
            }
        }

        if out_tx.send(mode.encode_output(batch)).await.is_err() {
            return BridgeOutcome::ClientGone;
        }

        if last_touch.elapsed() >= TOUCH_INTERVAL {
            let _ = store.touch(session_id, Utc::now()).await;
            last_touch = Instant::now();
        }
    }
}

/// Client -> PTY operation queue, plus heartbeat accounting.
async fn upstream_pump(
    mut ws_stream: SplitStream<WebSocket>,
    op_tx: mpsc::Sender<PtyOp>,
    out_tx: mpsc::Sender<Message>,
    config: BridgeConfig,
    store: Arc<MetadataStore>,
    session_id: Uuid,
) -> BridgeOutcome {
    let mut flood = FloodWindow::new(BAD_FRAME_WINDOW, BAD_FRAME_LIMIT);
    let mut last_activity = Instant::now();
    let mut last_touch = Instant::now();

    loop {
        let message = match timeout(config.ping_interval, ws_stream.next()).await {
            Err(_) => {
                if last_activity.elapsed() > config.idle_timeout {
                    return BridgeOutcome::IdleTimeout;
                }
                if out_tx.send(Message::ping(Vec::new())).await.is_err() {
                    return BridgeOutcome::ClientGone;
                }
                continue;
            }
            Ok(None) => return BridgeOutcome::ClientGone,
            Ok(Some(Err(e))) => {
                debug!("WebSocket receive error: {}", e);
                return BridgeOutcome::ClientGone;
            }
            Ok(Some(Ok(message))) => message,
        };

        last_activity = Instant::now();

        if message.is_close() {
            return BridgeOutcome::ClientClosed;
        }
        if message.is_ping() || message.is_pong() {
            continue;
        }

        let frame_len = message.as_bytes().len();
        if frame_len > MAX_FRAME_BYTES {
            return BridgeOutcome::SecurityViolation(format!(
                "frame of {} bytes exceeds the {} byte limit",
                frame_len, MAX_FRAME_BYTES
            ));
        }

        if message.is_binary() {
            if op_tx.send(PtyOp::Data(message.into_bytes())).await.is_err() {
                return BridgeOutcome::PtyEof;
            }
        } else if message.is_text() {
            let Ok(text) = message.to_str() else {
                continue;
            };
            match classify_text(text) {
                InboundFrame::Data(bytes) => {
                    if op_tx.send(PtyOp::Data(bytes)).await.is_err() {
                        return BridgeOutcome::PtyEof;
                    }
                }
                InboundFrame::Control(ControlMessage::Resize { cols, rows }) => {
                    if op_tx.send(PtyOp::Resize(cols, rows)).await.is_err() {
                        return BridgeOutcome::PtyEof;
                    }
                }
                InboundFrame::Ignored => {}
                InboundFrame::Malformed => {
                    if flood.record(Instant::now()) {
                        return BridgeOutcome::SecurityViolation(
                            "malformed control frame flood".to_string(),
                        );
                    }
                }
            }
        }

        if last_touch.elapsed() >= TOUCH_INTERVAL {
            let _ = store.touch(session_id, Utc::now()).await;
            last_touch = Instant::now();
        }
    }
}

/// Applies queued operations to the PTY in arrival order.
async fn pty_write_loop(mut op_rx: mpsc::Receiver<PtyOp>, mut pty_in: PtyInput) {
    while let Some(op) = op_rx.recv().await {
        match op {
            PtyOp::Data(bytes) => {
                if let Err(e) = pty_in.write(&bytes).await {
                    debug!("PTY write failed: {}", e);
                    break;
                }
            }
            PtyOp::Resize(cols, rows) => {
                if let Err(e) = pty_in.resize(cols, rows).await {
                    debug!("PTY resize to {}x{} failed: {}", cols, rows, e);
                }
            }
        }
    }
    pty_in.shutdown().await;
}
