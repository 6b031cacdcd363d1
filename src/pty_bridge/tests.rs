use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc as futures_mpsc;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use crate::container_runtime::pty::PtyHandle;
use crate::pty_bridge::bridge::{BridgeConfig, BridgeOutcome, PtyBridge, TransportMode};
use crate::pty_bridge::frames::MAX_FRAME_BYTES;
use crate::storage::MetadataStore;

type BridgeSlot = Arc<Mutex<Option<(PtyBridge, PtyHandle, oneshot::Sender<BridgeOutcome>)>>>;

struct Harness {
    pty_stdin: DuplexStream,
    pty_feed: futures_mpsc::UnboundedSender<Vec<u8>>,
    outcome: oneshot::Receiver<BridgeOutcome>,
    cancel: Arc<Notify>,
    store: Arc<MetadataStore>,
    session_id: Uuid,
    slot: BridgeSlot,
}

impl Harness {
    /// One-shot websocket route that runs the harnessed bridge on the
    /// first `/pty` upgrade.
    fn route(
        &self,
    ) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone + Send + Sync + 'static
    {
        let slot = self.slot.clone();
        let cancel = self.cancel.clone();
        warp::path!("pty")
            .and(warp::ws())
            .map(move |ws: warp::ws::Ws| {
                let slot = slot.clone();
                let cancel = cancel.clone();
                ws.on_upgrade(move |socket| async move {
                    let (bridge, pty, outcome_tx) = slot.lock().unwrap().take().unwrap();
                    let outcome = bridge.run(socket, pty, cancel).await;
                    let _ = outcome_tx.send(outcome);
                })
            })
    }
}

/// Builds a bridge wired to a fake PTY: an in-memory byte stream for
/// output, a duplex pipe for stdin.
async fn harness(mode: TransportMode, config: BridgeConfig) -> Harness {
    let store = Arc::new(MetadataStore::connect_in_memory().await.unwrap());
    let session_id = Uuid::new_v4();

    let (pty_feed, feed_rx) = futures_mpsc::unbounded::<Vec<u8>>();
    let (pty_stdin, bridge_side) = tokio::io::duplex(256 * 1024);
    let pty = PtyHandle::new(Box::pin(feed_rx), Box::pin(bridge_side), None);

    let cancel = Arc::new(Notify::new());
    let bridge = PtyBridge::with_config(
        session_id,
        "alice".to_string(),
        mode,
        store.clone(),
        config,
    );
    let (outcome_tx, outcome) = oneshot::channel();

    Harness {
        pty_stdin,
        pty_feed,
        outcome,
        cancel,
        store,
        session_id,
        slot: Arc::new(Mutex::new(Some((bridge, pty, outcome_tx)))),
    }
}

async fn read_exact(stdin: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut collected = vec![0u8; len];
    stdin.read_exact(&mut collected).await.unwrap();
    collected
}

#[tokio::test]
async fn text_frames_reach_pty_stdin_verbatim() {
    let mut h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    client.send(warp::ws::Message::text("echo hi\n")).await;
    assert_eq!(read_exact(&mut h.pty_stdin, 8).await, b"echo hi\n");
}

#[tokio::test]
async fn binary_frames_pass_control_characters_through() {
    let mut h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    // Ctrl-C, Ctrl-D, Ctrl-X, Ctrl-Z and an arrow-key escape sequence.
    let raw = vec![0x03, 0x04, 0x18, 0x1a, 0x1b, b'[', b'A'];
    client.send(warp::ws::Message::binary(raw.clone())).await;
    assert_eq!(read_exact(&mut h.pty_stdin, raw.len()).await, raw);
}

#[tokio::test]
async fn upstream_bytes_preserve_order_across_frames() {
    let mut h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    client.send(warp::ws::Message::text("first ")).await;
    client
        .send(warp::ws::Message::binary(b"second ".to_vec()))
        .await;
    client.send(warp::ws::Message::text("third")).await;

    assert_eq!(
        read_exact(&mut h.pty_stdin, "first second third".len()).await,
        b"first second third"
    );
}

#[tokio::test]
async fn pty_output_arrives_as_binary_frames() {
    let h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    h.pty_feed.unbounded_send(b"hi\r\n".to_vec()).unwrap();

    let message = client.recv().await.unwrap();
    assert!(message.is_binary());
    assert_eq!(message.as_bytes(), b"hi\r\n");
}

#[tokio::test]
async fn json_mode_wraps_output_and_signals_exit() {
    let h = harness(TransportMode::Json, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    h.pty_feed.unbounded_send(b"hello".to_vec()).unwrap();

    let message = client.recv().await.unwrap();
    let payload: serde_json::Value = serde_json::from_str(message.to_str().unwrap()).unwrap();
    assert_eq!(payload["type"], "pty_output");
    assert_eq!(payload["data"], "hello");

    // Closing the PTY stream ends the session with an exit notice.
    drop(h.pty_feed);
    let exit = client.recv().await.unwrap();
    let payload: serde_json::Value = serde_json::from_str(exit.to_str().unwrap()).unwrap();
    assert_eq!(payload["type"], "exit_interactive");

    let outcome = h.outcome.await.unwrap();
    assert_eq!(outcome, BridgeOutcome::PtyEof);
}

#[tokio::test]
async fn resize_control_is_consumed_not_forwarded() {
    let mut h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    client
        .send(warp::ws::Message::text(r#"{"resize":[132,40]}"#))
        .await;
    client.send(warp::ws::Message::text("after")).await;

    // Only the data frame lands on stdin; the control was consumed.
    assert_eq!(read_exact(&mut h.pty_stdin, 5).await, b"after");
}

#[tokio::test]
async fn frame_at_limit_passes_one_over_closes() {
    let mut h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    let exact = vec![b'x'; MAX_FRAME_BYTES];
    client.send(warp::ws::Message::binary(exact.clone())).await;
    assert_eq!(read_exact(&mut h.pty_stdin, exact.len()).await, exact);

    client
        .send(warp::ws::Message::binary(vec![b'x'; MAX_FRAME_BYTES + 1]))
        .await;

    let outcome = h.outcome.await.unwrap();
    assert!(matches!(outcome, BridgeOutcome::SecurityViolation(_)));

    let audit = h.store.audit_for_session(h.session_id, 10).await.unwrap();
    assert!(audit.iter().any(|r| r.kind == "security.violation"));
}

#[tokio::test]
async fn malformed_control_flood_terminates() {
    let h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    for _ in 0..20 {
        client.send(warp::ws::Message::text("{broken json")).await;
    }

    let outcome = h.outcome.await.unwrap();
    assert!(matches!(outcome, BridgeOutcome::SecurityViolation(_)));
}

#[tokio::test]
async fn unknown_controls_are_dropped_silently() {
    let mut h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    // Well-formed but unrecognized controls never count as violations.
    for _ in 0..20 {
        client
            .send(warp::ws::Message::text(r#"{"scroll":[1,2]}"#))
            .await;
    }
    client.send(warp::ws::Message::text("still alive")).await;
    assert_eq!(read_exact(&mut h.pty_stdin, 11).await, b"still alive");
}

#[tokio::test]
async fn silent_client_hits_idle_timeout() {
    let config = BridgeConfig {
        ping_interval: Duration::from_millis(10),
        idle_timeout: Duration::from_millis(50),
        ..BridgeConfig::default()
    };
    let h = harness(TransportMode::Binary, config).await;
    // Connect but never read or write: pings go unanswered.
    let _client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), h.outcome)
        .await
        .expect("bridge should time out")
        .unwrap();
    assert_eq!(outcome, BridgeOutcome::IdleTimeout);
}

#[tokio::test]
async fn manager_cancel_stops_the_bridge() {
    let h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let _client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    h.cancel.notify_one();

    let outcome = tokio::time::timeout(Duration::from_secs(5), h.outcome)
        .await
        .expect("bridge should cancel")
        .unwrap();
    assert_eq!(outcome, BridgeOutcome::Cancelled);
}

#[tokio::test]
async fn client_close_detaches_cleanly() {
    let h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let mut client = warp::test::ws().path("/pty").handshake(h.route()).await.unwrap();

    client.send(warp::ws::Message::close()).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), h.outcome)
        .await
        .expect("bridge should finish")
        .unwrap();
    assert_eq!(outcome, BridgeOutcome::ClientClosed);
}

/// Close-code check over a real socket; warp's test client does not
/// expose close frames.
#[tokio::test]
async fn oversized_frame_closes_with_4011() {
    use tokio_tungstenite::tungstenite::Message as TungMessage;

    let h = harness(TransportMode::Binary, BridgeConfig::default()).await;
    let (addr, server) = warp::serve(h.route()).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/pty", addr))
        .await
        .expect("connect");

    socket
        .send(TungMessage::Binary(vec![0u8; MAX_FRAME_BYTES + 1]))
        .await
        .unwrap();

    let mut close_code = None;
    while let Some(Ok(message)) = socket.next().await {
        if let TungMessage::Close(Some(frame)) = message {
            close_code = Some(u16::from(frame.code));
            break;
        }
    }
    assert_eq!(close_code, Some(4011));
}
