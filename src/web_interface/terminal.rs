//! Stream transport endpoints.
//!
//! `/pty/{session_id}` negotiates binary frames, `/ws/{session_id}` the
//! legacy JSON-text framing. Both bind the session to one bridge after
//! claiming it through the session manager.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

use crate::error_handling::types::SessionError;
use crate::pty_bridge::{BridgeOutcome, PtyBridge, TransportMode};
use crate::session_management::AttachmentEnd;
use crate::web_interface::routes::AppState;

pub fn terminal_routes(
    state: AppState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let pty_state = state.clone();
    let pty = warp::path!("pty" / String)
        .and(warp::ws())
        .map(move |raw_id: String, ws: warp::ws::Ws| {
            let state = pty_state.clone();
            ws.on_upgrade(move |socket| {
                handle_terminal(socket, raw_id, TransportMode::Binary, state)
            })
        });

    let ws_state = state;
    let ws = warp::path!("ws" / String)
        .and(warp::ws())
        .map(move |raw_id: String, ws: warp::ws::Ws| {
            let state = ws_state.clone();
            ws.on_upgrade(move |socket| {
                handle_terminal(socket, raw_id, TransportMode::Json, state)
            })
        });

    pty.or(ws)
}

async fn handle_terminal(
    socket: WebSocket,
    raw_id: String,
    mode: TransportMode,
    state: AppState,
) {
    let id = match Uuid::parse_str(&raw_id) {
        Ok(id) => id,
        Err(_) => {
            warn!("Rejecting stream with invalid session id {:?}", raw_id);
            close(socket, 4001, "invalid session id").await;
            return;
        }
    };

    let attached = match state.sessions.attach(id).await {
        Ok(attached) => attached,
        Err(SessionError::NotFound) => {
            close(socket, 4001, "unknown session").await;
            return;
        }
        Err(SessionError::NotAttachable(status)) => {
            debug!("Session {} not attachable ({})", id, status);
            close(socket, 4003, "session not attachable").await;
            return;
        }
        Err(e) => {
            warn!("Attach of session {} failed: {}", id, e);
            close(socket, 4003, "session not attachable").await;
            return;
        }
    };

    info!("Client attached to session {} ({:?})", id, mode);

    let bridge = PtyBridge::new(
        id,
        attached.session.user_id.clone(),
        mode,
        state.store.clone(),
    );
    let outcome = bridge.run(socket, attached.pty, attached.cancel).await;

    let end = match outcome {
        BridgeOutcome::SecurityViolation(_) => AttachmentEnd::SecurityViolation,
        _ => AttachmentEnd::Detached,
    };
    state.sessions.finish_attachment(id, end).await;
}

/// Rejects a connection post-upgrade with a close code; the HTTP layer
/// has already committed to the websocket at this point.
async fn close(socket: WebSocket, code: u16, reason: &'static str) {
    let (mut sink, _stream) = socket.split();
    let _ = sink.send(Message::close_with(code, reason)).await;
    let _ = sink.close().await;
}
