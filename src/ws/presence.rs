//! Presence channel: one connection per client, driving role transitions
//! and station membership in the hub.

use crate::registry::{normalize_flat_id, ConnId, StartOutcome};
use crate::web::{session_flat, SharedState};
use crate::ws::protocol::{self, PresenceFrame};
use crate::ws::{send_json, spawn_writer, Outbound, HEARTBEAT_INTERVAL};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use log::{debug, info};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

/// `GET /ws/presence` upgrade. The session cookie is checked before the
/// handshake completes; the session's flat is the only id this connection
/// may identify as.
pub async fn presence_upgrade(
    State(state): State<Arc<SharedState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(session_flat_id) = session_flat(&state, &headers).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_presence(socket, state, session_flat_id, addr))
}

async fn handle_presence(
    socket: WebSocket,
    state: Arc<SharedState>,
    session_flat_id: String,
    addr: SocketAddr,
) {
    let (sink, mut stream) = socket.split();
    let (tx, writer) = spawn_writer(sink);

    let conn = ConnId::next();
    state.hub.lock().unwrap().connect(conn, addr.ip());
    info!("presence connection open from {}", addr);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut alive = true;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    apply_frame(&state, conn, &session_flat_id, text.as_str(), &tx);
                }
                Some(Ok(Message::Pong(_))) => alive = true,
                Some(Ok(Message::Ping(payload))) => {
                    let _ = tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("presence socket error from {}: {}", addr, e);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if !alive {
                    info!("presence connection from {} missed heartbeat, closing", addr);
                    break;
                }
                alive = false;
                if tx.send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
        }
    }

    state.hub.lock().unwrap().disconnect(conn);
    drop(tx);
    let _ = writer.await;
    info!("presence connection from {} closed", addr);
}

/// Apply one frame to the hub. Every effect happens under a single lock
/// acquisition, so other frames and close cleanup never see partial state.
fn apply_frame(
    state: &SharedState,
    conn: ConnId,
    session_flat_id: &str,
    text: &str,
    tx: &Outbound,
) {
    let Some(frame) = protocol::parse_presence(text) else {
        return;
    };

    match frame {
        PresenceFrame::Identify { flat_id } => {
            let canonical = normalize_flat_id(&flat_id);
            if canonical != session_flat_id {
                debug!(
                    "presence identify for {} rejected (session is {})",
                    canonical, session_flat_id
                );
                return;
            }
            state.hub.lock().unwrap().identify(conn, canonical);
        }
        PresenceFrame::BroadcastStart => {
            let outcome = state.hub.lock().unwrap().start_broadcast(conn);
            if outcome == StartOutcome::AlreadyBroadcasting {
                send_json(
                    tx,
                    &json!({ "type": "broadcast:denied", "reason": "ALREADY_BROADCASTING" }),
                );
            }
        }
        PresenceFrame::BroadcastStop => {
            state.hub.lock().unwrap().stop_broadcast(conn);
        }
        PresenceFrame::BroadcastStatus {
            mic_on,
            sys_on,
            ptt,
            speaking,
            mic_level,
        } => {
            let audio = protocol::audio_status(&mic_on, &sys_on, &ptt, &speaking, &mic_level);
            state.hub.lock().unwrap().update_audio(conn, audio);
        }
        PresenceFrame::ListenStart { target_flat } => {
            state
                .hub
                .lock()
                .unwrap()
                .start_listen(conn, normalize_flat_id(&target_flat));
        }
        PresenceFrame::ListenStop => {
            state.hub.lock().unwrap().stop_listen(conn);
        }
    }
}
