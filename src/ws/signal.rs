//! Signaling channel: relays WebRTC offer/answer/ICE between one
//! broadcaster and the listeners of its station.
//!
//! The relay is best-effort. Lookups that fail, frames from the wrong role,
//! and undeliverable messages are all dropped silently; peers recover
//! through their own WebRTC retry logic.

use crate::registry::{normalize_flat_id, FlatId};
use crate::web::{session_flat, SharedState};
use crate::ws::protocol::{self, SignalFrame};
use crate::ws::{send_json, spawn_writer, Outbound, HEARTBEAT_INTERVAL};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use log::{debug, info};
use rand::RngCore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// WebSocket close code sent with a broadcast denial.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Role of a signaling connection. `Unknown` until `identify` arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRole {
    Unknown,
    Broadcaster,
    Listener,
}

/// One signaling connection, keyed by its server-assigned hex id.
#[derive(Debug)]
pub struct SignalClient {
    pub flat_id: Option<FlatId>,
    pub ip: IpAddr,
    pub role: SignalRole,
    pub listening_to: Option<FlatId>,
    sender: Outbound,
}

/// Outcome of a signaling `identify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyOutcome {
    Accepted,
    /// Another connection already signals for this flat; caller replies with
    /// a denial and closes 1008.
    Denied,
}

/// Signal-plane state: connections plus the broadcaster index.
///
/// Distinct from the presence-side station registry; a station can be live
/// on presence before its broadcaster has identified here.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    clients: HashMap<String, SignalClient>,
    broadcasters: HashMap<FlatId, String>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, id: String, ip: IpAddr, sender: Outbound) {
        self.clients.insert(
            id,
            SignalClient {
                flat_id: None,
                ip,
                role: SignalRole::Unknown,
                listening_to: None,
                sender,
            },
        );
    }

    /// Bind a connection to a flat and role. Broadcasters claim the flat's
    /// slot in the index; a second claim for the same flat is denied and the
    /// existing registration is untouched.
    pub fn identify(&mut self, id: &str, flat_id: FlatId, broadcaster: bool) -> IdentifyOutcome {
        if !self.clients.contains_key(id) {
            return IdentifyOutcome::Accepted;
        }

        if broadcaster {
            match self.broadcasters.get(&flat_id) {
                Some(existing) if existing != id => return IdentifyOutcome::Denied,
                _ => {}
            }
            self.broadcasters.insert(flat_id.clone(), id.to_string());
        }

        if let Some(client) = self.clients.get_mut(id) {
            client.flat_id = Some(flat_id);
            client.role = if broadcaster {
                SignalRole::Broadcaster
            } else {
                SignalRole::Listener
            };
        }
        IdentifyOutcome::Accepted
    }

    /// Remove a connection. The broadcaster index entry goes away only if it
    /// still points at this exact connection.
    pub fn disconnect(&mut self, id: &str) {
        let Some(client) = self.clients.remove(id) else {
            return;
        };
        if let Some(flat_id) = client.flat_id {
            if self.broadcasters.get(&flat_id).map(String::as_str) == Some(id) {
                self.broadcasters.remove(&flat_id);
            }
        }
    }

    /// A listener asks to join a station. `station_live` is the presence
    /// registry's verdict, checked by the caller.
    pub fn handle_join(&mut self, listener_id: &str, target: &str, station_live: bool) {
        let Some(listener) = self.clients.get(listener_id) else {
            return;
        };
        if listener.role != SignalRole::Listener {
            return;
        }

        if !station_live {
            self.send_to(
                listener_id,
                &json!({ "type": "listen:error", "error": "STATION_OFFLINE" }),
            );
            return;
        }
        let Some(broadcaster_id) = self.broadcasters.get(target).cloned() else {
            self.send_to(
                listener_id,
                &json!({ "type": "listen:error", "error": "BROADCASTER_SIGNAL_NOT_READY" }),
            );
            return;
        };

        if let Some(listener) = self.clients.get_mut(listener_id) {
            listener.listening_to = Some(target.to_string());
        }
        self.send_to(
            &broadcaster_id,
            &json!({ "type": "listener:join", "listenerId": listener_id }),
        );
        self.send_to(
            listener_id,
            &json!({ "type": "listen:ok", "targetFlat": target }),
        );
    }

    /// A listener leaves its station; the broadcaster is told which peer
    /// went away.
    pub fn handle_leave(&mut self, listener_id: &str) {
        let target = match self.clients.get_mut(listener_id) {
            Some(client) if client.role == SignalRole::Listener => client.listening_to.take(),
            _ => None,
        };
        let Some(target) = target else {
            return;
        };
        if let Some(broadcaster_id) = self.broadcasters.get(&target).cloned() {
            self.send_to(
                &broadcaster_id,
                &json!({ "type": "listener:leave", "listenerId": listener_id }),
            );
        }
    }

    /// Broadcaster → listener SDP offer.
    pub fn route_offer(&self, broadcaster_id: &str, listener_id: &str, sdp: Value) {
        if self.role_of(broadcaster_id) != Some(SignalRole::Broadcaster) {
            return;
        }
        self.send_to(
            listener_id,
            &json!({ "type": "webrtc:offer", "from": broadcaster_id, "sdp": sdp }),
        );
    }

    /// Listener → broadcaster SDP answer, addressed by the station's flat.
    pub fn route_answer(&self, listener_id: &str, broadcaster_flat: &str, sdp: Value) {
        if self.role_of(listener_id) != Some(SignalRole::Listener) {
            return;
        }
        if let Some(broadcaster_id) = self.broadcasters.get(broadcaster_flat) {
            self.send_to(
                broadcaster_id,
                &json!({ "type": "webrtc:answer", "listenerId": listener_id, "sdp": sdp }),
            );
        }
    }

    /// ICE candidate, either direction; the sender's role picks the route.
    pub fn route_ice(
        &self,
        sender_id: &str,
        listener_id: Option<&str>,
        broadcaster_flat: Option<&str>,
        candidate: Value,
    ) {
        match self.role_of(sender_id) {
            Some(SignalRole::Broadcaster) => {
                let Some(listener_id) = listener_id else {
                    return;
                };
                self.send_to(
                    listener_id,
                    &json!({ "type": "webrtc:ice", "from": sender_id, "candidate": candidate }),
                );
            }
            Some(SignalRole::Listener) => {
                let Some(flat) = broadcaster_flat else {
                    return;
                };
                if let Some(broadcaster_id) = self.broadcasters.get(&normalize_flat_id(flat)) {
                    self.send_to(
                        broadcaster_id,
                        &json!({
                            "type": "webrtc:ice",
                            "listenerId": sender_id,
                            "candidate": candidate,
                        }),
                    );
                }
            }
            _ => {}
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn role_of(&self, id: &str) -> Option<SignalRole> {
        self.clients.get(id).map(|c| c.role)
    }

    fn send_to(&self, id: &str, frame: &Value) {
        if let Some(client) = self.clients.get(id) {
            send_json(&client.sender, frame);
        }
    }

    #[cfg(test)]
    fn broadcaster_for(&self, flat_id: &str) -> Option<&str> {
        self.broadcasters.get(flat_id).map(String::as_str)
    }
}

/// `GET /ws/signal` upgrade, gated by the session cookie like presence.
pub async fn signal_upgrade(
    State(state): State<Arc<SharedState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(session_flat_id) = session_flat(&state, &headers).await else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_signal(socket, state, session_flat_id, addr))
}

async fn handle_signal(
    socket: WebSocket,
    state: Arc<SharedState>,
    session_flat_id: String,
    addr: SocketAddr,
) {
    let (sink, mut stream) = socket.split();
    let (tx, writer) = spawn_writer(sink);

    let id = new_signal_id();
    state
        .signals
        .lock()
        .unwrap()
        .connect(id.clone(), addr.ip(), tx.clone());
    send_json(&tx, &json!({ "type": "hello", "id": id }));
    info!("signal connection {} open from {}", id, addr);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut alive = true;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let flow = apply_frame(&state, &id, &session_flat_id, text.as_str(), &tx);
                    if flow == Flow::Close {
                        let _ = tx.send(Message::Close(Some(CloseFrame {
                            code: CLOSE_POLICY_VIOLATION,
                            reason: "ALREADY_BROADCASTING".into(),
                        })));
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => alive = true,
                Some(Ok(Message::Ping(payload))) => {
                    let _ = tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("signal socket error from {}: {}", addr, e);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if !alive {
                    info!("signal connection {} missed heartbeat, closing", id);
                    break;
                }
                alive = false;
                if tx.send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
        }
    }

    state.signals.lock().unwrap().disconnect(&id);
    drop(tx);
    let _ = writer.await;
    info!("signal connection {} closed", id);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

fn apply_frame(
    state: &SharedState,
    id: &str,
    session_flat_id: &str,
    text: &str,
    tx: &Outbound,
) -> Flow {
    let Some(frame) = protocol::parse_signal(text) else {
        return Flow::Continue;
    };

    match frame {
        SignalFrame::Identify { flat_id, role } => {
            let canonical = normalize_flat_id(&flat_id);
            if canonical != session_flat_id {
                debug!(
                    "signal identify for {} rejected (session is {})",
                    canonical, session_flat_id
                );
                return Flow::Continue;
            }
            let broadcaster = role.as_deref() == Some("broadcaster");
            let outcome = state
                .signals
                .lock()
                .unwrap()
                .identify(id, canonical, broadcaster);
            if outcome == IdentifyOutcome::Denied {
                send_json(
                    tx,
                    &json!({ "type": "broadcast:denied", "reason": "ALREADY_BROADCASTING" }),
                );
                return Flow::Close;
            }
        }
        SignalFrame::ListenJoin { target_flat } => {
            let target = normalize_flat_id(&target_flat);
            let station_live = state.hub.lock().unwrap().station_live(&target);
            state
                .signals
                .lock()
                .unwrap()
                .handle_join(id, &target, station_live);
        }
        SignalFrame::ListenLeave => {
            state.signals.lock().unwrap().handle_leave(id);
        }
        SignalFrame::Offer { listener_id, sdp } => {
            state.signals.lock().unwrap().route_offer(id, &listener_id, sdp);
        }
        SignalFrame::Answer {
            broadcaster_flat,
            sdp,
        } => {
            state.signals.lock().unwrap().route_answer(
                id,
                &normalize_flat_id(&broadcaster_flat),
                sdp,
            );
        }
        SignalFrame::Ice {
            listener_id,
            broadcaster_flat,
            candidate,
        } => {
            state.signals.lock().unwrap().route_ice(
                id,
                listener_id.as_deref(),
                broadcaster_flat.as_deref(),
                candidate,
            );
        }
    }
    Flow::Continue
}

/// 16 hex chars from the thread CSPRNG.
fn new_signal_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    fn attach(reg: &mut SignalRegistry, id: &str) -> UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.connect(id.to_string(), ip(), tx);
        rx
    }

    fn next_frame(rx: &mut UnboundedReceiver<Message>) -> Value {
        match rx.try_recv().expect("frame queued") {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("json frame"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    fn assert_empty(rx: &mut UnboundedReceiver<Message>) {
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn signal_ids_are_sixteen_hex_chars() {
        let id = new_signal_id();
        assert_eq!(id.len(), 16);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(id, new_signal_id());
    }

    #[test]
    fn second_broadcaster_for_same_flat_is_denied() {
        let mut reg = SignalRegistry::new();
        let _rx1 = attach(&mut reg, "b1");
        let _rx2 = attach(&mut reg, "b2");

        assert_eq!(
            reg.identify("b1", "A1".to_string(), true),
            IdentifyOutcome::Accepted
        );
        assert_eq!(
            reg.identify("b2", "A1".to_string(), true),
            IdentifyOutcome::Denied
        );
        assert_eq!(reg.broadcaster_for("A1"), Some("b1"));
    }

    #[test]
    fn re_identify_by_same_connection_is_fine() {
        let mut reg = SignalRegistry::new();
        let _rx = attach(&mut reg, "b1");
        reg.identify("b1", "A1".to_string(), true);
        assert_eq!(
            reg.identify("b1", "A1".to_string(), true),
            IdentifyOutcome::Accepted
        );
    }

    #[test]
    fn join_pairs_listener_with_broadcaster() {
        let mut reg = SignalRegistry::new();
        let mut b_rx = attach(&mut reg, "b1");
        let mut l_rx = attach(&mut reg, "l1");
        reg.identify("b1", "A1".to_string(), true);
        reg.identify("l1", "B2".to_string(), false);

        reg.handle_join("l1", "A1", true);

        let to_broadcaster = next_frame(&mut b_rx);
        assert_eq!(to_broadcaster["type"], "listener:join");
        assert_eq!(to_broadcaster["listenerId"], "l1");

        let to_listener = next_frame(&mut l_rx);
        assert_eq!(to_listener["type"], "listen:ok");
        assert_eq!(to_listener["targetFlat"], "A1");
    }

    #[test]
    fn join_reports_station_offline() {
        let mut reg = SignalRegistry::new();
        let mut l_rx = attach(&mut reg, "l1");
        reg.identify("l1", "B2".to_string(), false);

        reg.handle_join("l1", "A1", false);

        let err = next_frame(&mut l_rx);
        assert_eq!(err["type"], "listen:error");
        assert_eq!(err["error"], "STATION_OFFLINE");
    }

    #[test]
    fn join_reports_broadcaster_not_ready() {
        let mut reg = SignalRegistry::new();
        let mut l_rx = attach(&mut reg, "l1");
        reg.identify("l1", "B2".to_string(), false);

        // Station live on presence but no signaling-side broadcaster yet.
        reg.handle_join("l1", "A1", true);

        let err = next_frame(&mut l_rx);
        assert_eq!(err["type"], "listen:error");
        assert_eq!(err["error"], "BROADCASTER_SIGNAL_NOT_READY");
    }

    #[test]
    fn join_from_unidentified_connection_is_dropped() {
        let mut reg = SignalRegistry::new();
        let mut l_rx = attach(&mut reg, "l1");
        reg.handle_join("l1", "A1", true);
        assert_empty(&mut l_rx);
    }

    #[test]
    fn leave_notifies_broadcaster_once() {
        let mut reg = SignalRegistry::new();
        let mut b_rx = attach(&mut reg, "b1");
        let mut l_rx = attach(&mut reg, "l1");
        reg.identify("b1", "A1".to_string(), true);
        reg.identify("l1", "B2".to_string(), false);
        reg.handle_join("l1", "A1", true);
        next_frame(&mut b_rx);
        next_frame(&mut l_rx);

        reg.handle_leave("l1");
        let frame = next_frame(&mut b_rx);
        assert_eq!(frame["type"], "listener:leave");
        assert_eq!(frame["listenerId"], "l1");

        // No listening_to left; a second leave is silent.
        reg.handle_leave("l1");
        assert_empty(&mut b_rx);
    }

    #[test]
    fn offer_answer_and_ice_round_trip() {
        let mut reg = SignalRegistry::new();
        let mut b_rx = attach(&mut reg, "b1");
        let mut l_rx = attach(&mut reg, "l1");
        reg.identify("b1", "A1".to_string(), true);
        reg.identify("l1", "B2".to_string(), false);

        reg.route_offer("b1", "l1", serde_json::json!({"type": "offer"}));
        let offer = next_frame(&mut l_rx);
        assert_eq!(offer["type"], "webrtc:offer");
        assert_eq!(offer["from"], "b1");

        reg.route_answer("l1", "A1", serde_json::json!({"type": "answer"}));
        let answer = next_frame(&mut b_rx);
        assert_eq!(answer["type"], "webrtc:answer");
        assert_eq!(answer["listenerId"], "l1");

        reg.route_ice("b1", Some("l1"), None, serde_json::json!({"candidate": "x"}));
        let ice_down = next_frame(&mut l_rx);
        assert_eq!(ice_down["type"], "webrtc:ice");
        assert_eq!(ice_down["from"], "b1");

        reg.route_ice("l1", None, Some("a1"), serde_json::json!({"candidate": "y"}));
        let ice_up = next_frame(&mut b_rx);
        assert_eq!(ice_up["type"], "webrtc:ice");
        assert_eq!(ice_up["listenerId"], "l1");
    }

    #[test]
    fn wrong_role_frames_are_dropped() {
        let mut reg = SignalRegistry::new();
        let mut b_rx = attach(&mut reg, "b1");
        let mut l_rx = attach(&mut reg, "l1");
        reg.identify("b1", "A1".to_string(), true);
        reg.identify("l1", "B2".to_string(), false);

        // A listener cannot push offers; a broadcaster cannot answer.
        reg.route_offer("l1", "b1", Value::Null);
        reg.route_answer("b1", "A1", Value::Null);
        assert_empty(&mut b_rx);
        assert_empty(&mut l_rx);
    }

    #[test]
    fn disconnect_frees_broadcaster_slot_only_for_owner() {
        let mut reg = SignalRegistry::new();
        let _b1 = attach(&mut reg, "b1");
        let _b2 = attach(&mut reg, "b2");
        reg.identify("b1", "A1".to_string(), true);
        reg.identify("b2", "A1".to_string(), true); // denied, not registered

        reg.disconnect("b2");
        assert_eq!(reg.broadcaster_for("A1"), Some("b1"));

        reg.disconnect("b1");
        assert!(reg.broadcaster_for("A1").is_none());
        assert_eq!(reg.client_count(), 0);
    }
}
