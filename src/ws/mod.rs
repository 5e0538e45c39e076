//! WebSocket channels: presence and signaling.
//!
//! Both channels share the writer-task plumbing and the ping/pong liveness
//! discipline; the per-channel frame handling lives in the submodules.

pub mod presence;
pub mod protocol;
pub mod signal;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Ping cadence. A connection that has not ponged by the next tick is
/// terminated and cleaned up like a normal close.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Outbound frame channel for one connection.
pub type Outbound = mpsc::UnboundedSender<Message>;

/// Spawn the writer task draining an unbounded channel into the socket sink.
///
/// Writes never block frame handling; when the peer stalls or goes away the
/// sink errors, the task ends, and queued frames are dropped with it.
pub fn spawn_writer(mut sink: SplitSink<WebSocket, Message>) -> (Outbound, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });
    (tx, handle)
}

/// Serialize a JSON frame and queue it, best-effort.
pub fn send_json(tx: &Outbound, frame: &serde_json::Value) {
    let _ = tx.send(Message::Text(frame.to_string().into()));
}
