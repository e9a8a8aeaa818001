use crate::state::RecognitionNodeState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use common::attendance::CycleReport;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Ping,
    Pong,
    Report { report: CycleReport },
    /// Reports dropped because this client fell behind
    Lagged { skipped: u64 },
    Error { message: String },
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only forward reports of this camera
    pub camera_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RecognitionNodeState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.camera_id))
}

/// Serialize a message for the socket. A message that fails to serialize is
/// replaced by an `error` message so the client sees the gap.
fn encode(msg: &WsMessage) -> Message {
    match serde_json::to_string(msg) {
        Ok(text) => Message::Text(text),
        Err(e) => {
            warn!(error = %e, "failed to encode event message");
            let fallback = WsMessage::Error {
                message: format!("failed to encode event: {}", e),
            };
            Message::Text(
                serde_json::to_string(&fallback)
                    .unwrap_or_else(|_| r#"{"type":"error","message":"encode failed"}"#.to_string()),
            )
        }
    }
}

/// Reply to one text frame from the client
fn reply_to(text: &str) -> Option<WsMessage> {
    match serde_json::from_str::<WsMessage>(text) {
        Ok(WsMessage::Ping) => Some(WsMessage::Pong),
        Ok(_) => None,
        Err(e) => Some(WsMessage::Error {
            message: format!("unrecognized message: {}", e),
        }),
    }
}

/// Wait until either task ends, then abort the other one
async fn join_first(mut send_task: JoinHandle<()>, mut recv_task: JoinHandle<()>) {
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn handle_socket(socket: WebSocket, state: RecognitionNodeState, camera_id: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let mut reports = state.subscribe_reports();
    let shutdown = state.shutdown_token();
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel::<WsMessage>(8);

    info!(camera_id = ?camera_id, "event subscriber connected");

    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(reply) = reply_rx.recv() => reply,
                received = reports.recv() => match received {
                    Ok(report) => {
                        if camera_id.as_deref().is_some_and(|id| id != report.camera_id) {
                            continue;
                        }
                        WsMessage::Report { report }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagging, reports dropped");
                        WsMessage::Lagged { skipped }
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            if sender.send(encode(&msg)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Some(reply) = reply_to(&text) {
                        if reply_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => {
                    debug!("event subscriber closed the socket");
                    break;
                }
                _ => {}
            }
        }
    });

    join_first(send_task, recv_task).await;
    info!("event subscriber disconnected");
}
