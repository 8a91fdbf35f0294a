//! WebSocket handler streaming one workflow's step events.
//!
//! `/ws/{id}` upgrades an HTTP connection to a WebSocket. Once connected,
//! the handler:
//!
//! - **Forwards events:** every item of the registry subscription is pushed
//!   as `{workflow_id, timestamp, data}`. When the subscriber lagged, `data`
//!   is `{"type": "lagged", "skipped": n}` instead of a step event.
//! - **Receives commands:** `{"type": "ping"}` and `{"type": "cancel"}`.
//!
//! The server closes the socket once the workflow reaches a terminal state.
//! Disconnecting does **not** cancel the workflow.

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sdlc_core::registry::{EventStream, SubscriptionItem};
use sdlc_types::event::StepEvent;

use crate::http::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Replay transitions already recorded in the checkpoint history first.
    #[serde(default)]
    pub replay: bool,
}

/// Incoming command from a WebSocket client.
///
/// Unknown or malformed messages are logged and ignored.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    /// Request a cooperative stop after the current stage.
    Cancel,
    /// Keep-alive ping. Server responds with `{"type":"pong"}`.
    Ping,
}

#[derive(Debug, Serialize)]
struct WsEnvelope<'a> {
    workflow_id: Uuid,
    timestamp: DateTime<Utc>,
    data: WsData<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WsData<'a> {
    Event(&'a StepEvent),
    Lagged {
        #[serde(rename = "type")]
        kind: &'static str,
        skipped: u64,
    },
}

fn envelope_json(workflow_id: Uuid, item: &SubscriptionItem) -> Result<String, serde_json::Error> {
    let data = match item {
        SubscriptionItem::Event(event) => WsData::Event(event),
        SubscriptionItem::Lagged(skipped) => WsData::Lagged {
            kind: "lagged",
            skipped: *skipped,
        },
    };
    serde_json::to_string(&WsEnvelope {
        workflow_id,
        timestamp: Utc::now(),
        data,
    })
}

/// GET /ws/{id} - Upgrade to a WebSocket streaming step events.
///
/// The subscription is opened before the upgrade so an unknown workflow is
/// answered with a plain 404.
pub async fn workflow_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Query(params): Query<WsParams>,
) -> Result<Response, AppError> {
    let events = state.registry.subscribe(workflow_id, params.replay).await?;
    tracing::debug!(%workflow_id, replay = params.replay, "WebSocket subscriber attached");
    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, state, workflow_id, events)))
}

/// Multiplexes subscription items out and client commands in on one task.
async fn handle_ws_connection(
    socket: WebSocket,
    state: AppState,
    workflow_id: Uuid,
    mut events: EventStream,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    loop {
        tokio::select! {
            item = events.next() => {
                let Some(item) = item else {
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: Utf8Bytes::from_static("workflow finished"),
                    }));
                    let _ = ws_sender.send(close).await;
                    break;
                };
                match envelope_json(workflow_id, &item) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            // Client disconnected
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%workflow_id, "Failed to serialize step event: {err}");
                    }
                }
            }

            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        process_command(text.as_str(), &state, workflow_id, &mut ws_sender).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!("WebSocket receive error: {err}");
                        break;
                    }
                    // Binary, ping and pong frames are handled by axum
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!(%workflow_id, "WebSocket connection closed");
}

/// Parse and process a single command from the WebSocket client.
async fn process_command(
    text: &str,
    state: &AppState,
    workflow_id: Uuid,
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
) {
    let cmd: WsCommand = match serde_json::from_str(text) {
        Ok(cmd) => cmd,
        Err(err) => {
            tracing::warn!(raw = %text, error = %err, "Ignoring malformed WebSocket command");
            return;
        }
    };

    let reply = match cmd {
        WsCommand::Cancel => match state.registry.cancel(workflow_id).await {
            Ok(()) => r#"{"type":"cancel_requested"}"#.to_string(),
            Err(err) => serde_json::json!({"type": "error", "message": err.to_string()}).to_string(),
        },
        WsCommand::Ping => r#"{"type":"pong"}"#.to_string(),
    };

    if ws_sender.send(Message::Text(reply.into())).await.is_err() {
        tracing::debug!("Failed to send reply (client disconnecting)");
    }
}
