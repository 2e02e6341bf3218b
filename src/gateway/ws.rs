//! Realtime channel handler.
//!
//! Protocol (JSON text frames):
//! ```text
//! Server -> Client: {"event":"connected","data":{"id":"<correlation id>"}}
//! Client -> Server: {"event":"notify"}
//! Server -> Client: {"event":"authenticated","data":{"token":"...","to":"...","userId":1,"username":"...","name":"...","expiresIn":300}}
//! Client -> Server: {"event":"verify","data":"<token>"}
//! Client -> Server: {"event":"verify","data":{"token":"...","apiSecret":"..."}}
//! Server -> Client: {"event":"tokenValid","data":{"username":"...","userId":1,"name":"..."}}
//! Server -> Client: {"event":"tokenError","data":{"kind":"expired","message":"..."}}
//! ```

use super::hub::ServerEvent;
use super::AppState;
use crate::token;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};

/// GET /ws: WebSocket upgrade for the realtime channel
pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (id, mut outbound) = state.hub.register();
    tracing::debug!(correlation_id = %id, "Realtime client connected");

    if let Err(e) = send_event(&mut sender, &ServerEvent::Connected { id: id.clone() }).await {
        tracing::debug!(correlation_id = %id, "Realtime client dropped before greeting: {e:#}");
        state.hub.unregister(&id);
        return;
    }

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if let Some(reply) = handle_frame(&state, &id, &text) {
                    if let Err(e) = send_event(&mut sender, &reply).await {
                        tracing::debug!(correlation_id = %id, "{e:#}");
                        break;
                    }
                }
            }
            event = outbound.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = send_event(&mut sender, &event).await {
                    tracing::debug!(correlation_id = %id, "{e:#}");
                    break;
                }
            }
        }
    }

    state.hub.unregister(&id);
    tracing::debug!(correlation_id = %id, "Realtime client disconnected");
}

async fn send_event<S>(sender: &mut S, event: &ServerEvent) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(event).context("Failed to encode realtime event")?;
    sender
        .send(Message::Text(json.into()))
        .await
        .context("Failed to write realtime frame")
}

/// Apply one inbound frame; returns the direct reply, if any.
fn handle_frame(state: &AppState, id: &str, text: &str) -> Option<ServerEvent> {
    let Ok(frame) = serde_json::from_str::<serde_json::Value>(text) else {
        tracing::debug!(correlation_id = %id, "Ignoring non-JSON frame");
        return None;
    };

    match frame["event"].as_str().unwrap_or("") {
        "notify" => {
            tracing::debug!(correlation_id = %id, "Poll requested");
            state.signal.notify();
            None
        }
        "verify" => Some(verify_frame(state, &frame["data"])),
        other => {
            tracing::debug!(correlation_id = %id, event = other, "Ignoring unknown event");
            None
        }
    }
}

fn verify_frame(state: &AppState, data: &serde_json::Value) -> ServerEvent {
    let (token_value, api_secret) = match data {
        serde_json::Value::String(token) => (token.as_str(), None),
        serde_json::Value::Object(map) => (
            map.get("token").and_then(|v| v.as_str()).unwrap_or(""),
            map.get("apiSecret").and_then(|v| v.as_str()),
        ),
        _ => ("", None),
    };

    let Some(secret) = state.policy.verification_secret(api_secret) else {
        return ServerEvent::TokenError {
            kind: "missing_secret".into(),
            message: "apiSecret required".into(),
        };
    };

    match token::verify(token_value, &secret) {
        Ok(claims) => ServerEvent::TokenValid(claims),
        Err(e) => ServerEvent::TokenError {
            kind: e.kind().into(),
            message: e.to_string(),
        },
    }
}
