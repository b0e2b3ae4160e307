//! WebSocket chat handler.
//!
//! One socket drives one session at a time: the first `chat` command binds
//! the socket to the addressed session and starts forwarding its events;
//! `stop` cancels the active turn. Rebinding to a different session swaps
//! the forwarder.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use quorum_core::SessionKey;

use crate::types::{map_event, WireCommand};
use crate::AppState;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn error_frame(message: &str) -> String {
    serde_json::json!({"type": "error", "error": message, "code": "bad_request"}).to_string()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // Single writer task; the command loop and the event forwarder both
    // send through this channel.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut bound: Option<(SessionKey, JoinHandle<()>)> = None;

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let command: WireCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(e) => {
                let _ = out_tx.send(error_frame(&format!("bad command: {}", e)));
                continue;
            }
        };

        match command {
            WireCommand::Chat { message, agent_ref } => {
                let key = match agent_ref.session_key() {
                    Ok(key) => key,
                    Err(e) => {
                        let _ = out_tx.send(error_frame(&e));
                        continue;
                    }
                };

                let rebind = match &bound {
                    Some((current, _)) => *current != key,
                    None => true,
                };
                if rebind {
                    if let Some((_, forwarder)) = bound.take() {
                        forwarder.abort();
                    }
                    let mut events = state.engine.subscribe(key.clone());
                    let forward_tx = out_tx.clone();
                    let forwarder = tokio::spawn(async move {
                        loop {
                            match events.recv().await {
                                Ok(event) => {
                                    if forward_tx.send(map_event(&event).to_string()).is_err() {
                                        break;
                                    }
                                }
                                // Slow consumer skipped events; keep going.
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                    tracing::warn!(skipped = n, "websocket consumer lagged");
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    });
                    bound = Some((key.clone(), forwarder));
                }

                if let Err(e) = state.engine.route(key, message) {
                    let _ = out_tx.send(error_frame(&e.to_string()));
                }
            }
            WireCommand::Stop => match &bound {
                Some((key, _)) => state.engine.cancel_turn(key),
                None => {
                    let _ = out_tx.send(error_frame("no session bound to this socket"));
                }
            },
        }
    }

    if let Some((_, forwarder)) = bound {
        forwarder.abort();
    }
    writer.abort();
}
