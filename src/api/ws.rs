//! WS endpoint layer (C8): `/ws` upgrade, subscription parsing, per-client
//! control-message handling. Mirrors the teacher's `handle_socket` loop —
//! one task per client selecting between its outbound mailbox and inbound
//! frames from the browser.

use super::AppState;
use crate::models::{ClientControl, ConnectedFrame};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

const CLIENT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    symbols: Option<String>,
}

fn parse_symbols(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let initial_symbols = query.symbols.map(|s| parse_symbols(&s)).unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, initial_symbols))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, initial_symbols: HashSet<String>) {
    let (client_id, mut mailbox) = state.clients.register(initial_symbols.clone());

    let greeting = ConnectedFrame::new(initial_symbols.into_iter().collect());
    if let Ok(text) = serde_json::to_string(&greeting) {
        if send_with_timeout(&mut socket, Message::Text(text)).await.is_err() {
            state.clients.unregister(client_id);
            return;
        }
    }

    loop {
        tokio::select! {
            outbound = mailbox.recv() => {
                match outbound {
                    Some(frame) => {
                        if send_with_timeout(&mut socket, frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handle_control(&state, client_id, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.clients.unregister(client_id);
}

/// A write that neither succeeds nor fails within the deadline is a stalled
/// client (slow reader, half-open TCP) rather than a full mailbox — that
/// case is handled separately by the registry's `try_send` backpressure.
/// Either way the client gets dropped, it just doesn't get to hang the task.
async fn send_with_timeout(socket: &mut WebSocket, frame: Message) -> Result<(), ()> {
    match tokio::time::timeout(CLIENT_SEND_TIMEOUT, socket.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_) => {
            warn!("client send timed out, closing connection");
            Err(())
        }
    }
}

fn handle_control(state: &AppState, client_id: u64, text: &str) {
    let Ok(control) = serde_json::from_str::<ClientControl>(text) else {
        debug!(client_id, "ignoring malformed control frame");
        return;
    };
    match control {
        ClientControl::Subscribe { symbols } => state.clients.subscribe(client_id, symbols),
        ClientControl::Unsubscribe { symbols } => state.clients.unsubscribe(client_id, symbols),
    }
}
