use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::api::SharedState;
use crate::events::EventBus;
use crate::hub::inbound::{process_client_text, send_welcome};
use crate::hub::{ClientHandle, ClientId, Hub, Outbound};

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let hub = Arc::clone(state.hub());
    let bus = Arc::clone(state.broadcaster.bus());

    let (tx, rx) = mpsc::channel(hub.settings().outbound_buffer.max(1));
    let shutdown = state.shutdown.child_token();
    let client = hub.register(ClientHandle::new(tx, shutdown.clone()));
    send_welcome(&hub, client);

    let (sender, receiver) = socket.split();
    run_socket_loop(&hub, &bus, client, sender, receiver, rx, shutdown).await;
    hub.disconnect(client);
}

/// Core socket loop.
///
/// Drains the client's outbound queue onto the wire and feeds inbound text
/// frames to the hub. Exits when the peer closes, a write fails, or the
/// client is terminated (eviction or server shutdown).
async fn run_socket_loop(
    hub: &Hub,
    bus: &EventBus,
    client: ClientId,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: mpsc::Receiver<Outbound>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            // ── Outbound queue ──────────────────────────────────────
            frame = rx.recv() => {
                let message = match frame {
                    Some(Outbound::Text(text)) => Message::Text(text.as_ref().into()),
                    Some(Outbound::Ping) => Message::Ping(Default::default()),
                    None => break,
                };
                if sender.send(message).await.is_err() {
                    debug!(client_id = %client, "Write failed, closing socket");
                    break;
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        process_client_text(hub, bus, client, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Pong, Ping and Binary frames carry no application data.
                    }
                    Some(Err(e)) => {
                        debug!(client_id = %client, error = %e, "Socket read error");
                        break;
                    }
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}
