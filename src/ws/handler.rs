//! WebSocket upgrade handler

use std::fmt::Display;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::ConnectionId;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::ServerMsg;
use crate::ws::router::ConnectionContext;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn = ConnectionId::new();
    info!(conn = %conn, "New WebSocket connection");

    let outbound = state.hub.register(conn);
    let (ws_sink, ws_stream) = socket.split();

    let mut ctx = ConnectionContext::new(conn);
    run_session(&state, &mut ctx, ws_sink, ws_stream, outbound).await;

    // Cleanup on disconnect
    state.router.disconnect(&mut ctx);
    state.hub.unregister(conn);

    info!(conn = %conn, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    state: &AppState,
    ctx: &mut ConnectionContext,
    ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    outbound: mpsc::Receiver<ServerMsg>,
) {
    let conn = ctx.id();
    let rate_limiter = ConnectionRateLimiter::new(state.config.max_messages_per_second);

    // Writer task: hub -> WebSocket. Ends when the hub drops the sender,
    // which is also how the server closes a kicked connection.
    let mut writer_handle = tokio::spawn(write_outbound(conn, ws_sink, outbound));

    // Reader loop: WebSocket -> router
    loop {
        let result = tokio::select! {
            next = ws_stream.next() => match next {
                Some(result) => result,
                None => break,
            },
            _ = &mut writer_handle => {
                debug!(conn = %conn, "Writer finished, closing connection");
                return;
            }
        };

        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_message() {
                    warn!(conn = %conn, "Rate limited inbound message");
                    continue;
                }
                state.router.handle_text(ctx, &text);
            }
            Ok(Message::Binary(_)) => {
                warn!(conn = %conn, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) => {
                debug!(conn = %conn, "Received ping");
            }
            Ok(Message::Pong(_)) => {
                debug!(conn = %conn, "Received pong");
            }
            Ok(Message::Close(_)) => {
                info!(conn = %conn, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(conn = %conn, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

/// Drain the connection's outbox into the socket.
///
/// A failed send drops that message only; the player stays in their session
/// until the reader sees the connection end.
async fn write_outbound<S>(conn: ConnectionId, mut sink: S, mut outbound: mpsc::Receiver<ServerMsg>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = send_msg(&mut sink, &msg).await {
            warn!(conn = %conn, error = %e, "WebSocket send failed, dropping message");
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Send a message over WebSocket
async fn send_msg<S>(sink: &mut S, msg: &ServerMsg) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
