use std::sync::{Arc, atomic::AtomicU64};

use axum::{
    debug_handler,
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::mpsc;

use crate::AppState;

use super::{Connection, Frame, Session, is_current};

#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |stream| run_connection(stream, state))
}

/// Reads frames until the socket goes away, then leaves whatever room the
/// connection was in. Outgoing frames go through a separate writer task so a
/// slow socket never stalls a broadcast.
async fn run_connection(stream: WebSocket, state: AppState) {
    let (sender, mut receiver) = stream.split();
    let (tx, rx) = mpsc::unbounded_channel();

    let conn = Connection::new(tx);
    let id = conn.id;
    let mut writer = tokio::spawn(writer_task(sender, rx, conn.epoch()));
    let mut session = Session::new(state, conn);
    tracing::info!(connection = %id, "connected");

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(connection = %id, reason = ?frame, "client closed");
                    break;
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::warn!(connection = %id, "ignoring binary frame");
                }
                // transport-level ping/pong is answered by the socket itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(connection = %id, error = %e, "receive failed");
                    break;
                }
                None => break,
            },
            _ = &mut writer => {
                tracing::debug!(connection = %id, "writer stopped");
                break;
            }
        }
    }

    drop(session);
    writer.abort();
    tracing::info!(connection = %id, "disconnected");
}

async fn writer_task(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    epoch: Arc<AtomicU64>,
) {
    while let Some(frame) = rx.recv().await {
        if !is_current(&frame, &epoch) {
            continue;
        }
        if sender.send(Message::Text(frame.text.as_ref().into())).await.is_err() {
            break;
        }
    }
}
