use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use nutri_notify::ConnectionLease;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Drive one remote connection: a writer task drains the outbound queue and
/// sends pings, a reader task records pongs. The lease is released when
/// either side ends or the server shuts down.
pub async fn handle_ws_connection(
    socket: WebSocket,
    lease: ConnectionLease,
    mut rx: mpsc::Receiver<std::sync::Arc<str>>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) {
    let connection_id = lease.id().clone();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.as_ref().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_cid, "sent ping");
                }
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    let reader_cid = connection_id.clone();
    let manager = std::sync::Arc::clone(lease.manager());
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Pong(_) => manager.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                // Inbound traffic is not part of the protocol; any frame still
                // proves the client is alive.
                _ => manager.record_pong(&reader_cid),
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {},
        _ = &mut reader => {},
        () = shutdown.cancelled() => {},
    }
    writer.abort();
    reader.abort();

    drop(lease);
    tracing::info!(connection_id = %connection_id, "client disconnected");
}
