use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    hub::PeerId,
    types::{Device, Envelope, Hello},
    AppState,
};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
enum GatewayError {
    #[error("expected hello frame")]
    ExpectedHello,
    #[error("invalid hello frame: {0}")]
    InvalidHello(#[from] serde_json::Error),
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

pub async fn devices_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Device>> {
    Json(state.hub.devices())
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let role = match read_hello(ws_stream.next().await) {
        Ok(role) => role,
        Err(e) => {
            let text = error_frame(&e.to_string());
            let _ = ws_sink.send(Message::Text(text)).await;
            return;
        }
    };

    let peer_id: PeerId = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Envelope>(state.ws_send_buffer);
    let closed = state.hub.register_peer(peer_id, role, tx.clone());

    info!(%peer_id, ?role, "ws connected");

    let send_closed = closed.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = send_closed.cancelled() => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let text = match serde_json::to_string(&envelope) {
                Ok(t) => t,
                Err(e) => {
                    error!("failed to serialize envelope: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => {
                info!(%peer_id, "peer dropped by hub, closing socket");
                break;
            }
            msg = ws_stream.next() => match msg {
                Some(Ok(msg)) => msg,
                _ => break,
            },
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                let _ = tx.try_send(Envelope::new(
                    "error",
                    json!({ "message": format!("invalid frame: {e}") }),
                ));
                continue;
            }
        };

        let delivered = match role {
            Hello::Device => state.hub.from_device(peer_id, envelope),
            Hello::Dashboard => state.hub.from_dashboard(peer_id, envelope),
        };
        debug!(%peer_id, delivered, "frame relayed");
    }

    state.hub.unregister_peer(&peer_id);
    closed.cancel();
    drop(tx);
    if tokio::time::timeout(CLOSE_GRACE, send_task).await.is_err() {
        debug!(%peer_id, "send task did not finish, dropping socket");
    }
    info!(%peer_id, "ws disconnected");
}

fn read_hello<E>(frame: Option<Result<Message, E>>) -> Result<Hello, GatewayError> {
    match frame {
        Some(Ok(Message::Text(text))) => Ok(serde_json::from_str(&text)?),
        _ => Err(GatewayError::ExpectedHello),
    }
}

fn error_frame(message: &str) -> String {
    serde_json::to_string(&Envelope::new("error", json!({ "message": message })))
        .unwrap_or_else(|_| String::from(r#"{"event":"error","data":null}"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_must_be_first_text_frame() {
        let ok: Option<Result<Message, ()>> =
            Some(Ok(Message::Text(r#"{"role":"dashboard"}"#.into())));
        assert_eq!(read_hello(ok).unwrap(), Hello::Dashboard);

        let binary: Option<Result<Message, ()>> = Some(Ok(Message::Binary(vec![1])));
        assert!(matches!(read_hello(binary), Err(GatewayError::ExpectedHello)));

        let bad: Option<Result<Message, ()>> = Some(Ok(Message::Text(r#"{"role":"ghost"}"#.into())));
        assert!(matches!(read_hello(bad), Err(GatewayError::InvalidHello(_))));

        assert!(matches!(read_hello::<()>(None), Err(GatewayError::ExpectedHello)));
    }

    #[test]
    fn error_frames_are_envelopes() {
        let frame: Envelope = serde_json::from_str(&error_frame("nope")).unwrap();
        assert_eq!(frame.event, "error");
        assert_eq!(frame.data["message"], "nope");
    }
}
