//! WebSocket transport for collaboration sessions.
//!
//! Each socket gets one task that reads client frames into its
//! [`CollabSession`] and writes everything the session (or its room) queues
//! for it. Socket tasks are tracked by [`AppState`] and stop when the server
//! shuts down. The session is always disconnected when the loop ends.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use collab_hub_core::model::User;
use collab_hub_core::{ClientMessage, Flow, ServerMessage};
use tracing::{debug, info};

use super::{AppState, AuthContext};

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    auth: AuthContext,
) -> impl IntoResponse {
    let sockets = state.sockets.clone();
    ws.on_upgrade(move |socket| sockets.track_future(handle_socket(socket, state, auth.user)))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user: User) {
    let (mut session, mut rx) = state.sessions.open(user);
    let connection = session.connection_id();
    info!(%connection, user = %session.user().id, "socket connected");

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let msg = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                debug!(%connection, "ignoring malformed frame: {e}");
                                continue;
                            }
                        };
                        if session.handle(msg).await == Flow::Disconnect {
                            while let Ok(msg) = rx.try_recv() {
                                if send(&mut socket, &msg).await.is_err() {
                                    break;
                                }
                            }
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(%connection, "socket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            Some(msg) = rx.recv() => {
                if send(&mut socket, &msg).await.is_err() {
                    break;
                }
            }
            _ = state.stop.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    session.disconnect().await;
    info!(%connection, "socket closed");
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            debug!("failed to encode outbound frame: {e}");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}
