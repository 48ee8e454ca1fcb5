use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use signal_proto::{ClientEvent, ParticipantRole, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::AuthenticatedUser;
use crate::registry::ConnectionHandle;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    #[serde(default)]
    token: Option<String>,
}

/// Room binding for one connection. `Some` corresponds to the
/// IN_SESSION state; `None` is plain AUTHENTICATED.
struct RoomBinding {
    session_id: String,
    #[allow(dead_code)]
    role: ParticipantRole,
}

/// WebSocket upgrade handler. The handshake carries the signed token in
/// the query string; verification failure rejects the connection before
/// any event is processed.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsAuthParams>,
    State(state): State<AppState>,
) -> Response {
    let token = params.token.unwrap_or_default();
    let user = match state.verifier.verify(&token) {
        Ok(user) => user,
        Err(err) => {
            warn!(error = %err, "rejected unauthenticated connection");
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(socket: WebSocket, user: AuthenticatedUser, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let handle = ConnectionHandle::new(tx);

    // Forward queued server events onto the socket.
    let writer_user = user.user_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(user_id = %writer_user, error = %err, "dropping unserializable event"),
            }
        }
    });

    info!(
        user_id = %user.user_id,
        role = ?user.role,
        connection_id = %handle.connection_id,
        "connection authenticated"
    );

    let mut binding: Option<RoomBinding> = None;
    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!(user_id = %user.user_id, error = %err, "websocket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => handle_event(&state, &user, &handle, &mut binding, event),
                Err(err) => {
                    handle.send(ServerEvent::Error {
                        message: format!("invalid message format: {err}"),
                    });
                }
            },
            Message::Close(_) => break,
            // Ping/Pong are answered by axum; binary frames carry nothing
            // in this protocol.
            _ => {}
        }
    }

    // Transport-level disconnect is treated exactly as leave-session, so
    // the registry never leaks a participant when a client vanishes.
    leave_room(&state, &user, &mut binding);
    writer.abort();
    debug!(user_id = %user.user_id, "connection closed");
}

/// Dispatch one client event. Failures convert into an `error` emission
/// to the originating connection only; nothing here can take down
/// another connection's handler.
fn handle_event(
    state: &AppState,
    user: &AuthenticatedUser,
    handle: &ConnectionHandle,
    binding: &mut Option<RoomBinding>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::JoinSession { session_id, role } => {
            if binding.is_some() {
                handle.send(ServerEvent::Error {
                    message: "already in a session".into(),
                });
                return;
            }
            if session_id.trim().is_empty() {
                handle.send(ServerEvent::Error {
                    message: "session ID is required".into(),
                });
                return;
            }
            state
                .registry
                .add_participant(&session_id, &user.user_id, role, handle.clone());
            let others = state.registry.other_participants(&session_id, &user.user_id);
            handle.send(ServerEvent::SessionJoined {
                session_id: session_id.clone(),
                user_id: user.user_id.clone(),
                role,
                participants: others.iter().map(|p| p.summary()).collect(),
            });
            for other in &others {
                other.handle.send(ServerEvent::ParticipantJoined {
                    user_id: user.user_id.clone(),
                    role,
                });
            }
            info!(
                session_id = %session_id,
                user_id = %user.user_id,
                role = ?role,
                peers = others.len(),
                "participant joined session"
            );
            *binding = Some(RoomBinding { session_id, role });
        }
        ClientEvent::LeaveSession => leave_room(state, user, binding),
        ClientEvent::Offer {
            target_user_id,
            sdp,
        } => relay_to_target(state, user, handle, binding, &target_user_id, |sender| {
            ServerEvent::Offer {
                user_id: sender,
                sdp,
            }
        }),
        ClientEvent::Answer {
            target_user_id,
            sdp,
        } => relay_to_target(state, user, handle, binding, &target_user_id, |sender| {
            ServerEvent::Answer {
                user_id: sender,
                sdp,
            }
        }),
        ClientEvent::IceCandidate {
            target_user_id,
            candidate,
        } => relay_to_target(state, user, handle, binding, &target_user_id, |sender| {
            ServerEvent::IceCandidate {
                user_id: sender,
                candidate,
            }
        }),
        ClientEvent::ConnectionQuality { level, metrics } => {
            // Fire-and-forget: no acknowledgment, silently ignored
            // outside a session.
            let Some(binding) = binding.as_ref() else {
                return;
            };
            for other in state
                .registry
                .other_participants(&binding.session_id, &user.user_id)
            {
                other.handle.send(ServerEvent::ParticipantConnectionQuality {
                    user_id: user.user_id.clone(),
                    level,
                    metrics,
                });
            }
        }
    }
}

/// Shared by `leave-session` and transport disconnect: idempotent, and
/// the only code path that removes a participant from the registry.
fn leave_room(state: &AppState, user: &AuthenticatedUser, binding: &mut Option<RoomBinding>) {
    let Some(room) = binding.take() else {
        return;
    };
    state
        .registry
        .remove_participant(&room.session_id, &user.user_id);
    for other in state
        .registry
        .other_participants(&room.session_id, &user.user_id)
    {
        other.handle.send(ServerEvent::ParticipantLeft {
            user_id: user.user_id.clone(),
        });
    }
    info!(
        session_id = %room.session_id,
        user_id = %user.user_id,
        "participant left session"
    );
}

/// Resolve the target and forward an opaque signaling payload with the
/// authenticated sender id attached, overriding anything the client
/// may have claimed.
fn relay_to_target(
    state: &AppState,
    user: &AuthenticatedUser,
    handle: &ConnectionHandle,
    binding: &Option<RoomBinding>,
    target_user_id: &str,
    build: impl FnOnce(String) -> ServerEvent,
) {
    let Some(binding) = binding.as_ref() else {
        handle.send(ServerEvent::Error {
            message: "not in a session".into(),
        });
        return;
    };
    match state
        .registry
        .find_participant(&binding.session_id, target_user_id)
    {
        Some(target) => target.handle.send(build(user.user_id.clone())),
        None => handle.send(ServerEvent::Error {
            message: "target participant not found".into(),
        }),
    }
}
