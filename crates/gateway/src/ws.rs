//! WebSocket endpoint for simulation sessions.
//!
//! Flow:
//! 1. Client connects to `/ws/voice`
//! 2. First frame must be `join` (auth-checked in secure mode)
//! 3. Gateway replies `joined` and starts streaming role-gated state
//! 4. Bidirectional loop: audio and commands in, transcripts/audio/state
//!    out
//!
//! On disconnect the client is removed; the last connection out triggers
//! the one-shot session teardown.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use pg_domain::config::AuthMode;
use pg_domain::events::{LoggedEvent, SessionEvent};
use pg_protocol::{ClientMessage, ServerMessage};

use crate::orchestrator::{self, ConnCtx};
use crate::sessions::ClientHandle;
use crate::state::AppState;

pub async fn voice_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: forwards pre-serialized frames to the socket.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        while let Some(json) = outbound_rx.recv().await {
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // 1. Handshake: the first accepted frame must be a join.
    let Some(ctx) = wait_for_join(&state, &mut ws_stream, &outbound_tx).await else {
        writer.abort();
        return;
    };

    tracing::info!(
        session_id = %ctx.session_id,
        user_id = %ctx.user_id,
        role = ctx.role.as_str(),
        "client joined"
    );
    orchestrator::on_client_joined(&state, &ctx).await;

    // 2. Message loop.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                if chaos_drop(&state).await {
                    continue;
                }
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(parsed) => orchestrator::handle_message(&state, &ctx, parsed).await,
                    Err(e) => {
                        send_direct(
                            &outbound_tx,
                            &ServerMessage::Error {
                                message: format!("malformed frame: {e}"),
                            },
                        );
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {}
        }
    }

    // 3. Cleanup: floor, connection, possibly the whole session.
    if state.sessions.release_floor(&ctx.session_id, &ctx.user_id) {
        state.sessions.broadcast_to_session(
            &ctx.session_id,
            &ServerMessage::ParticipantState {
                session_id: ctx.session_id.clone(),
                user_id: ctx.user_id.clone(),
                speaking: false,
            },
        );
    }
    let emptied = state
        .sessions
        .remove_client(&ctx.session_id, ctx.role, ctx.conn_id);
    if emptied {
        orchestrator::session_empty(&state, &ctx.session_id).await;
    }
    writer.abort();
    tracing::info!(
        session_id = %ctx.session_id,
        user_id = %ctx.user_id,
        session_emptied = emptied,
        "client disconnected"
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Join handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn wait_for_join(
    state: &AppState,
    ws_stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    outbound: &mpsc::Sender<String>,
) -> Option<ConnCtx> {
    // Give the client 10 seconds to introduce itself.
    let deadline = std::time::Duration::from_secs(10);
    let result = tokio::time::timeout(deadline, async {
        while let Some(Ok(msg)) = ws_stream.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Join {
                    session_id,
                    user_id,
                    role,
                    auth_token,
                }) => {
                    return Some((session_id, user_id, role, auth_token));
                }
                Ok(_) => {
                    send_direct(
                        outbound,
                        &ServerMessage::Error {
                            message: "join required before any other message".into(),
                        },
                    );
                }
                Err(e) => {
                    send_direct(
                        outbound,
                        &ServerMessage::Error {
                            message: format!("malformed frame: {e}"),
                        },
                    );
                }
            }
        }
        None
    })
    .await;

    let (session_id, user_id, role, auth_token) = result.ok().flatten()?;

    // Secure mode: the token subject must equal the claimed user.
    let insecure = state.config.auth.mode == AuthMode::Insecure;
    if !insecure {
        let Some(token) = auth_token else {
            deny_join(state, outbound, &session_id, &user_id, "missing token").await;
            return None;
        };
        let Some(verifier) = state.verifier.as_ref() else {
            deny_join(state, outbound, &session_id, &user_id, "no verifier configured").await;
            return None;
        };
        match verifier.verify(&token).await {
            Ok(identity) if identity.uid == user_id => {}
            Ok(_) => {
                deny_join(state, outbound, &session_id, &user_id, "token subject mismatch").await;
                return None;
            }
            Err(e) => {
                deny_join(
                    state,
                    outbound,
                    &session_id,
                    &user_id,
                    &format!("verification failed: {e}"),
                )
                .await;
                return None;
            }
        }
    }

    let conn_id = state.sessions.mint_conn_id();
    state.sessions.add_client(
        &session_id,
        role,
        ClientHandle {
            conn_id,
            user_id: user_id.clone(),
            sink: outbound.clone(),
        },
    );

    send_direct(
        outbound,
        &ServerMessage::Joined {
            session_id: session_id.clone(),
            role,
            insecure_mode: insecure.then_some(true),
        },
    );

    Some(ConnCtx {
        conn_id,
        session_id,
        user_id,
        role,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn send_direct(outbound: &mpsc::Sender<String>, msg: &ServerMessage) {
    let _ = outbound.try_send(msg.to_json());
}

/// Refuse a join: record the denial, tell the client, and let the caller
/// close the socket.
async fn deny_join(
    state: &AppState,
    outbound: &mpsc::Sender<String>,
    session_id: &str,
    user_id: &str,
    reason: &str,
) {
    let event = SessionEvent::AuthDenied {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        reason: reason.to_string(),
    };
    event.emit();
    state
        .persistence
        .append_event(session_id, &LoggedEvent::now(event))
        .await;
    send_direct(
        outbound,
        &ServerMessage::Error {
            message: "unauthorized_token".into(),
        },
    );
}

/// Chaos hooks: drop or delay inbound frames. Disabled outside dev.
async fn chaos_drop(state: &AppState) -> bool {
    let chaos = &state.config.chaos;
    if !chaos.enabled || state.config.server.production {
        return false;
    }
    if chaos.latency_ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(chaos.latency_ms)).await;
    }
    chaos.drop_probability > 0.0 && rand::random::<f64>() < chaos.drop_probability
}
