//! Per-connection session endpoint.
//!
//! State machine: `Connecting → Authenticated → InRoom → Closed`. The
//! bearer token can arrive with the HTTP upgrade (`Authorization` header)
//! or on the first `join-room` frame; the gate re-validates on every join.
//!
//! Each connection runs as two tasks: the reader owns the socket's receive
//! half and dispatches frames into the room hub; the writer owns the send
//! half and drains the bounded outbound queue the hub fans into. A control
//! channel lets the hub force-close sessions it has dropped.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::ErrorKind;
use crate::hub::{HubCommand, HubHandle, SessionControl, SessionHandle};
use crate::protocol::{self, ClientFrame, ServerFrame};
use crate::server::ServerState;

/// Control-channel depth; signals are rare.
const CONTROL_QUEUE: usize = 4;

enum SessionState {
    Connecting,
    Authenticated(Identity),
    InRoom { identity: Identity, hub: HubHandle },
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::InRoom { .. } => "in-room",
        }
    }
}

/// Why the reader loop ended.
enum Exit {
    /// Socket closed, idle timeout, or hub-forced close.
    Closed,
    /// Malformed frame or rejected token; an error frame was queued first.
    Violation,
}

/// Serve one WebSocket connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Upgrade callback: enforce the origin allowlist and capture the
    // bearer token before the session exists.
    let mut bearer: Option<String> = None;
    let allowed_origin = state.config.frontend_origin.clone();
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Some(allowed) = &allowed_origin {
            let origin = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if origin != allowed {
                log::warn!("rejected upgrade from origin {origin:?}");
                let mut reject = ErrorResponse::new(Some("origin not allowed".to_string()));
                *reject.status_mut() = StatusCode::FORBIDDEN;
                return Err(reject);
            }
        }
        if let Some(value) = req.headers().get("authorization") {
            if let Ok(value) = value.to_str() {
                if let Some(token) = value.strip_prefix("Bearer ") {
                    bearer = Some(token.to_string());
                }
            }
        }
        Ok(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    {
        let mut stats = state.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }

    let session_id = Uuid::new_v4();
    let (ws_sink, ws_reader) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerFrame>(state.config.outbound_queue_frames);
    let (ctl_tx, ctl_rx) = mpsc::channel::<SessionControl>(CONTROL_QUEUE);

    // Writer task: drain the outbound queue onto the socket.
    let writer = tokio::spawn(async move {
        let mut sink = ws_sink;
        let mut out_rx = out_rx;
        while let Some(frame) = out_rx.recv().await {
            let text = protocol::encode_server(&frame);
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let exit = read_loop(
        session_id,
        ws_reader,
        &state,
        bearer,
        out_tx.clone(),
        ctl_tx,
        ctl_rx,
    )
    .await;

    if let Exit::Violation = exit {
        log::debug!("session {session_id} closed on protocol violation");
    }

    // Dropping our outbound sender (the hub's clone goes with Leave) ends
    // the writer, which closes the socket.
    drop(out_tx);
    let _ = writer.await;

    {
        let mut stats = state.stats.write().await;
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }
    log::debug!("session {session_id} ended");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn read_loop<S>(
    session_id: Uuid,
    mut ws_reader: S,
    state: &Arc<ServerState>,
    mut bearer: Option<String>,
    out_tx: mpsc::Sender<ServerFrame>,
    ctl_tx: mpsc::Sender<SessionControl>,
    mut ctl_rx: mpsc::Receiver<SessionControl>,
) -> Exit
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let idle = state.config.idle_timeout();
    let mut session = SessionState::Connecting;

    // Token attached to the upgrade authenticates immediately.
    if let Some(token) = bearer.clone() {
        match state.verifier.verify(&token).await {
            Ok(identity) => {
                log::info!("session {session_id} authenticated as {}", identity.username);
                session = SessionState::Authenticated(identity);
            }
            Err(e) => {
                let _ = out_tx
                    .send(ServerFrame::error(ErrorKind::Unauthenticated, e.to_string()))
                    .await;
                return Exit::Violation;
            }
        }
    }

    let exit = loop {
        tokio::select! {
            control = ctl_rx.recv() => {
                match control {
                    Some(SessionControl::Close) | None => break Exit::Closed,
                    Some(SessionControl::JoinDenied) => {
                        let prior = std::mem::replace(&mut session, SessionState::Connecting);
                        session = match prior {
                            SessionState::InRoom { identity, .. } => {
                                SessionState::Authenticated(identity)
                            }
                            other => other,
                        };
                    }
                }
            }

            msg = tokio::time::timeout(idle, ws_reader.next()) => {
                let msg = match msg {
                    Err(_) => {
                        log::info!("session {session_id} idle for {}s, closing", idle.as_secs());
                        break Exit::Closed;
                    }
                    Ok(None) | Ok(Some(Err(_))) => break Exit::Closed,
                    Ok(Some(Ok(msg))) => msg,
                };

                match msg {
                    Message::Text(text) => {
                        {
                            let mut stats = state.stats.write().await;
                            stats.frames_received += 1;
                        }
                        let frame = match protocol::decode_client(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                let _ = out_tx
                                    .send(ServerFrame::error(
                                        ErrorKind::ProtocolViolation,
                                        e.to_string(),
                                    ))
                                    .await;
                                break Exit::Violation;
                            }
                        };
                        let (next, exit_now) = dispatch(
                            session_id, frame, session, state, &mut bearer, &out_tx, &ctl_tx,
                        )
                        .await;
                        session = next;
                        if let Some(exit) = exit_now {
                            break exit;
                        }
                    }
                    Message::Binary(_) => {
                        let _ = out_tx
                            .send(ServerFrame::error(
                                ErrorKind::ProtocolViolation,
                                "binary frames are not part of the protocol",
                            ))
                            .await;
                        break Exit::Violation;
                    }
                    Message::Close(_) => break Exit::Closed,
                    // Ping/pong handled by the protocol layer.
                    _ => {}
                }
            }
        }
    };

    if let SessionState::InRoom { hub, .. } = &session {
        let _ = hub.send(HubCommand::Leave { session_id }).await;
    }
    exit
}

/// Handle one inbound frame; returns the next state and, when the session
/// must end, the exit reason.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    session_id: Uuid,
    frame: ClientFrame,
    session: SessionState,
    state: &Arc<ServerState>,
    bearer: &mut Option<String>,
    out_tx: &mpsc::Sender<ServerFrame>,
    ctl_tx: &mpsc::Sender<SessionControl>,
) -> (SessionState, Option<Exit>) {
    match (frame, session) {
        // join-room is legal while connecting (token in frame or header)
        // and while authenticated. Re-validated by the gate on every join.
        (ClientFrame::JoinRoom { room_id, token }, SessionState::Connecting)
        | (ClientFrame::JoinRoom { room_id, token }, SessionState::Authenticated(_)) => {
            let presented = token.or_else(|| bearer.clone());
            let Some(presented) = presented else {
                let _ = out_tx
                    .send(ServerFrame::error(
                        ErrorKind::Unauthenticated,
                        "no bearer token presented",
                    ))
                    .await;
                return (SessionState::Connecting, Some(Exit::Violation));
            };
            let identity = match state.verifier.verify(&presented).await {
                Ok(identity) => identity,
                Err(e) => {
                    let _ = out_tx
                        .send(ServerFrame::error(ErrorKind::Unauthenticated, e.to_string()))
                        .await;
                    return (SessionState::Connecting, Some(Exit::Violation));
                }
            };
            *bearer = Some(presented);

            join_room(session_id, room_id, identity, state, out_tx, ctl_tx).await
        }

        (ClientFrame::LeaveRoom, SessionState::InRoom { identity, hub }) => {
            let _ = hub.send(HubCommand::Leave { session_id }).await;
            (SessionState::Authenticated(identity), None)
        }

        (ClientFrame::CodeChange { file_id, op }, SessionState::InRoom { identity, hub }) => {
            forward(
                session_id,
                HubCommand::CodeChange {
                    session_id,
                    file_id,
                    op,
                },
                identity,
                hub,
                out_tx,
            )
            .await
        }

        (
            ClientFrame::CursorPosition {
                file_id,
                line,
                column,
            },
            SessionState::InRoom { identity, hub },
        ) => {
            forward(
                session_id,
                HubCommand::CursorPosition {
                    session_id,
                    file_id,
                    line,
                    column,
                },
                identity,
                hub,
                out_tx,
            )
            .await
        }

        (
            ClientFrame::ChatMessage {
                message,
                code_snippet,
            },
            SessionState::InRoom { identity, hub },
        ) => {
            forward(
                session_id,
                HubCommand::Chat {
                    session_id,
                    message,
                    code_snippet,
                },
                identity,
                hub,
                out_tx,
            )
            .await
        }

        (ClientFrame::GetChatHistory, SessionState::InRoom { identity, hub }) => {
            forward(
                session_id,
                HubCommand::ChatHistory { session_id },
                identity,
                hub,
                out_tx,
            )
            .await
        }

        (ClientFrame::CreateFile { name, language }, SessionState::InRoom { identity, hub }) => {
            forward(
                session_id,
                HubCommand::CreateFile {
                    session_id,
                    name,
                    language,
                },
                identity,
                hub,
                out_tx,
            )
            .await
        }

        (ClientFrame::DeleteFile { file_id }, SessionState::InRoom { identity, hub }) => {
            forward(
                session_id,
                HubCommand::DeleteFile {
                    session_id,
                    file_id,
                },
                identity,
                hub,
                out_tx,
            )
            .await
        }

        // Everything else is a frame in the wrong state: dropped, replied,
        // connection kept.
        (_frame, session) => {
            log::debug!(
                "session {session_id} dropped a frame sent in state {}",
                session.name()
            );
            let _ = out_tx
                .send(ServerFrame::error(ErrorKind::InvalidState, "invalid state"))
                .await;
            (session, None)
        }
    }
}

async fn join_room(
    session_id: Uuid,
    room_id: Uuid,
    identity: Identity,
    state: &Arc<ServerState>,
    out_tx: &mpsc::Sender<ServerFrame>,
    ctl_tx: &mpsc::Sender<SessionControl>,
) -> (SessionState, Option<Exit>) {
    let command = HubCommand::Join {
        user_id: identity.user_id,
        username: identity.username.clone(),
        session: SessionHandle {
            session_id,
            outbound: out_tx.clone(),
            control: ctl_tx.clone(),
        },
    };

    let hub = state.rooms.get_or_create(room_id).await;
    match hub.send(command).await {
        Ok(()) => (SessionState::InRoom { identity, hub }, None),
        Err(_) => {
            // Raced with a hub teardown; one respawn settles it.
            let hub = state.rooms.get_or_create(room_id).await;
            let retry = HubCommand::Join {
                user_id: identity.user_id,
                username: identity.username.clone(),
                session: SessionHandle {
                    session_id,
                    outbound: out_tx.clone(),
                    control: ctl_tx.clone(),
                },
            };
            match hub.send(retry).await {
                Ok(()) => (SessionState::InRoom { identity, hub }, None),
                Err(_) => {
                    let _ = out_tx
                        .send(ServerFrame::error(ErrorKind::Transient, "room unavailable"))
                        .await;
                    (SessionState::Authenticated(identity), None)
                }
            }
        }
    }
}

async fn forward(
    session_id: Uuid,
    command: HubCommand,
    identity: Identity,
    hub: HubHandle,
    out_tx: &mpsc::Sender<ServerFrame>,
) -> (SessionState, Option<Exit>) {
    match hub.send(command).await {
        Ok(()) => (SessionState::InRoom { identity, hub }, None),
        Err(_) => {
            log::warn!("session {session_id} lost its room hub");
            let _ = out_tx
                .send(ServerFrame::error(ErrorKind::NotFound, "room closed"))
                .await;
            (SessionState::Authenticated(identity), None)
        }
    }
}
