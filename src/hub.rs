//! Room hub: the serialization point for one room.
//!
//! ```text
//! Session A ──┐
//!             ├── mpsc ──► RoomHub task ──► OT transform ──► store
//! Session B ──┘               │                               │
//!                             │  per-peer bounded queues      ▼
//!                             ├──────────► Session A     oplog window
//!                             └──────────► Session B
//! ```
//!
//! Exactly one hub task owns a room's state at a time; every mutation for
//! files in that room flows through its mailbox, so edits are totally
//! ordered per file without any lock. The hub suspends only on its mailbox,
//! on store calls, and on nothing else — peer delivery is `try_send` with a
//! shed-or-disconnect policy so one slow client cannot stall the room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::{ChatEntry, ChatLog, HISTORY_LIMIT};
use crate::config::Config;
use crate::ephemeral::EphemeralStore;
use crate::error::ErrorKind;
use crate::oplog::OperationLog;
use crate::ot::{self, Operation};
use crate::presence::{ColorAllocator, CursorPos, PresenceRecord, PresenceRegistry};
use crate::protocol::ServerFrame;
use crate::store::{with_retry, DocumentStore, StoreError};

/// Mailbox depth per hub.
const HUB_QUEUE: usize = 128;

/// Window within which version appends for one file coalesce.
const VERSION_COALESCE: Duration = Duration::from_secs(1);

/// How long a shutting-down hub keeps draining its mailbox.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// How long an empty hub lingers before tearing itself down. Lingering
/// keeps the join path race-free: a session that was handed this hub's
/// mailbox can still complete its join.
const EMPTY_LINGER: Duration = Duration::from_secs(30);

/// Out-of-band signals from the hub to a session's reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// The hub dropped this peer (eviction or overload); close the socket
    /// so the client reconnects and refetches canonical content.
    Close,
    /// The join was rejected; fall back to the authenticated state.
    JoinDenied,
}

/// A session's endpoints as the hub sees them.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub outbound: mpsc::Sender<ServerFrame>,
    pub control: mpsc::Sender<SessionControl>,
}

/// Messages from sessions to the hub. Processed strictly FIFO.
#[derive(Debug)]
pub enum HubCommand {
    Join {
        user_id: Uuid,
        username: String,
        session: SessionHandle,
    },
    Leave {
        session_id: Uuid,
    },
    CodeChange {
        session_id: Uuid,
        file_id: Uuid,
        op: Operation,
    },
    CursorPosition {
        session_id: Uuid,
        file_id: Uuid,
        line: u32,
        column: u32,
    },
    Chat {
        session_id: Uuid,
        message: String,
        code_snippet: Option<String>,
    },
    ChatHistory {
        session_id: Uuid,
    },
    CreateFile {
        session_id: Uuid,
        name: String,
        language: String,
    },
    DeleteFile {
        session_id: Uuid,
        file_id: Uuid,
    },
}

/// The hub's mailbox is gone (room torn down).
#[derive(Debug, Clone, Copy)]
pub struct HubClosed;

impl std::fmt::Display for HubClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "room hub closed")
    }
}

impl std::error::Error for HubClosed {}

/// Cloneable sender half of a hub's mailbox.
#[derive(Clone)]
pub struct HubHandle {
    pub room_id: Uuid,
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn send(&self, command: HubCommand) -> Result<(), HubClosed> {
        self.tx.send(command).await.map_err(|_| HubClosed)
    }

    /// True once the hub task has exited (empty room torn down).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Peer {
    user_id: Uuid,
    username: String,
    outbound: mpsc::Sender<ServerFrame>,
    control: mpsc::Sender<SessionControl>,
    record: PresenceRecord,
}

/// One room's owning task.
pub struct RoomHub {
    room_id: Uuid,
    rx: mpsc::Receiver<HubCommand>,
    store: Arc<dyn DocumentStore>,
    presence: PresenceRegistry,
    oplog: OperationLog,
    chat: ChatLog,
    colors: ColorAllocator,
    peers: HashMap<Uuid, Peer>,
    retry_attempts: u32,
    /// Peers whose outbound queue overflowed on a non-sheddable frame;
    /// disconnected after the current command completes.
    pending_disconnects: Vec<Uuid>,
    last_version_append: HashMap<Uuid, Instant>,
    /// Set during the shutdown drain; joins are denied once true.
    draining: bool,
}

/// Spawn a hub task for `room_id` and return its handle.
pub fn spawn(
    room_id: Uuid,
    store: Arc<dyn DocumentStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    config: &Config,
) -> HubHandle {
    let (tx, rx) = mpsc::channel(HUB_QUEUE);
    let hub = RoomHub {
        room_id,
        rx,
        store,
        presence: PresenceRegistry::new(ephemeral.clone(), config.presence_ttl()),
        oplog: OperationLog::new(ephemeral.clone(), config.op_log_window, config.op_log_ttl()),
        chat: ChatLog::new(ephemeral, config.chat_ring_size, config.chat_ttl()),
        colors: ColorAllocator::new(),
        peers: HashMap::new(),
        retry_attempts: config.store_retry_attempts,
        pending_disconnects: Vec::new(),
        last_version_append: HashMap::new(),
        draining: false,
    };
    tokio::spawn(hub.run());
    HubHandle { room_id, tx }
}

enum Delivery {
    Delivered,
    Shed,
    Disconnect,
}

fn try_deliver(peer: &Peer, frame: ServerFrame) -> Delivery {
    match peer.outbound.try_send(frame) {
        Ok(()) => Delivery::Delivered,
        Err(mpsc::error::TrySendError::Full(frame)) => {
            if frame.droppable() {
                Delivery::Shed
            } else {
                Delivery::Disconnect
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Disconnect,
    }
}

impl RoomHub {
    async fn run(mut self) {
        log::info!("hub for room {} started", self.room_id);
        loop {
            match tokio::time::timeout(EMPTY_LINGER, self.rx.recv()).await {
                Ok(Some(command)) => {
                    self.handle(command).await;
                    self.flush_disconnects().await;
                }
                Ok(None) => {
                    // Server is gone; drain, notify, and close peers.
                    self.shutdown().await;
                    break;
                }
                Err(_) => {
                    if self.peers.is_empty() {
                        break;
                    }
                }
            }
        }
        log::info!("hub for room {} stopped", self.room_id);
    }

    /// Drain the mailbox for up to 2s (denying late joins), then notify
    /// and drop every peer.
    async fn shutdown(&mut self) {
        self.draining = true;
        let deadline = Instant::now() + DRAIN_WINDOW;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(command)) => {
                    self.handle(command).await;
                    self.flush_disconnects().await;
                }
                Ok(None) | Err(_) => break,
            }
        }
        let departed: Vec<Uuid> = self.peers.values().map(|p| p.user_id).collect();
        for user_id in departed {
            self.broadcast(ServerFrame::UserLeft { user_id }, None);
            let _ = self.presence.drop(self.room_id, user_id).await;
        }
        for peer in self.peers.values() {
            let _ = peer.control.try_send(SessionControl::Close);
        }
        self.peers.clear();
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Join {
                user_id,
                username,
                session,
            } => self.handle_join(user_id, username, session).await,
            HubCommand::Leave { session_id } => self.handle_leave(session_id).await,
            HubCommand::CodeChange {
                session_id,
                file_id,
                op,
            } => self.handle_code_change(session_id, file_id, op).await,
            HubCommand::CursorPosition {
                session_id,
                file_id,
                line,
                column,
            } => {
                self.handle_cursor(session_id, file_id, line, column).await;
            }
            HubCommand::Chat {
                session_id,
                message,
                code_snippet,
            } => self.handle_chat(session_id, message, code_snippet).await,
            HubCommand::ChatHistory { session_id } => self.handle_chat_history(session_id).await,
            HubCommand::CreateFile {
                session_id,
                name,
                language,
            } => self.handle_create_file(session_id, name, language).await,
            HubCommand::DeleteFile {
                session_id,
                file_id,
            } => self.handle_delete_file(session_id, file_id).await,
        }
    }

    // ── membership ───────────────────────────────────────────────

    async fn handle_join(&mut self, user_id: Uuid, username: String, session: SessionHandle) {
        if self.draining {
            let _ = session.outbound.try_send(ServerFrame::error(
                ErrorKind::Transient,
                "room shutting down",
            ));
            let _ = session.control.try_send(SessionControl::JoinDenied);
            return;
        }
        let member = match with_retry(self.retry_attempts, || {
            self.store.room_member(self.room_id, user_id)
        })
        .await
        {
            Ok(member) => member,
            Err(e) => {
                log::warn!("membership check failed for {user_id}: {e}");
                let _ = session.outbound.try_send(ServerFrame::error(
                    ErrorKind::Transient,
                    "membership check failed",
                ));
                let _ = session.control.try_send(SessionControl::JoinDenied);
                return;
            }
        };
        if !member {
            let _ = session.outbound.try_send(ServerFrame::error(
                ErrorKind::Forbidden,
                "not a member of this room",
            ));
            let _ = session.control.try_send(SessionControl::JoinDenied);
            return;
        }

        // Reconnection evicts the prior session of the same user within
        // this hub tick; closing its socket forces the old client out.
        let prior: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        for session_id in prior {
            log::info!("evicting prior session {session_id} of user {user_id}");
            if let Some(peer) = self.peers.remove(&session_id) {
                let _ = peer.control.try_send(SessionControl::Close);
            }
        }

        let color = self.colors.color_for(user_id);
        let record = PresenceRecord {
            user_id,
            username: username.clone(),
            color,
            cursor: None,
            session_id: session.session_id,
        };
        if let Err(e) = self.presence.put(self.room_id, &record).await {
            log::warn!("presence write failed for {user_id}: {e}");
        }

        let users = self.presence.room(self.room_id).await.unwrap_or_default();
        let files = with_retry(self.retry_attempts, || {
            self.store.list_files(self.room_id)
        })
        .await
        .unwrap_or_default();

        let session_id = session.session_id;
        self.peers.insert(
            session_id,
            Peer {
                user_id,
                username,
                outbound: session.outbound,
                control: session.control,
                record: record.clone(),
            },
        );

        self.send_to(session_id, ServerFrame::RoomUsers { users });
        self.send_to(session_id, ServerFrame::RoomFiles { files });
        self.broadcast(ServerFrame::UserJoined { user: record }, Some(session_id));
    }

    async fn handle_leave(&mut self, session_id: Uuid) {
        let Some(peer) = self.peers.remove(&session_id) else {
            return;
        };
        let _ = self.presence.drop(self.room_id, peer.user_id).await;
        self.colors.release(peer.user_id);
        self.broadcast(
            ServerFrame::UserLeft {
                user_id: peer.user_id,
            },
            None,
        );
    }

    // ── the edit path ────────────────────────────────────────────

    async fn handle_code_change(&mut self, session_id: Uuid, file_id: Uuid, op: Operation) {
        let Some(peer) = self.peers.get(&session_id) else {
            return;
        };
        let user_id = peer.user_id;

        let window = match self.oplog.list(file_id).await {
            Ok(window) => window,
            Err(e) => {
                // Degraded mode: stored content is current, so an empty
                // window only skips transformation.
                log::warn!("op-log read failed for {file_id}: {e}");
                Vec::new()
            }
        };
        let transformed = ot::transform_against(&op, &window);

        let file = match with_retry(self.retry_attempts, || self.store.load_file(file_id)).await {
            Ok(file) => file,
            Err(StoreError::NotFound) => {
                self.send_to(
                    session_id,
                    ServerFrame::error(ErrorKind::NotFound, "file does not exist"),
                );
                return;
            }
            Err(e) => {
                self.send_to(
                    session_id,
                    ServerFrame::error(ErrorKind::Transient, e.to_string()),
                );
                return;
            }
        };
        if file.room_id != self.room_id {
            self.send_to(
                session_id,
                ServerFrame::error(ErrorKind::NotFound, "file does not exist"),
            );
            return;
        }

        if ot::exceeds_bounds(&file.content, &transformed) {
            log::warn!(
                "clamping out-of-range op from {user_id} on {file_id} (pos {} past {} units)",
                transformed.position(),
                ot::utf16_len(&file.content)
            );
        }
        let new_content = ot::apply(&file.content, &transformed);

        // Version row first so every save is preceded by its pre-save
        // snapshot; appends within 1s of the last one coalesce.
        let append_due = self
            .last_version_append
            .get(&file_id)
            .map_or(true, |at| at.elapsed() >= VERSION_COALESCE);
        if append_due {
            match with_retry(self.retry_attempts, || {
                self.store.append_version(file_id, &file.content, user_id)
            })
            .await
            {
                Ok(()) => {
                    self.last_version_append.insert(file_id, Instant::now());
                }
                Err(e) => log::warn!("version append failed for {file_id}: {e}"),
            }
        }

        if let Err(e) = with_retry(self.retry_attempts, || {
            self.store.save_content(file_id, &new_content)
        })
        .await
        {
            let kind = match e {
                StoreError::NotFound => ErrorKind::NotFound,
                StoreError::Conflict => ErrorKind::Conflict,
                _ => ErrorKind::Transient,
            };
            self.send_to(session_id, ServerFrame::error(kind, e.to_string()));
            return;
        }

        if let Err(e) = self.oplog.push(file_id, &transformed).await {
            log::warn!("op-log append failed for {file_id}: {e}");
        }

        self.touch_presence(session_id).await;
        self.broadcast(
            ServerFrame::CodeUpdate {
                file_id,
                op: transformed,
                user_id,
            },
            Some(session_id),
        );
    }

    // ── ephemeral signals ────────────────────────────────────────

    async fn handle_cursor(&mut self, session_id: Uuid, file_id: Uuid, line: u32, column: u32) {
        let Some(peer) = self.peers.get_mut(&session_id) else {
            return;
        };
        peer.record.cursor = Some(CursorPos {
            file_id,
            line,
            column,
        });
        let record = peer.record.clone();
        let user_id = peer.user_id;
        if let Err(e) = self.presence.put(self.room_id, &record).await {
            log::warn!("presence cursor write failed for {user_id}: {e}");
        }
        self.broadcast(
            ServerFrame::CursorUpdate {
                user_id,
                file_id,
                line,
                column,
            },
            Some(session_id),
        );
    }

    async fn handle_chat(
        &mut self,
        session_id: Uuid,
        message: String,
        code_snippet: Option<String>,
    ) {
        let Some(peer) = self.peers.get(&session_id) else {
            return;
        };
        let entry = ChatEntry {
            id: Uuid::new_v4(),
            user_id: peer.user_id,
            username: peer.username.clone(),
            message,
            timestamp: Utc::now(),
            code_snippet,
        };
        if let Err(e) = self.chat.push(self.room_id, &entry).await {
            log::warn!("chat ring write failed for room {}: {e}", self.room_id);
        }
        self.touch_presence(session_id).await;
        // Including the sender, who sees the authoritative stamped copy.
        self.broadcast(ServerFrame::ChatMessage(entry), None);
    }

    async fn handle_chat_history(&mut self, session_id: Uuid) {
        let messages = self
            .chat
            .history(self.room_id, HISTORY_LIMIT)
            .await
            .unwrap_or_default();
        self.send_to(session_id, ServerFrame::ChatHistory { messages });
    }

    // ── file lifecycle ───────────────────────────────────────────

    async fn handle_create_file(&mut self, session_id: Uuid, name: String, language: String) {
        if !self.peers.contains_key(&session_id) {
            return;
        }
        match with_retry(self.retry_attempts, || {
            self.store.create_file(self.room_id, &name, &language)
        })
        .await
        {
            Ok(file) => {
                self.broadcast(ServerFrame::FileCreated { file }, None);
            }
            Err(e) => {
                let kind = match e {
                    StoreError::NotFound => ErrorKind::NotFound,
                    StoreError::Conflict => ErrorKind::Conflict,
                    _ => ErrorKind::Transient,
                };
                self.send_to(session_id, ServerFrame::error(kind, e.to_string()));
            }
        }
    }

    async fn handle_delete_file(&mut self, session_id: Uuid, file_id: Uuid) {
        if !self.peers.contains_key(&session_id) {
            return;
        }
        // A file in another room is invisible here.
        let owned = match with_retry(self.retry_attempts, || self.store.load_file(file_id)).await {
            Ok(file) => file.room_id == self.room_id,
            Err(_) => false,
        };
        if !owned {
            self.send_to(
                session_id,
                ServerFrame::error(ErrorKind::NotFound, "file does not exist"),
            );
            return;
        }
        match with_retry(self.retry_attempts, || self.store.delete_file(file_id)).await {
            Ok(()) => {
                if let Err(e) = self.oplog.clear(file_id).await {
                    log::warn!("op-log clear failed for {file_id}: {e}");
                }
                self.last_version_append.remove(&file_id);
                self.broadcast(ServerFrame::FileDeleted { file_id }, None);
            }
            Err(e) => {
                let kind = match e {
                    StoreError::NotFound => ErrorKind::NotFound,
                    _ => ErrorKind::Transient,
                };
                self.send_to(session_id, ServerFrame::error(kind, e.to_string()));
            }
        }
    }

    // ── delivery ─────────────────────────────────────────────────

    /// Refresh the origin's presence TTL; any activity renews it.
    async fn touch_presence(&mut self, session_id: Uuid) {
        if let Some(peer) = self.peers.get(&session_id) {
            let record = peer.record.clone();
            if let Err(e) = self.presence.put(self.room_id, &record).await {
                log::debug!("presence refresh failed for {}: {e}", record.user_id);
            }
        }
    }

    fn send_to(&mut self, session_id: Uuid, frame: ServerFrame) {
        let Some(peer) = self.peers.get(&session_id) else {
            return;
        };
        match try_deliver(peer, frame) {
            Delivery::Delivered => {}
            Delivery::Shed => {
                log::debug!("shed frame for slow session {session_id}");
            }
            Delivery::Disconnect => {
                self.pending_disconnects.push(session_id);
            }
        }
    }

    /// Fan a frame out to every peer except `except`, in mailbox order.
    fn broadcast(&mut self, frame: ServerFrame, except: Option<Uuid>) {
        let mut overflow = Vec::new();
        for (session_id, peer) in &self.peers {
            if Some(*session_id) == except {
                continue;
            }
            match try_deliver(peer, frame.clone()) {
                Delivery::Delivered => {}
                Delivery::Shed => {
                    log::debug!("shed {frame:?} for slow session {session_id}");
                }
                Delivery::Disconnect => overflow.push(*session_id),
            }
        }
        self.pending_disconnects.extend(overflow);
    }

    /// Disconnect peers whose queue overflowed on a non-sheddable frame.
    /// A dropped `code-update` means the peer must refetch canonical
    /// content, so the session is closed to force a reconnect.
    async fn flush_disconnects(&mut self) {
        while let Some(session_id) = self.pending_disconnects.pop() {
            let Some(peer) = self.peers.remove(&session_id) else {
                continue;
            };
            log::warn!(
                "disconnecting overloaded session {session_id} (user {})",
                peer.user_id
            );
            let _ = peer.control.try_send(SessionControl::Close);
            let _ = self.presence.drop(self.room_id, peer.user_id).await;
            self.colors.release(peer.user_id);
            self.broadcast(
                ServerFrame::UserLeft {
                    user_id: peer.user_id,
                },
                None,
            );
        }
    }
}
