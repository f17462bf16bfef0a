//! WebSocket endpoint: accept loop, room registry, server stats.
//!
//! One process owns every room it serves. The registry lazily spawns a hub
//! task per room on first join and respawns it if the previous instance
//! tore itself down after its last participant left.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::ephemeral::EphemeralStore;
use crate::hub::{self, HubHandle};
use crate::session;
use crate::store::DocumentStore;

/// Server-wide counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub active_rooms: usize,
}

/// Maps room ids to live hub handles.
pub struct RoomRegistry {
    store: Arc<dyn DocumentStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    config: Config,
    rooms: RwLock<HashMap<Uuid, HubHandle>>,
}

impl RoomRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        config: Config,
    ) -> Self {
        Self {
            store,
            ephemeral,
            config,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// The live hub for a room, spawning one if none is running.
    pub async fn get_or_create(&self, room_id: Uuid) -> HubHandle {
        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(&room_id) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(handle) = rooms.get(&room_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }
        let handle = hub::spawn(
            room_id,
            self.store.clone(),
            self.ephemeral.clone(),
            &self.config,
        );
        rooms.insert(room_id, handle.clone());
        handle
    }

    /// Number of rooms with a live hub.
    pub async fn active_rooms(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, handle| !handle.is_closed());
        rooms.len()
    }
}

/// Everything a session needs, shared across connections.
pub struct ServerState {
    pub config: Config,
    pub verifier: Arc<dyn TokenVerifier>,
    pub rooms: RoomRegistry,
    pub stats: RwLock<ServerStats>,
}

/// The collaboration server.
pub struct CollabServer {
    state: Arc<ServerState>,
}

impl CollabServer {
    pub fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let rooms = RoomRegistry::new(store, ephemeral, config.clone());
        Self {
            state: Arc::new(ServerState {
                config,
                verifier,
                rooms,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Bind and serve forever. Errors out only if the listener cannot be
    /// established (fatal at startup, exit code 1).
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.state.config.listen_addr).await?;
        log::info!("listening on {}", self.state.config.listen_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("connection from {addr}");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = session::handle_connection(stream, state).await {
                    log::debug!("session from {addr} ended: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.state.stats.read().await.clone();
        stats.active_rooms = self.state.rooms.active_rooms().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.listen_addr
    }
}
