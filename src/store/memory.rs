//! In-memory document store for tests and single-node dev.
//!
//! Mirrors the Postgres store's semantics, including version-row dedup and
//! cascade deletes. Inherent seed helpers stand in for the REST facade's
//! room lifecycle. Transient-failure injection exercises the retry path.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DocumentStore, File, FileVersion, Room, StoreError, VERSION_RING};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, String>,
    rooms: HashMap<Uuid, Room>,
    members: HashSet<(Uuid, Uuid)>,
    files: HashMap<Uuid, File>,
    versions: HashMap<Uuid, Vec<FileVersion>>,
    /// Remaining writes to fail with a transient error.
    fail_writes: u32,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user row (facade-owned in production).
    pub async fn seed_user(&self, user_id: Uuid, username: impl Into<String>) {
        self.inner.write().await.users.insert(user_id, username.into());
    }

    /// Seed a room row (facade-owned in production).
    pub async fn seed_room(&self, room: Room) {
        self.inner.write().await.rooms.insert(room.id, room);
    }

    /// Seed a membership row.
    pub async fn seed_member(&self, room_id: Uuid, user_id: Uuid) {
        self.inner.write().await.members.insert((room_id, user_id));
    }

    /// Delete a room, cascading to memberships, files, and versions.
    pub async fn delete_room(&self, room_id: Uuid) {
        let mut inner = self.inner.write().await;
        inner.rooms.remove(&room_id);
        inner.members.retain(|(r, _)| *r != room_id);
        let file_ids: Vec<Uuid> = inner
            .files
            .values()
            .filter(|f| f.room_id == room_id)
            .map(|f| f.id)
            .collect();
        for file_id in file_ids {
            inner.files.remove(&file_id);
            inner.versions.remove(&file_id);
        }
    }

    /// Fail the next `n` writes with a transient error (retry-path tests).
    pub async fn inject_transient_failures(&self, n: u32) {
        self.inner.write().await.fail_writes = n;
    }

    fn take_injected_failure(inner: &mut Inner) -> Result<(), StoreError> {
        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_file(&self, file_id: Uuid) -> Result<File, StoreError> {
        let inner = self.inner.read().await;
        inner.files.get(&file_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn save_content(&self, file_id: Uuid, content: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        Self::take_injected_failure(&mut inner)?;
        let file = inner.files.get_mut(&file_id).ok_or(StoreError::NotFound)?;
        file.content = content.to_string();
        file.updated_at = Utc::now();
        Ok(())
    }

    async fn append_version(
        &self,
        file_id: Uuid,
        prior_content: &str,
        user_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        Self::take_injected_failure(&mut inner)?;
        if !inner.files.contains_key(&file_id) {
            return Err(StoreError::NotFound);
        }
        let now = Utc::now();
        let versions = inner.versions.entry(file_id).or_default();
        // Same dedup the unique (file, second) constraint gives Postgres.
        if let Some(last) = versions.last() {
            if last.created_at.timestamp() == now.timestamp() && last.content == prior_content {
                return Ok(());
            }
        }
        versions.push(FileVersion {
            id: Uuid::new_v4(),
            file_id,
            content: prior_content.to_string(),
            user_id,
            created_at: now,
        });
        Ok(())
    }

    async fn list_versions(&self, file_id: Uuid) -> Result<Vec<FileVersion>, StoreError> {
        let inner = self.inner.read().await;
        let mut versions = inner.versions.get(&file_id).cloned().unwrap_or_default();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        versions.truncate(VERSION_RING as usize);
        Ok(versions)
    }

    async fn list_files(&self, room_id: Uuid) -> Result<Vec<File>, StoreError> {
        let inner = self.inner.read().await;
        if !inner.rooms.contains_key(&room_id) {
            return Err(StoreError::NotFound);
        }
        let mut files: Vec<File> = inner
            .files
            .values()
            .filter(|f| f.room_id == room_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn create_file(
        &self,
        room_id: Uuid,
        name: &str,
        language: &str,
    ) -> Result<File, StoreError> {
        let mut inner = self.inner.write().await;
        Self::take_injected_failure(&mut inner)?;
        if !inner.rooms.contains_key(&room_id) {
            return Err(StoreError::NotFound);
        }
        if inner
            .files
            .values()
            .any(|f| f.room_id == room_id && f.name == name)
        {
            return Err(StoreError::Conflict);
        }
        let now = Utc::now();
        let file = File {
            id: Uuid::new_v4(),
            room_id,
            name: name.to_string(),
            content: String::new(),
            language: language.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.files.insert(file.id, file.clone());
        Ok(file)
    }

    async fn delete_file(&self, file_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        Self::take_injected_failure(&mut inner)?;
        if inner.files.remove(&file_id).is_none() {
            return Err(StoreError::NotFound);
        }
        inner.versions.remove(&file_id);
        Ok(())
    }

    async fn room_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.members.contains(&(room_id, user_id)))
    }
}

/// Seed one room with one member; returns the room id. Test helper shared
/// by the integration suites.
pub async fn seed_room_with_member(store: &MemoryStore, user_id: Uuid, username: &str) -> Uuid {
    let room_id = Uuid::new_v4();
    store.seed_user(user_id, username).await;
    store
        .seed_room(Room {
            id: room_id,
            name: "test-room".to_string(),
            owner_id: user_id,
            invite_code: format!("invite-{}", &room_id.to_string()[..8]),
        })
        .await;
    store.seed_member(room_id, user_id).await;
    room_id
}
