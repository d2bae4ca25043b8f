use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::*;

use super::{StorageError, UserRepository, UserTable};

/// Volatile repository. State lives only as long as the value.
#[derive(Default)]
pub struct MemoryUserRepository {
    table: UserTable,
    create_lock: Mutex<()>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_limit(mut self, max_users: usize) -> Self {
        self.table.set_max_users(max_users);
        self
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        Ok(self.table.read(email).await)
    }

    async fn find_projection(
        &self,
        email: &str,
        fields: &[Field],
    ) -> Result<Option<UserProjection>, StorageError> {
        let Some(shared) = self.table.get(email) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(Some(guard.project(fields)))
    }

    async fn create(&self, user: User) -> Result<User, StorageError> {
        let _creating = self.create_lock.lock().await;
        if self.table.contains(&user.email) {
            return Err(StorageError::DuplicateKey(user.email));
        }
        if !self.table.has_room() {
            return Err(StorageError::CapacityExceeded);
        }
        self.table.insert_new(user.clone())?;
        Ok(user)
    }

    async fn update(&self, email: &str, patch: UserPatch) -> Result<User, StorageError> {
        let shared = self
            .table
            .get(email)
            .ok_or_else(|| StorageError::MissingRecord(email.to_string()))?;
        let mut guard = shared.write().await;
        guard.apply(&patch);
        Ok(guard.clone())
    }

    fn user_count(&self) -> usize {
        self.table.len()
    }
}
