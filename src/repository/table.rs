use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;

use crate::limits::MAX_USERS_PER_TENANT;
use crate::model::*;

use super::StorageError;

pub type SharedUser = Arc<RwLock<User>>;

/// Concurrent email → user index. Each record sits behind its own `RwLock`
/// so a patch and anything persisted alongside it happen under one guard.
pub struct UserTable {
    users: DashMap<String, SharedUser>,
    max_users: usize,
}

impl Default for UserTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UserTable {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            max_users: MAX_USERS_PER_TENANT,
        }
    }

    /// Rebuild from a replayed event log. Patches for unknown emails are skipped.
    pub fn from_events(events: &[Event]) -> Self {
        let mut users: HashMap<String, User> = HashMap::new();
        for event in events {
            match event {
                Event::UserCreated { user } => {
                    users.insert(user.email.clone(), user.clone());
                }
                Event::UserPatched { email, patch } => {
                    if let Some(user) = users.get_mut(email) {
                        user.apply(patch);
                    }
                }
            }
        }
        let table = Self::new();
        for (email, user) in users {
            table.users.insert(email, Arc::new(RwLock::new(user)));
        }
        table
    }

    pub fn set_max_users(&mut self, max_users: usize) {
        self.max_users = max_users;
    }

    /// Whether one more user fits under the cap. Callers must serialize
    /// this check with the insert that follows it.
    pub fn has_room(&self) -> bool {
        self.users.len() < self.max_users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, email: &str) -> bool {
        self.users.contains_key(email)
    }

    pub fn get(&self, email: &str) -> Option<SharedUser> {
        self.users.get(email).map(|e| e.value().clone())
    }

    /// Insert only if the email is free.
    pub fn insert_new(&self, user: User) -> Result<(), StorageError> {
        match self.users.entry(user.email.clone()) {
            Entry::Occupied(_) => Err(StorageError::DuplicateKey(user.email)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(user)));
                Ok(())
            }
        }
    }

    pub async fn read(&self, email: &str) -> Option<User> {
        let shared = self.get(email)?;
        let guard = shared.read().await;
        Some(guard.clone())
    }

    /// Point-in-time copy of every record, one `UserCreated` per user.
    pub async fn snapshot_events(&self) -> Vec<Event> {
        let records: Vec<SharedUser> = self.users.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(records.len());
        for shared in records {
            let user = shared.read().await.clone();
            events.push(Event::UserCreated { user });
        }
        events
    }
}
