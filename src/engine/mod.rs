mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;
mod validate;

pub use error::EngagementError;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::repository::UserRepository;

/// Booking and favorites protocol over a user repository.
///
/// Every mutation reads the user, checks its precondition and writes back.
/// The repository only serializes single calls, so the store holds a
/// per-email mutex from the read to the write; two mutations for the same
/// user never interleave. Reads take no lock.
pub struct EngagementStore<R: ?Sized> {
    repo: Arc<R>,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<R: UserRepository + ?Sized> EngagementStore<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            user_locks: DashMap::new(),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    /// Acquire the read-modify-write lock for one user.
    pub(super) async fn lock_user(&self, email: &str) -> UserLock<'_> {
        let lock = self
            .user_locks
            .entry(email.to_string())
            .or_default()
            .value()
            .clone();
        UserLock {
            locks: &self.user_locks,
            email: email.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

/// Held for the duration of one mutation. On release the map entry is
/// dropped unless another task has cloned the mutex in the meantime, so the
/// map only holds emails with a mutation in flight.
pub(super) struct UserLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    email: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Clones are only made under the shard lock that remove_if holds,
        // so a count of one means nobody is waiting.
        self.locks
            .remove_if(&self.email, |_, lock| Arc::strong_count(lock) == 1);
    }
}
