//! Storage of user records keyed by email.
//!
//! Implementations serialize operations on a single record but not sequences
//! of calls; callers that read, decide and write must hold their own lock.

mod durable;
mod error;
mod memory;
mod table;

pub use durable::DurableUserRepository;
pub use error::StorageError;
pub use memory::MemoryUserRepository;
pub use table::{SharedUser, UserTable};

use async_trait::async_trait;

use crate::model::*;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StorageError>;

    /// Fetch only `fields` of the record.
    async fn find_projection(
        &self,
        email: &str,
        fields: &[Field],
    ) -> Result<Option<UserProjection>, StorageError>;

    /// Insert a new record. Fails with `DuplicateKey` if the email is taken.
    async fn create(&self, user: User) -> Result<User, StorageError>;

    /// Apply `patch` to the record and return the updated copy.
    /// Fails with `MissingRecord` if the email is unknown.
    async fn update(&self, email: &str, patch: UserPatch) -> Result<User, StorageError>;

    fn user_count(&self) -> usize;
}
