//! Repository abstraction for request persistence.
//!
//! The tracker treats the chat card as a cache; the repository is the source
//! of truth for in-flight requests. Implementations provide the actual
//! backend (in-memory for tests, SQLite in production), and a restart
//! rehydrates pending requests from here.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use std::fmt;

use super::state::{MembershipRequest, MessageId, RequestState};

/// Error from a repository backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryError {
    operation: String,
    message: String,
}

impl RepositoryError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error during {}: {}", self.operation, self.message)
    }
}

impl std::error::Error for RepositoryError {}

/// Result of attempting to claim the one allowed decision for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// This caller won the claim; the returned request already carries the
    /// new terminal state.
    Claimed(MembershipRequest),
    /// Another decision got there first (or the request was already
    /// terminal).
    AlreadyDecided,
    /// No request is tracked for this card.
    Missing,
}

/// Storage backend for membership requests, keyed by card reference.
#[async_trait]
pub trait RequestRepository: Send + Sync {
    /// Get the request for a card, if tracked.
    async fn get(&self, card: &MessageId) -> Result<Option<MembershipRequest>, RepositoryError>;

    /// Store a request (upsert, keyed by `request.card`).
    async fn put(&self, request: MembershipRequest) -> Result<(), RepositoryError>;

    /// Drop a request from tracking.
    async fn delete(&self, card: &MessageId)
        -> Result<Option<MembershipRequest>, RepositoryError>;

    /// Atomically transition a pending request to a terminal state.
    ///
    /// This is the race guard: of any number of concurrent decisions against
    /// the same card, exactly one receives `Claimed`; the rest observe
    /// `AlreadyDecided` (or `Missing` once the card is retired) and must
    /// treat the event as a no-op.
    async fn claim_decision(
        &self,
        card: &MessageId,
        next: RequestState,
    ) -> Result<ClaimResult, RepositoryError>;

    /// All requests still awaiting a decision, for rehydration and expiry.
    async fn get_pending(&self) -> Result<Vec<MembershipRequest>, RepositoryError>;
}
