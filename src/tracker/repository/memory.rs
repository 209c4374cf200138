//! In-memory implementation of `RequestRepository`.
//!
//! Stores requests in a `HashMap` protected by a `RwLock`. All state is lost
//! on restart; production uses the SQLite backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ClaimResult, RepositoryError, RequestRepository};
use crate::tracker::state::{MembershipRequest, MessageId, RequestState};

pub struct InMemoryRepository {
    requests: RwLock<HashMap<MessageId, MembershipRequest>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestRepository for InMemoryRepository {
    async fn get(&self, card: &MessageId) -> Result<Option<MembershipRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.get(card).cloned())
    }

    async fn put(&self, request: MembershipRequest) -> Result<(), RepositoryError> {
        let mut requests = self.requests.write().await;
        requests.insert(request.card, request);
        Ok(())
    }

    async fn delete(
        &self,
        card: &MessageId,
    ) -> Result<Option<MembershipRequest>, RepositoryError> {
        let mut requests = self.requests.write().await;
        Ok(requests.remove(card))
    }

    async fn claim_decision(
        &self,
        card: &MessageId,
        next: RequestState,
    ) -> Result<ClaimResult, RepositoryError> {
        // Check-and-set under the write lock so only one claim can win.
        let mut requests = self.requests.write().await;
        match requests.get_mut(card) {
            None => Ok(ClaimResult::Missing),
            Some(request) if request.state.is_terminal() => Ok(ClaimResult::AlreadyDecided),
            Some(request) => {
                request.state = next;
                Ok(ClaimResult::Claimed(request.clone()))
            }
        }
    }

    async fn get_pending(&self) -> Result<Vec<MembershipRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.state == RequestState::Pending)
            .cloned()
            .collect())
    }
}
