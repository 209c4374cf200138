//! Role membership changes.
//!
//! Translates logical roles (verified, unverified) into the platform role ids
//! they are mapped to in configuration and applies grant/revoke operations
//! through the chat adapter.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::chat::{ChatApi, ChatError};
use crate::tracker::state::{LogicalRole, RoleGrant, RoleId, RoleOperation, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleError {
    /// No platform role is configured for this logical role.
    UnknownRole(LogicalRole),
    /// The subject left the community before the change could apply.
    SubjectNotFound(UserId),
    Api(String),
}

impl fmt::Display for RoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRole(role) => write!(f, "no role id configured for '{}'", role),
            Self::SubjectNotFound(user) => write!(f, "user {} is not a member", user),
            Self::Api(message) => write!(f, "role change failed: {}", message),
        }
    }
}

impl std::error::Error for RoleError {}

/// Applies role grants through the chat platform.
#[derive(Clone)]
pub struct RoleCoordinator {
    chat: Arc<dyn ChatApi>,
    roles: HashMap<LogicalRole, RoleId>,
}

impl RoleCoordinator {
    pub fn new(chat: Arc<dyn ChatApi>, roles: HashMap<LogicalRole, RoleId>) -> Self {
        Self { chat, roles }
    }

    fn resolve(&self, role: LogicalRole) -> Result<RoleId, RoleError> {
        self.roles
            .get(&role)
            .copied()
            .ok_or(RoleError::UnknownRole(role))
    }

    /// Apply a single grant or revoke.
    pub async fn apply(&self, grant: RoleGrant) -> Result<(), RoleError> {
        let role_id = self.resolve(grant.logical_role)?;

        let result = match grant.operation {
            RoleOperation::Grant => self.chat.add_role(grant.subject, role_id).await,
            RoleOperation::Revoke => self.chat.remove_role(grant.subject, role_id).await,
        };

        match result {
            Ok(()) => {
                info!(
                    subject = %grant.subject,
                    role = %grant.logical_role,
                    operation = %grant.operation,
                    "role change applied"
                );
                Ok(())
            }
            Err(ChatError::SubjectNotFound(user)) => Err(RoleError::SubjectNotFound(user)),
            Err(other) => Err(RoleError::Api(other.to_string())),
        }
    }

    /// Grant a logical role directly (onboarding path).
    pub async fn grant(&self, subject: UserId, role: LogicalRole) -> Result<(), RoleError> {
        self.apply(RoleGrant {
            subject,
            logical_role: role,
            operation: RoleOperation::Grant,
        })
        .await
    }
}
