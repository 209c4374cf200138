//! State types for the membership request state machine.
//!
//! This module defines the explicit data model for a single pending request:
//! who asked, what they asked for, which card represents the request, and
//! where the request is in its lifecycle. Following the principle of "make
//! illegal states unrepresentable", the request kind is an explicit enum tag
//! rather than something inferred from card text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Newtype for a Discord user snowflake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for a Discord channel snowflake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for a Discord message snowflake.
///
/// A message id is the card reference: the join key that resolves an incoming
/// reaction back to its tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for a Discord role snowflake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleId(pub u64);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for a Discord guild snowflake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuildId(pub u64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The member whose access or account is the subject of a request.
///
/// The id is stable across the request's lifetime; the name is carried only
/// for card rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: UserId,
    pub name: String,
}

impl Requester {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// What kind of request a card represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Grant the requester the verified role (and drop unverified).
    AccessAuth,
    /// Create a directory account for the requester.
    DirectoryEnrollment,
}

impl RequestKind {
    /// Stable machine tag, used in the card footer and the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessAuth => "access_auth",
            Self::DirectoryEnrollment => "directory_enrollment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "access_auth" => Some(Self::AccessAuth),
            "directory_enrollment" => Some(Self::DirectoryEnrollment),
            _ => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a request. Pending is initial; the other two are
/// terminal and never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Pending,
    Approved,
    Rejected,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific payload. The enum tag is the explicit kind marker that gets
/// persisted and serialized into the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    AccessAuth,
    DirectoryEnrollment(EnrollmentPayload),
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::AccessAuth => RequestKind::AccessAuth,
            Self::DirectoryEnrollment(_) => RequestKind::DirectoryEnrollment,
        }
    }
}

/// Identity details supplied with a directory enrollment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentPayload {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl EnrollmentPayload {
    /// Validate and construct a payload. All three fields must be non-empty
    /// after trimming; no request may be created from a payload that fails
    /// here.
    pub fn validate(
        first_name: &str,
        last_name: &str,
        email: &str,
    ) -> Result<Self, ValidationError> {
        let first_name = first_name.trim();
        let last_name = last_name.trim();
        let email = email.trim();

        if first_name.is_empty() {
            return Err(ValidationError { field: "first_name" });
        }
        if last_name.is_empty() {
            return Err(ValidationError { field: "last_name" });
        }
        if email.is_empty() {
            return Err(ValidationError { field: "email" });
        }

        Ok(Self {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.to_string(),
        })
    }
}

/// A request payload field failed validation. No side effect has occurred
/// when this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} must be non-empty", self.field)
    }
}

impl std::error::Error for ValidationError {}

/// The unit of work: one pending decision, represented by one live card.
///
/// Invariant: exactly one request maps to one live card at a time. The card
/// is deleted when the request reaches a terminal state, so a stale card can
/// never resolve to a request twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRequest {
    /// The card rendered for this request; also the tracking key.
    pub card: MessageId,
    pub requester: Requester,
    pub payload: RequestPayload,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

impl MembershipRequest {
    pub fn pending(card: MessageId, requester: Requester, payload: RequestPayload) -> Self {
        Self {
            card,
            requester,
            payload,
            state: RequestState::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }
}

/// Directory account attributes, derived on demand from an enrollment
/// payload and discarded after the provisioning call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryAccountSpec {
    pub uid: String,
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
    pub email: String,
    pub generate_random_credential: bool,
}

impl DirectoryAccountSpec {
    /// Derive a spec from enrollment details.
    ///
    /// The handle rule is deterministic: lowercase first initial followed by
    /// the lowercase last name, restricted to ASCII alphanumerics
    /// ("Jane Doe" -> "jdoe"). The generated credential is never sent back
    /// to chat.
    pub fn derive(payload: &EnrollmentPayload) -> Self {
        Self {
            uid: derive_uid(&payload.first_name, &payload.last_name),
            first_name: payload.first_name.clone(),
            last_name: payload.last_name.clone(),
            display_name: format!("{} {}", payload.first_name, payload.last_name),
            email: payload.email.clone(),
            generate_random_credential: true,
        }
    }

    /// Build a spec from an explicitly supplied handle (admin path).
    pub fn with_uid(
        uid: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        let first_name = first_name.into();
        let last_name = last_name.into();
        Self {
            uid: uid.into(),
            display_name: format!("{} {}", first_name, last_name),
            first_name,
            last_name,
            email: email.into(),
            generate_random_credential: true,
        }
    }
}

/// Deterministic directory handle: first initial + last name, lowercased,
/// non-alphanumerics stripped.
pub fn derive_uid(first_name: &str, last_name: &str) -> String {
    let initial = first_name
        .chars()
        .find(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase());

    let rest: String = last_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    match initial {
        Some(c) => format!("{}{}", c, rest),
        None => rest,
    }
}

/// An abstract access tier, mapped to a platform role id via configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalRole {
    Unverified,
    Verified,
}

impl LogicalRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
        }
    }
}

impl fmt::Display for LogicalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOperation {
    Grant,
    Revoke,
}

impl fmt::Display for RoleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grant => write!(f, "grant"),
            Self::Revoke => write!(f, "revoke"),
        }
    }
}

/// A single role membership change, constructed per transition and discarded
/// after it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleGrant {
    pub subject: UserId,
    pub logical_role: LogicalRole,
    pub operation: RoleOperation,
}

/// What a decision event ultimately did, returned to the caller for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing happened: unknown card, self reaction, already-decided
    /// request, or a reaction symbol the card does not define.
    NoOp,
    Approved,
    Rejected,
    /// Approved, but the directory identity already existed. Not a failure;
    /// the request still retires.
    Conflict,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "no-op"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_terminal() {
        assert!(!RequestState::Pending.is_terminal());
        assert!(RequestState::Approved.is_terminal());
        assert!(RequestState::Rejected.is_terminal());
    }

    #[test]
    fn test_kind_tag_round_trip() {
        for kind in [RequestKind::AccessAuth, RequestKind::DirectoryEnrollment] {
            assert_eq!(RequestKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RequestKind::parse("AUTH REQUEST"), None);
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let err = EnrollmentPayload::validate("Jane", "Doe", "").unwrap_err();
        assert_eq!(err.field, "email");

        let err = EnrollmentPayload::validate("  ", "Doe", "jane@example.com").unwrap_err();
        assert_eq!(err.field, "first_name");

        let err = EnrollmentPayload::validate("Jane", "\t", "jane@example.com").unwrap_err();
        assert_eq!(err.field, "last_name");
    }

    #[test]
    fn test_validate_trims_fields() {
        let payload =
            EnrollmentPayload::validate(" Jane ", "Doe", " jane@example.com ").unwrap();
        assert_eq!(payload.first_name, "Jane");
        assert_eq!(payload.email, "jane@example.com");
    }

    #[test]
    fn test_derive_uid() {
        assert_eq!(derive_uid("Jane", "Doe"), "jdoe");
        assert_eq!(derive_uid("jean-luc", "O'Brien"), "jobrien");
        assert_eq!(derive_uid("", "Doe"), "doe");
    }

    #[test]
    fn test_account_spec_derivation() {
        let payload =
            EnrollmentPayload::validate("Jane", "Doe", "jane@example.com").unwrap();
        let spec = DirectoryAccountSpec::derive(&payload);

        assert_eq!(spec.uid, "jdoe");
        assert_eq!(spec.display_name, "Jane Doe");
        assert_eq!(spec.email, "jane@example.com");
        assert!(spec.generate_random_credential);
    }

    #[test]
    fn test_pending_request_starts_pending() {
        let request = MembershipRequest::pending(
            MessageId(42),
            Requester::new(UserId(7), "jane"),
            RequestPayload::AccessAuth,
        );
        assert_eq!(request.state, RequestState::Pending);
        assert_eq!(request.kind(), RequestKind::AccessAuth);
    }

    #[test]
    fn test_request_serde_round_trip() {
        let request = MembershipRequest::pending(
            MessageId(42),
            Requester::new(UserId(7), "jane"),
            RequestPayload::DirectoryEnrollment(
                EnrollmentPayload::validate("Jane", "Doe", "jane@example.com").unwrap(),
            ),
        );

        let json = serde_json::to_string(&request).unwrap();
        let back: MembershipRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }
}
