//! Pure decision evaluation.
//!
//! Reactions (or any future approval channel) are lowered into
//! [`DecisionEvent`]s by the ingress layer. This module decides, with no side
//! effects, what a decision event means for a tracked request: ignore it, or
//! transition to a terminal state with a list of followup actions. The
//! tracker executes the followups against real adapters.

use super::state::{
    DirectoryAccountSpec, LogicalRole, MembershipRequest, MessageId, RequestPayload, RequestState,
    RoleGrant, RoleOperation, UserId,
};

/// Canonical approve symbol (thumbs up).
pub const APPROVE_EMOJI: &str = "\u{1F44D}";
/// Canonical reject symbol (thumbs down).
pub const REJECT_EMOJI: &str = "\u{1F44E}";

/// The two decisions an approver can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
}

impl Verdict {
    /// Map a reaction symbol to a verdict. Any other symbol carries no
    /// decision and is ignored upstream.
    pub fn from_reaction(emoji: &str) -> Option<Self> {
        match emoji {
            APPROVE_EMOJI => Some(Self::Approve),
            REJECT_EMOJI => Some(Self::Reject),
            _ => None,
        }
    }
}

/// An approval-channel-agnostic decision against a card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionEvent {
    pub card: MessageId,
    pub verdict: Verdict,
    pub actor: UserId,
}

/// Why a decision event was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The actor is the bot itself (the affordance reactions it attaches).
    SelfAuthored,
    /// The request already reached a terminal state.
    AlreadyDecided,
    /// The card does not define this verdict (reject on an access card).
    VerdictNotDefined,
}

/// Side effects to perform after a transition, as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    SetRole(RoleGrant),
    Provision(DirectoryAccountSpec),
}

/// Result of evaluating a decision event against a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Ignore(IgnoreReason),
    Transition {
        next: RequestState,
        followups: Vec<Followup>,
    },
}

/// Pure transition function for a single request.
///
/// The subject of every followup is the request's own embedded requester,
/// never the reacting actor. Resolution of the card to a request (and the
/// unknown-card no-op) happens in the tracker before this is called.
pub fn evaluate(
    request: &MembershipRequest,
    event: &DecisionEvent,
    bot_user: UserId,
) -> Evaluation {
    if event.actor == bot_user {
        return Evaluation::Ignore(IgnoreReason::SelfAuthored);
    }

    if request.state != RequestState::Pending {
        return Evaluation::Ignore(IgnoreReason::AlreadyDecided);
    }

    match (&request.payload, event.verdict) {
        (RequestPayload::AccessAuth, Verdict::Approve) => Evaluation::Transition {
            next: RequestState::Approved,
            followups: vec![
                Followup::SetRole(RoleGrant {
                    subject: request.requester.id,
                    logical_role: LogicalRole::Verified,
                    operation: RoleOperation::Grant,
                }),
                Followup::SetRole(RoleGrant {
                    subject: request.requester.id,
                    logical_role: LogicalRole::Unverified,
                    operation: RoleOperation::Revoke,
                }),
            ],
        },

        // Access cards only define approve.
        (RequestPayload::AccessAuth, Verdict::Reject) => {
            Evaluation::Ignore(IgnoreReason::VerdictNotDefined)
        }

        (RequestPayload::DirectoryEnrollment(payload), Verdict::Approve) => {
            Evaluation::Transition {
                next: RequestState::Approved,
                followups: vec![Followup::Provision(DirectoryAccountSpec::derive(payload))],
            }
        }

        (RequestPayload::DirectoryEnrollment(_), Verdict::Reject) => Evaluation::Transition {
            next: RequestState::Rejected,
            followups: vec![],
        },
    }
}
