//! The request tracker: the approval workflow's core.
//!
//! Owns the lifecycle of every membership request from card creation through
//! decision to retirement. The tracker is deliberately split: `state` holds
//! the data model, `decision` the pure transition logic, `repository` the
//! persistence seam, and this module the orchestration that ties the pure
//! core to the chat, role, and directory adapters.

pub mod decision;
pub mod repository;
pub mod state;

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use crate::card::Card;
use crate::chat::{ChatApi, ChatError};
use crate::directory::{DirectoryError, DirectoryProvisioner, ProvisionOutcome};
use crate::roles::RoleCoordinator;
use decision::{evaluate, DecisionEvent, Evaluation, Followup, APPROVE_EMOJI, REJECT_EMOJI};
use repository::{ClaimResult, RepositoryError, RequestRepository};
use state::{
    ChannelId, MembershipRequest, MessageId, Outcome, RequestPayload, RequestState, Requester,
    ValidationError,
};

/// Failure opening a new request. No request is tracked and no card is left
/// behind when this is returned.
#[derive(Debug)]
pub enum BeginRequestError {
    Validation(ValidationError),
    Chat(ChatError),
    Repository(RepositoryError),
}

impl fmt::Display for BeginRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "invalid request: {}", e),
            Self::Chat(e) => write!(f, "could not post request card: {}", e),
            Self::Repository(e) => write!(f, "could not track request: {}", e),
        }
    }
}

impl std::error::Error for BeginRequestError {}

impl From<ValidationError> for BeginRequestError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<ChatError> for BeginRequestError {
    fn from(e: ChatError) -> Self {
        Self::Chat(e)
    }
}

/// Orchestrates request lifecycles against the configured adapters.
pub struct RequestTracker {
    repository: Arc<dyn RequestRepository>,
    chat: Arc<dyn ChatApi>,
    provisioner: DirectoryProvisioner,
    roles: RoleCoordinator,
    review_channel: ChannelId,
    bot_user: state::UserId,
}

impl RequestTracker {
    pub fn new(
        repository: Arc<dyn RequestRepository>,
        chat: Arc<dyn ChatApi>,
        provisioner: DirectoryProvisioner,
        roles: RoleCoordinator,
        review_channel: ChannelId,
        bot_user: state::UserId,
    ) -> Self {
        Self {
            repository,
            chat,
            provisioner,
            roles,
            review_channel,
            bot_user,
        }
    }

    pub fn review_channel(&self) -> ChannelId {
        self.review_channel
    }

    pub fn bot_user(&self) -> state::UserId {
        self.bot_user
    }

    /// Open an access authorization request for a member.
    pub async fn begin_access_request(
        &self,
        requester: Requester,
    ) -> Result<MessageId, BeginRequestError> {
        let card = Card::access_request(&requester);
        self.post_and_track(card, requester, RequestPayload::AccessAuth, &[APPROVE_EMOJI])
            .await
    }

    /// Open a directory enrollment request for a member.
    ///
    /// Validation runs before any side effect, so a malformed request never
    /// produces a card.
    pub async fn begin_enrollment_request(
        &self,
        requester: Requester,
        first_name: &str,
        last_name: &str,
        email: &str,
    ) -> Result<MessageId, BeginRequestError> {
        let payload = state::EnrollmentPayload::validate(first_name, last_name, email)?;
        let card = Card::enrollment_request(&requester, &payload);
        self.post_and_track(
            card,
            requester,
            RequestPayload::DirectoryEnrollment(payload),
            &[APPROVE_EMOJI, REJECT_EMOJI],
        )
        .await
    }

    async fn post_and_track(
        &self,
        card: Card,
        requester: Requester,
        payload: RequestPayload,
        affordances: &[&str],
    ) -> Result<MessageId, BeginRequestError> {
        let message = self.chat.send_card(self.review_channel, &card).await?;

        for emoji in affordances {
            if let Err(e) = self
                .chat
                .add_reaction(self.review_channel, message, emoji)
                .await
            {
                self.remove_dangling_card(message).await;
                return Err(BeginRequestError::Chat(e));
            }
        }

        let request = MembershipRequest::pending(message, requester, payload);
        if let Err(e) = self.repository.put(request).await {
            self.remove_dangling_card(message).await;
            return Err(BeginRequestError::Repository(e));
        }

        info!(card = %message, kind = %card.kind, "request opened");
        Ok(message)
    }

    /// A card missing its affordances or tracking entry can never resolve to
    /// a decision; take it back down rather than leave it dangling.
    async fn remove_dangling_card(&self, message: MessageId) {
        if let Err(e) = self.chat.delete_message(self.review_channel, message).await {
            warn!(card = %message, error = %e, "failed to remove dangling card");
        }
    }

    /// Provision a directory account outside the review flow (owner command
    /// path). No card and no tracked request are involved.
    pub async fn provision_direct(
        &self,
        spec: &state::DirectoryAccountSpec,
    ) -> Result<ProvisionOutcome, DirectoryError> {
        self.provisioner.provision(spec).await
    }

    /// Apply a decision event to its tracked request.
    ///
    /// Infallible by contract: anything that goes wrong after the terminal
    /// state is claimed is logged and reported to the review channel, never
    /// bubbled up to the event source.
    pub async fn handle_decision(&self, event: DecisionEvent) -> Outcome {
        let request = match self.repository.get(&event.card).await {
            Ok(Some(request)) => request,
            Ok(None) => return Outcome::NoOp,
            Err(e) => {
                error!(card = %event.card, error = %e, "could not load request for decision");
                return Outcome::NoOp;
            }
        };

        let (next, followups) = match evaluate(&request, &event, self.bot_user) {
            Evaluation::Ignore(reason) => {
                info!(card = %event.card, reason = ?reason, "decision ignored");
                return Outcome::NoOp;
            }
            Evaluation::Transition { next, followups } => (next, followups),
        };

        // Claim the terminal state before any downstream I/O so a racing
        // decision observes it and backs off.
        let claimed = match self.repository.claim_decision(&event.card, next).await {
            Ok(ClaimResult::Claimed(request)) => request,
            Ok(ClaimResult::AlreadyDecided) | Ok(ClaimResult::Missing) => {
                info!(card = %event.card, "decision lost the claim race");
                return Outcome::NoOp;
            }
            Err(e) => {
                error!(card = %event.card, error = %e, "could not claim decision");
                return Outcome::NoOp;
            }
        };

        let mut outcome = match next {
            RequestState::Approved => Outcome::Approved,
            RequestState::Rejected => Outcome::Rejected,
            RequestState::Pending => Outcome::NoOp,
        };

        for followup in followups {
            match followup {
                Followup::SetRole(grant) => {
                    if let Err(e) = self.roles.apply(grant).await {
                        error!(card = %event.card, error = %e, "role change failed");
                        self.operator_note(&format!(
                            "Approved request {} but the role change failed: {}",
                            event.card, e
                        ))
                        .await;
                    }
                }
                Followup::Provision(spec) => match self.provisioner.provision(&spec).await {
                    Ok(ProvisionOutcome::Created) => {}
                    Ok(ProvisionOutcome::AlreadyExists) => outcome = Outcome::Conflict,
                    Err(e) => {
                        error!(card = %event.card, error = %e, "provisioning failed");
                        self.operator_note(&format!(
                            "Approved request {} but provisioning failed: {}",
                            event.card, e
                        ))
                        .await;
                    }
                },
            }
        }

        self.retire(&claimed, &outcome.to_string()).await;

        info!(
            card = %event.card,
            kind = %claimed.kind(),
            actor = %event.actor,
            outcome = %outcome,
            "request decided"
        );
        outcome
    }

    /// Expire pending requests older than `ttl`. Returns how many expired.
    ///
    /// Each expiry goes through the same claim as a decision, so a sweep
    /// racing a live reaction cannot double-resolve a request.
    pub async fn expire_stale(&self, ttl: Duration) -> usize {
        let pending = match self.repository.get_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "could not load pending requests for expiry");
                return 0;
            }
        };

        let cutoff = Utc::now() - ttl;
        let mut expired = 0;

        for request in pending {
            if request.created_at >= cutoff {
                continue;
            }

            match self
                .repository
                .claim_decision(&request.card, RequestState::Rejected)
                .await
            {
                Ok(ClaimResult::Claimed(claimed)) => {
                    info!(card = %claimed.card, kind = %claimed.kind(), "request expired");
                    self.retire(&claimed, "expired").await;
                    expired += 1;
                }
                Ok(ClaimResult::AlreadyDecided) | Ok(ClaimResult::Missing) => {}
                Err(e) => {
                    error!(card = %request.card, error = %e, "could not claim expiring request");
                }
            }
        }

        expired
    }

    /// Retire a decided request: post the terminal disposition, take the card
    /// down, and drop it from tracking. Failures here are logged only; the
    /// decision itself already happened.
    async fn retire(&self, request: &MembershipRequest, disposition: &str) {
        self.operator_note(&format!(
            "Request from {} ({}): {}",
            request.requester.name,
            request.kind(),
            disposition
        ))
        .await;

        if let Err(e) = self
            .chat
            .delete_message(self.review_channel, request.card)
            .await
        {
            warn!(card = %request.card, error = %e, "could not delete retired card");
        }

        if let Err(e) = self.repository.delete(&request.card).await {
            error!(card = %request.card, error = %e, "could not drop retired request");
        }
    }

    async fn operator_note(&self, text: &str) {
        if let Err(e) = self.chat.send_message(self.review_channel, text).await {
            warn!(error = %e, "could not post note to review channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatError;
    use crate::directory::{AccountHandle, DirectoryApi, DirectoryError};
    use crate::tracker::decision::Verdict;
    use crate::tracker::repository::InMemoryRepository;
    use crate::tracker::state::{LogicalRole, RoleId, UserId};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const BOT: UserId = UserId(1);
    const APPROVER: UserId = UserId(2);
    const REQUESTER: UserId = UserId(3);
    const REVIEW: ChannelId = ChannelId(500);

    #[derive(Default)]
    struct MockChat {
        next_message_id: Mutex<u64>,
        cards: Mutex<Vec<(ChannelId, Card)>>,
        messages: Mutex<Vec<(ChannelId, String)>>,
        reactions: Mutex<Vec<(MessageId, String)>>,
        deleted: Mutex<Vec<MessageId>>,
        roles_added: Mutex<Vec<(UserId, RoleId)>>,
        roles_removed: Mutex<Vec<(UserId, RoleId)>>,
        fail_reactions: bool,
    }

    impl MockChat {
        fn new() -> Self {
            Self {
                next_message_id: Mutex::new(1000),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ChatApi for MockChat {
        async fn send_card(&self, channel: ChannelId, card: &Card) -> Result<MessageId, ChatError> {
            let mut next = self.next_message_id.lock().unwrap();
            *next += 1;
            let id = MessageId(*next);
            self.cards.lock().unwrap().push((channel, card.clone()));
            Ok(id)
        }
        async fn send_message(
            &self,
            channel: ChannelId,
            text: &str,
        ) -> Result<MessageId, ChatError> {
            self.messages
                .lock()
                .unwrap()
                .push((channel, text.to_string()));
            Ok(MessageId(1))
        }
        async fn add_reaction(
            &self,
            _: ChannelId,
            message: MessageId,
            emoji: &str,
        ) -> Result<(), ChatError> {
            if self.fail_reactions {
                return Err(ChatError::Api {
                    status: Some(500),
                    message: "reaction failed".to_string(),
                });
            }
            self.reactions
                .lock()
                .unwrap()
                .push((message, emoji.to_string()));
            Ok(())
        }
        async fn delete_message(&self, _: ChannelId, message: MessageId) -> Result<(), ChatError> {
            self.deleted.lock().unwrap().push(message);
            Ok(())
        }
        async fn message_exists(&self, _: ChannelId, _: MessageId) -> Result<bool, ChatError> {
            Ok(true)
        }
        async fn send_direct_message(&self, _: UserId, _: &str) -> Result<(), ChatError> {
            Ok(())
        }
        async fn add_role(&self, user: UserId, role: RoleId) -> Result<(), ChatError> {
            self.roles_added.lock().unwrap().push((user, role));
            Ok(())
        }
        async fn remove_role(&self, user: UserId, role: RoleId) -> Result<(), ChatError> {
            self.roles_removed.lock().unwrap().push((user, role));
            Ok(())
        }
        async fn current_user(&self) -> Result<UserId, ChatError> {
            Ok(BOT)
        }
    }

    struct MockDirectory {
        existing: Mutex<Vec<String>>,
        created: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MockDirectory {
        fn new() -> Self {
            Self {
                existing: Mutex::new(vec![]),
                created: Mutex::new(vec![]),
                fail: false,
            }
        }

        fn with_existing(uid: &str) -> Self {
            Self {
                existing: Mutex::new(vec![uid.to_string()]),
                created: Mutex::new(vec![]),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                existing: Mutex::new(vec![]),
                created: Mutex::new(vec![]),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl DirectoryApi for MockDirectory {
        async fn exists(&self, uid: &str) -> Result<bool, DirectoryError> {
            if self.fail {
                return Err(DirectoryError::Unavailable("down".to_string()));
            }
            Ok(self.existing.lock().unwrap().iter().any(|u| u == uid))
        }
        async fn create(
            &self,
            spec: &state::DirectoryAccountSpec,
        ) -> Result<AccountHandle, DirectoryError> {
            if self.fail {
                return Err(DirectoryError::Unavailable("down".to_string()));
            }
            self.created.lock().unwrap().push(spec.uid.clone());
            Ok(AccountHandle {
                uid: spec.uid.clone(),
                dn: None,
            })
        }
    }

    struct Fixture {
        tracker: RequestTracker,
        chat: Arc<MockChat>,
        directory: Arc<MockDirectory>,
        repository: Arc<InMemoryRepository>,
    }

    fn fixture_with(chat: Arc<MockChat>, directory: MockDirectory) -> Fixture {
        let directory = Arc::new(directory);
        let repository = Arc::new(InMemoryRepository::new());

        let mut roles = HashMap::new();
        roles.insert(LogicalRole::Verified, RoleId(100));
        roles.insert(LogicalRole::Unverified, RoleId(200));

        let tracker = RequestTracker::new(
            repository.clone(),
            chat.clone(),
            DirectoryProvisioner::new(directory.clone()),
            RoleCoordinator::new(chat.clone(), roles),
            REVIEW,
            BOT,
        );

        Fixture {
            tracker,
            chat,
            directory,
            repository,
        }
    }

    fn fixture_with_directory(directory: MockDirectory) -> Fixture {
        fixture_with(Arc::new(MockChat::new()), directory)
    }

    fn fixture() -> Fixture {
        fixture_with_directory(MockDirectory::new())
    }

    fn decision(card: MessageId, verdict: Verdict, actor: UserId) -> DecisionEvent {
        DecisionEvent {
            card,
            verdict,
            actor,
        }
    }

    #[tokio::test]
    async fn test_access_request_posts_card_with_approve_affordance() {
        let f = fixture();
        let card = f
            .tracker
            .begin_access_request(Requester::new(REQUESTER, "jane"))
            .await
            .unwrap();

        let cards = f.chat.cards.lock().unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].0, REVIEW);
        assert_eq!(cards[0].1.title, "ACCESS REQUEST");

        let reactions = f.chat.reactions.lock().unwrap();
        assert_eq!(reactions.as_slice(), [(card, APPROVE_EMOJI.to_string())]);

        let tracked = f.repository.get(&card).await.unwrap().unwrap();
        assert_eq!(tracked.state, RequestState::Pending);
    }

    #[tokio::test]
    async fn test_enrollment_request_posts_both_affordances() {
        let f = fixture();
        let card = f
            .tracker
            .begin_enrollment_request(
                Requester::new(REQUESTER, "jane"),
                "Jane",
                "Doe",
                "jane@example.com",
            )
            .await
            .unwrap();

        let reactions = f.chat.reactions.lock().unwrap();
        assert_eq!(
            reactions.as_slice(),
            [
                (card, APPROVE_EMOJI.to_string()),
                (card, REJECT_EMOJI.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_reaction_failure_removes_posted_card() {
        let chat = Arc::new(MockChat {
            fail_reactions: true,
            ..MockChat::new()
        });
        let f = fixture_with(chat, MockDirectory::new());

        let err = f
            .tracker
            .begin_access_request(Requester::new(REQUESTER, "jane"))
            .await
            .unwrap_err();
        assert!(matches!(err, BeginRequestError::Chat(_)));

        // The posted card is taken back down and nothing is tracked, so no
        // undecidable card lingers in the review channel.
        assert!(f.repository.get_pending().await.unwrap().is_empty());
        assert_eq!(f.chat.cards.lock().unwrap().len(), 1);
        assert_eq!(*f.chat.deleted.lock().unwrap(), vec![MessageId(1001)]);
    }

    #[tokio::test]
    async fn test_invalid_enrollment_creates_no_card() {
        let f = fixture();
        let err = f
            .tracker
            .begin_enrollment_request(Requester::new(REQUESTER, "jane"), "Jane", "Doe", "  ")
            .await
            .unwrap_err();

        assert!(matches!(err, BeginRequestError::Validation(_)));
        assert!(f.chat.cards.lock().unwrap().is_empty());
        assert!(f.repository.get_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approve_access_swaps_roles_and_retires_card() {
        let f = fixture();
        let card = f
            .tracker
            .begin_access_request(Requester::new(REQUESTER, "jane"))
            .await
            .unwrap();

        let outcome = f
            .tracker
            .handle_decision(decision(card, Verdict::Approve, APPROVER))
            .await;
        assert_eq!(outcome, Outcome::Approved);

        // Roles change for the requester, not the approver.
        assert_eq!(
            *f.chat.roles_added.lock().unwrap(),
            vec![(REQUESTER, RoleId(100))]
        );
        assert_eq!(
            *f.chat.roles_removed.lock().unwrap(),
            vec![(REQUESTER, RoleId(200))]
        );

        assert_eq!(*f.chat.deleted.lock().unwrap(), vec![card]);
        assert_eq!(f.repository.get(&card).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reject_enrollment_creates_no_account() {
        let f = fixture();
        let card = f
            .tracker
            .begin_enrollment_request(
                Requester::new(REQUESTER, "jane"),
                "Jane",
                "Doe",
                "jane@example.com",
            )
            .await
            .unwrap();

        let outcome = f
            .tracker
            .handle_decision(decision(card, Verdict::Reject, APPROVER))
            .await;
        assert_eq!(outcome, Outcome::Rejected);

        assert!(f.directory.created.lock().unwrap().is_empty());
        assert_eq!(*f.chat.deleted.lock().unwrap(), vec![card]);
        assert_eq!(f.repository.get(&card).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_approve_enrollment_provisions_account() {
        let f = fixture();
        let card = f
            .tracker
            .begin_enrollment_request(
                Requester::new(REQUESTER, "jane"),
                "Jane",
                "Doe",
                "jane@example.com",
            )
            .await
            .unwrap();

        let outcome = f
            .tracker
            .handle_decision(decision(card, Verdict::Approve, APPROVER))
            .await;
        assert_eq!(outcome, Outcome::Approved);
        assert_eq!(*f.directory.created.lock().unwrap(), vec!["jdoe"]);
    }

    #[tokio::test]
    async fn test_second_decision_is_a_no_op() {
        let f = fixture();
        let card = f
            .tracker
            .begin_access_request(Requester::new(REQUESTER, "jane"))
            .await
            .unwrap();

        let first = f
            .tracker
            .handle_decision(decision(card, Verdict::Approve, APPROVER))
            .await;
        let second = f
            .tracker
            .handle_decision(decision(card, Verdict::Approve, UserId(4)))
            .await;

        assert_eq!(first, Outcome::Approved);
        assert_eq!(second, Outcome::NoOp);
        // Exactly one role grant despite two approvals.
        assert_eq!(f.chat.roles_added.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_self_reaction_is_a_no_op() {
        let f = fixture();
        let card = f
            .tracker
            .begin_access_request(Requester::new(REQUESTER, "jane"))
            .await
            .unwrap();

        let outcome = f
            .tracker
            .handle_decision(decision(card, Verdict::Approve, BOT))
            .await;
        assert_eq!(outcome, Outcome::NoOp);
        assert!(f.chat.roles_added.lock().unwrap().is_empty());
        assert!(f.repository.get(&card).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_card_is_a_no_op() {
        let f = fixture();
        let outcome = f
            .tracker
            .handle_decision(decision(MessageId(9999), Verdict::Approve, APPROVER))
            .await;
        assert_eq!(outcome, Outcome::NoOp);
    }

    #[tokio::test]
    async fn test_duplicate_identity_resolves_as_conflict() {
        let f = fixture_with_directory(MockDirectory::with_existing("jdoe"));
        let card = f
            .tracker
            .begin_enrollment_request(
                Requester::new(REQUESTER, "jane"),
                "Jane",
                "Doe",
                "jane@example.com",
            )
            .await
            .unwrap();

        let outcome = f
            .tracker
            .handle_decision(decision(card, Verdict::Approve, APPROVER))
            .await;

        assert_eq!(outcome, Outcome::Conflict);
        assert!(f.directory.created.lock().unwrap().is_empty());
        // Conflict still retires the request.
        assert_eq!(*f.chat.deleted.lock().unwrap(), vec![card]);
        assert_eq!(f.repository.get(&card).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_provisioning_failure_still_retires_request() {
        let f = fixture_with_directory(MockDirectory::failing());
        let card = f
            .tracker
            .begin_enrollment_request(
                Requester::new(REQUESTER, "jane"),
                "Jane",
                "Doe",
                "jane@example.com",
            )
            .await
            .unwrap();

        let outcome = f
            .tracker
            .handle_decision(decision(card, Verdict::Approve, APPROVER))
            .await;

        // The decision stands even though provisioning failed; the failure is
        // reported to the review channel.
        assert_eq!(outcome, Outcome::Approved);
        assert_eq!(f.repository.get(&card).await.unwrap(), None);
        let messages = f.chat.messages.lock().unwrap();
        assert!(messages
            .iter()
            .any(|(_, text)| text.contains("provisioning failed")));
    }

    #[tokio::test]
    async fn test_expire_stale_retires_old_requests_only() {
        let f = fixture();
        let old_card = f
            .tracker
            .begin_access_request(Requester::new(REQUESTER, "jane"))
            .await
            .unwrap();
        let fresh_card = f
            .tracker
            .begin_access_request(Requester::new(UserId(4), "alex"))
            .await
            .unwrap();

        // Backdate the first request past the TTL.
        let mut old = f.repository.get(&old_card).await.unwrap().unwrap();
        old.created_at = Utc::now() - Duration::hours(48);
        f.repository.put(old).await.unwrap();

        let expired = f.tracker.expire_stale(Duration::hours(24)).await;

        assert_eq!(expired, 1);
        assert_eq!(f.repository.get(&old_card).await.unwrap(), None);
        assert!(f.repository.get(&fresh_card).await.unwrap().is_some());
        assert_eq!(*f.chat.deleted.lock().unwrap(), vec![old_card]);

        // The terminal note names expiry, not a moderator rejection.
        let messages = f.chat.messages.lock().unwrap();
        assert!(messages.iter().any(|(_, text)| text.ends_with("expired")));
        assert!(!messages.iter().any(|(_, text)| text.ends_with("rejected")));
    }
}
