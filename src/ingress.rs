//! Gateway event dispatch.
//!
//! Events arrive from the gateway bridge as JSON payloads (see `webhook`)
//! and are lowered here into workflow operations: onboarding on member join,
//! decision events from reactions, and text commands.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chat::ChatApi;
use crate::command::{self, BotCommand, ParseResult};
use crate::directory::ProvisionOutcome;
use crate::roles::RoleCoordinator;
use crate::tracker::decision::{DecisionEvent, Verdict, APPROVE_EMOJI};
use crate::tracker::state::{ChannelId, LogicalRole, MessageId, Requester, UserId};
use crate::tracker::{BeginRequestError, RequestTracker};

/// A user as carried on gateway events.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayUser {
    pub id: u64,
    pub name: String,
}

impl GatewayUser {
    fn requester(&self) -> Requester {
        Requester::new(UserId(self.id), self.name.clone())
    }
}

/// Events delivered by the gateway bridge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    MemberJoined {
        user: GatewayUser,
    },
    ReactionAdded {
        channel_id: u64,
        message_id: u64,
        emoji: String,
        user: GatewayUser,
    },
    MessageCreated {
        channel_id: u64,
        content: String,
        author: GatewayUser,
    },
}

const JOIN_INSTRUCTIONS: &str = "Welcome! To get access to the community, react \u{1F44D} \
     to the pinned message in the verification channel and wait for a moderator to approve you.";

/// Routes gateway events into the workflow.
pub struct EventIngress {
    tracker: Arc<RequestTracker>,
    chat: Arc<dyn ChatApi>,
    roles: RoleCoordinator,
    verification_channel: ChannelId,
    owners: Vec<UserId>,
}

impl EventIngress {
    pub fn new(
        tracker: Arc<RequestTracker>,
        chat: Arc<dyn ChatApi>,
        roles: RoleCoordinator,
        verification_channel: ChannelId,
        owners: Vec<UserId>,
    ) -> Self {
        Self {
            tracker,
            chat,
            roles,
            verification_channel,
            owners,
        }
    }

    /// Handle one gateway event. Never fails: per-event problems are logged
    /// and must not take down the delivery loop.
    pub async fn dispatch(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::MemberJoined { user } => self.on_member_joined(user).await,
            GatewayEvent::ReactionAdded {
                channel_id,
                message_id,
                emoji,
                user,
            } => {
                self.on_reaction(ChannelId(channel_id), MessageId(message_id), &emoji, user)
                    .await
            }
            GatewayEvent::MessageCreated {
                channel_id,
                content,
                author,
            } => self.on_message(ChannelId(channel_id), &content, author).await,
        }
    }

    async fn on_member_joined(&self, user: GatewayUser) {
        info!(user = user.id, name = %user.name, "member joined");

        let subject = UserId(user.id);
        if let Err(e) = self.roles.grant(subject, LogicalRole::Unverified).await {
            warn!(user = user.id, error = %e, "could not assign unverified role on join");
        }

        // A closed-DM failure is the member's privacy setting, not ours.
        if let Err(e) = self.chat.send_direct_message(subject, JOIN_INSTRUCTIONS).await {
            info!(user = user.id, error = %e, "could not DM join instructions");
        }
    }

    async fn on_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
        user: GatewayUser,
    ) {
        if UserId(user.id) == self.tracker.bot_user() {
            return;
        }

        if channel == self.verification_channel {
            if emoji == APPROVE_EMOJI {
                if let Err(e) = self.tracker.begin_access_request(user.requester()).await {
                    warn!(user = user.id, error = %e, "could not open access request");
                }
            }
            return;
        }

        if channel == self.tracker.review_channel() {
            if let Some(verdict) = Verdict::from_reaction(emoji) {
                let outcome = self
                    .tracker
                    .handle_decision(DecisionEvent {
                        card: message,
                        verdict,
                        actor: UserId(user.id),
                    })
                    .await;
                info!(card = %message, outcome = %outcome, "reaction handled");
            }
        }
    }

    async fn on_message(&self, channel: ChannelId, content: &str, author: GatewayUser) {
        if UserId(author.id) == self.tracker.bot_user() {
            return;
        }

        match command::parse_message(content) {
            ParseResult::NotCommand => {}

            ParseResult::UnrecognizedCommand { attempted } => {
                info!(user = author.id, command = %attempted, "unrecognized command");
            }

            ParseResult::MalformedCommand { command, usage } => {
                self.reply(channel, &format!("Usage for ^{}: {}", command, usage))
                    .await;
            }

            ParseResult::Command(BotCommand::Ping) => {
                self.reply(channel, "pong").await;
            }

            ParseResult::Command(BotCommand::RequestMembership {
                first_name,
                last_name,
                email,
            }) => {
                match self
                    .tracker
                    .begin_enrollment_request(
                        author.requester(),
                        &first_name,
                        &last_name,
                        &email,
                    )
                    .await
                {
                    Ok(_) => {
                        self.reply(channel, "Your membership request has been submitted for review.")
                            .await;
                    }
                    Err(BeginRequestError::Validation(e)) => {
                        self.reply(channel, &format!("Invalid request: {}", e)).await;
                    }
                    Err(e) => {
                        warn!(user = author.id, error = %e, "could not open enrollment request");
                        self.reply(channel, "Something went wrong; please try again later.")
                            .await;
                    }
                }
            }

            ParseResult::Command(BotCommand::AddUser {
                uid,
                first_name,
                last_name,
                email,
            }) => {
                self.on_add_user(channel, author, &uid, &first_name, &last_name, &email)
                    .await;
            }
        }
    }

    async fn on_add_user(
        &self,
        channel: ChannelId,
        author: GatewayUser,
        uid: &str,
        first_name: &str,
        last_name: &str,
        email: &str,
    ) {
        let Some(authorized) = command::try_authorize_add_user(
            uid,
            first_name,
            last_name,
            email,
            UserId(author.id),
            &self.owners,
        ) else {
            warn!(user = author.id, "unauthorized add_user attempt");
            self.reply(channel, "You do not have the correct role for this command.")
                .await;
            return;
        };

        match self.tracker.provision_direct(&authorized.spec).await {
            Ok(ProvisionOutcome::Created) => {
                self.reply(channel, &format!("User '{}' created.", authorized.spec.uid))
                    .await;
            }
            Ok(ProvisionOutcome::AlreadyExists) => {
                self.reply(channel, "User already exists.").await;
            }
            Err(e) => {
                warn!(uid = %authorized.spec.uid, error = %e, "direct provisioning failed");
                self.reply(channel, &format!("Could not create user: {}", e))
                    .await;
            }
        }
    }

    async fn reply(&self, channel: ChannelId, text: &str) {
        if let Err(e) = self.chat.send_message(channel, text).await {
            warn!(channel = %channel, error = %e, "could not send reply");
        }
    }
}
