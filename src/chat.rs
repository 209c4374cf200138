//! Chat platform adapter.
//!
//! [`ChatApi`] is the seam between the tracker and the real chat service; the
//! tracker only ever talks to the trait, so tests swap in a mock and the
//! production binary wires up [`DiscordClient`], a thin REST client for the
//! Discord HTTP API (v10).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use tracing::debug;

use crate::card::Card;
use crate::tracker::state::{ChannelId, GuildId, MessageId, RoleId, UserId};

/// Error from the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// The subject user is not a member of the community (left, or was
    /// removed, between request and decision).
    SubjectNotFound(UserId),
    /// Any other API failure.
    Api {
        status: Option<u16>,
        message: String,
    },
}

impl ChatError {
    fn api(message: impl Into<String>) -> Self {
        Self::Api {
            status: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubjectNotFound(user) => write!(f, "user {} not found in the community", user),
            Self::Api {
                status: Some(status),
                message,
            } => write!(f, "chat API error (HTTP {}): {}", status, message),
            Self::Api {
                status: None,
                message,
            } => write!(f, "chat API error: {}", message),
        }
    }
}

impl std::error::Error for ChatError {}

/// Operations the workflow needs from the chat platform.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Post a request card to a channel, returning its message id.
    async fn send_card(&self, channel: ChannelId, card: &Card) -> Result<MessageId, ChatError>;

    /// Post a plain text message to a channel.
    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<MessageId, ChatError>;

    /// Attach a reaction to a message as the bot (the decision affordance).
    async fn add_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), ChatError>;

    /// Delete a message.
    async fn delete_message(&self, channel: ChannelId, message: MessageId)
        -> Result<(), ChatError>;

    /// Whether a message still exists (false on a clean 404).
    async fn message_exists(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<bool, ChatError>;

    /// Send a user a direct message.
    async fn send_direct_message(&self, user: UserId, text: &str) -> Result<(), ChatError>;

    /// Add a role to a community member.
    async fn add_role(&self, user: UserId, role: RoleId) -> Result<(), ChatError>;

    /// Remove a role from a community member.
    async fn remove_role(&self, user: UserId, role: RoleId) -> Result<(), ChatError>;

    /// The bot's own user id.
    async fn current_user(&self) -> Result<UserId, ChatError>;
}

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Discord REST client authenticated with a bot token.
pub struct DiscordClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    guild: GuildId,
}

/// Discord returns snowflakes as JSON strings.
#[derive(Deserialize)]
struct SnowflakeObject {
    id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl DiscordClient {
    pub fn new(token: impl Into<String>, guild: GuildId) -> Self {
        Self::with_base_url(token, guild, DISCORD_API_BASE)
    }

    pub fn with_base_url(
        token: impl Into<String>,
        guild: GuildId,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            guild,
        }
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", format!("Bot {}", self.token))
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| status.to_string());
        Err(ChatError::Api {
            status: Some(status.as_u16()),
            message,
        })
    }

    fn parse_snowflake(raw: &str) -> Result<u64, ChatError> {
        raw.parse::<u64>()
            .map_err(|_| ChatError::api(format!("malformed snowflake in response: {raw}")))
    }
}

/// Percent-encode a reaction emoji for use in a URL path segment.
fn encode_emoji(emoji: &str) -> String {
    emoji
        .bytes()
        .map(|b| format!("%{:02X}", b))
        .collect()
}

fn card_to_embed(card: &Card) -> serde_json::Value {
    json!({
        "title": card.title,
        "author": { "name": card.author_name },
        "footer": { "text": card.kind_tag() },
        "fields": card.fields.iter().map(|f| json!({
            "name": f.name,
            "value": f.value,
            "inline": f.inline,
        })).collect::<Vec<_>>(),
    })
}

#[async_trait]
impl ChatApi for DiscordClient {
    async fn send_card(&self, channel: ChannelId, card: &Card) -> Result<MessageId, ChatError> {
        let url = format!("{}/channels/{}/messages", self.base_url, channel);
        let body = json!({ "embeds": [card_to_embed(card)] });

        let response = self
            .auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;
        let message: SnowflakeObject = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;

        let id = Self::parse_snowflake(&message.id)?;
        debug!(channel = %channel, message = id, kind = %card.kind, "posted request card");
        Ok(MessageId(id))
    }

    async fn send_message(&self, channel: ChannelId, text: &str) -> Result<MessageId, ChatError> {
        let url = format!("{}/channels/{}/messages", self.base_url, channel);
        let response = self
            .auth(self.client.post(&url))
            .json(&json!({ "content": text }))
            .send()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;
        let message: SnowflakeObject = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;

        Ok(MessageId(Self::parse_snowflake(&message.id)?))
    }

    async fn add_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), ChatError> {
        let url = format!(
            "{}/channels/{}/messages/{}/reactions/{}/@me",
            self.base_url,
            channel,
            message,
            encode_emoji(emoji)
        );
        let response = self
            .auth(self.client.put(&url))
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), ChatError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.base_url, channel, message
        );
        let response = self
            .auth(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }

    async fn message_exists(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<bool, ChatError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.base_url, channel, message
        );
        let response = self
            .auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        self.check(response).await?;
        Ok(true)
    }

    async fn send_direct_message(&self, user: UserId, text: &str) -> Result<(), ChatError> {
        // DMs go through a per-recipient channel that must be opened first.
        let url = format!("{}/users/@me/channels", self.base_url);
        let response = self
            .auth(self.client.post(&url))
            .json(&json!({ "recipient_id": user.0.to_string() }))
            .send()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;
        let dm_channel: SnowflakeObject = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;

        let channel = ChannelId(Self::parse_snowflake(&dm_channel.id)?);
        self.send_message(channel, text).await?;
        Ok(())
    }

    async fn add_role(&self, user: UserId, role: RoleId) -> Result<(), ChatError> {
        let url = format!(
            "{}/guilds/{}/members/{}/roles/{}",
            self.base_url, self.guild, user, role
        );
        let response = self
            .auth(self.client.put(&url))
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChatError::SubjectNotFound(user));
        }
        self.check(response).await?;
        Ok(())
    }

    async fn remove_role(&self, user: UserId, role: RoleId) -> Result<(), ChatError> {
        let url = format!(
            "{}/guilds/{}/members/{}/roles/{}",
            self.base_url, self.guild, user, role
        );
        let response = self
            .auth(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChatError::SubjectNotFound(user));
        }
        self.check(response).await?;
        Ok(())
    }

    async fn current_user(&self) -> Result<UserId, ChatError> {
        let url = format!("{}/users/@me", self.base_url);
        let response = self
            .auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;
        let me: SnowflakeObject = self
            .check(response)
            .await?
            .json()
            .await
            .map_err(|e| ChatError::api(e.to_string()))?;

        Ok(UserId(Self::parse_snowflake(&me.id)?))
    }
}
