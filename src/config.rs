//! Service configuration, read from the environment at startup.

use anyhow::Context;
use std::env;
use std::path::PathBuf;

use crate::tracker::state::{ChannelId, GuildId, RoleId, UserId};

#[derive(Debug, Clone)]
pub struct Config {
    /// Bot token for the chat platform.
    pub discord_token: String,
    /// The community (guild) the bot operates in.
    pub discord_guild: GuildId,
    /// Role granted on approval.
    pub verified_role: RoleId,
    /// Role assigned on join and revoked on approval.
    pub unverified_role: RoleId,
    /// Channel where request cards are posted and decided.
    pub auth_channel: ChannelId,
    /// Channel whose pinned message members react to for access.
    pub verification_channel: ChannelId,
    /// Users allowed to run administrative commands.
    pub owners: Vec<UserId>,
    /// Directory server base URL, e.g. `https://ipa.example.org/ipa`.
    pub ldap_url: String,
    pub ldap_user: String,
    pub ldap_pw: String,
    /// Accept a self-signed directory certificate. Lab use only.
    pub ldap_accept_invalid_certs: bool,
    /// Shared secret the gateway bridge signs deliveries with.
    pub gateway_shared_secret: String,
    /// Where the state database lives.
    pub state_dir: PathBuf,
    pub port: u16,
    /// Pending requests older than this are retired automatically. None
    /// disables expiry.
    pub request_ttl: Option<chrono::Duration>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            discord_token: required("DISCORD_TOKEN")?,
            discord_guild: GuildId(parse_required("DISCORD_GUILD")?),
            verified_role: RoleId(parse_required("VERIFIED_ROLE")?),
            unverified_role: RoleId(parse_required("UNVERIFIED_ROLE")?),
            auth_channel: ChannelId(parse_required("AUTH_CHANNEL")?),
            verification_channel: ChannelId(parse_required("VERIFICATION_CHANNEL")?),
            owners: parse_owners(&env::var("OWNERS").unwrap_or_default())
                .context("OWNERS must be a comma-separated list of user ids")?,
            ldap_url: required("LDAP_URL")?,
            ldap_user: required("LDAP_USER")?,
            ldap_pw: required("LDAP_PW")?,
            ldap_accept_invalid_certs: env::var("LDAP_ACCEPT_INVALID_CERTS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            gateway_shared_secret: required("GATEWAY_SHARED_SECRET")?,
            state_dir: env::var("STATE_DIR").map(PathBuf::from).unwrap_or_else(|_| {
                PathBuf::from(".")
            }),
            port: match env::var("PORT") {
                Ok(raw) => raw.parse().context("PORT must be a number")?,
                Err(_) => 3000,
            },
            request_ttl: match env::var("REQUEST_TTL_SECS") {
                Ok(raw) => Some(parse_ttl(&raw).context("REQUEST_TTL_SECS must be a positive number of seconds")?),
                Err(_) => None,
            },
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("doorman-state.db")
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{} environment variable not set", name))
}

fn parse_required(name: &str) -> anyhow::Result<u64> {
    required(name)?
        .parse()
        .with_context(|| format!("{} must be a numeric id", name))
}

fn parse_owners(raw: &str) -> anyhow::Result<Vec<UserId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(UserId)
                .with_context(|| format!("'{}' is not a user id", s))
        })
        .collect()
}

fn parse_ttl(raw: &str) -> anyhow::Result<chrono::Duration> {
    let secs: i64 = raw.parse().context("not a number")?;
    anyhow::ensure!(secs > 0, "must be positive");
    Ok(chrono::Duration::seconds(secs))
}
