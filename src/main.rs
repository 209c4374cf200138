use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use doorman::chat::{ChatApi, DiscordClient};
use doorman::config::Config;
use doorman::directory::{DirectoryProvisioner, IpaClient};
use doorman::expiry::expiry_sweep_loop;
use doorman::ingress::EventIngress;
use doorman::reconcile::reconcile_pending_requests;
use doorman::roles::RoleCoordinator;
use doorman::tracker::repository::{RequestRepository, SqliteRepository};
use doorman::tracker::state::LogicalRole;
use doorman::tracker::RequestTracker;
use doorman::webhook::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doorman=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let chat: Arc<dyn ChatApi> = Arc::new(DiscordClient::new(
        config.discord_token.clone(),
        config.discord_guild,
    ));
    let bot_user = chat
        .current_user()
        .await
        .context("could not identify the bot user; check DISCORD_TOKEN")?;
    info!(%bot_user, guild = %config.discord_guild, "chat session established");

    let ipa = IpaClient::new(
        config.ldap_url.clone(),
        config.ldap_user.clone(),
        config.ldap_pw.clone(),
        config.ldap_accept_invalid_certs,
    )?;
    // No point serving if provisioning can never succeed.
    ipa.login()
        .await
        .context("could not log in to the directory; check LDAP_USER/LDAP_PW")?;

    let repository: Arc<dyn RequestRepository> =
        Arc::new(SqliteRepository::new(config.database_path())?);

    let mut roles = HashMap::new();
    roles.insert(LogicalRole::Verified, config.verified_role);
    roles.insert(LogicalRole::Unverified, config.unverified_role);
    let roles = RoleCoordinator::new(chat.clone(), roles);

    let tracker = Arc::new(RequestTracker::new(
        repository.clone(),
        chat.clone(),
        DirectoryProvisioner::new(Arc::new(ipa)),
        roles.clone(),
        config.auth_channel,
        bot_user,
    ));

    reconcile_pending_requests(&repository, &chat, config.auth_channel).await?;

    if let Some(ttl) = config.request_ttl {
        tokio::spawn(expiry_sweep_loop(tracker.clone(), ttl));
    }

    let ingress = Arc::new(EventIngress::new(
        tracker,
        chat,
        roles,
        config.verification_channel,
        config.owners.clone(),
    ));

    let app = router(AppState {
        gateway_secret: Arc::new(config.gateway_shared_secret.clone()),
        ingress,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {}", addr))?;
    info!(%addr, "doorman listening");

    axum::serve(listener, app).await?;
    Ok(())
}
