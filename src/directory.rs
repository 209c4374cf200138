//! Directory service adapter (FreeIPA).
//!
//! The directory speaks JSON-RPC over HTTPS with a cookie session obtained
//! from a form login. [`DirectoryApi`] is the seam the provisioner talks to;
//! [`IpaClient`] is the real implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::tracker::state::DirectoryAccountSpec;

/// FreeIPA error code for "entry already exists".
const IPA_DUPLICATE_ENTRY: i64 = 4002;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// An account with this handle already exists.
    DuplicateIdentity(String),
    /// Login credentials were rejected.
    Authentication,
    /// The directory is unreachable or returned an unexpected failure.
    Unavailable(String),
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateIdentity(uid) => write!(f, "directory account '{}' already exists", uid),
            Self::Authentication => write!(f, "directory rejected the service credentials"),
            Self::Unavailable(message) => write!(f, "directory unavailable: {}", message),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// A provisioned account, as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountHandle {
    pub uid: String,
    pub dn: Option<String>,
}

/// Operations the workflow needs from the directory service.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    /// Whether an account with this handle exists.
    async fn exists(&self, uid: &str) -> Result<bool, DirectoryError>;

    /// Create an account. Fails with `DuplicateIdentity` if the handle is
    /// taken.
    async fn create(&self, spec: &DirectoryAccountSpec) -> Result<AccountHandle, DirectoryError>;
}

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// JSON-RPC client for a FreeIPA server.
///
/// The session cookie issued by `/session/login_password` is held in the
/// reqwest cookie store and sent automatically on subsequent calls.
pub struct IpaClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl IpaClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        let base_url = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Authenticate and establish a session cookie. Call once at startup and
    /// again whenever a call reports an expired session.
    pub async fn login(&self) -> Result<(), DirectoryError> {
        let url = format!("{}/session/login_password", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Referer", &self.base_url)
            .header("Accept", "text/plain")
            .form(&[("user", &self.username), ("password", &self.password)])
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                info!(user = %self.username, "directory session established");
                Ok(())
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(DirectoryError::Authentication),
            status => Err(DirectoryError::Unavailable(format!(
                "login failed with HTTP {}",
                status
            ))),
        }
    }

    async fn rpc(
        &self,
        method: &str,
        args: serde_json::Value,
        options: serde_json::Value,
    ) -> Result<serde_json::Value, DirectoryError> {
        let url = format!("{}/session/json", self.base_url);
        let body = json!({
            "method": method,
            "params": [args, options],
        });

        let response = self
            .client
            .post(&url)
            .header("Referer", &self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DirectoryError::Authentication);
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Unavailable(format!(
                "{} failed with HTTP {}",
                method,
                response.status()
            )));
        }

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        if let Some(error) = envelope.error {
            if error.code == IPA_DUPLICATE_ENTRY {
                return Err(DirectoryError::DuplicateIdentity(error.message));
            }
            return Err(DirectoryError::Unavailable(format!(
                "{} returned error {}: {}",
                method, error.code, error.message
            )));
        }

        envelope
            .result
            .ok_or_else(|| DirectoryError::Unavailable(format!("{} returned no result", method)))
    }
}

#[async_trait]
impl DirectoryApi for IpaClient {
    async fn exists(&self, uid: &str) -> Result<bool, DirectoryError> {
        let result = self
            .rpc("user_find", json!([]), json!({ "uid": uid }))
            .await?;

        let count = result
            .get("count")
            .and_then(|c| c.as_i64())
            .unwrap_or(0);
        Ok(count > 0)
    }

    async fn create(&self, spec: &DirectoryAccountSpec) -> Result<AccountHandle, DirectoryError> {
        let result = self
            .rpc(
                "user_add",
                json!([spec.uid]),
                json!({
                    "givenname": spec.first_name,
                    "sn": spec.last_name,
                    "cn": spec.display_name,
                    "mail": spec.email,
                    "random": spec.generate_random_credential,
                }),
            )
            .await
            .map_err(|e| match e {
                DirectoryError::DuplicateIdentity(_) => {
                    DirectoryError::DuplicateIdentity(spec.uid.clone())
                }
                other => other,
            })?;

        let dn = result
            .get("result")
            .and_then(|r| r.get("dn"))
            .and_then(|dn| dn.as_str())
            .map(|dn| dn.to_string());

        Ok(AccountHandle {
            uid: spec.uid.clone(),
            dn,
        })
    }
}

/// What provisioning did for an approved enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Created,
    /// The identity already existed; nothing was created or modified.
    AlreadyExists,
}

/// Provisioning policy over a directory backend.
#[derive(Clone)]
pub struct DirectoryProvisioner {
    directory: Arc<dyn DirectoryApi>,
}

impl DirectoryProvisioner {
    pub fn new(directory: Arc<dyn DirectoryApi>) -> Self {
        Self { directory }
    }

    /// Provision an account for an approved enrollment.
    ///
    /// An existing identity is a conflict, not a failure: nothing in the
    /// directory is modified and the caller retires the request as usual. The
    /// duplicate check races a concurrent create by design, so a duplicate
    /// error from `create` itself is folded into the same outcome.
    pub async fn provision(
        &self,
        spec: &DirectoryAccountSpec,
    ) -> Result<ProvisionOutcome, DirectoryError> {
        if self.directory.exists(&spec.uid).await? {
            warn!(uid = %spec.uid, "directory identity already exists, skipping create");
            return Ok(ProvisionOutcome::AlreadyExists);
        }

        match self.directory.create(spec).await {
            Ok(handle) => {
                info!(uid = %handle.uid, "directory account created");
                Ok(ProvisionOutcome::Created)
            }
            Err(DirectoryError::DuplicateIdentity(_)) => {
                warn!(uid = %spec.uid, "directory identity appeared mid-provision");
                Ok(ProvisionOutcome::AlreadyExists)
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeDirectory {
        existing: Mutex<Vec<String>>,
        fail_create: bool,
    }

    impl FakeDirectory {
        fn new(existing: &[&str]) -> Self {
            Self {
                existing: Mutex::new(existing.iter().map(|s| s.to_string()).collect()),
                fail_create: false,
            }
        }
    }

    #[async_trait]
    impl DirectoryApi for FakeDirectory {
        async fn exists(&self, uid: &str) -> Result<bool, DirectoryError> {
            Ok(self.existing.lock().unwrap().iter().any(|u| u == uid))
        }

        async fn create(
            &self,
            spec: &DirectoryAccountSpec,
        ) -> Result<AccountHandle, DirectoryError> {
            if self.fail_create {
                return Err(DirectoryError::Unavailable("down".to_string()));
            }
            let mut existing = self.existing.lock().unwrap();
            if existing.iter().any(|u| u == &spec.uid) {
                return Err(DirectoryError::DuplicateIdentity(spec.uid.clone()));
            }
            existing.push(spec.uid.clone());
            Ok(AccountHandle {
                uid: spec.uid.clone(),
                dn: None,
            })
        }
    }

    fn spec() -> DirectoryAccountSpec {
        DirectoryAccountSpec::with_uid("jdoe", "Jane", "Doe", "jane@example.com")
    }

    #[tokio::test]
    async fn test_provision_creates_new_account() {
        let provisioner = DirectoryProvisioner::new(Arc::new(FakeDirectory::new(&[])));
        let outcome = provisioner.provision(&spec()).await.unwrap();
        assert_eq!(outcome, ProvisionOutcome::Created);
    }

    #[tokio::test]
    async fn test_provision_tolerates_existing_identity() {
        let provisioner = DirectoryProvisioner::new(Arc::new(FakeDirectory::new(&["jdoe"])));
        let outcome = provisioner.provision(&spec()).await.unwrap();
        assert_eq!(outcome, ProvisionOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn test_provision_propagates_unavailability() {
        let directory = FakeDirectory {
            existing: Mutex::new(vec![]),
            fail_create: true,
        };
        let provisioner = DirectoryProvisioner::new(Arc::new(directory));
        let err = provisioner.provision(&spec()).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Unavailable(_)));
    }
}
