use crate::{errors::ServiceError, services::token_provider::TokenProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Canonical account identifier, produced at the protocol-adapter boundary.
///
/// Providers send account identity in whatever shape their dashboard was
/// configured with: a login string, a numeric id, an email with arbitrary
/// casing, under inconsistently cased key names. Everything is normalized
/// into this one value before it reaches the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef(String);

impl AccountRef {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    /// Extract the account identifier from a provider-supplied params object,
    /// accepting the key spellings seen across both providers.
    pub fn from_params(params: &Value) -> Option<Self> {
        const KEYS: [&str; 4] = ["login", "user_id", "userId", "account"];

        // Some integrations send `account` as a bare scalar rather than an object.
        if let Some(value) = params.get("account") {
            match value {
                Value::String(s) if !s.trim().is_empty() => return Some(Self::new(s)),
                Value::Number(n) => return Some(Self::new(&n.to_string())),
                _ => {}
            }
        }

        let account = params.get("account").unwrap_or(params);
        for key in KEYS {
            if let Some(value) = account.get(key) {
                match value {
                    Value::String(s) if !s.trim().is_empty() => return Some(Self::new(s)),
                    Value::Number(n) => return Some(Self::new(&n.to_string())),
                    _ => {}
                }
            }
        }
        None
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Successful account resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAccount {
    pub user_id: Uuid,
}

/// Maps a provider-supplied account identifier to an internal user.
///
/// The identity platform owns the user directory; this is the seam the
/// gateways consume.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountResolver: Send + Sync {
    /// `Ok(None)` means the account does not exist; errors are infrastructure
    /// failures only.
    async fn resolve(&self, account: &AccountRef) -> Result<Option<ResolvedAccount>, ServiceError>;
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    exists: bool,
    user_id: Option<Uuid>,
}

/// Resolver backed by the identity platform's REST API.
pub struct HttpAccountResolver {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenProvider>,
}

impl HttpAccountResolver {
    pub fn new(base_url: String, tokens: Arc<TokenProvider>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            client,
            base_url,
            tokens,
        }
    }
}

#[async_trait]
impl AccountResolver for HttpAccountResolver {
    #[instrument(skip(self), fields(account = %account))]
    async fn resolve(&self, account: &AccountRef) -> Result<Option<ResolvedAccount>, ServiceError> {
        let token = self.tokens.bearer_token().await?;

        let url = format!("{}/internal/accounts/resolve", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("login", account.as_str())])
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "account resolution request failed");
                ServiceError::ExternalApiError(format!("account resolution failed: {}", e))
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response.error_for_status().map_err(|e| {
            ServiceError::ExternalApiError(format!("account resolution returned error: {}", e))
        })?;

        let body: ResolveResponse = response.json().await.map_err(|e| {
            ServiceError::ExternalApiError(format!("malformed resolver response: {}", e))
        })?;

        match (body.exists, body.user_id) {
            (true, Some(user_id)) => Ok(Some(ResolvedAccount { user_id })),
            _ => Ok(None),
        }
    }
}
