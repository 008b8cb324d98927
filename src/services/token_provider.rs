use crate::errors::ServiceError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const REFRESH_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Owns the bearer credential for outbound calls to the identity platform.
///
/// The cached token is refreshed once it is within the configured safety
/// margin of expiry. The cache lives behind a single async mutex held across
/// the refresh call, so concurrent callers collapse into one outbound
/// request instead of hammering the token endpoint.
pub struct TokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_margin: ChronoDuration,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(
        token_url: String,
        client_id: String,
        client_secret: String,
        timeout: Duration,
        refresh_margin_secs: i64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            client,
            token_url,
            client_id,
            client_secret,
            refresh_margin: ChronoDuration::seconds(refresh_margin_secs),
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, refreshing if the cached one is gone or about
    /// to expire.
    #[instrument(skip(self))]
    pub async fn bearer_token(&self) -> Result<String, ServiceError> {
        // Holding the lock across the refresh is what makes this
        // single-flight: the second caller blocks here and then reads the
        // token the first caller fetched.
        let mut cached = self.cached.lock().await;

        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - self.refresh_margin > now {
                return Ok(token.access_token.clone());
            }
            debug!("cached token within refresh margin, refreshing");
        }

        let fresh = self.fetch_token().await?;
        let token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token, forcing the next caller to refresh. Called when
    /// an upstream rejects the credential mid-lifetime.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        *cached = None;
    }

    async fn fetch_token(&self) -> Result<CachedToken, ServiceError> {
        let mut last_error = None;

        for attempt in 1..=REFRESH_ATTEMPTS {
            match self.request_token().await {
                Ok(token) => {
                    info!(attempt, "bearer token refreshed");
                    return Ok(token);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "token refresh attempt failed");
                    last_error = Some(e);
                    if attempt < REFRESH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1),
                        ))
                        .await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ServiceError::ExternalApiError("token refresh failed".into())))
    }

    async fn request_token(&self) -> Result<CachedToken, ServiceError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ServiceError::ExternalApiError(format!("token request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| {
                ServiceError::ExternalApiError(format!("token endpoint returned error: {}", e))
            })?;

        let body: TokenResponse = response.json().await.map_err(|e| {
            ServiceError::ExternalApiError(format!("malformed token response: {}", e))
        })?;

        Ok(CachedToken {
            access_token: body.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(body.expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> TokenProvider {
        TokenProvider::new(
            format!("{}/oauth/token", server.uri()),
            "learnset".into(),
            "secret".into(),
            Duration::from_secs(5),
            60,
        )
    }

    fn token_body(token: &str, expires_in: i64) -> serde_json::Value {
        serde_json::json!({"access_token": token, "expires_in": expires_in})
    }

    #[tokio::test]
    async fn caches_token_until_expiry_margin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-1", 3600)))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server);
        assert_eq!(provider.bearer_token().await.unwrap(), "tok-1");
        // Second call is served from cache; the mock's expect(1) verifies it.
        assert_eq!(provider.bearer_token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn refreshes_token_already_inside_margin() {
        let server = MockServer::start().await;
        // expires_in shorter than the 60s margin: every call refreshes
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-short", 10)))
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(&server);
        provider.bearer_token().await.unwrap();
        provider.bearer_token().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("tok-sf", 3600))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = Arc::new(provider(&server));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let p = provider.clone();
                tokio::spawn(async move { p.bearer_token().await.unwrap() })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), "tok-sf");
        }
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("tok-a", 3600)))
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider(&server);
        provider.bearer_token().await.unwrap();
        provider.invalidate().await;
        provider.bearer_token().await.unwrap();
    }

    #[tokio::test]
    async fn surfaces_error_after_bounded_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let provider = provider(&server);
        let result = provider.bearer_token().await;
        assert_matches::assert_matches!(result, Err(ServiceError::ExternalApiError(_)));
    }
}
