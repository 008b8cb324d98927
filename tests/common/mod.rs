//! Shared test harness: an in-memory SQLite app instance with a static
//! account resolver, driven through the router with `tower::ServiceExt`.

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, Response, StatusCode},
    Router,
};
use base64::Engine;
use learnset_api::{
    config::AppConfig,
    errors::ServiceError,
    events::EventSender,
    handlers::AppServices,
    services::accounts::{AccountRef, AccountResolver, ResolvedAccount},
    AppState,
};
use sea_orm::{Database, DatabaseConnection};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const GATEWAY_SECRET: &str = "paylane-gateway-secret-for-tests";
pub const WEBHOOK_SECRET: &str = "fastbill-callback-secret-for-tests";
pub const STORE_ID: &str = "store-learnset";

/// Resolver answering from a fixed login -> user map.
pub struct StaticResolver {
    accounts: HashMap<String, Uuid>,
}

#[async_trait]
impl AccountResolver for StaticResolver {
    async fn resolve(&self, account: &AccountRef) -> Result<Option<ResolvedAccount>, ServiceError> {
        Ok(self
            .accounts
            .get(account.as_str())
            .map(|user_id| ResolvedAccount { user_id: *user_id }))
    }
}

pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub state: AppState,
    router: Router,
}

impl TestApp {
    pub async fn new(accounts: &[(&str, Uuid)]) -> Self {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let db = Arc::new(db);
        learnset_api::db::run_migrations(&db).await.expect("migrations");

        let mut config = test_config();
        config.database_url = "sqlite::memory:".into();
        let config = Arc::new(config);

        // Events are best-effort; tests drop the receiver and let sends fail.
        let (event_tx, _event_rx) = mpsc::channel(1024);
        let event_sender = EventSender::new(event_tx);

        let resolver = Arc::new(StaticResolver {
            accounts: accounts
                .iter()
                .map(|(login, id)| (AccountRef::new(login).as_str().to_string(), *id))
                .collect(),
        });

        let services = AppServices::with_resolver(
            db.clone(),
            config.clone(),
            Arc::new(event_sender.clone()),
            resolver,
        );

        let state = AppState {
            db: db.clone(),
            config,
            event_sender,
            services,
        };

        let router = Router::new()
            .nest("/api/v1", learnset_api::api_v1_routes())
            .with_state(state.clone());

        Self { db, state, router }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        auth: Option<(&str, &str)>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((user, password)) = auth {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", user, password));
            builder = builder.header(header::AUTHORIZATION, format!("Basic {}", encoded));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Authorized call to the Paylane RPC endpoint.
    pub async fn rpc(&self, body: Value) -> Value {
        let response = self
            .request(
                Method::POST,
                "/api/v1/gateways/paylane",
                Some(body),
                Some(("paylane", GATEWAY_SECRET)),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "gateway always answers 200");
        response_json(response).await
    }

    pub async fn webhook(&self, body: Value) -> (StatusCode, Value) {
        let response = self
            .request(
                Method::POST,
                "/api/v1/gateways/fastbill/callback",
                Some(body),
                None,
            )
            .await;
        let status = response.status();
        let json = response_json(response).await;
        (status, json)
    }

    pub async fn entitlement(&self, user_id: Uuid) -> Value {
        let response = self
            .request(
                Method::GET,
                &format!("/api/v1/entitlements/{}", user_id),
                None,
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        response_json(response).await
    }
}

pub fn test_config() -> AppConfig {
    let raw = serde_json::json!({
        "database_url": "sqlite::memory:",
        "environment": "test",
        "paylane_gateway_secret": GATEWAY_SECRET,
        "fastbill_webhook_secret": WEBHOOK_SECRET,
        "fastbill_store_id": STORE_ID,
        "sweep_interval_secs": 0,
    });
    serde_json::from_value(raw).expect("test config deserializes")
}

pub async fn response_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).expect("json response")
}

/// Age the stored entitlement so its expiry is in the past, simulating the
/// passage of time up to the end of the current window.
pub async fn force_expire(db: &DatabaseConnection, user_id: Uuid) {
    use learnset_api::models::user_entitlement;
    use sea_orm::{ActiveModelTrait, Set};

    user_entitlement::ActiveModel {
        user_id: Set(user_id),
        expiry_date: Set(Some(chrono::Utc::now() - chrono::Duration::seconds(1))),
        ..Default::default()
    }
    .update(db)
    .await
    .expect("force expire entitlement row");
}

/// Signature the Fastbill gateway expects for a callback body.
pub fn fastbill_signature(invoice_id: &str, amount: i64) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(STORE_ID.as_bytes());
    hasher.update(invoice_id.as_bytes());
    hasher.update(amount.to_string().as_bytes());
    hasher.update(WEBHOOK_SECRET.as_bytes());
    hex::encode(hasher.finalize())
}
