//! Paylane merchant gateway: a single JSON-RPC-shaped endpoint the provider
//! calls to drive the transaction lifecycle.
//!
//! Authorization is checked before any dispatch; every business outcome is
//! reported through the protocol's own error taxonomy with HTTP 200.

use crate::errors::ServiceError;
use crate::handlers::common::constant_time_eq;
use crate::models::{PaymentProvider, TransactionState};
use crate::services::accounts::AccountRef;
use crate::services::ledger::{NewTransaction, TransitionStamp};
use crate::AppState;
use axum::{
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Protocol error codes. These are wire-visible and must stay stable.
pub mod codes {
    pub const INSUFFICIENT_PRIVILEGES: i32 = -32504;
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INTERNAL_ERROR: i32 = -32400;
    pub const ACCOUNT_NOT_FOUND: i32 = -31050;
    pub const INVALID_AMOUNT: i32 = -31001;
    pub const TRANSACTION_NOT_FOUND: i32 = -31003;
    pub const UNABLE_TO_PERFORM: i32 = -31008;
}

const EXPECTED_USERNAME: &str = "paylane";

struct RpcError {
    code: i32,
    message: &'static str,
}

impl RpcError {
    const fn new(code: i32, message: &'static str) -> Self {
        Self { code, message }
    }

    fn insufficient_privileges() -> Self {
        Self::new(codes::INSUFFICIENT_PRIVILEGES, "insufficient privileges")
    }
    fn parse_error() -> Self {
        Self::new(codes::PARSE_ERROR, "could not parse request")
    }
    fn method_not_found() -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "method not found")
    }
    fn internal_error() -> Self {
        Self::new(codes::INTERNAL_ERROR, "internal error")
    }
    fn account_not_found() -> Self {
        Self::new(codes::ACCOUNT_NOT_FOUND, "account not found")
    }
    fn invalid_amount() -> Self {
        Self::new(codes::INVALID_AMOUNT, "amount does not match any plan")
    }
    fn transaction_not_found() -> Self {
        Self::new(codes::TRANSACTION_NOT_FOUND, "transaction not found")
    }
    fn unable_to_perform() -> Self {
        Self::new(codes::UNABLE_TO_PERFORM, "operation not permitted in current state")
    }
}

impl From<ServiceError> for RpcError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(_) => RpcError::transaction_not_found(),
            ServiceError::InvalidStateTransition(_) => RpcError::unable_to_perform(),
            ServiceError::ValidationError(_) => RpcError::invalid_amount(),
            other => {
                warn!(error = %other, "gateway call failed with internal error");
                RpcError::internal_error()
            }
        }
    }
}

type RpcResult = Result<Value, RpcError>;

/// Inbound envelope. `params` stays raw until the method is known; each
/// method then deserializes its own typed variant so malformed input is
/// rejected uniformly.
#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CheckPerformParams {
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct CreateTransactionParams {
    id: String,
    #[serde(default)]
    time: Option<i64>,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct TransactionIdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CancelTransactionParams {
    id: String,
    #[serde(default)]
    reason: Option<i32>,
}

pub fn gateway_routes() -> Router<AppState> {
    Router::new().route("/paylane", post(paylane_rpc))
}

/// The single Paylane endpoint. Transport authorization is a hard
/// precondition evaluated before any business logic, for every method.
#[utoipa::path(
    post,
    path = "/api/v1/gateways/paylane",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Protocol envelope with result or error", body = serde_json::Value)
    ),
    tag = "Gateways"
)]
pub async fn paylane_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let envelope: Option<RpcEnvelope> = serde_json::from_slice(&body).ok();
    let request_id = envelope
        .as_ref()
        .map(|e| e.id.clone())
        .unwrap_or(Value::Null);

    if let Err(err) = authorize(&headers, &state) {
        return Json(error_body(request_id, err));
    }

    let Some(envelope) = envelope else {
        return Json(error_body(request_id, RpcError::parse_error()));
    };

    info!(method = %envelope.method, "paylane gateway call");

    let outcome = dispatch(&state, &envelope).await;
    match outcome {
        Ok(result) => Json(json!({ "id": envelope.id, "result": result })),
        Err(err) => Json(error_body(envelope.id, err)),
    }
}

fn error_body(id: Value, err: RpcError) -> Value {
    json!({ "id": id, "error": { "code": err.code, "message": err.message } })
}

/// Basic-auth check: fixed username, password compared to the configured
/// secret in constant time. With no secret configured (development), a
/// length sanity check still applies; an empty or short password is never
/// accepted.
fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), RpcError> {
    let header = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(RpcError::insufficient_privileges)?;

    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(RpcError::insufficient_privileges)?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(RpcError::insufficient_privileges)?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(RpcError::insufficient_privileges)?;

    if username != EXPECTED_USERNAME {
        return Err(RpcError::insufficient_privileges());
    }

    match state.config.paylane_gateway_secret.as_deref() {
        Some(secret) => {
            if constant_time_eq(password, secret) {
                Ok(())
            } else {
                Err(RpcError::insufficient_privileges())
            }
        }
        None => {
            if !password.is_empty() && password.len() >= crate::config::GATEWAY_PASSWORD_MIN_LEN {
                Ok(())
            } else {
                Err(RpcError::insufficient_privileges())
            }
        }
    }
}

async fn dispatch(state: &AppState, envelope: &RpcEnvelope) -> RpcResult {
    match envelope.method.as_str() {
        "CheckPerformTransaction" => check_perform_transaction(state, &envelope.params).await,
        "CreateTransaction" => create_transaction(state, &envelope.params).await,
        "PerformTransaction" => perform_transaction(state, &envelope.params).await,
        "CancelTransaction" => cancel_transaction(state, &envelope.params).await,
        "CheckTransaction" => check_transaction(state, &envelope.params).await,
        // Statement export and credential rotation are handled in the
        // provider dashboard, not on this endpoint.
        "GetStatement" | "ChangePassword" => Err(RpcError::method_not_found()),
        _ => Err(RpcError::method_not_found()),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, RpcError> {
    serde_json::from_value(params.clone()).map_err(|_| RpcError::parse_error())
}

/// Resolve and validate the account/amount pair shared by the check and
/// create methods.
async fn validate_account_and_amount(
    state: &AppState,
    params: &Value,
    amount: i64,
) -> Result<uuid::Uuid, RpcError> {
    let account = AccountRef::from_params(params).ok_or_else(RpcError::account_not_found)?;

    let resolved = state
        .services
        .accounts
        .resolve(&account)
        .await
        .map_err(|e| {
            warn!(error = %e, "account resolution failed");
            RpcError::internal_error()
        })?
        .ok_or_else(RpcError::account_not_found)?;

    if state.config.plan_for_amount(amount).is_none() {
        return Err(RpcError::invalid_amount());
    }

    Ok(resolved.user_id)
}

async fn check_perform_transaction(state: &AppState, params: &Value) -> RpcResult {
    let parsed: CheckPerformParams = parse_params(params)?;
    validate_account_and_amount(state, params, parsed.amount).await?;
    Ok(json!({ "allow": true }))
}

async fn create_transaction(state: &AppState, params: &Value) -> RpcResult {
    let parsed: CreateTransactionParams = parse_params(params)?;
    let user_id = validate_account_and_amount(state, params, parsed.amount).await?;

    let (tx, created) = state
        .services
        .ledger
        .create_if_absent(NewTransaction {
            provider: PaymentProvider::Paylane,
            provider_tx_id: parsed.id.clone(),
            merchant_order_id: parsed.id.clone(),
            user_id,
            amount: parsed.amount,
            plan: None,
            duration_days: None,
            provider_create_time: parsed.time,
            raw_payload: Some(params.clone()),
        })
        .await?;

    // Idempotent create: an existing record is returned as-is, but only
    // while it is still pending; a settled transaction cannot be re-created.
    if !created && tx.state != TransactionState::Created {
        return Err(RpcError::unable_to_perform());
    }

    Ok(json!({
        "create_time": tx.create_time_ms(),
        "transaction": tx.id.to_string(),
        "state": tx.state.provider_code(),
    }))
}

async fn perform_transaction(state: &AppState, params: &Value) -> RpcResult {
    let parsed: TransactionIdParams = parse_params(params)?;

    let tx = state
        .services
        .ledger
        .find_by_provider_tx(PaymentProvider::Paylane, &parsed.id)
        .await?
        .ok_or_else(RpcError::transaction_not_found)?;

    if tx.state.is_cancelled() {
        return Err(RpcError::unable_to_perform());
    }

    // Created completes; a repeated delivery of an already-completed call is
    // a counted no-op inside the ledger.
    let (tx, changed) = state
        .services
        .ledger
        .transition(&tx, TransactionState::Completed, TransitionStamp::default())
        .await?;

    if changed {
        // Synchronous reconciliation so the user's access reflects the
        // payment before the provider sees our acknowledgment.
        if let Err(e) = state.services.entitlements.reconcile_user(tx.user_id).await {
            warn!(user_id = %tx.user_id, error = %e, "post-perform reconciliation failed; sweep will repair");
        }
    }

    Ok(json!({
        "transaction": tx.id.to_string(),
        "perform_time": tx.perform_time_ms(),
        "state": tx.state.provider_code(),
    }))
}

async fn cancel_transaction(state: &AppState, params: &Value) -> RpcResult {
    let parsed: CancelTransactionParams = parse_params(params)?;

    let tx = state
        .services
        .ledger
        .find_by_provider_tx(PaymentProvider::Paylane, &parsed.id)
        .await?
        .ok_or_else(RpcError::transaction_not_found)?;

    let stamp = TransitionStamp {
        reason_code: parsed.reason,
        raw_payload: Some(params.clone()),
    };

    let target = match tx.state {
        TransactionState::Created => TransactionState::Cancelled,
        TransactionState::Completed => TransactionState::CancelledAfterComplete,
        // Repeated cancel is an idempotent no-op reporting current state.
        current => current,
    };
    let (tx, changed) = state.services.ledger.transition(&tx, target, stamp).await?;

    if changed && tx.state == TransactionState::CancelledAfterComplete {
        // Re-run reconciliation so a lapsed or inconsistent entitlement is
        // repaired without the revoked payment.
        if let Err(e) = state.services.entitlements.reconcile_user(tx.user_id).await {
            warn!(user_id = %tx.user_id, error = %e, "post-cancel reconciliation failed; sweep will repair");
        }
    }

    Ok(json!({
        "transaction": tx.id.to_string(),
        "cancel_time": tx.cancel_time_ms(),
        "state": tx.state.provider_code(),
    }))
}

async fn check_transaction(state: &AppState, params: &Value) -> RpcResult {
    let parsed: TransactionIdParams = parse_params(params)?;

    let tx = state
        .services
        .ledger
        .find_by_provider_tx(PaymentProvider::Paylane, &parsed.id)
        .await?
        .ok_or_else(RpcError::transaction_not_found)?;

    Ok(json!({
        "create_time": tx.create_time_ms(),
        "perform_time": tx.perform_time_ms(),
        "cancel_time": tx.cancel_time_ms(),
        "transaction": tx.id.to_string(),
        "state": tx.state.provider_code(),
        "reason": tx.reason_code,
    }))
}
