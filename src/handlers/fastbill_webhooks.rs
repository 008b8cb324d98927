//! Fastbill callback gateway: push notifications for invoices we opened with
//! the provider. Signature verification is the only rejection path; every
//! business outcome is acknowledged with HTTP 200 so the provider's retry
//! queue drains.

use crate::errors::ServiceError;
use crate::handlers::common::constant_time_eq;
use crate::models::{PaymentProvider, TransactionState};
use crate::services::ledger::TransitionStamp;
use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Payload Fastbill posts on every invoice status change.
#[derive(Debug, Clone, Deserialize, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FastbillCallback {
    pub store_id: String,
    pub invoice_id: String,
    pub amount: i64,
    pub status: FastbillStatus,
    /// Provider-side delivery id; changes on every retry of the same event.
    pub uuid: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FastbillStatus {
    Paid,
    Failed,
    Refunded,
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/fastbill/callback", post(fastbill_callback))
}

/// Recompute the keyed hash over `store_id + invoice_id + amount + secret`.
pub fn compute_signature(store_id: &str, invoice_id: &str, amount: i64, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(store_id.as_bytes());
    hasher.update(invoice_id.as_bytes());
    hasher.update(amount.to_string().as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[utoipa::path(
    post,
    path = "/api/v1/gateways/fastbill/callback",
    request_body = FastbillCallback,
    responses(
        (status = 200, description = "Callback acknowledged"),
        (status = 400, description = "Malformed payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse)
    ),
    tag = "Gateways"
)]
pub async fn fastbill_callback(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let callback: FastbillCallback = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid callback payload: {}", e)))?;

    // Security boundary: verified before the ledger is touched in any way.
    let secret = state
        .config
        .fastbill_webhook_secret
        .as_deref()
        .ok_or_else(|| {
            warn!("fastbill callback received but no webhook secret is configured");
            ServiceError::Unauthorized("webhook secret not configured".to_string())
        })?;

    let expected = compute_signature(
        &callback.store_id,
        &callback.invoice_id,
        callback.amount,
        secret,
    );
    if !constant_time_eq(&expected, &callback.signature) {
        warn!(invoice_id = %callback.invoice_id, "fastbill signature verification failed");
        return Err(ServiceError::Unauthorized(
            "invalid callback signature".to_string(),
        ));
    }

    if let Some(expected_store) = state.config.fastbill_store_id.as_deref() {
        if expected_store != callback.store_id {
            warn!(store_id = %callback.store_id, "fastbill callback for foreign store rejected");
            return Err(ServiceError::Unauthorized("unknown store".to_string()));
        }
    }

    let tx = state
        .services
        .ledger
        .find_by_order_id(PaymentProvider::Fastbill, &callback.invoice_id)
        .await?;

    let Some(tx) = tx else {
        // Nothing to attribute this to; acknowledge so the provider stops
        // retrying, and leave the ledger alone.
        info!(invoice_id = %callback.invoice_id, "fastbill callback for unknown invoice ignored");
        return Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))));
    };

    // Duplicate delivery of a settled invoice: acknowledge without
    // re-mutating anything.
    if tx.state == TransactionState::Completed && callback.status == FastbillStatus::Paid {
        info!(invoice_id = %callback.invoice_id, "fastbill callback already processed");
        return Ok((
            StatusCode::OK,
            Json(json!({ "status": "already_processed" })),
        ));
    }

    let target = match callback.status {
        FastbillStatus::Paid => TransactionState::Completed,
        FastbillStatus::Failed => TransactionState::Cancelled,
        FastbillStatus::Refunded => {
            if tx.state == TransactionState::Completed {
                TransactionState::CancelledAfterComplete
            } else {
                TransactionState::Cancelled
            }
        }
    };

    let stamp = TransitionStamp {
        reason_code: match callback.status {
            FastbillStatus::Refunded => Some(crate::models::payment_transaction::reason::REFUND),
            _ => None,
        },
        raw_payload: serde_json::to_value(&callback).ok(),
    };

    let transition = state.services.ledger.transition(&tx, target, stamp).await;

    let (tx, changed) = match transition {
        Ok(result) => result,
        // Business-logic failure (e.g. a late `paid` for a cancelled
        // invoice): acknowledged, not retried. The defect is already logged
        // at the ledger boundary.
        Err(ServiceError::InvalidStateTransition(msg)) => {
            warn!(invoice_id = %callback.invoice_id, %msg, "fastbill callback ignored");
            return Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))));
        }
        Err(other) => return Err(other),
    };

    // First transition into paid settles the subscription synchronously.
    if changed && tx.state == TransactionState::Completed {
        if let Err(e) = state.services.entitlements.reconcile_user(tx.user_id).await {
            warn!(user_id = %tx.user_id, error = %e, "post-payment reconciliation failed; sweep will repair");
        }
    }
    // After a refund the revoked payment must stop counting toward stacking.
    if changed && tx.state == TransactionState::CancelledAfterComplete {
        if let Err(e) = state.services.entitlements.reconcile_user(tx.user_id).await {
            warn!(user_id = %tx.user_id, error = %e, "post-refund reconciliation failed; sweep will repair");
        }
    }

    Ok((StatusCode::OK, Json(json!({ "status": "ok" }))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_hex_sha256_over_concatenation() {
        let sig = compute_signature("store-1", "inv-42", 9_900, "topsecret");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));

        // Same inputs, same signature
        assert_eq!(
            sig,
            compute_signature("store-1", "inv-42", 9_900, "topsecret")
        );
    }

    #[test]
    fn signature_changes_with_any_field() {
        let base = compute_signature("store-1", "inv-42", 9_900, "topsecret");
        assert_ne!(base, compute_signature("store-2", "inv-42", 9_900, "topsecret"));
        assert_ne!(base, compute_signature("store-1", "inv-43", 9_900, "topsecret"));
        assert_ne!(base, compute_signature("store-1", "inv-42", 9_901, "topsecret"));
        assert_ne!(base, compute_signature("store-1", "inv-42", 9_900, "other"));
    }

    #[test]
    fn callback_deserializes_camel_case_payload() {
        let payload = serde_json::json!({
            "storeId": "store-1",
            "invoiceId": "inv-42",
            "amount": 9900,
            "status": "paid",
            "uuid": "d3adb33f",
            "signature": "abc"
        });
        let callback: FastbillCallback = serde_json::from_value(payload).unwrap();
        assert_eq!(callback.status, FastbillStatus::Paid);
        assert_eq!(callback.invoice_id, "inv-42");
    }

    #[test]
    fn unknown_status_is_rejected_at_parse_time() {
        let payload = serde_json::json!({
            "storeId": "store-1",
            "invoiceId": "inv-42",
            "amount": 9900,
            "status": "chargeback",
            "uuid": "d3adb33f",
            "signature": "abc"
        });
        assert!(serde_json::from_value::<FastbillCallback>(payload).is_err());
    }
}
