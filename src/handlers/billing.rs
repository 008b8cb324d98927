use crate::errors::ServiceError;
use crate::models::{payment_transaction, PaymentProvider};
use crate::services::ledger::NewTransaction;
use crate::{ApiResponse, AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "user_id": "550e8400-e29b-41d4-a716-446655440000",
    "amount": 9900
}))]
pub struct CreateInvoiceRequest {
    /// User the invoice is opened for
    pub user_id: Uuid,
    /// Amount in minor currency units; must match a configured price point
    #[validate(range(min = 1))]
    pub amount: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InvoiceResponse {
    pub invoice_id: String,
    pub user_id: Uuid,
    pub amount: i64,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

/// Audit view of a ledger record.
#[derive(Debug, Serialize, ToSchema)]
pub struct TransactionView {
    pub id: Uuid,
    pub provider: String,
    pub provider_tx_id: String,
    pub merchant_order_id: String,
    pub amount: i64,
    pub state: String,
    pub reason_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub performed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl From<payment_transaction::Model> for TransactionView {
    fn from(tx: payment_transaction::Model) -> Self {
        Self {
            id: tx.id,
            provider: tx.provider.to_string(),
            provider_tx_id: tx.provider_tx_id,
            merchant_order_id: tx.merchant_order_id,
            amount: tx.amount,
            state: tx.state.to_string(),
            reason_code: tx.reason_code,
            created_at: tx.created_at,
            performed_at: tx.performed_at,
            cancelled_at: tx.cancelled_at,
        }
    }
}

/// Open a Fastbill invoice: the pending ledger record the provider's
/// callback later settles.
#[utoipa::path(
    post,
    path = "/api/v1/billing/invoices",
    request_body = CreateInvoiceRequest,
    responses(
        (status = 201, description = "Invoice opened", body = crate::ApiResponse<InvoiceResponse>),
        (status = 400, description = "Unknown price point", body = crate::errors::ErrorResponse)
    ),
    tag = "Billing"
)]
pub async fn create_invoice(
    State(state): State<AppState>,
    Json(request): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<ApiResponse<InvoiceResponse>>), ServiceError> {
    request.validate()?;

    // Hard error for unknown amounts; there is no default plan.
    if state.config.plan_for_amount(request.amount).is_none() {
        return Err(ServiceError::ValidationError(format!(
            "amount {} does not match any configured price point",
            request.amount
        )));
    }

    let invoice_id = format!("inv-{}", Uuid::new_v4().simple());
    let (tx, _) = state
        .services
        .ledger
        .create_if_absent(NewTransaction {
            provider: PaymentProvider::Fastbill,
            provider_tx_id: invoice_id.clone(),
            merchant_order_id: invoice_id,
            user_id: request.user_id,
            amount: request.amount,
            plan: None,
            duration_days: None,
            provider_create_time: None,
            raw_payload: None,
        })
        .await?;

    let response = InvoiceResponse {
        invoice_id: tx.merchant_order_id.clone(),
        user_id: tx.user_id,
        amount: tx.amount,
        state: tx.state.to_string(),
        created_at: tx.created_at,
    };

    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}

/// Full transaction history for a user, newest first.
#[utoipa::path(
    get,
    path = "/api/v1/billing/transactions/{user_id}",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Transactions for user", body = crate::ApiResponse<Vec<TransactionView>>)
    ),
    tag = "Billing"
)]
pub async fn list_user_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<TransactionView>>>, ServiceError> {
    let transactions = state.services.ledger.transactions_for_user(user_id).await?;
    let views = transactions.into_iter().map(TransactionView::from).collect();
    Ok(Json(ApiResponse::success(views)))
}

pub fn billing_routes() -> Router<AppState> {
    Router::new()
        .route("/invoices", post(create_invoice))
        .route("/transactions/:user_id", get(list_user_transactions))
}
