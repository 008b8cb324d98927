use crate::errors::ServiceError;
use crate::models::SubscriptionPlan;
use crate::services::entitlement::EntitlementView;
use crate::services::sweep::SweepReport;
use crate::{ApiResponse, AppState};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// What the rest of the platform calls for access-control checks. Runs a
/// lazy reconciliation pass first, so the answer reflects the ledger even
/// when a webhook-path reconciliation was skipped.
#[utoipa::path(
    get,
    path = "/api/v1/entitlements/{user_id}",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Current entitlement", body = crate::ApiResponse<EntitlementView>)
    ),
    tag = "Entitlements"
)]
pub async fn get_entitlement(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<EntitlementView>>, ServiceError> {
    let view = state.services.entitlements.get_entitlement(user_id).await?;
    Ok(Json(ApiResponse::success(view)))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "user_id": "550e8400-e29b-41d4-a716-446655440000",
    "plan": "premium",
    "duration_days": 30
}))]
pub struct GrantEntitlementRequest {
    pub user_id: Uuid,
    #[schema(value_type = String, example = "premium")]
    pub plan: SubscriptionPlan,
    #[validate(range(min = 1, max = 3660))]
    pub duration_days: i32,
}

/// Manual/promotional grant. Recorded as a synthetic zero-amount ledger
/// transaction and reconciled, never written to the entitlement row directly.
#[utoipa::path(
    post,
    path = "/api/v1/entitlements/grant",
    request_body = GrantEntitlementRequest,
    responses(
        (status = 200, description = "Entitlement after the grant", body = crate::ApiResponse<EntitlementView>),
        (status = 400, description = "Invalid grant", body = crate::errors::ErrorResponse)
    ),
    tag = "Entitlements"
)]
pub async fn grant_entitlement(
    State(state): State<AppState>,
    Json(request): Json<GrantEntitlementRequest>,
) -> Result<Json<ApiResponse<EntitlementView>>, ServiceError> {
    request.validate()?;

    let view = state
        .services
        .entitlements
        .grant_entitlement(request.user_id, request.plan, request.duration_days)
        .await?;
    Ok(Json(ApiResponse::success(view)))
}

/// Trigger the reconciliation sweep out of schedule.
#[utoipa::path(
    post,
    path = "/api/v1/admin/reconciliation/run",
    responses(
        (status = 200, description = "Sweep counts", body = crate::ApiResponse<SweepReport>)
    ),
    tag = "Admin"
)]
pub async fn run_reconciliation(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<SweepReport>>, ServiceError> {
    let report = state.services.sweep.run().await?;
    Ok(Json(ApiResponse::success(report)))
}

pub fn entitlement_routes() -> Router<AppState> {
    Router::new()
        .route("/:user_id", get(get_entitlement))
        .route("/grant", post(grant_entitlement))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/reconciliation/run", post(run_reconciliation))
}
