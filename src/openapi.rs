use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// OpenAPI document covering every HTTP surface of the service.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Learnset API",
        description = "Payment gateway adapters, transaction ledger, and subscription entitlement reconciliation"
    ),
    paths(
        crate::handlers::paylane_gateway::paylane_rpc,
        crate::handlers::fastbill_webhooks::fastbill_callback,
        crate::handlers::billing::create_invoice,
        crate::handlers::billing::list_user_transactions,
        crate::handlers::entitlements::get_entitlement,
        crate::handlers::entitlements::grant_entitlement,
        crate::handlers::entitlements::run_reconciliation,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::handlers::fastbill_webhooks::FastbillCallback,
        crate::handlers::fastbill_webhooks::FastbillStatus,
        crate::handlers::billing::CreateInvoiceRequest,
        crate::handlers::billing::InvoiceResponse,
        crate::handlers::billing::TransactionView,
        crate::handlers::entitlements::GrantEntitlementRequest,
        crate::services::entitlement::EntitlementView,
        crate::services::sweep::SweepReport,
    )),
    tags(
        (name = "Gateways", description = "Inbound payment provider protocols"),
        (name = "Billing", description = "Invoice creation and transaction audit"),
        (name = "Entitlements", description = "Subscription entitlement reads and grants"),
        (name = "Admin", description = "Operational triggers"),
    )
)]
pub struct ApiDoc;

/// Swagger UI mounted at `/docs`.
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}
