//! Integration tests for the Fastbill callback gateway: the signature
//! boundary, idempotent delivery, and entitlement settlement.

mod common;

use axum::http::{Method, StatusCode};
use common::{fastbill_signature, response_json, TestApp, STORE_ID};
use serde_json::{json, Value};
use uuid::Uuid;

async fn open_invoice(app: &TestApp, user_id: Uuid, amount: i64) -> String {
    let response = app
        .request(
            Method::POST,
            "/api/v1/billing/invoices",
            Some(json!({"user_id": user_id, "amount": amount})),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    body["data"]["invoice_id"].as_str().unwrap().to_string()
}

fn callback(invoice_id: &str, amount: i64, status: &str) -> Value {
    json!({
        "storeId": STORE_ID,
        "invoiceId": invoice_id,
        "amount": amount,
        "status": status,
        "uuid": Uuid::new_v4().to_string(),
        "signature": fastbill_signature(invoice_id, amount),
    })
}

#[tokio::test]
#[ignore = "requires SQLite integration environment"]
async fn invalid_signature_rejected_and_ledger_untouched() {
    let user_id = Uuid::new_v4();
    let app = TestApp::new(&[]).await;
    let invoice_id = open_invoice(&app, user_id, 9_900).await;

    let mut payload = callback(&invoice_id, 9_900, "paid");
    payload["signature"] = json!("0000000000000000000000000000000000000000000000000000000000000000");

    let (status, _) = app.webhook(payload).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Business fields looked valid, but the ledger must not have moved.
    let entitlement = app.entitlement(user_id).await;
    assert_eq!(entitlement["data"]["plan"], json!("free"));
}

#[tokio::test]
#[ignore = "requires SQLite integration environment"]
async fn tampered_amount_fails_signature_check() {
    let user_id = Uuid::new_v4();
    let app = TestApp::new(&[]).await;
    let invoice_id = open_invoice(&app, user_id, 9_900).await;

    // Signature computed for the real amount, payload claims another.
    let mut payload = callback(&invoice_id, 9_900, "paid");
    payload["amount"] = json!(1);

    let (status, _) = app.webhook(payload).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore = "requires SQLite integration environment"]
async fn malformed_payload_is_bad_request() {
    let app = TestApp::new(&[]).await;
    let (status, _) = app.webhook(json!({"storeId": STORE_ID})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[ignore = "requires SQLite integration environment"]
async fn paid_callback_settles_invoice_and_activates() {
    let user_id = Uuid::new_v4();
    let app = TestApp::new(&[]).await;
    let invoice_id = open_invoice(&app, user_id, 9_900).await;

    let (status, body) = app.webhook(callback(&invoice_id, 9_900, "paid")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));

    let entitlement = app.entitlement(user_id).await;
    assert_eq!(entitlement["data"]["plan"], json!("premium"));
    assert_eq!(entitlement["data"]["active"], json!(true));
}

#[tokio::test]
#[ignore = "requires SQLite integration environment"]
async fn duplicate_paid_callback_acknowledged_without_remutation() {
    let user_id = Uuid::new_v4();
    let app = TestApp::new(&[]).await;
    let invoice_id = open_invoice(&app, user_id, 9_900).await;

    let (_, first) = app.webhook(callback(&invoice_id, 9_900, "paid")).await;
    assert_eq!(first["status"], json!("ok"));

    let expiry_after_first = app.entitlement(user_id).await["data"]["expiry_date"].clone();

    // Same invoice delivered again (provider retry): acknowledged, one
    // transition, one entitlement window.
    let (status, second) = app.webhook(callback(&invoice_id, 9_900, "paid")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], json!("already_processed"));

    let expiry_after_second = app.entitlement(user_id).await["data"]["expiry_date"].clone();
    assert_eq!(expiry_after_first, expiry_after_second);
}

#[tokio::test]
#[ignore = "requires SQLite integration environment"]
async fn unknown_invoice_acknowledged_as_ignored() {
    let app = TestApp::new(&[]).await;
    let (status, body) = app.webhook(callback("inv-unknown", 9_900, "paid")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ignored"));
}

#[tokio::test]
#[ignore = "requires SQLite integration environment"]
async fn failed_callback_cancels_pending_invoice() {
    let user_id = Uuid::new_v4();
    let app = TestApp::new(&[]).await;
    let invoice_id = open_invoice(&app, user_id, 9_900).await;

    let (status, body) = app.webhook(callback(&invoice_id, 9_900, "failed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));

    let entitlement = app.entitlement(user_id).await;
    assert_eq!(entitlement["data"]["plan"], json!("free"));
}

#[tokio::test]
#[ignore = "requires SQLite integration environment"]
async fn refunded_payment_does_not_renew_after_window_ends() {
    let user_id = Uuid::new_v4();
    let app = TestApp::new(&[]).await;
    let invoice_id = open_invoice(&app, user_id, 9_900).await;

    app.webhook(callback(&invoice_id, 9_900, "paid")).await;
    assert_eq!(
        app.entitlement(user_id).await["data"]["active"],
        json!(true)
    );

    let (status, body) = app.webhook(callback(&invoice_id, 9_900, "refunded")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));

    // The refunded transaction no longer counts toward stacking: once the
    // stored window lapses, the user reconciles to free.
    common::force_expire(&app.db, user_id).await;
    let entitlement = app.entitlement(user_id).await;
    assert_eq!(entitlement["data"]["plan"], json!("free"));
    assert_eq!(entitlement["data"]["active"], json!(false));
}

#[tokio::test]
#[ignore = "requires SQLite integration environment"]
async fn late_paid_for_cancelled_invoice_acknowledged_not_applied() {
    let user_id = Uuid::new_v4();
    let app = TestApp::new(&[]).await;
    let invoice_id = open_invoice(&app, user_id, 9_900).await;

    app.webhook(callback(&invoice_id, 9_900, "failed")).await;

    // Out-of-order `paid` for an already-failed invoice: the ledger rejects
    // the edge, the provider still gets a 200 so it stops retrying.
    let (status, body) = app.webhook(callback(&invoice_id, 9_900, "paid")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ignored"));

    let entitlement = app.entitlement(user_id).await;
    assert_eq!(entitlement["data"]["plan"], json!("free"));
}
