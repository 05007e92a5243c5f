//! Payment reconciliation: signed webhooks, client confirmations and the
//! exactly-once confirmation transition.

mod common;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::{
    razorpay_signature, response_json, session_completed, TestApp,
    STRIPE_WEBHOOK_SECRET,
};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_checkout::{
    entities::{OrderSource, OrderStatus},
    errors::{ServiceError, PAYMENT_NOT_VERIFIED},
    events::Event,
    metrics,
    services::{
        gateways::{stripe, GatewayProvider, GatewayRegistry},
        reconciler::{PaymentReconciler, ReconcileOutcome},
    },
};
use uuid::Uuid;

struct Opened {
    order_id: Uuid,
    session_id: String,
    amount_minor: i64,
}

async fn open(app: &TestApp, gateway: &str, customer: Option<Uuid>, body: serde_json::Value) -> Opened {
    let uri = match gateway {
        "stripe" => "/api/v1/checkout/stripe/session",
        _ => "/api/v1/checkout/razorpay/order",
    };
    let response = app.request(Method::POST, uri, Some(body), customer).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let data = response_json(response).await["data"].clone();
    Opened {
        order_id: data["order_id"].as_str().unwrap().parse().unwrap(),
        session_id: data["session_id"].as_str().unwrap().to_string(),
        amount_minor: data["amount_minor"].as_i64().unwrap(),
    }
}

/// Customer with two cart lines checked out through the redirect gateway.
async fn cart_checkout(app: &TestApp, gateway: &str) -> (Uuid, Opened) {
    let customer = Uuid::new_v4();
    let chair = app.seed_product("Chair", dec!(100), 5).await;
    let rug = app.seed_product("Rug", dec!(60), 5).await;
    app.state.services.cart.add_item(customer, chair, 2).await.unwrap();
    app.state.services.cart.add_item(customer, rug, 1).await.unwrap();

    let opened = open(app, gateway, Some(customer), json!({})).await;
    (customer, opened)
}

fn confirmations(events: &[Event], order: Uuid) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::OrderConfirmed { order_id, .. } if *order_id == order))
        .count()
}

#[tokio::test]
async fn webhook_confirms_once_and_clears_the_cart_once() {
    let app = TestApp::new().await;
    let (customer, opened) = cart_checkout(&app, "stripe").await;
    assert_eq!(opened.amount_minor, 26000);
    app.drain_events().await;

    let payload = session_completed(&opened.session_id, Some(opened.order_id), 26000, "paid");

    let first = app.deliver_signed_webhook(&payload).await;
    assert_eq!(first.status(), StatusCode::OK);
    let ack = response_json(first).await;
    assert_eq!(ack["received"], true);
    assert_eq!(ack["outcome"], "confirmed");
    assert_eq!(ack["order_id"], opened.order_id.to_string());

    let order = app.order(opened.order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert!(order.confirmed_at.is_some());
    assert!(order.gateway_payment_id.as_deref().unwrap().starts_with("pi_"));
    let cart = app.state.services.cart.read_cart(customer).await.unwrap();
    assert_eq!(cart.count, 0);

    // The customer starts a new cart; a redelivery must not touch it
    let lamp = app.seed_product("Lamp", dec!(45), 5).await;
    app.state.services.cart.add_item(customer, lamp, 1).await.unwrap();

    let again = app.deliver_signed_webhook(&payload).await;
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(response_json(again).await["outcome"], "already_confirmed");

    let cart = app.state.services.cart.read_cart(customer).await.unwrap();
    assert_eq!(cart.count, 1);
    let unchanged = app.order(opened.order_id).await;
    assert_eq!(unchanged.confirmed_at, order.confirmed_at);
    assert_eq!(unchanged.gateway_payment_id, order.gateway_payment_id);

    let events = app.drain_events().await;
    assert_eq!(confirmations(&events, opened.order_id), 1);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::CartCleared { lines: 2, .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn concurrent_deliveries_confirm_once() {
    let app = TestApp::new().await;
    let (_, opened) = cart_checkout(&app, "stripe").await;
    app.drain_events().await;

    let payload = session_completed(&opened.session_id, Some(opened.order_id), 26000, "paid");
    let reconciler = app.state.services.reconciler.clone();

    let deliveries = (0..5).map(|_| {
        let reconciler = reconciler.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            let header =
                stripe::signature_header(STRIPE_WEBHOOK_SECRET, &payload, Utc::now().timestamp())
                    .unwrap();
            reconciler
                .handle_webhook(
                    GatewayProvider::Stripe,
                    Some(header.as_str()),
                    &payload,
                )
                .await
        })
    });
    let outcomes = futures::future::join_all(deliveries).await;

    let confirmed = outcomes
        .into_iter()
        .map(|r| r.expect("task completes").expect("delivery accepted"))
        .filter(|o| matches!(o, ReconcileOutcome::Confirmed { .. }))
        .count();
    assert_eq!(confirmed, 1);
    assert_eq!(confirmations(&app.drain_events().await, opened.order_id), 1);
}

#[tokio::test]
async fn bad_signatures_change_nothing() {
    let app = TestApp::new().await;
    let (customer, opened) = cart_checkout(&app, "stripe").await;
    let payload = session_completed(&opened.session_id, Some(opened.order_id), 26000, "paid");

    let forged = stripe::signature_header("whsec_wrong", &payload, Utc::now().timestamp()).unwrap();
    let stale = stripe::signature_header(
        STRIPE_WEBHOOK_SECRET,
        &payload,
        Utc::now().timestamp() - 3600,
    )
    .unwrap();
    let valid = stripe::signature_header(STRIPE_WEBHOOK_SECRET, &payload, Utc::now().timestamp())
        .unwrap();

    let mut tampered = payload.clone();
    tampered.extend_from_slice(b" ");

    let attempts: Vec<(Vec<u8>, Option<String>)> = vec![
        (payload.clone(), None),
        (payload.clone(), Some(forged)),
        (payload.clone(), Some(stale)),
        (payload.clone(), Some("garbage".to_string())),
        (tampered, Some(valid)),
    ];

    for (body, header) in attempts {
        let response = app.deliver_webhook(&body, header.as_deref()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = response_json(response).await;
        assert_eq!(error["code"], "invalid_webhook_signature");
        assert_eq!(error["message"], PAYMENT_NOT_VERIFIED);
    }

    assert_eq!(app.order(opened.order_id).await.status, OrderStatus::Placed);
    let cart = app.state.services.cart.read_cart(customer).await.unwrap();
    assert_eq!(cart.count, 2);
}

#[tokio::test]
async fn signature_is_checked_before_the_body_is_parsed() {
    let app = TestApp::new().await;

    let response = app.deliver_webhook(b"not json at all", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response_json(response).await["code"],
        "invalid_webhook_signature"
    );
}

#[tokio::test]
async fn unrelated_and_unpaid_events_are_acknowledged() {
    let app = TestApp::new().await;
    let (_, opened) = cart_checkout(&app, "stripe").await;

    let unpaid = session_completed(&opened.session_id, Some(opened.order_id), 26000, "unpaid");
    let response = app.deliver_signed_webhook(&unpaid).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "ignored");

    let refund = serde_json::to_vec(&json!({
        "id": "evt_refund",
        "type": "charge.refunded",
        "data": { "object": { "id": "ch_1" } }
    }))
    .unwrap();
    let response = app.deliver_signed_webhook(&refund).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "ignored");

    assert_eq!(app.order(opened.order_id).await.status, OrderStatus::Placed);
}

#[tokio::test]
async fn async_payment_success_confirms() {
    let app = TestApp::new().await;
    let (_, opened) = cart_checkout(&app, "stripe").await;

    let payload = serde_json::to_vec(&json!({
        "id": "evt_async",
        "type": "checkout.session.async_payment_succeeded",
        "data": { "object": {
            "id": opened.session_id,
            "client_reference_id": opened.order_id.to_string(),
            "payment_status": "paid",
            "payment_intent": { "id": "pi_async" },
            "amount_total": opened.amount_minor,
            "currency": "inr"
        }}
    }))
    .unwrap();

    let response = app.deliver_signed_webhook(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    let order = app.order(opened.order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.gateway_payment_id.as_deref(), Some("pi_async"));
}

#[tokio::test]
async fn unconfigured_webhooks_are_rejected_as_unverified() {
    let app = TestApp::new().await;
    let (_, opened) = cart_checkout(&app, "stripe").await;
    let reconciler = PaymentReconciler::new(
        app.state.db.clone(),
        app.state.services.orders.clone(),
        GatewayRegistry::new(),
        app.state.event_sender.clone(),
        "INR".to_string(),
    );

    let payload = session_completed(&opened.session_id, Some(opened.order_id), 26000, "paid");
    let header = stripe::signature_header(STRIPE_WEBHOOK_SECRET, &payload, Utc::now().timestamp())
        .unwrap();
    let result = reconciler
        .handle_webhook(GatewayProvider::Stripe, Some(header.as_str()), &payload)
        .await;

    assert!(matches!(
        result,
        Err(ServiceError::InvalidWebhookSignature(_))
    ));
    assert_eq!(app.order(opened.order_id).await.status, OrderStatus::Placed);
}

#[tokio::test]
async fn amount_mismatch_is_rejected_without_mutation() {
    let app = TestApp::new().await;
    let (customer, opened) = cart_checkout(&app, "stripe").await;
    let mismatches = metrics::AMOUNT_MISMATCHES.with_label_values(&["stripe"]);
    let before = mismatches.get();

    let payload = session_completed(&opened.session_id, Some(opened.order_id), 100, "paid");
    let response = app.deliver_signed_webhook(&payload).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let error = response_json(response).await;
    assert_eq!(error["code"], "amount_mismatch");
    assert_eq!(error["message"], PAYMENT_NOT_VERIFIED);
    assert!(mismatches.get() > before);

    assert_eq!(app.order(opened.order_id).await.status, OrderStatus::Placed);
    assert_eq!(
        app.state.services.cart.read_cart(customer).await.unwrap().count,
        2
    );
}

#[tokio::test]
async fn webhook_for_unknown_order_is_not_found() {
    let app = TestApp::new().await;

    let payload = session_completed("cs_test_orphan", Some(Uuid::new_v4()), 5000, "paid");
    let response = app.deliver_signed_webhook(&payload).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.order_count().await, 0);
}

#[tokio::test]
async fn unreferenced_payment_resolves_by_session() {
    let app = TestApp::new().await;
    let (_, opened) = cart_checkout(&app, "stripe").await;

    let payload = session_completed(&opened.session_id, None, 26000, "paid");
    let response = app.deliver_signed_webhook(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = response_json(response).await;
    assert_eq!(ack["order_id"], opened.order_id.to_string());

    assert_eq!(app.order(opened.order_id).await.status, OrderStatus::Confirmed);
    assert_eq!(app.order_count().await, 1);
}

#[tokio::test]
async fn unreferenced_payment_synthesizes_one_order() {
    let app = TestApp::new().await;

    let payload = session_completed("cs_test_external", None, 12345, "paid");
    let first = app.deliver_signed_webhook(&payload).await;
    assert_eq!(first.status(), StatusCode::OK);
    let ack = response_json(first).await;
    assert_eq!(ack["outcome"], "confirmed");
    let order_id: Uuid = ack["order_id"].as_str().unwrap().parse().unwrap();

    let order = app.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.source, OrderSource::Gateway);
    assert_eq!(order.owner_id, None);
    assert_eq!(order.total, dec!(123.45));
    assert_eq!(order.currency, "INR");
    assert_eq!(order.gateway_session_id.as_deref(), Some("cs_test_external"));

    let second = app.deliver_signed_webhook(&payload).await;
    assert_eq!(second.status(), StatusCode::OK);
    let ack = response_json(second).await;
    assert_eq!(ack["outcome"], "already_confirmed");
    assert_eq!(ack["order_id"], order_id.to_string());
    assert_eq!(app.order_count().await, 1);
}

#[tokio::test]
async fn modal_payment_verifies_and_confirms() {
    let app = TestApp::new().await;
    let (customer, opened) = cart_checkout(&app, "razorpay").await;
    assert_eq!(app.order(opened.order_id).await.status, OrderStatus::Draft);
    app.drain_events().await;

    let body = json!({
        "order_id": opened.order_id,
        "razorpay_order_id": opened.session_id,
        "razorpay_payment_id": "pay_modal_1",
        "razorpay_signature": razorpay_signature(&opened.session_id, "pay_modal_1"),
    });

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/razorpay/verify",
            Some(body.clone()),
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let verified = response_json(response).await;
    assert_eq!(verified["data"]["status"], "confirmed");
    assert_eq!(verified["data"]["already_confirmed"], false);

    let order = app.order(opened.order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.gateway_payment_id.as_deref(), Some("pay_modal_1"));
    assert_eq!(order.total, dec!(260));
    assert_eq!(
        app.state.services.cart.read_cart(customer).await.unwrap().count,
        0
    );

    // The browser retries after a flaky network
    let retry = app
        .request(
            Method::POST,
            "/api/v1/payments/razorpay/verify",
            Some(body),
            Some(customer),
        )
        .await;
    assert_eq!(retry.status(), StatusCode::OK);
    assert_eq!(response_json(retry).await["data"]["already_confirmed"], true);
    assert_eq!(confirmations(&app.drain_events().await, opened.order_id), 1);
}

#[tokio::test]
async fn modal_signature_mismatch_is_rejected() {
    let app = TestApp::new().await;
    let (customer, opened) = cart_checkout(&app, "razorpay").await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/razorpay/verify",
            Some(json!({
                "order_id": opened.order_id,
                "razorpay_order_id": opened.session_id,
                "razorpay_payment_id": "pay_modal_2",
                "razorpay_signature": razorpay_signature(&opened.session_id, "pay_other"),
            })),
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = response_json(response).await;
    assert_eq!(error["code"], "signature_mismatch");
    assert_eq!(error["message"], PAYMENT_NOT_VERIFIED);

    assert_eq!(app.order(opened.order_id).await.status, OrderStatus::Draft);
    assert_eq!(
        app.state.services.cart.read_cart(customer).await.unwrap().count,
        2
    );
}

#[tokio::test]
async fn modal_signature_for_another_order_is_rejected() {
    let app = TestApp::new().await;
    let cheap = app.seed_product("Coaster", dec!(5), 50).await;
    let pricey = app.seed_product("Armchair", dec!(700), 2).await;

    let paid = open(
        &app,
        "razorpay",
        None,
        json!({ "items": [{ "product_id": cheap, "quantity": 1 }] }),
    )
    .await;
    let unpaid = open(
        &app,
        "razorpay",
        None,
        json!({ "items": [{ "product_id": pricey, "quantity": 1 }] }),
    )
    .await;

    // Genuine signature for the cheap order, replayed against the expensive one
    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/razorpay/verify",
            Some(json!({
                "order_id": unpaid.order_id,
                "razorpay_order_id": paid.session_id,
                "razorpay_payment_id": "pay_cheap",
                "razorpay_signature": razorpay_signature(&paid.session_id, "pay_cheap"),
            })),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(response).await["code"], "signature_mismatch");
    assert_eq!(app.order(unpaid.order_id).await.status, OrderStatus::Draft);
}

#[tokio::test]
async fn guest_confirmation_leaves_carts_alone() {
    let app = TestApp::new().await;
    let shopper = Uuid::new_v4();
    let vase = app.seed_product("Vase", dec!(30), 10).await;
    app.state.services.cart.add_item(shopper, vase, 1).await.unwrap();

    let opened = open(
        &app,
        "stripe",
        None,
        json!({ "items": [{ "product_id": vase, "quantity": 2 }] }),
    )
    .await;
    let payload = session_completed(&opened.session_id, Some(opened.order_id), 6000, "paid");

    let response = app.deliver_signed_webhook(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);

    let order = app.order(opened.order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.owner_id, None);
    assert_eq!(
        app.state.services.cart.read_cart(shopper).await.unwrap().count,
        1
    );
}

#[tokio::test]
async fn buy_now_confirmation_keeps_the_cart() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let vase = app.seed_product("Vase", dec!(30), 10).await;
    let mirror = app.seed_product("Mirror", dec!(80), 10).await;
    app.state.services.cart.add_item(customer, vase, 1).await.unwrap();

    let opened = open(
        &app,
        "stripe",
        Some(customer),
        json!({ "items": [{ "product_id": mirror, "quantity": 1 }], "buy_now": true }),
    )
    .await;
    let payload = session_completed(&opened.session_id, Some(opened.order_id), 8000, "paid");

    let response = app.deliver_signed_webhook(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.order(opened.order_id).await.status, OrderStatus::Confirmed);
    assert_eq!(
        app.state.services.cart.read_cart(customer).await.unwrap().count,
        1
    );
}

#[tokio::test]
async fn late_payment_confirms_an_expired_order() {
    let app = TestApp::new().await;
    let (_, opened) = cart_checkout(&app, "stripe").await;

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let expired = app
        .state
        .services
        .orders
        .expire_stale_drafts(chrono::Duration::zero())
        .await
        .unwrap();
    assert_eq!(expired, vec![opened.order_id]);

    let payload = session_completed(&opened.session_id, Some(opened.order_id), 26000, "paid");
    let response = app.deliver_signed_webhook(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "confirmed");
    assert_eq!(
        app.order(opened.order_id).await.status,
        OrderStatus::Confirmed
    );
}
