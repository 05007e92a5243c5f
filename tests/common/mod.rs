#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use storefront_checkout::{
    config::AppConfig,
    db,
    entities::{product, OrderModel, Order, Product},
    events::{Event, EventSender},
    handlers::AppServices,
    identity::CUSTOMER_ID_HEADER,
    services::gateways::{razorpay, stripe},
    signing, AppState,
};
use tokio::sync::{mpsc, Mutex};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request as MockRequest, ResponseTemplate,
};

pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const RAZORPAY_KEY_ID: &str = "rzp_test_key";
pub const RAZORPAY_KEY_SECRET: &str = "rzp_test_secret";

/// Application over an in-memory SQLite database with both gateways pointed
/// at local mock servers.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub stripe_server: MockServer,
    pub razorpay_server: MockServer,
    events: Mutex<mpsc::Receiver<Event>>,
}

impl TestApp {
    pub async fn new() -> Self {
        let stripe_server = MockServer::start().await;
        let razorpay_server = MockServer::start().await;
        mount_stripe_sessions(&stripe_server).await;
        mount_razorpay_orders(&razorpay_server).await;

        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            0,
            "test".to_string(),
        );
        // One connection keeps every query on the same in-memory database
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.cors_allow_any_origin = true;
        cfg.stripe.api_base = stripe_server.uri();
        cfg.stripe.secret_key = Some("sk_test_123".to_string());
        cfg.stripe.webhook_secret = Some(STRIPE_WEBHOOK_SECRET.to_string());
        cfg.razorpay.api_base = razorpay_server.uri();
        cfg.razorpay.key_id = Some(RAZORPAY_KEY_ID.to_string());
        cfg.razorpay.key_secret = Some(RAZORPAY_KEY_SECRET.to_string());

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(4096);
        let event_sender = Arc::new(EventSender::new(event_tx));

        let services = AppServices::from_config(db_arc.clone(), &cfg, event_sender.clone())
            .expect("services for tests");

        let state = AppState {
            db: db_arc,
            config: Arc::new(cfg),
            event_sender,
            services,
        };

        Self {
            router: storefront_checkout::build_router(state.clone()),
            state,
            stripe_server,
            razorpay_server,
            events: Mutex::new(event_rx),
        }
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> Uuid {
        self.seed_product_with(name, price, None, stock, true).await
    }

    pub async fn seed_product_with(
        &self,
        name: &str,
        price: Decimal,
        discount_price: Option<Decimal>,
        stock: i32,
        is_active: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            price: Set(price),
            discount_price: Set(discount_price),
            stock: Set(stock),
            is_active: Set(is_active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product for tests");
        id
    }

    pub async fn set_price(&self, product_id: Uuid, price: Decimal) {
        let mut model: product::ActiveModel = Product::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
            .into();
        model.price = Set(price);
        model.updated_at = Set(Utc::now());
        model.update(&*self.state.db).await.expect("update product");
    }

    pub async fn set_active(&self, product_id: Uuid, is_active: bool) {
        let mut model: product::ActiveModel = Product::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
            .into();
        model.is_active = Set(is_active);
        model.update(&*self.state.db).await.expect("update product");
    }

    pub async fn order(&self, order_id: Uuid) -> OrderModel {
        Order::find_by_id(order_id)
            .one(&*self.state.db)
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn order_count(&self) -> usize {
        Order::find()
            .all(&*self.state.db)
            .await
            .expect("list orders")
            .len()
    }

    /// Send a request with an optional customer identity.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        customer: Option<Uuid>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(id) = customer {
            builder = builder.header(CUSTOMER_ID_HEADER, id.to_string());
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Deliver a webhook body exactly as given, with an optional signature header.
    pub async fn deliver_webhook(&self, payload: &[u8], signature: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/stripe/webhook")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(stripe::SIGNATURE_HEADER, sig);
        }

        self.send(
            builder
                .body(Body::from(payload.to_vec()))
                .expect("failed to build request"),
        )
        .await
    }

    /// Deliver a webhook signed with the configured secret.
    pub async fn deliver_signed_webhook(&self, payload: &[u8]) -> Response {
        let header = stripe::signature_header(STRIPE_WEBHOOK_SECRET, payload, Utc::now().timestamp())
            .expect("sign webhook");
        self.deliver_webhook(payload, Some(&header)).await
    }

    /// Drains every event emitted so far.
    pub async fn drain_events(&self) -> Vec<Event> {
        let mut rx = self.events.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reads a decimal that the API serialized as a string.
pub fn decimal(value: &Value) -> Decimal {
    value
        .as_str()
        .expect("decimal serialized as string")
        .parse()
        .expect("valid decimal")
}

/// `checkout.session.completed` event for a paid session.
pub fn session_completed(
    session_id: &str,
    order_id: Option<Uuid>,
    amount_total: i64,
    payment_status: &str,
) -> Vec<u8> {
    let metadata = match order_id {
        Some(id) => json!({ "order_id": id.to_string() }),
        None => json!({}),
    };
    serde_json::to_vec(&json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "object": "event",
        "type": "checkout.session.completed",
        "data": { "object": {
            "id": session_id,
            "object": "checkout.session",
            "metadata": metadata,
            "payment_status": payment_status,
            "payment_intent": format!("pi_{}", Uuid::new_v4().simple()),
            "amount_total": amount_total,
            "currency": "inr"
        }}
    }))
    .expect("serialize event")
}

/// Signature the modal gateway would hand the browser.
pub fn razorpay_signature(gateway_order_id: &str, payment_id: &str) -> String {
    signing::sign_hex(
        RAZORPAY_KEY_SECRET.as_bytes(),
        razorpay::signed_message(gateway_order_id, payment_id).as_bytes(),
    )
    .expect("sign payment")
}

async fn mount_stripe_sessions(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .respond_with(|_: &MockRequest| {
            let id = format!("cs_test_{}", Uuid::new_v4().simple());
            ResponseTemplate::new(200).set_body_json(json!({
                "id": id,
                "object": "checkout.session",
                "url": format!("https://checkout.stripe.test/pay/{}", id),
            }))
        })
        .mount(server)
        .await;
}

async fn mount_razorpay_orders(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .respond_with(|req: &MockRequest| {
            let body: Value = req.body_json().unwrap_or_default();
            ResponseTemplate::new(200).set_body_json(json!({
                "id": format!("order_{}", Uuid::new_v4().simple()),
                "entity": "order",
                "amount": body["amount"],
                "currency": body["currency"],
                "receipt": body["receipt"],
                "status": "created",
            }))
        })
        .mount(server)
        .await;
}

/// Replaces the mock's behavior with a hard failure.
pub async fn fail_gateway(server: &MockServer, route: &str, status: u16) {
    server.reset().await;
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}
