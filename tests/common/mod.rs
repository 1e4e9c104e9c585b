#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use storefront_api::{
    auth::{AuthConfig, AuthService, ROLE_ADMIN},
    config::AppConfig,
    db,
    entities::{order, payment::PaymentStatus, product},
    events::{self, EventSender},
    handlers::AppServices,
    services::payments::{
        GatewayError, PaymentGateway, PaymentInitiation, PaymentRequest, PaymentStatusReport,
    },
    AppState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const CUSTOMER_EMAIL: &str = "ana@example.com";

/// What the scripted gateway answers to `initiate`.
#[derive(Debug, Clone)]
pub enum InitiateScript {
    Redirect,
    Charge {
        status: PaymentStatus,
        vendor_status: &'static str,
    },
    Fail(u16),
    Hang,
}

/// In-process gateway with canned answers. Records every request it sees.
pub struct ScriptedGateway {
    script: Mutex<InitiateScript>,
    reports: Mutex<HashMap<String, PaymentStatusReport>>,
    requests: Mutex<Vec<PaymentRequest>>,
}

impl ScriptedGateway {
    pub fn new(script: InitiateScript) -> Self {
        Self {
            script: Mutex::new(script),
            reports: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: InitiateScript) {
        *self.script.lock().unwrap() = script;
    }

    /// Registers what `fetch_status` returns for `payment_id`.
    pub fn report(
        &self,
        payment_id: &str,
        order_reference: Option<&str>,
        vendor_status: &str,
        amount: Option<Decimal>,
    ) {
        self.reports.lock().unwrap().insert(
            payment_id.to_string(),
            PaymentStatusReport {
                external_payment_id: payment_id.to_string(),
                order_reference: order_reference.map(str::to_string),
                status: storefront_api::services::payments::normalize_status(vendor_status),
                vendor_status: vendor_status.to_string(),
                amount,
                payment_method: Some("pix".to_string()),
                raw: json!({ "id": payment_id, "status": vendor_status }),
            },
        );
    }

    pub fn requests(&self) -> Vec<PaymentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn initiate(&self, request: &PaymentRequest) -> Result<PaymentInitiation, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self.script.lock().unwrap().clone();
        match script {
            InitiateScript::Redirect => Ok(PaymentInitiation::Redirect {
                preference_id: format!("pref-{}", request.order_number),
                checkout_url: format!("https://pay.example.com/checkout/{}", request.order_number),
            }),
            InitiateScript::Charge {
                status,
                vendor_status,
            } => Ok(PaymentInitiation::Charge(
                storefront_api::services::payments::ChargeResult {
                    transaction_id: format!("TXN_{}", request.order_number),
                    status,
                    vendor_status: vendor_status.to_string(),
                    message: None,
                    payment_url: None,
                    qr_code: None,
                    raw: None,
                },
            )),
            InitiateScript::Fail(status) => Err(GatewayError::Vendor {
                status,
                message: "vendor refused the payment".to_string(),
            }),
            InitiateScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(GatewayError::Transport("unreachable".to_string()))
            }
        }
    }

    async fn fetch_status(
        &self,
        external_payment_id: &str,
    ) -> Result<PaymentStatusReport, GatewayError> {
        self.reports
            .lock()
            .unwrap()
            .get(external_payment_id)
            .cloned()
            .ok_or_else(|| GatewayError::Vendor {
                status: 404,
                message: format!("payment {} not found", external_payment_id),
            })
    }
}

/// Application state backed by a throwaway SQLite file.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<ScriptedGateway>,
    token: String,
    _event_task: tokio::task::JoinHandle<()>,
    _db_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_gateway(InitiateScript::Redirect, |_| {}).await
    }

    pub async fn with_gateway(script: InitiateScript, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let db_dir = tempfile::tempdir().expect("temp dir for test database");
        let db_path = db_dir.path().join("storefront_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            TEST_JWT_SECRET.to_string(),
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment.timeout_secs = 1;
        tweak(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(ScriptedGateway::new(script));
        let auth_service = Arc::new(AuthService::new(AuthConfig::from(&cfg)));
        let services = AppServices::new(
            db_arc.clone(),
            event_sender.clone(),
            gateway.clone(),
            &cfg,
        );

        let token = auth_service
            .issue_token("customer-1", CUSTOMER_EMAIL, Some("Ana Souza"), &[])
            .expect("issue test token");

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
            auth: auth_service,
        };
        let router = storefront_api::build_app(state.clone());

        Self {
            router,
            state,
            gateway,
            token,
            _event_task: event_task,
            _db_dir: db_dir,
        }
    }

    /// Bearer token for `CUSTOMER_EMAIL`.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn token_for(&self, email: &str, roles: &[&str]) -> String {
        self.state
            .auth
            .issue_token("other-user", email, None, roles)
            .expect("issue test token")
    }

    pub fn admin_token(&self) -> String {
        self.token_for("admin@example.com", &[ROLE_ADMIN])
    }

    /// Sends a request with optional JSON body and extra headers.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Same as `request` with a raw body, for webhook deliveries.
    pub async fn post_raw(
        &self,
        uri: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(Body::from(body.to_vec()))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_product(&self, id: i32, name: &str, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            sku: Set(format!("SKU-{}", id)),
            price: Set(price),
            sale_price: Set(None),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product for tests")
    }

    pub async fn stock_of(&self, product_id: i32) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
            .stock
    }

    pub async fn order(&self, order_id: uuid::Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.state.db)
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn add_to_cart(&self, session: &str, product_id: i32, quantity: i32) {
        self.state
            .services
            .cart
            .add_item(session, product_id, quantity)
            .await
            .expect("add item to cart");
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn checkout_body(payment_method: &str) -> Value {
    json!({
        "customer_name": "Ana Souza",
        "customer_email": CUSTOMER_EMAIL,
        "customer_phone": "11987654321",
        "customer_document": "123.456.789-09",
        "shipping_address": "Rua das Flores 123, São Paulo - SP",
        "payment_method": payment_method,
    })
}

pub fn checkout_request(payment_method: &str) -> storefront_api::services::commerce::CheckoutRequest {
    serde_json::from_value(checkout_body(payment_method)).expect("valid checkout request")
}

pub async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

/// Reads a decimal that may be serialized as a string or a number.
pub fn money(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a monetary value: {}", other),
    }
}
