use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Which payment gateway variant the checkout uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    /// Hosted checkout: the customer pays on the vendor's page.
    Preference,
    /// Synchronous charge with tokenized card / PIX / boleto.
    DirectCharge,
}

/// Checkout pricing and policy knobs.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckoutConfig {
    /// ISO currency code passed to the gateway
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Subtotal at or above which shipping is free
    #[serde(default = "default_free_shipping_threshold")]
    #[validate(custom = "validate_non_negative_amount")]
    pub free_shipping_threshold: Decimal,

    /// Flat shipping charged below the threshold
    #[serde(default = "default_flat_shipping_cost")]
    #[validate(custom = "validate_non_negative_amount")]
    pub flat_shipping_cost: Decimal,

    /// Days after creation during which the customer may cancel
    #[serde(default = "default_cancellation_window_days")]
    #[validate(range(min = 0, max = 365))]
    pub cancellation_window_days: i64,

    /// Public URL of the storefront, used for notification and return URLs
    #[serde(default = "default_public_base_url")]
    #[validate(url)]
    pub public_base_url: String,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            free_shipping_threshold: default_free_shipping_threshold(),
            flat_shipping_cost: default_flat_shipping_cost(),
            cancellation_window_days: default_cancellation_window_days(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Credentials for the hosted-checkout gateway.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PreferenceGatewayConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default = "default_preference_base_url")]
    pub base_url: String,
    #[serde(default = "default_true_bool")]
    pub sandbox: bool,
}

/// Credentials for the direct-charge gateway.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DirectChargeConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Overrides the sandbox/production URL derived from `sandbox`
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_true_bool")]
    pub sandbox: bool,
    /// Answer charges locally without calling the vendor (sandbox only)
    #[serde(default)]
    pub simulate: bool,
}

impl DirectChargeConfig {
    pub fn effective_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.sandbox => "https://sandbox.nuvempago.com.br/api/v1".to_string(),
            None => "https://api.nuvempago.com.br/v1".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentConfig {
    #[serde(default = "default_provider")]
    pub provider: PaymentProvider,

    /// Upper bound for any single gateway call
    #[serde(default = "default_payment_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub timeout_secs: u64,

    /// Shared secret for signed webhook deliveries; unsigned deliveries are
    /// accepted when absent
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,

    #[serde(default)]
    pub preference: PreferenceGatewayConfig,

    #[serde(default)]
    pub direct_charge: DirectChargeConfig,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            timeout_secs: default_payment_timeout_secs(),
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            preference: PreferenceGatewayConfig {
                base_url: default_preference_base_url(),
                sandbox: true,
                ..Default::default()
            },
            direct_charge: DirectChargeConfig {
                sandbox: true,
                ..Default::default()
            },
        }
    }
}

impl PaymentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Comma-separated list of allowed CORS origins; permissive when unset
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// HS256 secret for customer tokens
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Token lifetime in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration: u64,

    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,

    #[serde(default = "default_jwt_audience")]
    pub jwt_audience: String,

    /// Capacity of the in-process domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub checkout: CheckoutConfig,

    #[serde(default)]
    #[validate]
    pub payment: PaymentConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials.
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            jwt_secret,
            jwt_expiration: default_jwt_expiration(),
            jwt_issuer: default_jwt_issuer(),
            jwt_audience: default_jwt_audience(),
            event_channel_capacity: default_event_channel_capacity(),
            checkout: CheckoutConfig::default(),
            payment: PaymentConfig::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Simulated charges never leave a sandbox deployment.
    fn validate_additional_constraints(&self) -> Result<(), ValidationError> {
        let direct = &self.payment.direct_charge;
        if direct.simulate && (!direct.sandbox || self.is_production()) {
            let mut err = ValidationError::new("payment.direct_charge.simulate");
            err.message = Some("simulated charges are only allowed in sandbox mode".into());
            return Err(err);
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Configuration constraint violated: {0}")]
    Constraint(ValidationError),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_jwt_expiration() -> u64 {
    3600
}
fn default_jwt_issuer() -> String {
    "storefront-auth".to_string()
}
fn default_jwt_audience() -> String {
    "storefront-api".to_string()
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_true_bool() -> bool {
    true
}
fn default_currency() -> String {
    "BRL".to_string()
}
fn default_free_shipping_threshold() -> Decimal {
    dec!(200.00)
}
fn default_flat_shipping_cost() -> Decimal {
    dec!(15.00)
}
fn default_cancellation_window_days() -> i64 {
    7
}
fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_provider() -> PaymentProvider {
    PaymentProvider::Preference
}
fn default_payment_timeout_secs() -> u64 {
    15
}
fn default_webhook_tolerance_secs() -> u64 {
    300
}
fn default_preference_base_url() -> String {
    "https://api.mercadopago.com".to_string()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("log_level")),
    }
}

fn validate_non_negative_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_negative() {
        let mut err = ValidationError::new("amount");
        err.message = Some("monetary settings must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. `config/default.toml`
/// 3. `config/{RUN_ENV}.toml`
/// 4. Environment variables (`APP__*`, nested keys separated by `__`)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.clone())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET (at least 32 characters).");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;
    app_config
        .validate_additional_constraints()
        .map_err(AppConfigError::Constraint)?;

    info!(
        provider = ?app_config.payment.provider,
        currency = %app_config.checkout.currency,
        "Configuration loaded successfully"
    );
    Ok(app_config)
}
