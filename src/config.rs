use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "INR";
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 10;

/// Tax and shipping rules applied to cart breakdowns.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    /// Tax rate as a fraction of the subtotal (0.05 = 5%)
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Decimal,

    /// Flat shipping fee charged while the subtotal is at or below the threshold
    #[serde(default = "default_shipping_flat_fee")]
    #[validate(custom = "validate_non_negative")]
    pub shipping_flat_fee: Decimal,

    /// Subtotals strictly above this amount ship for free
    #[serde(default = "default_free_shipping_threshold")]
    #[validate(custom = "validate_non_negative")]
    pub free_shipping_threshold: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tax_rate: default_tax_rate(),
            shipping_flat_fee: default_shipping_flat_fee(),
            free_shipping_threshold: default_free_shipping_threshold(),
        }
    }
}

/// Hosted-checkout (redirect) gateway settings.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StripeConfig {
    #[serde(default = "default_stripe_api_base")]
    pub api_base: String,

    /// Secret API key; the gateway is disabled when absent
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Endpoint secret used to verify `Stripe-Signature` headers
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Maximum age of a signed webhook timestamp
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,

    #[serde(default = "default_success_url")]
    pub success_url: String,

    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            api_base: default_stripe_api_base(),
            secret_key: None,
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            success_url: default_success_url(),
            cancel_url: default_cancel_url(),
        }
    }
}

/// In-page modal gateway settings.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RazorpayConfig {
    #[serde(default = "default_razorpay_api_base")]
    pub api_base: String,

    /// Public key id, also handed to the browser widget
    #[serde(default)]
    pub key_id: Option<String>,

    /// Secret used for API auth and client signature verification
    #[serde(default)]
    pub key_secret: Option<String>,
}

impl Default for RazorpayConfig {
    fn default() -> Self {
        Self {
            api_base: default_razorpay_api_base(),
            key_id: None,
            key_secret: None,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
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

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default)]
    pub cors_allow_any_origin: bool,

    #[serde(default)]
    pub cors_allow_credentials: bool,

    /// DB pool tuning
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

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// ISO 4217 code every order is charged in
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    #[serde(default)]
    #[validate]
    pub pricing: PricingConfig,

    /// Timeout applied to every outbound gateway call
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,

    #[serde(default)]
    #[validate]
    pub stripe: StripeConfig,

    #[serde(default)]
    #[validate]
    pub razorpay: RazorpayConfig,

    /// Downstream endpoint notified when an order is confirmed
    #[serde(default)]
    pub order_notification_url: Option<String>,

    /// HMAC secret for outbound order notifications
    #[serde(default)]
    pub order_notification_secret: Option<String>,

    /// Age after which unpaid draft/placed orders are expired
    #[serde(default = "default_draft_order_ttl_secs")]
    pub draft_order_ttl_secs: u64,

    /// Sweep interval for stale orders, 0 disables the background sweeper
    #[serde(default)]
    pub order_sweep_interval_secs: u64,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            cors_allow_credentials: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            currency: default_currency(),
            pricing: PricingConfig::default(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            stripe: StripeConfig::default(),
            razorpay: RazorpayConfig::default(),
            order_notification_url: None,
            order_notification_secret: None,
            draft_order_ttl_secs: default_draft_order_ttl_secs(),
            order_sweep_interval_secs: 0,
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn draft_order_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.draft_order_ttl_secs).unwrap_or(i64::MAX))
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if self.is_production()
            && self.stripe.secret_key.is_some()
            && is_blank(self.stripe.webhook_secret.as_deref())
        {
            let mut err = ValidationError::new("stripe_webhook_secret_required");
            err.message = Some(
                "APP__STRIPE__WEBHOOK_SECRET is required when the hosted checkout gateway is enabled in production".into(),
            );
            errors.add("stripe", err);
        }

        if self.razorpay.key_id.is_some() && is_blank(self.razorpay.key_secret.as_deref()) {
            let mut err = ValidationError::new("razorpay_key_secret_required");
            err.message =
                Some("APP__RAZORPAY__KEY_SECRET must accompany APP__RAZORPAY__KEY_ID".into());
            errors.add("razorpay", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
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

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_tax_rate() -> Decimal {
    dec!(0.05)
}

fn default_shipping_flat_fee() -> Decimal {
    dec!(50)
}

fn default_free_shipping_threshold() -> Decimal {
    dec!(500)
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_razorpay_api_base() -> String {
    "https://api.razorpay.com".to_string()
}

fn default_success_url() -> String {
    "http://localhost:3000/checkout/success?session_id={CHECKOUT_SESSION_ID}".to_string()
}

fn default_cancel_url() -> String {
    "http://localhost:3000/cart".to_string()
}

fn default_draft_order_ttl_secs() -> u64 {
    24 * 60 * 60
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE {
        let mut err = ValidationError::new("tax_rate");
        err.message = Some("tax_rate must be between 0 and 1".into());
        return Err(err);
    }
    Ok(())
}

fn validate_non_negative(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_negative() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("amount must not be negative".into());
        return Err(err);
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_checkout={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

/// Loads configuration from an explicit directory and profile.
pub fn load_config_from(config_dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&config_dir.join("default").to_string_lossy()).required(false))
        .add_source(File::with_name(&config_dir.join(run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn non_dev_requires_cors_origins() {
        let cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn non_dev_with_origins_passes() {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some("https://shop.example.com".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn production_stripe_requires_webhook_secret() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        cfg.stripe.secret_key = Some("sk_live_abc".into());
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.errors().contains_key("stripe"));

        cfg.stripe.webhook_secret = Some("whsec_abc".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn razorpay_key_id_requires_secret() {
        let mut cfg = base_config();
        cfg.environment = "development".into();
        cfg.razorpay.key_id = Some("rzp_test_1".into());
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn default_pricing_matches_storefront_rules() {
        let cfg = base_config();
        assert_eq!(cfg.pricing.tax_rate, dec!(0.05));
        assert_eq!(cfg.pricing.shipping_flat_fee, dec!(50));
        assert_eq!(cfg.pricing.free_shipping_threshold, dec!(500));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn negative_tax_rate_is_rejected() {
        let mut cfg = base_config();
        cfg.pricing.tax_rate = dec!(-0.01);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_layered_file_config() {
        let dir = TempDir::new().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
            database_url = "sqlite::memory:"
            currency = "USD"

            [pricing]
            tax_rate = "0.08"

            [stripe]
            secret_key = "sk_test_123"
            webhook_secret = "whsec_123"
            "#
        )
        .unwrap();

        let cfg = load_config_from(dir.path(), "development").unwrap();
        assert_eq!(cfg.currency, "USD");
        assert_eq!(cfg.pricing.tax_rate, dec!(0.08));
        assert_eq!(cfg.pricing.shipping_flat_fee, dec!(50));
        assert_eq!(cfg.stripe.webhook_secret.as_deref(), Some("whsec_123"));
        assert_eq!(cfg.stripe.webhook_tolerance_secs, 300);
    }
}
