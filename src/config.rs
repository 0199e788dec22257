use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Platform and gateway percentages for one payment method.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FeeRate {
    pub platform_percent: Decimal,
    #[serde(default)]
    pub gateway_percent: Decimal,
}

impl FeeRate {
    pub fn new(platform_percent: Decimal, gateway_percent: Decimal) -> Self {
        Self {
            platform_percent,
            gateway_percent,
        }
    }
}

/// Fallback rate table used when `payment_mode_charges` has no active row.
/// Cash on delivery is always zero and is not configurable.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FeeRatesConfig {
    pub upi: FeeRate,
    pub card: FeeRate,
    pub netbanking: FeeRate,
    pub wallet: FeeRate,
}

impl Default for FeeRatesConfig {
    fn default() -> Self {
        Self {
            upi: FeeRate::new(dec!(2.00), dec!(0.00)),
            card: FeeRate::new(dec!(2.50), dec!(2.00)),
            netbanking: FeeRate::new(dec!(2.00), dec!(1.90)),
            wallet: FeeRate::new(dec!(2.00), dec!(1.90)),
        }
    }
}

/// Money rules applied at checkout and cancellation.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct SettlementConfig {
    /// Orders with a subtotal strictly above this ship free
    #[serde(default = "default_free_shipping_threshold")]
    #[validate(custom = "validate_non_negative")]
    pub free_shipping_threshold: Decimal,

    #[serde(default = "default_flat_shipping_fee")]
    #[validate(custom = "validate_non_negative")]
    pub flat_shipping_fee: Decimal,

    /// Percentage of the subtotal
    #[serde(default)]
    #[validate(custom = "validate_percent")]
    pub tax_rate_percent: Decimal,

    /// Allowed gap between an admin's final-amount override and the derived amount
    #[serde(default = "default_refund_tolerance")]
    #[validate(custom = "validate_non_negative")]
    pub refund_tolerance: Decimal,

    #[serde(default = "default_order_id_prefix")]
    #[validate(custom = "validate_order_id_prefix")]
    pub order_id_prefix: String,

    #[serde(default)]
    pub fee_rates: FeeRatesConfig,

    #[serde(default = "default_pickup_pincode")]
    pub default_pickup_pincode: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            free_shipping_threshold: default_free_shipping_threshold(),
            flat_shipping_fee: default_flat_shipping_fee(),
            tax_rate_percent: Decimal::ZERO,
            refund_tolerance: default_refund_tolerance(),
            order_id_prefix: default_order_id_prefix(),
            fee_rates: FeeRatesConfig::default(),
            default_pickup_pincode: default_pickup_pincode(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct PaymentGatewayConfig {
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub key_secret: String,
    /// Secret for the `X-Razorpay-Signature` webhook header
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,
    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub timeout_secs: u64,
}

impl Default for PaymentGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            key_id: String::new(),
            key_secret: String::new(),
            webhook_secret: String::new(),
            currency: default_currency(),
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CarrierConfig {
    #[serde(default = "default_carrier_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    /// Lifetime of a cached auth token
    #[serde(default = "default_carrier_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_carrier_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub timeout_secs: u64,
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            base_url: default_carrier_base_url(),
            email: String::new(),
            password: String::new(),
            token_ttl_secs: default_carrier_token_ttl_secs(),
            timeout_secs: default_carrier_timeout_secs(),
            circuit_breaker_failure_threshold: default_circuit_breaker_failures(),
            circuit_breaker_reset_secs: default_circuit_breaker_reset_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    pub database_url: String,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

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

    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Comma-separated admin API tokens
    #[serde(default)]
    pub admin_tokens: String,

    #[serde(default)]
    #[validate]
    pub settlement: SettlementConfig,

    #[serde(default)]
    #[validate]
    pub payment_gateway: PaymentGatewayConfig,

    #[serde(default)]
    #[validate]
    pub carrier: CarrierConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            admin_tokens: String::new(),
            settlement: SettlementConfig::default(),
            payment_gateway: PaymentGatewayConfig::default(),
            carrier: CarrierConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn admin_token_list(&self) -> Vec<String> {
        self.admin_tokens
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.is_production() {
            if self.payment_gateway.key_secret.trim().is_empty() {
                let mut err = ValidationError::new("key_secret_required");
                err.message =
                    Some("Set APP__PAYMENT_GATEWAY__KEY_SECRET outside development".into());
                errors.add("payment_gateway", err);
            }
            if self.payment_gateway.webhook_secret.trim().is_empty() {
                let mut err = ValidationError::new("webhook_secret_required");
                err.message =
                    Some("Set APP__PAYMENT_GATEWAY__WEBHOOK_SECRET outside development".into());
                errors.add("payment_gateway", err);
            }
            if self.admin_token_list().is_empty() {
                let mut err = ValidationError::new("admin_tokens_required");
                err.message = Some("At least one admin token must be configured".into());
                errors.add("admin_tokens", err);
            }
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_pool_bounds");
            err.message = Some("db_min_connections cannot exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
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
fn default_free_shipping_threshold() -> Decimal {
    dec!(500)
}
fn default_flat_shipping_fee() -> Decimal {
    dec!(50.00)
}
fn default_refund_tolerance() -> Decimal {
    dec!(0.10)
}
fn default_order_id_prefix() -> String {
    "KC".to_string()
}
fn default_pickup_pincode() -> String {
    "110001".to_string()
}
fn default_gateway_base_url() -> String {
    "https://api.razorpay.com/v1".to_string()
}
fn default_currency() -> String {
    "INR".to_string()
}
fn default_gateway_timeout_secs() -> u64 {
    30
}
fn default_carrier_base_url() -> String {
    "https://apiv2.shiprocket.in/v1/external".to_string()
}
fn default_carrier_token_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_carrier_timeout_secs() -> u64 {
    30
}
fn default_circuit_breaker_failures() -> u32 {
    5
}
fn default_circuit_breaker_reset_secs() -> u64 {
    60
}

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

fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("Value must not be negative".into());
        return Err(err);
    }
    Ok(())
}

fn validate_percent(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO || *value > dec!(100) {
        let mut err = ValidationError::new("percent");
        err.message = Some("Percentage must be between 0 and 100".into());
        return Err(err);
    }
    Ok(())
}

fn validate_order_id_prefix(prefix: &str) -> Result<(), ValidationError> {
    if prefix.is_empty() || prefix.len() > 4 || !prefix.chars().all(|c| c.is_ascii_uppercase()) {
        let mut err = ValidationError::new("order_id_prefix");
        err.message = Some("Order id prefix must be 1-4 uppercase ASCII letters".into());
        return Err(err);
    }
    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` replaces the default
/// `farmgate_settlement=<level>` directive when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("farmgate_settlement={},tower_http=debug", level);
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

/// Loads the settlement configuration. Later sources win: built-in
/// defaults, `config/default.toml`, `config/{RUN_ENV}.toml`, then `APP__*`
/// environment variables (`APP__SETTLEMENT__REFUND_TOLERANCE=0.05`).
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!(environment = %run_env, "Loading settlement configuration");

    if !Path::new(CONFIG_DIR).exists() {
        info!(dir = CONFIG_DIR, "No config directory, using defaults and APP__ variables");
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://farmgate.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config
        .validate()
        .and_then(|_| app_config.validate_additional_constraints())
        .map_err(|e| {
            error!(errors = ?e, "Settlement configuration rejected");
            AppConfigError::Validation(e)
        })?;

    info!(
        environment = %app_config.environment,
        refund_tolerance = %app_config.settlement.refund_tolerance,
        "Settlement configuration loaded"
    );
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new("sqlite::memory:".into(), "development".into())
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
        assert_eq!(cfg.settlement.free_shipping_threshold, dec!(500));
        assert_eq!(cfg.settlement.flat_shipping_fee, dec!(50));
        assert_eq!(cfg.settlement.fee_rates.upi.platform_percent, dec!(2));
    }

    #[test]
    fn production_requires_secrets_and_admins() {
        let mut cfg = base_config();
        cfg.environment = "production".into();
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.errors().contains_key("payment_gateway"));
        assert!(errors.errors().contains_key("admin_tokens"));

        cfg.payment_gateway.key_secret = "rzp_secret".into();
        cfg.payment_gateway.webhook_secret = "whsec".into();
        cfg.admin_tokens = "token-a, token-b".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn admin_tokens_are_split_and_trimmed() {
        let mut cfg = base_config();
        cfg.admin_tokens = " a ,, b ".into();
        assert_eq!(cfg.admin_token_list(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn rejects_bad_prefix_and_log_level() {
        let mut cfg = base_config();
        cfg.settlement.order_id_prefix = "kc1".into();
        cfg.log_level = "verbose".into();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.errors().contains_key("log_level"));
        assert!(errors.errors().contains_key("settlement"));
    }

    #[test]
    fn rejects_negative_money_settings() {
        let mut cfg = base_config();
        cfg.settlement.flat_shipping_fee = dec!(-1);
        assert!(cfg.validate().is_err());
    }
}
