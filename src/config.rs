use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Per-provider credentials and endpoints. Base URLs are configurable so
/// tests can point the gateways at a local stub server.
#[derive(Clone, Debug, Deserialize)]
pub struct CardProviderConfig {
    pub base_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WalletProviderConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BnplProviderConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub webhook_secret: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PaymentsConfig {
    pub card: CardProviderConfig,
    pub wallet: WalletProviderConfig,
    pub bnpl: BnplProviderConfig,
    /// Maximum webhook timestamp skew accepted during signature checks.
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_secs: u64,
    /// Timeout for outbound provider calls.
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ShippingConfig {
    /// Flat shipping fee applied below the free-shipping threshold.
    pub flat_fee: Decimal,
    /// Subtotal at or above which shipping is free.
    pub free_threshold: Decimal,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub environment: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    /// Create missing tables on startup (dev/test convenience).
    #[serde(default)]
    pub auto_migrate: bool,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    pub shipping: ShippingConfig,
    pub payments: PaymentsConfig,
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment == "development" || self.environment == "test"
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_webhook_tolerance() -> u64 {
    300
}

fn default_provider_timeout() -> u64 {
    10
}

fn default_db_max_connections() -> u32 {
    10
}

/// Loads layered configuration: built-in defaults, `config/default.toml`,
/// `config/{environment}.toml`, then `APP__*` environment overrides
/// (`APP__PAYMENTS__CARD__SECRET_KEY=...`).
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let builder = Config::builder()
        .set_default("database_url", "sqlite://nutriorder.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", environment.clone())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("auto_migrate", true)?
        .set_default("shipping.flat_fee", "9.90")?
        .set_default("shipping.free_threshold", "1500")?
        .set_default("payments.card.base_url", "https://api.cardprocessor.example")?
        .set_default("payments.card.secret_key", "sk_test_placeholder")?
        .set_default("payments.card.webhook_secret", "whsec_card_placeholder")?
        .set_default("payments.wallet.base_url", "https://api.wallet.example")?
        .set_default("payments.wallet.client_id", "wallet_client_placeholder")?
        .set_default("payments.wallet.client_secret", "wallet_secret_placeholder")?
        .set_default("payments.wallet.webhook_secret", "whsec_wallet_placeholder")?
        .set_default("payments.bnpl.base_url", "https://api.bnpl.example")?
        .set_default("payments.bnpl.username", "bnpl_user_placeholder")?
        .set_default("payments.bnpl.password", "bnpl_password_placeholder")?
        .set_default("payments.bnpl.webhook_secret", "whsec_bnpl_placeholder")?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, environment)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"));

    let config = builder.build()?;
    config.try_deserialize()
}

/// Initializes the global tracing subscriber. Honors `RUST_LOG` when set,
/// falling back to the configured level.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nutriorder_api={0},tower_http={0}", log_level)));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(log_level, json, "tracing initialized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_produce_a_complete_config() {
        let cfg = load_config().expect("default config should load");
        assert_eq!(cfg.shipping.flat_fee, dec!(9.90));
        assert_eq!(cfg.shipping.free_threshold, dec!(1500));
        assert_eq!(cfg.payments.webhook_tolerance_secs, 300);
        assert!(!cfg.payments.card.base_url.is_empty());
    }
}
