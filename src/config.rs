use crate::models::SubscriptionPlan;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use tracing::info;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_PENDING_TIMEOUT_HOURS: i64 = 12;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 21_600;
const DEFAULT_OUTBOUND_TIMEOUT_SECS: u64 = 15;
const DEFAULT_TOKEN_REFRESH_MARGIN_SECS: i64 = 60;
/// Minimum length the gateway password must have when no shared secret is
/// configured (development fallback).
pub const GATEWAY_PASSWORD_MIN_LEN: usize = 32;

/// A configured price point: an exact amount in minor currency units mapped
/// to the plan and entitlement window it purchases.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PricePoint {
    pub amount: i64,
    pub plan: SubscriptionPlan,
    pub duration_days: i32,
}

fn default_price_points() -> Vec<PricePoint> {
    vec![
        PricePoint {
            amount: 9_900,
            plan: SubscriptionPlan::Premium,
            duration_days: 30,
        },
        PricePoint {
            amount: 24_900,
            plan: SubscriptionPlan::Premium,
            duration_days: 90,
        },
        PricePoint {
            amount: 89_900,
            plan: SubscriptionPlan::Premium,
            duration_days: 365,
        },
    ]
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Price table: amount in minor units -> plan + entitlement window.
    /// An amount outside this table is always rejected.
    #[serde(default = "default_price_points")]
    pub plan_price_points: Vec<PricePoint>,

    /// Shared secret for the Paylane RPC gateway Basic auth password.
    #[serde(default)]
    pub paylane_gateway_secret: Option<String>,

    /// Shared secret for Fastbill callback signatures.
    #[serde(default)]
    pub fastbill_webhook_secret: Option<String>,

    /// Our store identifier at Fastbill; callbacks for other stores are rejected.
    #[serde(default)]
    pub fastbill_store_id: Option<String>,

    /// Window after which a still-pending transaction may be cancelled (hours).
    #[serde(default = "default_pending_timeout_hours")]
    pub pending_timeout_hours: i64,

    /// Interval between batch reconciliation sweeps (seconds); 0 disables.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Identity-provider REST API base URL (account resolution).
    #[serde(default)]
    pub accounts_api_url: Option<String>,

    /// Identity-provider token endpoint.
    #[serde(default)]
    pub accounts_token_url: Option<String>,

    /// Client credentials for the identity-provider token endpoint.
    #[serde(default)]
    pub accounts_client_id: Option<String>,
    #[serde(default)]
    pub accounts_client_secret: Option<String>,

    /// Timeout for outbound provider/identity calls (seconds).
    #[serde(default = "default_outbound_timeout_secs")]
    pub outbound_timeout_secs: u64,

    /// Refresh the cached bearer token this many seconds before it expires.
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: i64,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_pending_timeout_hours() -> i64 {
    DEFAULT_PENDING_TIMEOUT_HOURS
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_outbound_timeout_secs() -> u64 {
    DEFAULT_OUTBOUND_TIMEOUT_SECS
}
fn default_token_refresh_margin_secs() -> i64 {
    DEFAULT_TOKEN_REFRESH_MARGIN_SECS
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
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

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Look up the plan and window a given amount purchases. Amounts outside
    /// the table are a hard error at every call site; there is no default plan.
    pub fn plan_for_amount(&self, amount: i64) -> Option<&PricePoint> {
        self.plan_price_points.iter().find(|p| p.amount == amount)
    }
}

/// Load configuration from config files and `APP__`-prefixed environment
/// variables, environment taking precedence.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let run_env = std::env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let mut builder = Config::builder()
        .set_default("environment", run_env.clone())?
        .set_default("database_url", "sqlite::memory:")?;

    let base_path = Path::new(CONFIG_DIR).join("default");
    let env_path = Path::new(CONFIG_DIR).join(&run_env);
    builder = builder
        .add_source(File::with_name(base_path.to_str().unwrap()).required(false))
        .add_source(File::with_name(env_path.to_str().unwrap()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"));

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config
        .validate()
        .map_err(|e| ConfigError::Message(e.to_string()))?;

    Ok(config)
}

/// Initialize the tracing subscriber. Safe to call once at startup.
pub fn init_tracing(log_level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }

    info!("Tracing initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".into(),
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            plan_price_points: default_price_points(),
            paylane_gateway_secret: None,
            fastbill_webhook_secret: None,
            fastbill_store_id: None,
            pending_timeout_hours: default_pending_timeout_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
            accounts_api_url: None,
            accounts_token_url: None,
            accounts_client_id: None,
            accounts_client_secret: None,
            outbound_timeout_secs: default_outbound_timeout_secs(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
        }
    }

    #[test_case::test_case(9_900, 30 ; "monthly")]
    #[test_case::test_case(24_900, 90 ; "quarterly")]
    #[test_case::test_case(89_900, 365 ; "yearly")]
    fn plan_lookup_matches_configured_amounts(amount: i64, expected_days: i32) {
        let cfg = test_config();
        let point = cfg.plan_for_amount(amount).expect("configured price point");
        assert_eq!(point.plan, SubscriptionPlan::Premium);
        assert_eq!(point.duration_days, expected_days);
    }

    #[test_case::test_case(0 ; "zero")]
    #[test_case::test_case(1 ; "one unit")]
    #[test_case::test_case(9_901 ; "off by one")]
    #[test_case::test_case(-9_900 ; "negative")]
    fn plan_lookup_rejects_unlisted_amounts(amount: i64) {
        // No fuzzy matching, no default plan
        assert!(test_config().plan_for_amount(amount).is_none());
    }

    #[test]
    fn default_timeout_window_is_twelve_hours() {
        assert_eq!(test_config().pending_timeout_hours, 12);
    }
}
