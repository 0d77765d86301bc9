use config::{Config, ConfigError, Environment, File};
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
const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_ALI_API_BASE: &str = "https://api-sg.aliexpress.com";
const DEFAULT_ALI_AUTHORIZE_URL: &str = "https://api-sg.aliexpress.com/oauth/authorize";
const DEFAULT_MAIL_API_URL: &str = "https://api.resend.com/emails";
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_WEBHOOK_DEADLINE_SECS: u64 = 25;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_LEASE_TTL_SECS: u64 = 120;
const DEFAULT_STORE_NAME: &str = "Our Store";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Database connection URL (holds the supplier token record)
    #[validate(length(min = 1))]
    pub database_url: String,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    /// Redis URL for the cross-instance fulfillment lease; in-process locking when absent
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Stripe secret API key
    #[validate(custom = "validate_secret")]
    pub stripe_secret_key: String,

    /// Stripe webhook endpoint signing secret
    #[validate(custom = "validate_secret")]
    pub stripe_webhook_secret: String,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub stripe_webhook_tolerance_secs: u64,

    #[serde(default = "default_stripe_api_base")]
    #[validate(url)]
    pub stripe_api_base: String,

    /// AliExpress open platform app key
    #[validate(custom = "validate_secret")]
    pub ali_app_key: String,

    /// AliExpress open platform app secret (signing key)
    #[validate(custom = "validate_secret")]
    pub ali_app_secret: String,

    #[serde(default = "default_ali_api_base")]
    #[validate(url)]
    pub ali_api_base: String,

    #[serde(default = "default_ali_authorize_url")]
    #[validate(url)]
    pub ali_authorize_url: String,

    /// OAuth redirect URI registered with the supplier app
    #[serde(default)]
    pub ali_redirect_uri: Option<String>,

    /// Logistics service requested on every supplier order (supplier default when absent)
    #[serde(default)]
    pub ali_logistics_service: Option<String>,

    /// Shared secret for supplier shipment pushes
    #[serde(default)]
    pub supplier_webhook_secret: Option<String>,

    /// Transactional mail API endpoint
    #[serde(default = "default_mail_api_url")]
    #[validate(url)]
    pub mail_api_url: String,

    /// Transactional mail API key; emails are only logged when absent
    #[serde(default)]
    pub mail_api_key: Option<String>,

    /// Sender address for customer email
    #[validate(length(min = 3))]
    pub mail_from: String,

    /// Store name shown in email subjects and signatures
    #[serde(default = "default_store_name")]
    #[validate(length(min = 1))]
    pub store_name: String,

    /// Static map image URL with an `{address}` placeholder
    #[serde(default)]
    pub mail_map_url_template: Option<String>,

    /// Overall deadline for processing one webhook delivery before acknowledging
    #[serde(default = "default_webhook_deadline_secs")]
    #[validate(range(min = 1, max = 300))]
    pub webhook_deadline_secs: u64,

    /// Timeout applied to every outbound HTTP call
    #[serde(default = "default_http_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub http_timeout_secs: u64,

    /// Expiry of a cross-instance intent lease
    #[serde(default = "default_lease_ttl_secs")]
    #[validate(range(min = 10, max = 3600))]
    pub lease_ttl_secs: u64,

    /// Interval of the optional background token warm-up
    #[serde(default)]
    pub token_warmup_interval_secs: Option<u64>,

    /// Interval of the optional sweep retrying deferred payouts
    #[serde(default)]
    pub payout_retry_interval_secs: Option<u64>,
}

impl AppConfig {
    /// Creates a configuration with defaults for every optional field
    pub fn new(
        database_url: String,
        stripe_secret_key: String,
        stripe_webhook_secret: String,
        ali_app_key: String,
        ali_app_secret: String,
        mail_from: String,
        environment: String,
    ) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            database_url,
            db_max_connections: default_db_max_connections(),
            auto_migrate: true,
            redis_url: None,
            stripe_secret_key,
            stripe_webhook_secret,
            stripe_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            stripe_api_base: default_stripe_api_base(),
            ali_app_key,
            ali_app_secret,
            ali_api_base: default_ali_api_base(),
            ali_authorize_url: default_ali_authorize_url(),
            ali_redirect_uri: None,
            ali_logistics_service: None,
            supplier_webhook_secret: None,
            mail_api_url: default_mail_api_url(),
            mail_api_key: None,
            mail_from,
            store_name: default_store_name(),
            mail_map_url_template: None,
            webhook_deadline_secs: default_webhook_deadline_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            token_warmup_interval_secs: None,
            payout_retry_interval_secs: None,
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn webhook_deadline(&self) -> Duration {
        Duration::from_secs(self.webhook_deadline_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Warm-up interval, when the background refresher is enabled.
    pub fn token_warmup_interval(&self) -> Option<Duration> {
        self.token_warmup_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Sweep interval for deferred payouts, when enabled.
    pub fn payout_retry_interval(&self) -> Option<Duration> {
        self.payout_retry_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.is_production() && self.stripe_secret_key.starts_with("sk_test_") {
            let mut err = ValidationError::new("stripe_secret_key");
            err.message = Some("production must not run with a Stripe test key".into());
            errors.add("stripe_secret_key", err);
        }

        if self.is_production() && self.mail_api_key.is_none() {
            let mut err = ValidationError::new("mail_api_key");
            err.message = Some("production requires a mail API key".into());
            errors.add("mail_api_key", err);
        }

        if let Some(template) = &self.mail_map_url_template {
            if !template.contains("{address}") {
                let mut err = ValidationError::new("mail_map_url_template");
                err.message = Some("template must contain an {address} placeholder".into());
                errors.add("mail_map_url_template", err);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] ConfigError),
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    5
}

fn default_true_bool() -> bool {
    true
}

fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}

fn default_stripe_api_base() -> String {
    DEFAULT_STRIPE_API_BASE.to_string()
}

fn default_ali_api_base() -> String {
    DEFAULT_ALI_API_BASE.to_string()
}

fn default_ali_authorize_url() -> String {
    DEFAULT_ALI_AUTHORIZE_URL.to_string()
}

fn default_mail_api_url() -> String {
    DEFAULT_MAIL_API_URL.to_string()
}

fn default_webhook_deadline_secs() -> u64 {
    DEFAULT_WEBHOOK_DEADLINE_SECS
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_lease_ttl_secs() -> u64 {
    DEFAULT_LEASE_TTL_SECS
}

fn default_store_name() -> String {
    DEFAULT_STORE_NAME.to_string()
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

fn validate_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        let mut err = ValidationError::new("secret");
        err.message = Some("secret must not be empty".into());
        return Err(err);
    }
    const PLACEHOLDERS: [&str; 3] = ["changeme", "your-secret-key", "CHANGE_THIS_SECRET"];
    if PLACEHOLDERS
        .iter()
        .any(|&bad| trimmed.eq_ignore_ascii_case(bad))
    {
        let mut err = ValidationError::new("secret");
        err.message = Some("secret must be overridden with the real credential".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("dropship_api={},tower_http=info", level);
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
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

pub fn load_config_from(config_dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let dir = config_dir.display();
    // Secrets have no defaults: they must come from a config file or APP__* variables.
    let config = Config::builder()
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("database_url", "sqlite://dropship.db?mode=rwc")?
        .add_source(File::with_name(&format!("{}/default", dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", dir, run_env)).required(false))
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
