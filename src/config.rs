use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub salesforce: SalesforceConfig,
    #[serde(default)]
    pub woocommerce: WooCommerceConfig,
    #[serde(default)]
    pub avalara: AvalaraConfig,
    #[serde(default)]
    pub quickbase: QuickBaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Re-confirm a connected backend after this many seconds
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Treat a credential as expired this many seconds early
    #[serde(default = "default_refresh_buffer_secs")]
    pub refresh_buffer_secs: u64,
    #[serde(default = "default_reauthorize_timeout_secs")]
    pub reauthorize_timeout_secs: u64,
    /// Open the browser during bring-up when silent refresh fails
    #[serde(default)]
    pub auto_reauthorize: bool,
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// OS keyring, falling back to owner-only files
    #[default]
    Keyring,
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_keyring_service")]
    pub keyring_service: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SalesforceAuthMethod {
    /// Authorization code flow with PKCE in the user's browser
    #[default]
    Browser,
    /// JWT bearer assertion signed with a private key
    Jwt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesforceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_salesforce_login_url")]
    pub login_url: String,
    #[serde(default = "default_salesforce_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub auth_method: SalesforceAuthMethod,
    /// First port tried for the OAuth callback listener
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    /// How many consecutive ports to try
    #[serde(default = "default_callback_port_attempts")]
    pub callback_port_attempts: u16,
    #[serde(default = "default_salesforce_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WooCommerceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub store_url: Option<String>,
    #[serde(default = "default_vendor_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_woo_per_page")]
    pub per_page: usize,
    #[serde(default = "default_woo_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_woo_max_records")]
    pub max_records: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvalaraEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl AvalaraEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            AvalaraEnvironment::Sandbox => "https://sandbox-rest.avatax.com",
            AvalaraEnvironment::Production => "https://rest.avatax.com",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvalaraConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub environment: AvalaraEnvironment,
    /// Overrides the environment's base URL
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_vendor_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl AvalaraConfig {
    pub fn resolved_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.environment.base_url().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickBaseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub realm_hostname: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default = "default_quickbase_api_url")]
    pub api_url: String,
    #[serde(default = "default_salesforce_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_quickbase_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_true() -> bool {
    true
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_refresh_buffer_secs() -> u64 {
    300
}

fn default_reauthorize_timeout_secs() -> u64 {
    120
}

fn default_keep_alive_interval_secs() -> u64 {
    60
}

fn default_keyring_service() -> String {
    "reportpull".to_string()
}

fn default_salesforce_login_url() -> String {
    "https://login.salesforce.com".to_string()
}

fn default_salesforce_api_version() -> String {
    "63.0".to_string()
}

fn default_callback_port() -> u16 {
    8080
}

fn default_callback_port_attempts() -> u16 {
    10
}

fn default_salesforce_timeout_secs() -> u64 {
    90
}

fn default_vendor_timeout_secs() -> u64 {
    60
}

fn default_max_records() -> usize {
    10_000
}

fn default_woo_per_page() -> usize {
    100
}

fn default_woo_max_pages() -> u32 {
    50
}

fn default_woo_max_records() -> usize {
    1_000
}

fn default_quickbase_api_url() -> String {
    "https://api.quickbase.com/v1".to_string()
}

fn default_quickbase_page_size() -> usize {
    1_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            refresh_buffer_secs: default_refresh_buffer_secs(),
            reauthorize_timeout_secs: default_reauthorize_timeout_secs(),
            auto_reauthorize: false,
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
        }
    }
}

impl ConnectionConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.refresh_buffer_secs)
    }

    pub fn reauthorize_timeout(&self) -> Duration {
        Duration::from_secs(self.reauthorize_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs.max(1))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            keyring_service: default_keyring_service(),
        }
    }
}

impl Default for SalesforceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            login_url: default_salesforce_login_url(),
            api_version: default_salesforce_api_version(),
            auth_method: SalesforceAuthMethod::default(),
            callback_port: default_callback_port(),
            callback_port_attempts: default_callback_port_attempts(),
            timeout_secs: default_salesforce_timeout_secs(),
            max_records: default_max_records(),
        }
    }
}

impl SalesforceConfig {
    pub fn callback_ports(&self) -> std::ops::RangeInclusive<u16> {
        let last = self
            .callback_port
            .saturating_add(self.callback_port_attempts.max(1) - 1);
        self.callback_port..=last
    }
}

impl Default for WooCommerceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_url: None,
            timeout_secs: default_vendor_timeout_secs(),
            per_page: default_woo_per_page(),
            max_pages: default_woo_max_pages(),
            max_records: default_woo_max_records(),
        }
    }
}

impl Default for AvalaraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            environment: AvalaraEnvironment::default(),
            base_url: None,
            timeout_secs: default_vendor_timeout_secs(),
            max_records: default_max_records(),
        }
    }
}

impl Default for QuickBaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            realm_hostname: None,
            app_id: None,
            api_url: default_quickbase_api_url(),
            timeout_secs: default_salesforce_timeout_secs(),
            page_size: default_quickbase_page_size(),
            max_records: default_max_records(),
        }
    }
}

impl Config {
    /// Apply non-secret overrides from the environment
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("WOO_STORE_URL") {
            self.woocommerce.store_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Some(env) = get("AVALARA_ENVIRONMENT") {
            self.avalara.environment = if env.eq_ignore_ascii_case("production") {
                AvalaraEnvironment::Production
            } else {
                AvalaraEnvironment::Sandbox
            };
        }
        if let Some(realm) = get("QUICKBASE_REALM_HOSTNAME") {
            self.quickbase.realm_hostname = Some(realm);
        }
        if let Some(app_id) = get("QUICKBASE_APP_ID") {
            self.quickbase.app_id = Some(app_id);
        }
        if let Some(url) = get("SF_LOGIN_URL") {
            self.salesforce.login_url = url.trim_end_matches('/').to_string();
        }
    }
}

/// Secrets come only from the environment, never from the config file
#[derive(Clone, Default)]
pub struct Secrets {
    pub salesforce_consumer_key: Option<String>,
    pub salesforce_consumer_secret: Option<String>,
    pub salesforce_jwt_subject: Option<String>,
    pub salesforce_jwt_key_path: Option<PathBuf>,
    pub salesforce_jwt_key_id: Option<String>,
    pub woo_consumer_key: Option<String>,
    pub woo_consumer_secret: Option<String>,
    pub avalara_account_id: Option<String>,
    pub avalara_license_key: Option<String>,
    pub quickbase_user_token: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            salesforce_consumer_key: get("SF_CONSUMER_KEY").or_else(|| get("SF_CLIENT_ID")),
            salesforce_consumer_secret: get("SF_CONSUMER_SECRET"),
            salesforce_jwt_subject: get("SF_JWT_SUBJECT"),
            salesforce_jwt_key_path: get("SF_JWT_KEY_PATH").map(PathBuf::from),
            salesforce_jwt_key_id: get("SF_JWT_KEY_ID"),
            woo_consumer_key: get("WOO_CONSUMER_KEY"),
            woo_consumer_secret: get("WOO_CONSUMER_SECRET"),
            avalara_account_id: get("AVALARA_ACCOUNT_ID"),
            avalara_license_key: get("AVALARA_LICENSE_KEY"),
            quickbase_user_token: get("QUICKBASE_USER_TOKEN"),
        }
    }

    /// `key:secret` for WooCommerce Basic auth
    pub fn woo_key_pair(&self) -> Option<String> {
        match (&self.woo_consumer_key, &self.woo_consumer_secret) {
            (Some(key), Some(secret)) => Some(format!("{}:{}", key, secret)),
            _ => None,
        }
    }

    /// `account:license` for Avalara Basic auth
    pub fn avalara_key_pair(&self) -> Option<String> {
        match (&self.avalara_account_id, &self.avalara_license_key) {
            (Some(account), Some(license)) => Some(format!("{}:{}", account, license)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |v: &Option<String>| if v.is_some() { "set" } else { "unset" };
        f.debug_struct("Secrets")
            .field("salesforce_consumer_key", &set(&self.salesforce_consumer_key))
            .field("salesforce_jwt_key_path", &self.salesforce_jwt_key_path)
            .field("woo_consumer_key", &set(&self.woo_consumer_key))
            .field("avalara_account_id", &set(&self.avalara_account_id))
            .field("quickbase_user_token", &set(&self.quickbase_user_token))
            .finish()
    }
}

/// Get the config directory path
pub fn get_config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        // Use ~/.config/reportpull on Linux and macOS
        if let Some(home) = dirs::home_dir() {
            return Ok(home.join(".config").join("reportpull"));
        }
    }

    #[cfg(target_os = "windows")]
    {
        // Use AppData on Windows
        if let Some(config) = dirs::config_dir() {
            return Ok(config.join("reportpull"));
        }
    }

    Err(ConfigError::NoConfigDir)
}

/// Get the config file path
pub fn get_config_path() -> Result<PathBuf, ConfigError> {
    Ok(get_config_dir()?.join("config.jsonc"))
}

/// Directory for file-backed credentials
pub fn get_credentials_dir() -> Result<PathBuf, ConfigError> {
    Ok(get_config_dir()?.join("credentials"))
}

/// Load config from the default location, creating it if it doesn't exist
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&get_config_path()?)
}

/// Load config from `config_path`, writing defaults there when missing
pub fn load_config_from(config_path: &Path) -> Result<Config, ConfigError> {
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let default_config = Config::default();
        let json = serde_json::to_string_pretty(&default_config)?;

        let jsonc = format!(
            "// ReportPull configuration\n// Credentials are read from the environment (or a .env file), never from here\n{}",
            json
        );

        std::fs::write(config_path, jsonc)?;
        tracing::info!("Created default config at {:?}", config_path);

        return Ok(default_config);
    }

    // Read and parse config (strip comments first)
    let content = std::fs::read_to_string(config_path)?;
    let json = json_comments::StripComments::new(content.as_bytes());
    let config: Config = serde_json::from_reader(json)?;
    config.validate()?;

    tracing::debug!("Loaded config from {:?}", config_path);
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.woocommerce.per_page == 0 || self.woocommerce.per_page > 100 {
            return Err(ConfigError::Invalid(
                "woocommerce.perPage must be between 1 and 100".to_string(),
            ));
        }
        if self.salesforce.callback_port_attempts == 0 {
            return Err(ConfigError::Invalid(
                "salesforce.callbackPortAttempts must be at least 1".to_string(),
            ));
        }
        if self.quickbase.page_size == 0 {
            return Err(ConfigError::Invalid(
                "quickbase.pageSize must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
