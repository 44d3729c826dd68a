//! Configuration: TOML file first, then environment variables on top.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_LANG: &str = "nl";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable base URL (used in OAuth callbacks and connect links).
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// SQLite database file. `~` is expanded.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub apiai: ApiAiConfig,
    #[serde(default)]
    pub facebook: FacebookConfig,
    #[serde(default)]
    pub alterdesk: AlterdeskConfig,
    #[serde(default)]
    pub nokia: OAuth1AppConfig,
    #[serde(default)]
    pub vitadock: OAuth1AppConfig,
    #[serde(default)]
    pub wunderlist: WunderlistConfig,
    #[serde(default)]
    pub salesforce: SalesforceConfig,

    /// Where this config was loaded from; not part of the file.
    #[serde(skip)]
    #[schemars(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind to a non-loopback address.
    #[serde(default)]
    pub allow_public_bind: bool,
    /// Webhook requests per client IP per minute; 0 disables the limit.
    #[serde(default = "default_webhook_rate_limit")]
    pub webhook_rate_limit_per_minute: u32,
    #[serde(default = "default_max_keys")]
    pub rate_limit_max_keys: usize,
    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP`.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    /// How long Messenger message ids and Vitadock nonces are remembered.
    #[serde(default = "default_replay_ttl")]
    pub replay_ttl_secs: u64,
    #[serde(default = "default_max_keys")]
    pub replay_max_ids: usize,
    /// Shared secret the scheduler sends in `X-Scheduler-Secret`.
    #[serde(default)]
    pub scheduler_secret: Option<String>,
    /// Bearer token the dashboard sends to `GET /client/{id}/data`.
    #[serde(default)]
    pub dashboard_token: Option<String>,
    /// Questionnaires idle this long get a reminder on the scheduler tick.
    #[serde(default = "default_stale_hours")]
    pub stale_questionnaire_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApiAiConfig {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_lang")]
    pub lang: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FacebookConfig {
    #[serde(default)]
    pub verify_token: Option<String>,
    #[serde(default)]
    pub page_access_token: Option<String>,
    /// Enables `X-Hub-Signature-256` verification when set.
    #[serde(default)]
    pub app_secret: Option<String>,
    /// Messenger id of the human agent that fallback questions are referred to.
    #[serde(default)]
    pub escalation_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AlterdeskConfig {
    #[serde(default)]
    pub api_token: Option<String>,
}

/// OAuth1 application credentials (Nokia consumer key, Vitadock application token).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct OAuth1AppConfig {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WunderlistConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SalesforceConfig {
    #[serde(default)]
    pub instance_url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_hostname() -> String {
    format!("http://localhost:{DEFAULT_PORT}")
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_webhook_rate_limit() -> u32 {
    120
}
fn default_max_keys() -> usize {
    10_000
}
fn default_replay_ttl() -> u64 {
    300
}
fn default_stale_hours() -> u64 {
    24
}
fn default_lang() -> String {
    DEFAULT_LANG.into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            allow_public_bind: false,
            webhook_rate_limit_per_minute: default_webhook_rate_limit(),
            rate_limit_max_keys: default_max_keys(),
            trust_forwarded_headers: false,
            replay_ttl_secs: default_replay_ttl(),
            replay_max_ids: default_max_keys(),
            scheduler_secret: None,
            dashboard_token: None,
            stale_questionnaire_hours: default_stale_hours(),
        }
    }
}

impl Default for ApiAiConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            lang: default_lang(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            hostname: default_hostname(),
            database_path: None,
            gateway: GatewayConfig::default(),
            apiai: ApiAiConfig::default(),
            facebook: FacebookConfig::default(),
            alterdesk: AlterdeskConfig::default(),
            nokia: OAuth1AppConfig::default(),
            vitadock: OAuth1AppConfig::default(),
            wunderlist: WunderlistConfig::default(),
            salesforce: SalesforceConfig::default(),
            config_path: None,
        }
    }
}

/// `<config dir>/paula/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "paula").map(|dirs| dirs.config_dir().join("config.toml"))
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "paula")
        .map_or_else(|| PathBuf::from("paula.db"), |dirs| dirs.data_dir().join("paula.db"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Environment variables win over the file.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| non_empty(lookup(name));

        if let Some(port) = get("PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(hostname) = get("HOSTNAME") {
            self.hostname = hostname;
        }
        if let Some(path) = get("DATABASE_PATH") {
            self.database_path = Some(path);
        }
        if let Some(secret) = get("SCHEDULER_SECRET") {
            self.gateway.scheduler_secret = Some(secret);
        }
        if let Some(token) = get("DASHBOARD_TOKEN") {
            self.gateway.dashboard_token = Some(token);
        }

        let overrides: [(&str, &mut Option<String>); 14] = [
            ("APIAI_ACCESS_TOKEN", &mut self.apiai.access_token),
            ("FB_VERIFY_TOKEN", &mut self.facebook.verify_token),
            ("FB_PAGE_ACCESS_TOKEN", &mut self.facebook.page_access_token),
            ("FB_APP_SECRET", &mut self.facebook.app_secret),
            ("FB_ESCALATION_AGENT", &mut self.facebook.escalation_agent),
            ("ALTERDESK_API_TOKEN", &mut self.alterdesk.api_token),
            ("NOKIA_CONSUMER_KEY", &mut self.nokia.key),
            ("NOKIA_CONSUMER_SECRET", &mut self.nokia.secret),
            ("VITADOCK_APPLICATION_TOKEN", &mut self.vitadock.key),
            ("VITADOCK_APPLICATION_SECRET", &mut self.vitadock.secret),
            ("WUNDERLIST_CLIENT_ID", &mut self.wunderlist.client_id),
            ("WUNDERLIST_CLIENT_SECRET", &mut self.wunderlist.client_secret),
            ("SALESFORCE_INSTANCE_URL", &mut self.salesforce.instance_url),
            ("SALESFORCE_ACCESS_TOKEN", &mut self.salesforce.access_token),
        ];
        for (name, slot) in overrides {
            if let Some(value) = get(name) {
                *slot = Some(value);
            }
        }
        if let Some(lang) = get("APIAI_LANG") {
            self.apiai.lang = lang;
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
            .unwrap_or_else(default_database_path)
    }

    pub fn public_url(&self) -> String {
        let host = self.hostname.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        }
    }

    /// Log what is missing. The gateway still starts; the affected routes
    /// answer with an error.
    pub fn warn_missing(&self) {
        if self.apiai.access_token.is_none() {
            tracing::warn!("APIAI_ACCESS_TOKEN is not set; messages cannot be understood");
        }
        if self.facebook.verify_token.is_none() || self.facebook.page_access_token.is_none() {
            tracing::warn!("Facebook Messenger is not fully configured");
        }
        if self.facebook.app_secret.is_none() {
            tracing::warn!("FB_APP_SECRET is not set; Messenger webhook signatures are not checked");
        }
        if self.gateway.scheduler_secret.is_none() {
            tracing::warn!("SCHEDULER_SECRET is not set; /webhook/scheduler is disabled");
        }
        if self.gateway.dashboard_token.is_none() {
            tracing::warn!("DASHBOARD_TOKEN is not set; client dashboard data is served without authentication");
        }
    }
}

/// JSON schema of the config file.
pub fn config_schema_json() -> Result<serde_json::Value> {
    serde_json::to_value(schemars::schema_for!(Config)).context("Failed to render config schema")
}
