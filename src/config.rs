//! Configuration management for the bridge
//!
//! Values come from a YAML file (if one is given) and are then overridden by
//! environment variables.

use crate::errors::{BridgeError, Result};
use crate::template::{
    DEFAULT_ACKNOWLEDGEMENT, DEFAULT_INVESTIGATING, DEFAULT_RESOLVING, Templates, TimeZoneSetting,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Upper bound for `settings.max_retries`
pub const MAX_RETRIES: u32 = 10;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub zabbix: ZabbixConfig,

    #[serde(default)]
    pub cachet: CachetConfig,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub templates: TemplatesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZabbixConfig {
    /// Zabbix frontend URL, e.g. https://zabbix.example.com
    #[serde(default)]
    pub server: String,

    #[serde(default)]
    pub user: String,

    #[serde(default, rename = "pass")]
    pub password: String,

    /// API token; when set, `user`/`pass` are not used
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_true", rename = "https-verify")]
    pub https_verify: bool,
}

impl Default for ZabbixConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            user: String::new(),
            password: String::new(),
            token: None,
            https_verify: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachetConfig {
    /// Cachet base URL, without the trailing /api
    #[serde(default)]
    pub server: String,

    #[serde(default)]
    pub token: String,

    #[serde(default = "default_true", rename = "https-verify")]
    pub https_verify: bool,
}

impl Default for CachetConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            token: String::new(),
            https_verify: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name of the Zabbix service used as tree root; empty means the whole tree
    pub root_service: Option<String>,

    pub log_level: String,

    /// Verbosity of the HTTP client stack
    pub log_level_requests: String,

    /// Seconds between service tree syncs
    pub update_comp_interval: u64,

    /// Seconds between problem polls
    pub update_inc_interval: u64,

    /// IANA time zone for rendered times; local time when unset
    pub time_zone: Option<String>,

    pub http_timeout_seconds: u64,

    pub max_retries: u32,

    pub retry_backoff_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_service: None,
            log_level: "INFO".to_string(),
            log_level_requests: "WARN".to_string(),
            update_comp_interval: 3600,
            update_inc_interval: 60,
            time_zone: None,
            http_timeout_seconds: 10,
            max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl Settings {
    pub fn update_comp_interval(&self) -> Duration {
        Duration::from_secs(self.update_comp_interval)
    }

    pub fn update_inc_interval(&self) -> Duration {
        Duration::from_secs(self.update_inc_interval)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn root_service(&self) -> Option<&str> {
        self.root_service
            .as_deref()
            .map(str::trim)
            .filter(|root| !root.is_empty())
    }

    /// `EnvFilter` directive built from the two log levels
    pub fn log_filter(&self) -> String {
        let requests = filter_level(&self.log_level_requests);
        format!(
            "{},reqwest={},hyper={},hyper_util={}",
            filter_level(&self.log_level),
            requests,
            requests,
            requests
        )
    }
}

/// Accepts both tracing level names and the classic DEBUG/INFO/WARNING/CRITICAL spelling
fn filter_level(level: &str) -> &'static str {
    match level.trim().to_lowercase().as_str() {
        "trace" | "notset" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" | "fatal" => "error",
        "off" => "off",
        _ => "info",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    pub acknowledgement: String,
    pub investigating: String,
    pub resolving: String,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            acknowledgement: DEFAULT_ACKNOWLEDGEMENT.to_string(),
            investigating: DEFAULT_INVESTIGATING.to_string(),
            resolving: DEFAULT_RESOLVING.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&raw)?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(server) = env::var("ZABBIX_SERVER") {
            self.zabbix.server = server;
        }

        if let Ok(user) = env::var("ZABBIX_USER") {
            self.zabbix.user = user;
        }

        if let Ok(password) = env::var("ZABBIX_PASS") {
            self.zabbix.password = password;
        }

        if let Ok(token) = env::var("ZABBIX_TOKEN") {
            self.zabbix.token = Some(token);
        }

        if let Ok(verify) = env::var("ZABBIX_HTTPS_VERIFY") {
            self.zabbix.https_verify = verify.to_lowercase() != "false";
        }

        if let Ok(server) = env::var("CACHET_SERVER") {
            self.cachet.server = server;
        }

        if let Ok(token) = env::var("CACHET_TOKEN") {
            self.cachet.token = token;
        }

        if let Ok(verify) = env::var("CACHET_HTTPS_VERIFY") {
            self.cachet.https_verify = verify.to_lowercase() != "false";
        }

        if let Ok(root) = env::var("ROOT_SERVICE") {
            self.settings.root_service = Some(root);
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            self.settings.log_level = level;
        }

        if let Ok(interval) = env::var("UPDATE_INC_INTERVAL") {
            if let Ok(seconds) = interval.parse() {
                self.settings.update_inc_interval = seconds;
            }
        }

        if let Ok(interval) = env::var("UPDATE_COMP_INTERVAL") {
            if let Ok(seconds) = interval.parse() {
                self.settings.update_comp_interval = seconds;
            }
        }

        if let Ok(tz) = env::var("TIME_ZONE") {
            self.settings.time_zone = Some(tz);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.zabbix.server.is_empty() {
            return Err("zabbix.server cannot be empty".to_string());
        }

        let has_token = self.zabbix.token.as_deref().is_some_and(|t| !t.is_empty());
        if !has_token && self.zabbix.user.is_empty() {
            return Err("either zabbix.token or zabbix.user must be set".to_string());
        }

        if self.cachet.server.is_empty() {
            return Err("cachet.server cannot be empty".to_string());
        }

        if self.cachet.token.is_empty() {
            return Err("cachet.token cannot be empty".to_string());
        }

        if self.settings.update_inc_interval == 0 {
            return Err("update_inc_interval must be greater than 0".to_string());
        }

        if self.settings.update_comp_interval == 0 {
            return Err("update_comp_interval must be greater than 0".to_string());
        }

        if self.settings.max_retries > MAX_RETRIES {
            return Err(format!("max_retries cannot exceed {}", MAX_RETRIES));
        }

        Ok(())
    }

    /// Parse and validate the incident templates; any error here is fatal at startup
    pub fn templates(&self) -> Result<Templates> {
        let time_zone = TimeZoneSetting::parse(self.settings.time_zone.as_deref())?;
        Templates::new(&self.templates, time_zone)
    }
}
