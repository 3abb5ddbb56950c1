// src/config.rs
use dotenv::dotenv;
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{BusError, Result};
use crate::serialization::SerializerOptions;

const ENV_PREFIX: &str = "RABBIT_BUS_";

/// What happens to operations attempted while the connection is recovering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Wait until the connection is back.
    #[default]
    Block,
    /// Fail with a connection error right away.
    FailFast,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// PEM bundle used to verify the broker certificate.
    #[serde(default)]
    pub ca_certificate_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_hostnames")]
    pub hostnames: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_true")]
    pub automatic_recovery: bool,
    #[serde(default = "default_true")]
    pub topology_recovery: bool,
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default)]
    pub recovery_mode: RecoveryMode,

    #[serde(default = "default_true")]
    pub publisher_confirms: bool,
    #[serde(default = "default_publish_confirm_timeout_ms")]
    pub publish_confirm_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub persistent_delivery_mode: bool,

    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Reported to the broker and stamped on every message context.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub serialization: SerializerOptions,
}

// Default values
fn default_hostnames() -> Vec<String> { vec!["localhost".to_string()] }
fn default_port() -> u16 { 5672 }
fn default_virtual_host() -> String { "/".to_string() }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_true() -> bool { true }
fn default_recovery_interval_ms() -> u64 { 10_000 }
fn default_max_recovery_attempts() -> u32 { 10 }
fn default_publish_confirm_timeout_ms() -> u64 { 1_000 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_prefetch_count() -> u16 { 50 }
fn default_max_channels() -> usize { 64 }
fn default_application_name() -> String { "rabbit_bus".to_string() }

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            hostnames: default_hostnames(),
            port: default_port(),
            virtual_host: default_virtual_host(),
            username: default_username(),
            password: default_password(),
            automatic_recovery: true,
            topology_recovery: true,
            recovery_interval_ms: default_recovery_interval_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
            recovery_mode: RecoveryMode::default(),
            publisher_confirms: true,
            publish_confirm_timeout_ms: default_publish_confirm_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            persistent_delivery_mode: true,
            prefetch_count: default_prefetch_count(),
            max_channels: default_max_channels(),
            application_name: default_application_name(),
            tls: TlsConfig::default(),
            serialization: SerializerOptions::default(),
        }
    }
}

impl BusConfig {
    /// Parse a JSON document, then normalize and validate it.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: BusConfig = serde_json::from_str(content).map_err(|e| {
            BusError::Configuration(format!("configuration contains invalid JSON or fields: {}", e))
        })?;
        config.normalized().validated()
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn publish_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_confirm_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Trim and de-duplicate hostnames, case-insensitively, keeping order.
    pub fn normalized(mut self) -> Self {
        let mut seen: Vec<String> = Vec::with_capacity(self.hostnames.len());
        self.hostnames.retain(|host| {
            let key = host.trim().to_lowercase();
            if key.is_empty() || seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });
        for host in &mut self.hostnames {
            *host = host.trim().to_string();
        }
        self
    }

    pub fn validated(self) -> Result<Self> {
        if self.hostnames.is_empty() {
            return Err(BusError::Configuration("hostnames cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(BusError::Configuration("port cannot be 0".to_string()));
        }
        if self.publish_confirm_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(BusError::Configuration(
                "publish_confirm_timeout_ms and request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_channels == 0 {
            return Err(BusError::Configuration("max_channels must be at least 1".to_string()));
        }
        Ok(self)
    }

    /// Override fields from `RABBIT_BUS_*` variables, loading `.env` first.
    pub fn apply_env(self) -> Result<Self> {
        dotenv().ok();
        self.apply_overrides(|key| env::var(key).ok())
    }

    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(hosts) = var("HOSTNAMES") {
            self.hostnames = hosts.split(',').map(str::to_string).collect();
        }
        if let Some(port) = var("PORT") {
            self.port = parse_var("PORT", &port)?;
        }
        if let Some(vhost) = var("VIRTUAL_HOST") {
            self.virtual_host = vhost;
        }
        if let Some(username) = var("USERNAME") {
            self.username = username;
        }
        if let Some(password) = var("PASSWORD") {
            self.password = password;
        }
        if let Some(value) = var("AUTOMATIC_RECOVERY") {
            self.automatic_recovery = parse_var("AUTOMATIC_RECOVERY", &value)?;
        }
        if let Some(value) = var("TOPOLOGY_RECOVERY") {
            self.topology_recovery = parse_var("TOPOLOGY_RECOVERY", &value)?;
        }
        if let Some(value) = var("RECOVERY_INTERVAL_MS") {
            self.recovery_interval_ms = parse_var("RECOVERY_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("PUBLISH_CONFIRM_TIMEOUT_MS") {
            self.publish_confirm_timeout_ms = parse_var("PUBLISH_CONFIRM_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_var("REQUEST_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("PREFETCH_COUNT") {
            self.prefetch_count = parse_var("PREFETCH_COUNT", &value)?;
        }
        if let Some(name) = var("APPLICATION_NAME") {
            self.application_name = name;
        }
        if let Some(value) = var("TLS_ENABLED") {
            self.tls.enabled = parse_var("TLS_ENABLED", &value)?;
        }

        self.normalized().validated()
    }

    /// Connection URI for one of the configured hosts. Credentials and vhost
    /// are carried as-is; lapin handles the encoding.
    pub fn amqp_uri(&self, host: &str) -> AMQPUri {
        AMQPUri {
            scheme: if self.tls.enabled { AMQPScheme::AMQPS } else { AMQPScheme::AMQP },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: host.to_string(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            ..AMQPUri::default()
        }
    }

    pub fn amqp_uris(&self) -> Vec<AMQPUri> {
        self.hostnames.iter().map(|host| self.amqp_uri(host)).collect()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        BusError::Configuration(format!("invalid value '{}' for {}{}: {}", raw, ENV_PREFIX, name, e))
    })
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    // Check various locations
    let locations = [
        ("Current directory", Path::new("rabbit_bus.json")),
        ("Current directory (alternative)", Path::new("config/rabbit_bus.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rabbit_bus.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(BusError::Configuration(
        "could not find rabbit_bus.json in the current directory, config/ or the home directory".to_string(),
    ))
}

pub fn load_config_from(path: &Path) -> Result<BusConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        BusError::Configuration(format!("failed to read config file at {}: {}", path.display(), e))
    })?;
    BusConfig::from_json_str(&content)
}

/// Locate the config file, parse it and apply environment overrides.
pub fn load_config() -> Result<BusConfig> {
    let path = find_config_file()?;
    info!(path = %path.display(), "Loading bus configuration");
    load_config_from(&path)?.apply_env()
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&BusConfig::default())?;

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                BusError::Configuration(format!("failed to create directory at {}: {}", parent.display(), e))
            })?;
        }
    }

    fs::write(path, json).map_err(|e| {
        BusError::Configuration(format!("failed to write configuration to {}: {}", path.display(), e))
    })?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
