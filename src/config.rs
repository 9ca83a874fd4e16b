// src/config.rs
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rabbitmq::{RequestOptions, TimeoutBehavior};

const CONFIG_FILE_NAME: &str = "rabbitmq-rpc.json";

// everything but RFC 3986 unreserved characters
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub request: RequestDefaults,
}

/// Settings for one broker session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default = "default_login")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    /// Full AMQP URI; overrides the individual fields when set.
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestDefaults {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub on_timeout: TimeoutBehavior,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_login() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_heartbeat() -> u16 { 30 }
fn default_timeout() -> u64 { 5000 }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            login: default_login(),
            password: default_login(),
            vhost: default_vhost(),
            heartbeat_seconds: default_heartbeat(),
            connection_timeout_ms: default_timeout(),
            uri: None,
        }
    }
}

impl ConnectionConfig {
    /// Reads `RABBITMQ_*` variables, loading a `.env` file first if present.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            host: env::var("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: parse_var("RABBITMQ_PORT")?.unwrap_or(defaults.port),
            login: env::var("RABBITMQ_LOGIN").unwrap_or(defaults.login),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: env::var("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            heartbeat_seconds: parse_var("RABBITMQ_HEARTBEAT_SECONDS")?
                .unwrap_or(defaults.heartbeat_seconds),
            connection_timeout_ms: parse_var("RABBITMQ_CONNECT_TIMEOUT_MS")?
                .unwrap_or(defaults.connection_timeout_ms),
            uri: env::var("RABBITMQ_URI").ok(),
        })
    }

    pub fn amqp_uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }

        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            utf8_percent_encode(&self.login, URI_COMPONENT),
            utf8_percent_encode(&self.password, URI_COMPONENT),
            self.host,
            self.port,
            utf8_percent_encode(&self.vhost, URI_COMPONENT),
            self.heartbeat_seconds
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl RequestDefaults {
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            timeout: self.timeout_ms.map(Duration::from_millis),
            on_timeout: self.on_timeout,
            ..RequestOptions::default()
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("{} has an invalid value: {}", name, value)),
        Err(_) => Ok(None),
    }
}

pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, config/ or the home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<RpcConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(path: &Path) -> Result<RpcConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: RpcConfig = serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    if config.connection.host.is_empty() && config.connection.uri.is_none() {
        return Err(anyhow!("Configuration error: connection.host cannot be empty"));
    }

    Ok(config)
}
