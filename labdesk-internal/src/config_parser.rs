use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::usage_limit::FreemiumLimiterConfig;

pub const DEFAULT_API_KEY_ENV: &str = "LABDESK_BACKEND_API_KEY";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub limits: FreemiumLimiterConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum BackendConfig {
    /// Process-local data, empty at startup
    #[default]
    Memory,
    Postgrest {
        url: Url,
        #[serde(default = "default_api_key_env")]
        api_key_env: String,
        #[serde(default = "default_backend_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_backend_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationsConfig {
    pub webhook_url: Option<Url>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,
    #[serde(default)]
    pub store: NotificationStoreConfig,
}

fn default_webhook_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum NotificationStoreConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
        #[serde(default = "default_redis_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_key_prefix() -> String {
    "labdesk".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    100
}

impl Config {
    pub async fn load_and_verify_from_path(path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config = Self::load_from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file `{}`: {e}", path.display()),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_str(contents: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if let BackendConfig::Postgrest {
            url, api_key_env, ..
        } = &self.backend
        {
            if url.cannot_be_a_base() || url.host_str().is_none_or(str::is_empty) {
                return Err(config_error(format!(
                    "`backend.url` must be an absolute http(s) URL, got `{url}`"
                )));
            }
            if api_key_env.trim().is_empty() {
                return Err(config_error("`backend.api_key_env` must not be empty"));
            }
        }
        match &self.notifications.store {
            NotificationStoreConfig::File { path } if path.as_os_str().is_empty() => {
                return Err(config_error("`notifications.store.path` must not be empty"));
            }
            NotificationStoreConfig::Redis { url, .. } if url.trim().is_empty() => {
                return Err(config_error("`notifications.store.url` must not be empty"));
            }
            _ => {}
        }
        if self.limits.max_cache_size == 0 {
            return Err(config_error("`limits.max_cache_size` must be positive"));
        }
        Ok(())
    }
}

impl BackendConfig {
    /// Reads the service key from the configured environment variable
    pub fn api_key(&self) -> Result<Option<SecretString>, Error> {
        match self {
            BackendConfig::Memory => Ok(None),
            BackendConfig::Postgrest { api_key_env, .. } => std::env::var(api_key_env)
                .map(|key| Some(SecretString::from(key)))
                .map_err(|_| {
                    config_error(format!(
                        "Environment variable `{api_key_env}` must hold the backend service key"
                    ))
                }),
        }
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::new(ErrorDetails::Config {
        message: message.into(),
    })
}
