//! Runtime configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, a TOML
//! file (`$CHATRELAY_CONFIG`, else `./chatrelay.toml` when present), and a
//! handful of environment variables.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:3001"
//! cors_origins = ["https://chat.example.com"]
//!
//! [upstream]
//! idle_timeout_secs = 60
//!
//! [auth]
//! url = "https://chat.example.com"
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::llm::Provider;
use crate::llm::provider::{google, openrouter};
use crate::server::DEFAULT_MAX_REQUEST_BYTES;

pub const CONFIG_PATH_ENV: &str = "CHATRELAY_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "chatrelay.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Empty strings count as unset.
fn secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|s| !s.trim().is_empty())
        .map(SecretString::from))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub google: GoogleConfig,
    pub openrouter: OpenRouterConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub titles: TitleConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub max_request_bytes: usize,
    /// `*` admits bearer-token callers only; cookie sessions need the
    /// browser origin listed explicitly.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".to_owned(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            cors_origins: vec!["*".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Longest silence between two upstream reads; 0 disables the limit.
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GoogleConfig {
    pub base_url: String,
    #[serde(deserialize_with = "secret")]
    pub api_key: Option<SecretString>,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            base_url: google::DEFAULT_BASE_URL.to_owned(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenRouterConfig {
    pub base_url: String,
    pub referer: Option<String>,
    pub title: Option<String>,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: openrouter::DEFAULT_BASE_URL.to_owned(),
            referer: None,
            title: None,
        }
    }
}

/// Without a URL every request gets a local development session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub url: Option<String>,
}

/// Without a URL messages are kept in memory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub url: Option<String>,
    #[serde(deserialize_with = "secret")]
    pub token: Option<SecretString>,
}

/// Model used to name new threads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TitleConfig {
    pub provider: Provider,
    pub model: String,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Google,
            model: "gemma-3-12b-it".to_owned(),
        }
    }
}

impl Config {
    /// Loads the configuration file (if any) and applies the process
    /// environment on top.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|name| env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Overrides values from environment variables. `lookup` is
    /// `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(bind) = get("CHATRELAY_BIND") {
            self.server.bind = bind;
        }
        if let Some(key) = get("GOOGLE_GENERATIVE_AI_API_KEY") {
            self.google.api_key = Some(SecretString::from(key));
        }
        if let Some(url) = get("OPENROUTER_BASE_URL") {
            self.openrouter.base_url = url;
        }
        if let Some(url) = get("CHATRELAY_AUTH_URL") {
            self.auth.url = Some(url);
        }
        if let Some(url) = get("CHATRELAY_STORE_URL") {
            self.store.url = Some(url);
        }
        if let Some(token) = get("CHATRELAY_STORE_TOKEN") {
            self.store.token = Some(SecretString::from(token));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("server.bind must not be empty".into()));
        }
        if self.server.max_request_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_request_bytes must be positive".into(),
            ));
        }
        if self.titles.model.trim().is_empty() {
            return Err(ConfigError::Invalid("titles.model must not be empty".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.upstream.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:3001");
        assert_eq!(config.server.cors_origins, vec!["*".to_owned()]);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.titles.provider, Provider::Google);
        assert_eq!(config.google.base_url, google::DEFAULT_BASE_URL);
        assert!(config.auth.url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind = "0.0.0.0:8080"

            [upstream]
            idle_timeout_secs = 0

            [google]
            api_key = "from-file"

            [store]
            url = "http://web:3000"
            token = ""

            [titles]
            provider = "openrouter"
            model = "openrouter/openai/gpt-4o"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.server.max_request_bytes, DEFAULT_MAX_REQUEST_BYTES);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.google.api_key.as_ref().map(|k| k.expose_secret().to_owned()),
            Some("from-file".into())
        );
        assert_eq!(config.store.url.as_deref(), Some("http://web:3000"));
        assert!(config.store.token.is_none());
        assert_eq!(config.titles.provider, Provider::OpenRouter);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<Config>("[server]\nbnid = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("bnid"));
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CHATRELAY_BIND", "0.0.0.0:9000"),
            ("GOOGLE_GENERATIVE_AI_API_KEY", "from-env"),
            ("CHATRELAY_AUTH_URL", "http://auth:3000"),
            ("CHATRELAY_STORE_TOKEN", "   "),
        ]);
        let mut config = Config::default();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(
            config.google.api_key.as_ref().map(|k| k.expose_secret().to_owned()),
            Some("from-env".into())
        );
        assert_eq!(config.auth.url.as_deref(), Some("http://auth:3000"));
        assert!(config.store.token.is_none());
        assert_eq!(config.openrouter.base_url, openrouter::DEFAULT_BASE_URL);
    }

    #[test]
    fn invalid_values() {
        let mut config = Config::default();
        config.server.max_request_bytes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::from_file(Path::new("/nonexistent/chatrelay.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/chatrelay.toml"));
    }
}
