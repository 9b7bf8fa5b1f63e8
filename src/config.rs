//! Application settings and their loading from TOML.
//!
//! ```toml
//! env = "production"
//! trust_proxy = true
//! body_limit = 1048576
//! request_timeout_ms = 30000
//!
//! [views]
//! dir = "templates"
//! extension = "html"
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable selecting the [`Environment`].
pub const ENV_VAR: &str = "KEEL_ENV";

/// Environment variable naming a TOML file read by [`AppConfig::from_env`].
pub const CONFIG_VAR: &str = "KEEL_CONFIG";

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown environment {0:?} (expected development, production or test)")]
    UnknownEnvironment(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The mode the application runs in.
///
/// Development mode exposes error detail (`stack`) in error responses;
/// production turns view caching on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }

    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            _ => Err(ConfigError::UnknownEnvironment(s.to_owned())),
        }
    }
}

/// Where views live and how they are loaded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Root directory view names are resolved against.
    pub dir: String,
    /// Extension appended to view names given without one.
    pub extension: String,
    /// Cache template text. Unset means "on in production".
    pub cache: Option<bool>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            dir: "views".to_owned(),
            extension: "html".to_owned(),
            cache: None,
        }
    }
}

/// Application settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub env: Environment,
    /// Believe `X-Forwarded-*` headers.
    pub trust_proxy: bool,
    /// Largest accepted request body, in bytes.
    pub body_limit: usize,
    /// Largest request (head and body) buffered per connection, in bytes.
    pub max_request_size: usize,
    /// Per-request deadline; `None` disables it.
    pub request_timeout_ms: Option<u64>,
    pub views: ViewConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            env: Environment::Development,
            trust_proxy: false,
            body_limit: 1024 * 1024,
            max_request_size: 8 * 1024 * 1024,
            request_timeout_ms: None,
            views: ViewConfig::default(),
        }
    }
}

impl AppConfig {
    /// Parses and validates a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, [`ConfigError::Invalid`]
    /// when the values are inconsistent.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// See [`from_toml_str`](Self::from_toml_str); also [`ConfigError::Io`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Loads the file named by `KEEL_CONFIG` (defaults otherwise), then
    /// applies `KEEL_ENV` on top.
    ///
    /// # Errors
    ///
    /// Any error from [`from_file`](Self::from_file), or
    /// [`ConfigError::UnknownEnvironment`] for an unrecognized `KEEL_ENV`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_VAR) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        if let Ok(env) = std::env::var(ENV_VAR) {
            config.env = env.parse()?;
        }
        Ok(config)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Checks that the values are usable together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_request_size == 0 {
            return Err(ConfigError::Invalid("max_request_size must be positive".into()));
        }
        if self.body_limit > self.max_request_size {
            return Err(ConfigError::Invalid(format!(
                "body_limit ({}) exceeds max_request_size ({})",
                self.body_limit, self.max_request_size
            )));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be positive; omit it to disable".into(),
            ));
        }
        if self.views.dir.is_empty() {
            return Err(ConfigError::Invalid("views.dir must not be empty".into()));
        }
        Ok(())
    }
}
