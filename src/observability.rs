//! Logging setup and the service lifecycle events shared by both binaries.

use std::env;
use std::net::SocketAddr;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::model::ModelInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn from_word(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    // Same rules as the service config: blank means unset, and a word that
    // does not parse keeps the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let defaults = Self::default();

        Self {
            level: get("AQI_LOG_LEVEL").unwrap_or(defaults.level),
            format: get("AQI_LOG_FORMAT")
                .and_then(|raw| LogFormat::from_word(&raw))
                .unwrap_or(defaults.format),
            include_target: get("AQI_LOG_TARGET")
                .and_then(|raw| bool_word(&raw))
                .unwrap_or(defaults.include_target),
        }
    }

    pub fn install(&self) -> Result<(), LoggingInitError> {
        let env_filter =
            EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(self.include_target)
            .with_ansi(self.format == LogFormat::Pretty);

        match self.format {
            LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
            LogFormat::Pretty => {
                tracing::subscriber::set_global_default(builder.pretty().finish())?
            }
        }

        Ok(())
    }
}

fn bool_word(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Milestones a binary passes through between process start and serving.
#[derive(Debug, Clone, Copy)]
pub enum Lifecycle<'a> {
    Started {
        binary: &'static str,
        logging: &'a LoggingConfig,
    },
    ModelLoaded {
        path: &'a Path,
        info: &'a ModelInfo,
    },
    FetchEnabled {
        output_dir: &'a Path,
    },
    FetchDisabled {
        reason: &'a str,
    },
    Listening(SocketAddr),
}

impl Lifecycle<'_> {
    pub fn event(&self) -> &'static str {
        match self {
            Self::Started { .. } => "app.start",
            Self::ModelLoaded { .. } => "model.loaded",
            Self::FetchEnabled { .. } | Self::FetchDisabled { .. } => "fetch.capability",
            Self::Listening(_) => "app.bind",
        }
    }

    pub fn record(&self) {
        let event = self.event();
        match *self {
            Self::Started { binary, logging } => info!(
                component = "lifecycle",
                event,
                binary,
                log_level = %logging.level,
                log_format = ?logging.format,
                include_target = logging.include_target
            ),
            Self::ModelLoaded { path, info } => info!(
                component = "lifecycle",
                event,
                path = %path.display(),
                model_type = %info.model_type,
                expected_features = info.expected_features
            ),
            Self::FetchEnabled { output_dir } => info!(
                component = "lifecycle",
                event,
                enabled = true,
                output_dir = %output_dir.display()
            ),
            Self::FetchDisabled { reason } => info!(
                component = "lifecycle",
                event,
                enabled = false,
                reason
            ),
            Self::Listening(addr) => info!(
                component = "lifecycle",
                event,
                bind_addr = %addr
            ),
        }
    }
}
