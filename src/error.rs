use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to load template {path}: {reason}")]
    TemplateLoad { path: PathBuf, reason: String },

    #[error("Profile document skipped: {0}")]
    ProfileFile(PathBuf),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DNS resolution error: {0}")]
    Dns(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid target format: {0}")]
    InvalidTarget(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Matcher error: {0}")]
    Matcher(String),

    #[error("Extractor error: {0}")]
    Extractor(String),

    #[error("DSL error: {0}")]
    Dsl(String),

    #[error("Flow error: {0}")]
    Flow(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Headless error: {0}")]
    Headless(String),

    #[error("Browser initialization failed: {0}")]
    BrowserInit(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ScanError {
    /// Errors that escape per-request containment and stop the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::Canceled | ScanError::BrowserInit(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ScanError::Canceled)
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Serialization(format!("JSON error: {}", err))
    }
}

