use thiserror::Error;

#[derive(Error, Debug)]
pub enum CIFetchError {
    #[error("API request to {url} failed: {status} - {body}")]
    Api {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Authentication rejected by {url} (HTTP {status})")]
    Auth { url: String, status: u16 },

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid path template {template:?}: {message}")]
    Template { template: String, message: String },

    #[error("Malformed provider payload: {0}")]
    Payload(String),

    #[error("Invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetching failed for: {}", .0.join(", "))]
    ProvidersFailed(Vec<String>),
}

impl CIFetchError {
    pub fn template(template: &str, message: impl Into<String>) -> Self {
        Self::Template {
            template: template.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status attached to the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::Auth { status, .. } => Some(*status),
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_gone(&self) -> bool {
        self.status() == Some(410)
    }

    /// Errors that stop the whole process instead of only the current provider
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::MissingCredential(_) | Self::Config(_) | Self::Template { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CIFetchError>;
