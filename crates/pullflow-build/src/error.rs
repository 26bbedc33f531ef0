use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("Unexpected registry response from {url}: {status}")]
    RegistryResponse { url: String, status: u16 },

    #[error("Invalid tag: {tag}")]
    InvalidTag { tag: String },

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Job not found: {namespace}/{name}")]
    JobNotFound { namespace: String, name: String },

    #[error("No pod found for job {0}")]
    PodNotFound(String),

    #[error("Timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] pullflow_config::ConfigError),
}

impl BuildError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BuildError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
