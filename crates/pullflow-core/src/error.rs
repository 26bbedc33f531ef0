use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {path}\nreason: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Template render error: {0}")]
    TemplateRenderError(String),

    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Deploy not found: {0}")]
    DeployNotFound(String),

    #[error("Snapshot version {found} is newer than supported version {supported}")]
    SnapshotVersion { found: u32, supported: u32 },
}

pub type Result<T> = std::result::Result<T, CoreError>;
