use pullflow_build::BuildError;
use pullflow_config::ConfigError;
use pullflow_core::{CoreError, DeployStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Service '{0}' has no source repository configured")]
    RepositoryNotFound(String),

    #[error("No commit found for {repository}@{branch}")]
    ShaNotFound { repository: String, branch: String },

    #[error("Source control request failed: {0}")]
    SourceControl(String),

    #[error("Service '{service}' depends on '{dependency}', which is not part of this build")]
    DependencyNotFound { service: String, dependency: String },

    #[error("Timed out after {seconds}s waiting for {dependency} {milestone}")]
    DependencyTimeout {
        dependency: String,
        milestone: &'static str,
        seconds: u64,
    },

    #[error("No external pipeline is configured for pipeline '{0}'")]
    PipelineUnavailable(String),

    #[error("External pipeline error: {0}")]
    Pipeline(String),

    #[error("Namespace {namespace} was not active after {seconds}s")]
    NamespaceTimeout { namespace: String, seconds: u64 },

    #[error("{message}")]
    BuildFailed { message: String, logs: String },

    /// 新しい実行がデプロイを所有している。永続化はしない
    #[error("Run {run_uuid} was superseded")]
    Superseded { run_uuid: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// デプロイの終わり方を決める失敗の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    UpstreamLookup,
    DependencyTimeout,
    BuildFailure,
    Internal,
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Config(_)
            | DeployError::PipelineUnavailable(_)
            | DeployError::DependencyNotFound { .. } => ErrorKind::Configuration,
            DeployError::Core(
                CoreError::InvalidConfig(_) | CoreError::TemplateRenderError(_),
            ) => ErrorKind::Configuration,
            DeployError::Build(
                BuildError::Config(_) | BuildError::InvalidConfig(_) | BuildError::InvalidTag { .. },
            ) => {
                ErrorKind::Configuration
            }
            DeployError::RepositoryNotFound(_)
            | DeployError::ShaNotFound { .. }
            | DeployError::SourceControl(_) => ErrorKind::UpstreamLookup,
            DeployError::DependencyTimeout { .. } => ErrorKind::DependencyTimeout,
            DeployError::BuildFailed { .. } | DeployError::Pipeline(_) => ErrorKind::BuildFailure,
            _ => ErrorKind::Internal,
        }
    }

    /// このエラーで実行が失敗したときのデプロイの終端状態
    pub fn terminal_status(&self) -> DeployStatus {
        match self.kind() {
            ErrorKind::BuildFailure => DeployStatus::BuildFailed,
            _ => DeployStatus::Error,
        }
    }

    /// 状態と一緒に残すビルドログ
    pub fn logs(&self) -> Option<&str> {
        match self {
            DeployError::BuildFailed { logs, .. } if !logs.is_empty() => Some(logs),
            _ => None,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, DeployError::Superseded { .. })
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
