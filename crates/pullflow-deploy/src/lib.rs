//! pullflow のデプロイオーケストレーション
//!
//! サービスごとにイメージの用意の仕方を決め、`pullflow-build` でビルドを進め、
//! サービス間のビルド依存を待ち、すべての状態遷移を記録する。

pub mod dependency;
pub mod env;
pub mod error;
pub mod namespace;
pub mod orchestrator;
pub mod pipeline;
pub mod source;
pub mod status;
pub mod strategy;

pub use dependency::{DependencyResolver, DependencyWait, extract_values};
pub use env::{EnvResolver, ResolvedEnv};
pub use error::{DeployError, ErrorKind, Result};
pub use namespace::ensure_namespace;
pub use orchestrator::{
    BuildReport, BuildTarget, DeployOutcome, Orchestrator, build_job_spec, env_config_map,
};
pub use pipeline::{ExternalPipeline, PipelineRequest, PipelineRun, PipelineState};
pub use source::{GithubClient, SourceControl};
pub use status::{StatusTracker, Transition};
pub use strategy::{Strategy, select_strategy};
