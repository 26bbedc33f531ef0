//! 設定ファイルのスキーマ
//!
//! ```yaml
//! defaults:
//!   default_uuid: dev-0
//!   default_public_url_domain: preview.example.com
//! build:
//!   registry: registry.example.com/preview
//!   engine: buildkit
//! polling:
//!   job_poll_interval_secs: 5
//! ```
//!
//! 全フィールドにデフォルトがあるため、部分的なファイルでよい。

use crate::error::{ConfigError, Result};
use pullflow_core::{BuildEngine, ClusterDefaults, ResourceRequirements};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub defaults: ClusterDefaults,
    pub build: BuildSettings,
    pub polling: PollSettings,
    pub github: GithubSettings,
    pub stream: StreamSettings,
}

impl Settings {
    /// push する全イメージが置かれるレジストリドメイン
    pub fn registry(&self) -> Result<&str> {
        match self.build.registry.as_deref() {
            Some(registry) if !registry.trim().is_empty() => Ok(registry.trim_end_matches('/')),
            _ => Err(ConfigError::Invalid(
                "build.registry is not configured".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// 例: `registry.example.com/preview`
    pub registry: Option<String>,
    pub engine: BuildEngine,
    pub service_account: String,
    pub job_timeout_secs: u64,
    /// 完了したジョブの保持期間。`None` なら削除されるまで残す
    pub ttl_secs: Option<i32>,
    /// 静的ビルドの完了ジョブの保持期間
    pub static_ttl_secs: i32,
    pub resources: ResourceRequirements,
    /// 共有 buildkitd デーモンのアドレス
    pub buildkit_endpoint: String,
    pub git_image: String,
    pub kaniko_image: String,
    pub buildkit_image: String,
    pub restore_image: String,
    pub git_host: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            registry: None,
            engine: BuildEngine::Kaniko,
            service_account: "pullflow-builder".to_string(),
            job_timeout_secs: 1800,
            ttl_secs: Some(3600),
            static_ttl_secs: 86400,
            resources: ResourceRequirements {
                cpu_request: Some("500m".to_string()),
                memory_request: Some("1Gi".to_string()),
                cpu_limit: Some("2".to_string()),
                memory_limit: Some("4Gi".to_string()),
            },
            buildkit_endpoint: "tcp://buildkitd.pullflow.svc.cluster.local:1234".to_string(),
            git_image: "alpine/git:2.45.2".to_string(),
            kaniko_image: "gcr.io/kaniko-project/executor:v1.23.2".to_string(),
            buildkit_image: "moby/buildkit:v0.16.0".to_string(),
            restore_image: "ghcr.io/pullflow/db-restore:latest".to_string(),
            git_host: "github.com".to_string(),
        }
    }
}

impl BuildSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

/// 全待機ループのポーリング間隔とタイムアウト
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub job_poll_interval_secs: u64,
    pub dependency_poll_interval_secs: u64,
    /// 依存先にビルドディスパッチ ID が付くまでの待機
    pub dependency_dispatch_timeout_secs: u64,
    /// 依存先のビルドログが出るまでの待機
    pub dependency_output_timeout_secs: u64,
    pub namespace_poll_interval_secs: u64,
    pub namespace_timeout_secs: u64,
    pub pipeline_poll_interval_secs: u64,
    pub pipeline_timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            job_poll_interval_secs: 5,
            dependency_poll_interval_secs: 5,
            dependency_dispatch_timeout_secs: 600,
            dependency_output_timeout_secs: 3600,
            namespace_poll_interval_secs: 2,
            namespace_timeout_secs: 120,
            pipeline_poll_interval_secs: 10,
            pipeline_timeout_secs: 3600,
        }
    }
}

impl PollSettings {
    pub fn job_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_interval_secs)
    }

    pub fn dependency_interval(&self) -> Duration {
        Duration::from_secs(self.dependency_poll_interval_secs)
    }

    pub fn dependency_dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_dispatch_timeout_secs)
    }

    pub fn dependency_output_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_output_timeout_secs)
    }

    pub fn namespace_interval(&self) -> Duration {
        Duration::from_secs(self.namespace_poll_interval_secs)
    }

    pub fn namespace_timeout(&self) -> Duration {
        Duration::from_secs(self.namespace_timeout_secs)
    }

    pub fn pipeline_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline_poll_interval_secs)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubSettings {
    pub api_url: String,
    /// API トークンを保持する環境変数
    pub token_env: String,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

impl GithubSettings {
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// ログビューアが接続する WebSocket エンドポイント
    pub endpoint: String,
    pub tail_lines: i64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            endpoint: "/api/logs/stream".to_string(),
            tail_lines: 500,
        }
    }
}
