//! サービス定義

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// プルリクエスト環境内の 1 サービスの静的な定義
///
/// YAML 形式:
/// ```yaml
/// name: api
/// repository: acme/api
/// branch: main
/// dockerfile_path: Dockerfile
/// port: 8080
/// env:
///   DATABASE_URL: "postgres://{{{db_internalHostname}}}:5432/app"
/// build_dependencies:
///   - service: db
///     extract:
///       - env_key: DB_HOST
///         pattern: '\bhost=\S+\b'
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub kind: ServiceKind,
    /// ソースリポジトリの `owner/repo`
    pub repository: Option<String>,
    pub branch: Option<String>,
    /// そのまま使うビルド済みイメージ
    pub docker_image: Option<String>,
    pub dockerfile_path: Option<String>,
    /// init イメージ用の Dockerfile (任意)
    pub init_dockerfile_path: Option<String>,
    /// リポジトリルートからのビルドコンテキスト
    pub context_path: Option<String>,
    pub port: Option<u16>,
    /// `ポート -> サブドメインのプレフィックス`
    #[serde(default)]
    pub host_port_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// ネイティブエンジンの上書き（未指定ならクラスタのデフォルト）
    pub builder: Option<BuildEngine>,
    /// 外部 CI パイプライン ID。指定時はビルドをそのパイプラインに委譲する
    pub ci_pipeline: Option<String>,
    /// env テンプレート（値に `{{{service_property}}}` プレースホルダーを含められる）
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub init_env: BTreeMap<String, String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub build_dependencies: Vec<BuildDependency>,
    /// 外部ホストのチャート参照
    pub helm_chart: Option<String>,
    /// データベースサービスでリストアするスナップショット
    pub restore_snapshot: Option<String>,
    /// 長寿命ビルド。完了したジョブを長めに保持する
    #[serde(default)]
    pub static_build: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    Application,
    Helm,
    Database,
    /// フラットな key/value 設定ブロック。トークンのみに寄与する
    Configuration,
}

/// クラスタ内ネイティブのイメージビルダー
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildEngine {
    #[default]
    Kaniko,
    Buildkit,
}

impl BuildEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kaniko => "kaniko",
            Self::Buildkit => "buildkit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "kaniko" => Some(Self::Kaniko),
            "buildkit" | "buildctl" => Some(Self::Buildkit),
            _ => None,
        }
    }
}

impl fmt::Display for BuildEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// デプロイのイメージをどこでビルドするか
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildBackend {
    Native { engine: BuildEngine },
    ExternalCi { pipeline_id: String },
}

impl BuildBackend {
    pub fn name(&self) -> &str {
        match self {
            Self::Native { engine } => engine.as_str(),
            Self::ExternalCi { .. } => "external-ci",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.cpu_request.is_none()
            && self.memory_request.is_none()
            && self.cpu_limit.is_none()
            && self.memory_limit.is_none()
    }

    /// 未設定のフィールドを `fallback` で埋める
    pub fn or(&self, fallback: &ResourceRequirements) -> ResourceRequirements {
        ResourceRequirements {
            cpu_request: self.cpu_request.clone().or(fallback.cpu_request.clone()),
            memory_request: self
                .memory_request
                .clone()
                .or(fallback.memory_request.clone()),
            cpu_limit: self.cpu_limit.clone().or(fallback.cpu_limit.clone()),
            memory_limit: self.memory_limit.clone().or(fallback.memory_limit.clone()),
        }
    }
}

/// ビルド出力がこのサービスの env に流れ込む別サービス
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDependency {
    pub service: String,
    #[serde(default)]
    pub extract: Vec<EnvExtraction>,
}

/// `env_key` には依存先のビルドログで `pattern` に最初にマッチした文字列が入る。
/// 空パターンは順序のみの依存。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvExtraction {
    pub env_key: String,
    #[serde(default)]
    pub pattern: String,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.kind == ServiceKind::Configuration
    }

    pub fn has_dockerfile(&self) -> bool {
        self.dockerfile_path
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
    }

    /// クラスタのデフォルトエンジンを踏まえた、このサービスのビルドバックエンド
    pub fn backend(&self, default_engine: BuildEngine) -> BuildBackend {
        match &self.ci_pipeline {
            Some(pipeline_id) if !pipeline_id.is_empty() => BuildBackend::ExternalCi {
                pipeline_id: pipeline_id.clone(),
            },
            _ => BuildBackend::Native {
                engine: self.builder.unwrap_or(default_engine),
            },
        }
    }

    /// [`ServiceDefinition::repository`] を `(owner, repo)` に分割
    pub fn owner_and_repo(&self) -> Option<(&str, &str)> {
        let repository = self.repository.as_deref()?;
        let (owner, repo) = repository.trim_end_matches(".git").split_once('/')?;
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        Some((owner, repo))
    }

    /// `other` の上書きをマージ
    ///
    /// `Option<T>`: `Some` なら `other` を優先
    /// `Vec<T>`: 空でなければ `other` を優先
    /// マップ: マージし、キーごとに `other` を優先
    pub fn merge(&mut self, other: ServiceDefinition) {
        if other.repository.is_some() {
            self.repository = other.repository;
        }
        if other.branch.is_some() {
            self.branch = other.branch;
        }
        if other.docker_image.is_some() {
            self.docker_image = other.docker_image;
        }
        if other.dockerfile_path.is_some() {
            self.dockerfile_path = other.dockerfile_path;
        }
        if other.init_dockerfile_path.is_some() {
            self.init_dockerfile_path = other.init_dockerfile_path;
        }
        if other.context_path.is_some() {
            self.context_path = other.context_path;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.builder.is_some() {
            self.builder = other.builder;
        }
        if other.ci_pipeline.is_some() {
            self.ci_pipeline = other.ci_pipeline;
        }
        if other.helm_chart.is_some() {
            self.helm_chart = other.helm_chart;
        }
        if other.restore_snapshot.is_some() {
            self.restore_snapshot = other.restore_snapshot;
        }
        self.resources = other.resources.or(&self.resources);

        if !other.build_dependencies.is_empty() {
            self.build_dependencies = other.build_dependencies;
        }

        self.host_port_mapping.extend(other.host_port_mapping);
        self.env.extend(other.env);
        self.init_env.extend(other.init_env);
        self.build_args.extend(other.build_args);
    }
}
