//! ネイティブビルドのバックエンド
//!
//! 各プロファイルはコンテナイメージ、コマンド、引数の規約、キャッシュ参照の
//! 形式を持つ。どちらのキャッシュ参照もソースリポジトリごとに 1 つの
//! キャッシュイメージを指す。

use k8s_openapi::api::core::v1::EnvVar;
use pullflow_config::BuildSettings;
use pullflow_core::BuildEngine;
use std::collections::BTreeMap;

/// ソースをクローンするディレクトリ
pub const WORKSPACE_DIR: &str = "/workspace";

/// 1 回のイメージビルドの入力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInvocation<'a> {
    /// リポジトリルートからの相対パス
    pub context_path: &'a str,
    /// リポジトリルートからの相対パス
    pub dockerfile_path: &'a str,
    pub destination: &'a str,
    pub cache_ref: &'a str,
    pub build_args: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendProfile {
    Kaniko { image: String },
    Buildkit { image: String, endpoint: String },
}

impl BackendProfile {
    pub fn for_engine(engine: BuildEngine, settings: &BuildSettings) -> Self {
        match engine {
            BuildEngine::Kaniko => Self::Kaniko {
                image: settings.kaniko_image.clone(),
            },
            BuildEngine::Buildkit => Self::Buildkit {
                image: settings.buildkit_image.clone(),
                endpoint: settings.buildkit_endpoint.clone(),
            },
        }
    }

    pub fn engine(&self) -> BuildEngine {
        match self {
            Self::Kaniko { .. } => BuildEngine::Kaniko,
            Self::Buildkit { .. } => BuildEngine::Buildkit,
        }
    }

    pub fn name(&self) -> &'static str {
        self.engine().as_str()
    }

    pub fn image(&self) -> &str {
        match self {
            Self::Kaniko { image } | Self::Buildkit { image, .. } => image,
        }
    }

    pub fn command(&self) -> Vec<String> {
        match self {
            Self::Kaniko { .. } => vec!["/kaniko/executor".to_string()],
            Self::Buildkit { .. } => vec!["buildctl".to_string()],
        }
    }

    /// コンテナの env。buildkit は `BUILDKIT_HOST` 経由で共有デーモンと通信する
    pub fn env(&self) -> Vec<EnvVar> {
        match self {
            Self::Kaniko { .. } => Vec::new(),
            Self::Buildkit { endpoint, .. } => vec![EnvVar {
                name: "BUILDKIT_HOST".to_string(),
                value: Some(endpoint.clone()),
                ..Default::default()
            }],
        }
    }

    /// 1 ソースリポジトリ分の共有レイヤーキャッシュ
    ///
    /// - kaniko: `{registry}/{repo}/cache`
    /// - buildkit: `{registry}/{repo}:buildcache`
    pub fn cache_ref(&self, registry: &str, repo: &str) -> String {
        let registry = registry.trim_end_matches('/');
        match self {
            Self::Kaniko { .. } => format!("{}/{}/cache", registry, repo),
            Self::Buildkit { .. } => format!("{}/{}:buildcache", registry, repo),
        }
    }

    pub fn args(&self, invocation: &BuildInvocation<'_>) -> Vec<String> {
        match self {
            Self::Kaniko { .. } => kaniko_args(invocation),
            Self::Buildkit { .. } => buildkit_args(invocation),
        }
    }
}

fn workspace_path(relative: &str) -> String {
    let relative = relative.trim_start_matches("./").trim_matches('/');
    if relative.is_empty() || relative == "." {
        WORKSPACE_DIR.to_string()
    } else {
        format!("{}/{}", WORKSPACE_DIR, relative)
    }
}

fn kaniko_args(invocation: &BuildInvocation<'_>) -> Vec<String> {
    let mut args = vec![
        format!("--context=dir://{}", workspace_path(invocation.context_path)),
        format!("--dockerfile={}", workspace_path(invocation.dockerfile_path)),
        format!("--destination={}", invocation.destination),
        "--cache=true".to_string(),
        format!("--cache-repo={}", invocation.cache_ref),
        "--snapshot-mode=redo".to_string(),
        "--use-new-run".to_string(),
    ];
    for (key, value) in invocation.build_args {
        args.push(format!("--build-arg={}={}", key, value));
    }
    args
}

fn buildkit_args(invocation: &BuildInvocation<'_>) -> Vec<String> {
    let dockerfile = workspace_path(invocation.dockerfile_path);
    let (dockerfile_dir, filename) = match dockerfile.rsplit_once('/') {
        Some((dir, file)) if !dir.is_empty() => (dir.to_string(), file.to_string()),
        _ => (WORKSPACE_DIR.to_string(), dockerfile.clone()),
    };

    let mut args = vec![
        "build".to_string(),
        "--frontend".to_string(),
        "dockerfile.v0".to_string(),
        "--local".to_string(),
        format!("context={}", workspace_path(invocation.context_path)),
        "--local".to_string(),
        format!("dockerfile={}", dockerfile_dir),
        "--opt".to_string(),
        format!("filename={}", filename),
        "--output".to_string(),
        format!("type=image,name={},push=true", invocation.destination),
        "--export-cache".to_string(),
        format!("type=registry,ref={},mode=max", invocation.cache_ref),
        "--import-cache".to_string(),
        format!("type=registry,ref={}", invocation.cache_ref),
    ];
    for (key, value) in invocation.build_args {
        args.push("--opt".to_string());
        args.push(format!("build-arg:{}={}", key, value));
    }
    args
}
