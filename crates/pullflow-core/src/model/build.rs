//! ビルド: プルリクエストの 1 リビジョンのコンテキスト

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// デフォルト環境へのフォールバックを無効にするフィーチャーフラグ
pub const NO_DEFAULT_ENV_FEATURE: &str = "no-default-env";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub uuid: String,
    /// このビルドの全リソースが置かれる名前空間
    pub namespace: String,
    pub sha: Option<String>,
    pub pull_request_number: Option<u64>,
    /// プルリクエストが属する `owner/repo`
    pub repository: Option<String>,
    #[serde(default)]
    pub features: BTreeSet<String>,
    /// 非アクティブなデプロイは共有のデフォルト環境を参照する
    #[serde(default = "default_true")]
    pub use_default_uuid: bool,
    /// サービスをサービスごとの設定ではなく環境全体の YAML で記述する
    #[serde(default)]
    pub full_yaml: bool,
}

fn default_true() -> bool {
    true
}

impl Build {
    pub fn new(uuid: impl Into<String>) -> Self {
        let uuid = uuid.into();
        Self {
            namespace: format!("env-{}", uuid),
            uuid,
            sha: None,
            pull_request_number: None,
            repository: None,
            features: BTreeSet::new(),
            use_default_uuid: true,
            full_yaml: false,
        }
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn no_default_env(&self) -> bool {
        self.has_feature(NO_DEFAULT_ENV_FEATURE)
    }
}
