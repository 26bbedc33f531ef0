//! クラスタ全体のデフォルト
//!
//! 実行ごとにテンプレートエンジンとトークンビルダーへ明示的に渡す。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterDefaults {
    /// 共有ベースライン環境の UUID
    pub default_uuid: String,
    /// 公開 URL の生成に使うドメイン（例: `preview.example.com`）
    pub default_public_url_domain: String,
    /// ベースラインの名前空間。未設定なら `env-{default_uuid}`
    pub baseline_namespace: Option<String>,
    pub cluster_domain: String,
}

impl Default for ClusterDefaults {
    fn default() -> Self {
        Self {
            default_uuid: "dev-0".to_string(),
            default_public_url_domain: "preview.local".to_string(),
            baseline_namespace: None,
            cluster_domain: "svc.cluster.local".to_string(),
        }
    }
}

impl ClusterDefaults {
    pub fn baseline_namespace(&self) -> String {
        self.baseline_namespace
            .clone()
            .unwrap_or_else(|| format!("env-{}", self.default_uuid))
    }

    /// `{service}-{default_uuid}`
    pub fn default_hostname(&self, service: &str) -> String {
        format!("{}-{}", service, self.default_uuid)
    }

    /// `{service}-{default_uuid}.{domain}`
    pub fn default_public_url(&self, service: &str) -> String {
        format!(
            "{}.{}",
            self.default_hostname(service),
            self.default_public_url_domain
        )
    }
}
