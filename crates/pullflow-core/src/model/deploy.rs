//! デプロイ: ビルド内の 1 サービス

use super::{BuildBackend, DeployStatus, ServiceDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deploy {
    /// `{service}-{build_uuid}`
    pub uuid: String,
    pub build_uuid: String,
    pub service: ServiceDefinition,
    /// このプルリクエストからビルドする。非アクティブなデプロイはベースライン環境を再利用
    pub active: bool,
    pub branch_name: Option<String>,
    pub sha: Option<String>,
    pub tag: Option<String>,
    pub init_tag: Option<String>,
    pub docker_image: Option<String>,
    pub init_docker_image: Option<String>,
    pub ip_address: Option<String>,
    pub public_url: Option<String>,
    /// 生のホスト名。上書きがなければ `{service}-{build_uuid}`
    pub internal_hostname: Option<String>,
    /// 解決済みのランタイム env
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub init_env: BTreeMap<String, String>,
    pub backend: Option<BuildBackend>,
    #[serde(default)]
    pub status: DeployStatus,
    pub status_message: Option<String>,
    /// 取得したビルドログ
    pub build_output: Option<String>,
    /// 現在のビルドのジョブ名、または外部パイプラインの実行 ID
    pub build_dispatch_id: Option<String>,
    /// このデプロイを現在所有している実行の相関 ID
    pub run_uuid: Option<String>,
}

impl Deploy {
    pub fn new(service: ServiceDefinition, build_uuid: impl Into<String>, active: bool) -> Self {
        let build_uuid = build_uuid.into();
        let uuid = deploy_uuid(&service.name, &build_uuid);
        Self {
            internal_hostname: Some(uuid.clone()),
            uuid,
            build_uuid,
            branch_name: service.branch.clone(),
            service,
            active,
            sha: None,
            tag: None,
            init_tag: None,
            docker_image: None,
            init_docker_image: None,
            ip_address: None,
            public_url: None,
            env: BTreeMap::new(),
            init_env: BTreeMap::new(),
            backend: None,
            status: DeployStatus::Queued,
            status_message: None,
            build_output: None,
            build_dispatch_id: None,
            run_uuid: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    pub fn has_build_output(&self) -> bool {
        non_empty(&self.build_output)
    }

    pub fn has_dispatch_id(&self) -> bool {
        non_empty(&self.build_dispatch_id)
    }

    /// `patch` の `Some` のフィールドをすべて適用
    pub fn apply(&mut self, patch: DeployPatch) {
        let DeployPatch {
            status,
            status_message,
            branch_name,
            sha,
            tag,
            init_tag,
            docker_image,
            init_docker_image,
            env,
            init_env,
            backend,
            build_output,
            build_dispatch_id,
            run_uuid,
        } = patch;

        if let Some(v) = status {
            self.status = v;
        }
        if let Some(v) = status_message {
            self.status_message = Some(v);
        }
        if let Some(v) = branch_name {
            self.branch_name = Some(v);
        }
        if let Some(v) = sha {
            self.sha = Some(v);
        }
        if let Some(v) = tag {
            self.tag = Some(v);
        }
        if let Some(v) = init_tag {
            self.init_tag = Some(v);
        }
        if let Some(v) = docker_image {
            self.docker_image = Some(v);
        }
        if let Some(v) = init_docker_image {
            self.init_docker_image = Some(v);
        }
        if let Some(v) = env {
            self.env = v;
        }
        if let Some(v) = init_env {
            self.init_env = v;
        }
        if let Some(v) = backend {
            self.backend = Some(v);
        }
        if let Some(v) = build_output {
            self.build_output = Some(v);
        }
        if let Some(v) = build_dispatch_id {
            self.build_dispatch_id = Some(v);
        }
        if let Some(v) = run_uuid {
            self.run_uuid = Some(v);
        }
    }
}

/// `{service}-{build_uuid}`
pub fn deploy_uuid(service: &str, build_uuid: &str) -> String {
    format!("{}-{}", service, build_uuid)
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

/// [`Deploy`] の部分更新
///
/// `None` のフィールドは変更しない。空文字はテキストフィールドをクリアする。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeployPatch {
    pub status: Option<DeployStatus>,
    pub status_message: Option<String>,
    pub branch_name: Option<String>,
    pub sha: Option<String>,
    pub tag: Option<String>,
    pub init_tag: Option<String>,
    pub docker_image: Option<String>,
    pub init_docker_image: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub init_env: Option<BTreeMap<String, String>>,
    pub backend: Option<BuildBackend>,
    pub build_output: Option<String>,
    pub build_dispatch_id: Option<String>,
    pub run_uuid: Option<String>,
}

impl DeployPatch {
    pub fn status(status: DeployStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            status_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_deploy_uuid_and_hostname() {
        let deploy = Deploy::new(ServiceDefinition::new("api"), "abc123", true);
        assert_eq!(deploy.uuid, "api-abc123");
        assert_eq!(deploy.internal_hostname.as_deref(), Some("api-abc123"));
        assert_eq!(deploy.status, DeployStatus::Queued);
    }

    #[test]
    fn test_apply_only_touches_set_fields() {
        let mut deploy = Deploy::new(ServiceDefinition::new("api"), "abc123", true);
        deploy.sha = Some("deadbeef".to_string());

        deploy.apply(DeployPatch {
            tag: Some("deadbee-0123".to_string()),
            ..DeployPatch::status(DeployStatus::Built, "done")
        });

        assert_eq!(deploy.sha.as_deref(), Some("deadbeef"));
        assert_eq!(deploy.tag.as_deref(), Some("deadbee-0123"));
        assert_eq!(deploy.status, DeployStatus::Built);
        assert_eq!(deploy.status_message.as_deref(), Some("done"));
    }

    #[test]
    fn test_empty_string_counts_as_missing_output() {
        let mut deploy = Deploy::new(ServiceDefinition::new("db"), "abc123", true);
        deploy.build_output = Some(String::new());
        assert!(!deploy.has_build_output());
        deploy.build_output = Some("host=10.0.0.5".to_string());
        assert!(deploy.has_build_output());
    }
}
