//! トークン辞書
//!
//! ビルドの全 env テンプレートで共有するフラットな `{service}_{property}` -> 値の
//! プール。解決のたびに作り直し、永続化はしない。

use super::{NO_DEFAULT_ENV, escape_hyphens};
use crate::error::{CoreError, Result};
use crate::model::{Build, ClusterDefaults, Deploy};
use crate::store::DeployStore;
use std::collections::BTreeMap;

pub type Tokens = BTreeMap<String, String>;

/// トークンとして公開するデプロイごとのプロパティ
pub const TOKEN_PROPERTIES: &[&str] = &[
    "branchName",
    "ipAddress",
    "publicUrl",
    "UUID",
    "internalHostname",
    "dockerImage",
    "initDockerImage",
    "sha",
    "namespace",
];

/// ハイフンをエスケープした `{service}_{property}`
pub fn token_key(service: &str, property: &str) -> String {
    format!("{}_{}", escape_hyphens(service), property)
}

/// サービス構成に関係なく全ビルドが公開するトークン
pub fn build_extras(build: &Build) -> Tokens {
    let mut extras = Tokens::new();
    extras.insert("buildUUID".to_string(), build.uuid.clone());
    extras.insert("buildSHA".to_string(), build.sha.clone().unwrap_or_default());
    extras.insert(
        "pullRequestNumber".to_string(),
        build
            .pull_request_number
            .map(|n| n.to_string())
            .unwrap_or_default(),
    );
    extras.insert("namespace".to_string(), build.namespace.clone());
    extras
}

/// 1 ビルド分のトークンプールを構築
pub struct TokenBuilder<'a> {
    defaults: &'a ClusterDefaults,
}

impl<'a> TokenBuilder<'a> {
    pub fn new(defaults: &'a ClusterDefaults) -> Self {
        Self { defaults }
    }

    /// `store` からビルドとそのデプロイを読み込みプールを構築
    ///
    /// ビルドが見つからなければエラー（デプロイがないだけならエラーではない）。
    pub async fn for_build(
        &self,
        store: &dyn DeployStore,
        build_uuid: &str,
        extras: &Tokens,
    ) -> Result<Tokens> {
        let build = store
            .find_build(build_uuid)
            .await?
            .ok_or_else(|| CoreError::BuildNotFound(build_uuid.to_string()))?;
        let deploys = store.list_deploys(build_uuid).await?;
        self.build_tokens(store, &build, &deploys, extras).await
    }

    /// サービストークン、設定ブロック、`extras` の順。後のキーが優先
    pub async fn build_tokens(
        &self,
        store: &dyn DeployStore,
        build: &Build,
        deploys: &[Deploy],
        extras: &Tokens,
    ) -> Result<Tokens> {
        let mut tokens = self.service_tokens(build, deploys);

        for deploy in deploys.iter().filter(|d| d.service.is_configuration()) {
            let values = store
                .configuration_values(deploy.name(), deploy.branch_name.as_deref())
                .await?;
            tracing::debug!(
                service = deploy.name(),
                keys = values.len(),
                "Merging configuration block"
            );
            for (key, value) in values {
                tokens.insert(escape_hyphens(&key), value);
            }
        }

        for (key, value) in extras {
            tokens.insert(escape_hyphens(key), value.clone());
        }

        Ok(tokens)
    }

    /// 設定以外の全デプロイのプロパティトークン
    pub fn service_tokens(&self, build: &Build, deploys: &[Deploy]) -> Tokens {
        let mut tokens = Tokens::new();

        for deploy in deploys.iter().filter(|d| !d.service.is_configuration()) {
            let name = deploy.name();
            let values = if deploy.active {
                self.active_values(build, deploy)
            } else {
                self.inactive_values(build, deploy)
            };

            for (property, value) in TOKEN_PROPERTIES.iter().zip(values) {
                tokens.insert(token_key(name, property), value);
            }

            let public_url = tokens
                .get(&token_key(name, "publicUrl"))
                .cloned()
                .unwrap_or_default();
            for (port, prefix) in &deploy.service.host_port_mapping {
                tokens.insert(
                    token_key(&format!("{}-{}", port, name), "publicUrl"),
                    format!("{}-{}", prefix, public_url),
                );
            }
        }

        tokens
    }

    /// [`TOKEN_PROPERTIES`] の順の値
    fn active_values(&self, build: &Build, deploy: &Deploy) -> [String; 9] {
        let name = deploy.name();
        let public_url = deploy.public_url.clone().unwrap_or_else(|| {
            format!(
                "{}-{}.{}",
                name, build.uuid, self.defaults.default_public_url_domain
            )
        });
        let internal_hostname = deploy
            .internal_hostname
            .clone()
            .unwrap_or_else(|| format!("{}-{}", name, build.uuid));

        [
            branch_name(build, deploy),
            deploy.ip_address.clone().unwrap_or_default(),
            public_url,
            build.uuid.clone(),
            internal_hostname,
            deploy.docker_image.clone().unwrap_or_default(),
            deploy.init_docker_image.clone().unwrap_or_default(),
            deploy.sha.clone().unwrap_or_default(),
            build.namespace.clone(),
        ]
    }

    fn inactive_values(&self, build: &Build, deploy: &Deploy) -> [String; 9] {
        let name = deploy.name();
        let no_default_env = build.no_default_env();

        let uuid = if no_default_env {
            NO_DEFAULT_ENV.to_string()
        } else if build.use_default_uuid {
            self.defaults.default_uuid.clone()
        } else {
            String::new()
        };
        let internal_hostname = if no_default_env {
            NO_DEFAULT_ENV.to_string()
        } else {
            self.defaults.default_hostname(name)
        };

        [
            String::new(),
            String::new(),
            self.defaults.default_public_url(name),
            uuid,
            internal_hostname,
            String::new(),
            String::new(),
            String::new(),
            self.defaults.baseline_namespace(),
        ]
    }
}

/// フル YAML のビルドはデプロイ側でブランチを追跡する。それ以外は
/// サービス定義のブランチを優先。
fn branch_name(build: &Build, deploy: &Deploy) -> String {
    let branch = if build.full_yaml {
        deploy.branch_name.clone()
    } else {
        deploy
            .service
            .branch
            .clone()
            .or_else(|| deploy.branch_name.clone())
    };
    branch.unwrap_or_default()
}
