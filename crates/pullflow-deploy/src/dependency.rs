//! サービス間のビルド依存
//!
//! サービスは env の値を別サービスのビルドログから取ると宣言できる。
//! 待つ側のデプロイは、依存先がビルドをディスパッチして出力を出すまで
//! ブロックし、その後正規表現で値を抽出する。

use crate::error::{DeployError, Result};
use crate::status::StatusTracker;
use futures_util::future::try_join_all;
use pullflow_core::{BuildDependency, CoreError, Deploy, DeployPatch, DeployStatus, DeployStore};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 依存待ちのポーリング間隔と上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyWait {
    pub interval: Duration,
    /// 依存先にビルドディスパッチ ID が付くまで
    pub dispatch_timeout: Duration,
    /// 依存先にビルド出力が出るまで
    pub output_timeout: Duration,
}

impl DependencyWait {
    pub fn from_settings(polling: &pullflow_config::PollSettings) -> Self {
        Self {
            interval: polling.dependency_interval(),
            dispatch_timeout: polling.dependency_dispatch_timeout(),
            output_timeout: polling.dependency_output_timeout(),
        }
    }
}

pub struct DependencyResolver {
    store: Arc<dyn DeployStore>,
    tracker: StatusTracker,
    wait: DependencyWait,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn DeployStore>, tracker: StatusTracker, wait: DependencyWait) -> Self {
        Self {
            store,
            tracker,
            wait,
        }
    }

    /// 宣言された全依存を待ち、抽出した値を `env` にマージ
    ///
    /// 抽出した値はレンダリング済みの値より優先。マージ後の env は永続化する。
    #[tracing::instrument(skip(self, deploy, env), fields(deploy = %deploy.uuid))]
    pub async fn wait_and_resolve(
        &self,
        deploy: &Deploy,
        run_uuid: &str,
        env: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let dependencies = &deploy.service.build_dependencies;
        if dependencies.is_empty() {
            return Ok(());
        }

        let waits = dependencies
            .iter()
            .map(|dependency| self.resolve_one(deploy, run_uuid, dependency));
        let extracted = try_join_all(waits).await?;

        for values in extracted {
            env.extend(values);
        }

        self.tracker
            .patch(
                &deploy.uuid,
                run_uuid,
                DeployPatch {
                    env: Some(env.clone()),
                    ..Default::default()
                },
            )
            .await
    }

    async fn resolve_one(
        &self,
        deploy: &Deploy,
        run_uuid: &str,
        dependency: &BuildDependency,
    ) -> Result<BTreeMap<String, String>> {
        let sibling = self
            .store
            .find_deploy_by_service(&deploy.build_uuid, &dependency.service)
            .await?
            .ok_or_else(|| DeployError::DependencyNotFound {
                service: deploy.name().to_string(),
                dependency: dependency.service.clone(),
            })?;

        self.tracker
            .advance(
                &deploy.uuid,
                run_uuid,
                DeployStatus::Waiting,
                format!("Waiting for {} build output", dependency.service),
                DeployPatch::default(),
            )
            .await?;

        self.poll_until(
            &sibling.uuid,
            &dependency.service,
            "build dispatch",
            self.wait.dispatch_timeout,
            Deploy::has_dispatch_id,
        )
        .await?;

        let needs_output = dependency.extract.iter().any(|e| !e.pattern.is_empty());
        let output = if needs_output {
            self.poll_until(
                &sibling.uuid,
                &dependency.service,
                "build output",
                self.wait.output_timeout,
                Deploy::has_build_output,
            )
            .await?
            .build_output
            .unwrap_or_default()
        } else {
            String::new()
        };

        Ok(extract_values(&dependency.service, &dependency.extract, &output))
    }

    async fn poll_until(
        &self,
        sibling_uuid: &str,
        dependency: &str,
        milestone: &'static str,
        timeout: Duration,
        reached: fn(&Deploy) -> bool,
    ) -> Result<Deploy> {
        let deadline = Instant::now() + timeout;

        loop {
            let sibling = self
                .store
                .find_deploy(sibling_uuid)
                .await?
                .ok_or_else(|| CoreError::DeployNotFound(sibling_uuid.to_string()))?;
            if reached(&sibling) {
                tracing::debug!(dependency, milestone, "Dependency milestone reached");
                return Ok(sibling);
            }

            if Instant::now() >= deadline {
                return Err(DeployError::DependencyTimeout {
                    dependency: dependency.to_string(),
                    milestone,
                    seconds: timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.wait.interval).await;
        }
    }
}

/// 各抽出を `output` に適用
///
/// 空パターンは空文字。それ以外は最初にマッチした文字列全体。
/// マッチしない場合や不正なパターンではキーを設定しない。
pub fn extract_values(
    dependency: &str,
    extractions: &[pullflow_core::EnvExtraction],
    output: &str,
) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();

    for extraction in extractions {
        if extraction.pattern.is_empty() {
            values.insert(extraction.env_key.clone(), String::new());
            continue;
        }

        let regex = match Regex::new(&extraction.pattern) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!(
                    dependency,
                    key = %extraction.env_key,
                    error = %e,
                    "Invalid extraction pattern"
                );
                continue;
            }
        };

        match regex.find(output).map(|m| m.as_str().to_string()) {
            Some(value) => {
                values.insert(extraction.env_key.clone(), value);
            }
            None => tracing::warn!(
                dependency,
                key = %extraction.env_key,
                pattern = %extraction.pattern,
                "No match in dependency build output"
            ),
        }
    }

    values
}
