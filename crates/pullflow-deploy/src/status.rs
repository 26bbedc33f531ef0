//! ガード付きの状態遷移
//!
//! 書き込みはすべて [`DeployStore::patch_deploy_for_run`] を通すため、
//! 新しい実行に取って代わられた実行はデプロイに触れられない。
//! 受理された遷移はアクティビティに追記する。

use crate::error::{DeployError, Result};
use pullflow_core::{ActivityEntry, CoreError, DeployPatch, DeployStatus, DeployStore};
use std::sync::Arc;

/// 要求された遷移の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// 現在の状態から到達できない。ログに残して破棄
    Rejected,
    /// 新しい実行がデプロイを所有している。黙って破棄
    Superseded,
}

#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn DeployStore>,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn DeployStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DeployStore> {
        &self.store
    }

    /// 新しい実行としてデプロイの所有権を取り、`QUEUED` にリセット
    ///
    /// 新しい実行 ID を返す。実行中の古い実行は書き込み権を失う。
    pub async fn begin_run(&self, deploy_uuid: &str) -> Result<String> {
        let run_uuid = uuid::Uuid::new_v4().to_string();

        let patch = DeployPatch {
            status: Some(DeployStatus::Queued),
            status_message: Some("Queued".to_string()),
            build_output: Some(String::new()),
            build_dispatch_id: Some(String::new()),
            run_uuid: Some(run_uuid.clone()),
            ..Default::default()
        };
        self.store.patch_deploy(deploy_uuid, patch).await?;
        self.store
            .record_activity(ActivityEntry::new(
                deploy_uuid,
                Some(run_uuid.clone()),
                DeployStatus::Queued,
                Some("Queued".to_string()),
            ))
            .await?;

        tracing::debug!(deploy = deploy_uuid, run = %run_uuid, "Run started");
        Ok(run_uuid)
    }

    /// デプロイを `status` に進め、同じ書き込みで `extra` も適用
    pub async fn transition(
        &self,
        deploy_uuid: &str,
        run_uuid: &str,
        status: DeployStatus,
        message: impl Into<String>,
        extra: DeployPatch,
    ) -> Result<Transition> {
        let message = message.into();

        let current = self
            .store
            .find_deploy(deploy_uuid)
            .await?
            .ok_or_else(|| CoreError::DeployNotFound(deploy_uuid.to_string()))?;

        if current.run_uuid.as_deref() != Some(run_uuid) {
            tracing::debug!(deploy = deploy_uuid, run = run_uuid, "Dropping stale transition");
            return Ok(Transition::Superseded);
        }

        if !current.status.can_transition_to(status) {
            tracing::warn!(
                deploy = deploy_uuid,
                from = %current.status,
                to = %status,
                "Rejecting illegal status transition"
            );
            return Ok(Transition::Rejected);
        }

        let patch = DeployPatch {
            status: Some(status),
            status_message: Some(message.clone()),
            ..extra
        };
        if !self
            .store
            .patch_deploy_for_run(deploy_uuid, run_uuid, patch)
            .await?
        {
            tracing::debug!(deploy = deploy_uuid, run = run_uuid, "Dropping stale transition");
            return Ok(Transition::Superseded);
        }

        self.store
            .record_activity(ActivityEntry::new(
                deploy_uuid,
                Some(run_uuid.to_string()),
                status,
                Some(message.clone()),
            ))
            .await?;

        tracing::info!(deploy = deploy_uuid, status = %status, "{}", message);
        Ok(Transition::Applied)
    }

    /// [`StatusTracker::transition`] と同じだが、取って代わられた実行はエラーにして
    /// 呼び出し側の処理を止める
    pub async fn advance(
        &self,
        deploy_uuid: &str,
        run_uuid: &str,
        status: DeployStatus,
        message: impl Into<String>,
        extra: DeployPatch,
    ) -> Result<()> {
        match self
            .transition(deploy_uuid, run_uuid, status, message, extra)
            .await?
        {
            Transition::Superseded => Err(DeployError::Superseded {
                run_uuid: run_uuid.to_string(),
            }),
            Transition::Applied | Transition::Rejected => Ok(()),
        }
    }

    /// 状態以外のフィールド。実行 ID でガードする
    pub async fn patch(&self, deploy_uuid: &str, run_uuid: &str, patch: DeployPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        if self
            .store
            .patch_deploy_for_run(deploy_uuid, run_uuid, patch)
            .await?
        {
            Ok(())
        } else {
            Err(DeployError::Superseded {
                run_uuid: run_uuid.to_string(),
            })
        }
    }

    /// `err` に対応する終端状態で実行を終える
    pub async fn fail(&self, deploy_uuid: &str, run_uuid: &str, err: &DeployError) -> Result<()> {
        if err.is_superseded() {
            return Ok(());
        }

        let extra = DeployPatch {
            build_output: err.logs().map(str::to_string),
            ..Default::default()
        };
        let outcome = self
            .transition(
                deploy_uuid,
                run_uuid,
                err.terminal_status(),
                err.to_string(),
                extra,
            )
            .await?;
        if outcome == Transition::Applied {
            tracing::error!(deploy = deploy_uuid, kind = ?err.kind(), error = %err, "Deploy failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullflow_core::{Deploy, MemoryStore, ServiceDefinition};

    async fn setup() -> (Arc<MemoryStore>, StatusTracker) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_deploy(Deploy::new(ServiceDefinition::new("api"), "abc123", true))
            .await;
        let tracker = StatusTracker::new(store.clone());
        (store, tracker)
    }

    #[tokio::test]
    async fn test_transitions_are_recorded() {
        let (store, tracker) = setup().await;
        let run = tracker.begin_run("api-abc123").await.unwrap();

        let outcome = tracker
            .transition("api-abc123", &run, DeployStatus::Cloning, "cloning", DeployPatch::default())
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Applied);

        let deploy = store.find_deploy("api-abc123").await.unwrap().unwrap();
        assert_eq!(deploy.status, DeployStatus::Cloning);
        assert_eq!(deploy.status_message.as_deref(), Some("cloning"));

        let feed = store.activity("api-abc123").await.unwrap();
        let statuses: Vec<_> = feed.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![DeployStatus::Queued, DeployStatus::Cloning]);
        assert!(feed.iter().all(|e| e.run_uuid.as_deref() == Some(run.as_str())));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_not_persisted() {
        let (store, tracker) = setup().await;
        let run = tracker.begin_run("api-abc123").await.unwrap();
        tracker
            .advance("api-abc123", &run, DeployStatus::Built, "cache hit", DeployPatch::default())
            .await
            .unwrap();

        let outcome = tracker
            .transition("api-abc123", &run, DeployStatus::Building, "again", DeployPatch::default())
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Rejected);

        let deploy = store.find_deploy("api-abc123").await.unwrap().unwrap();
        assert_eq!(deploy.status, DeployStatus::Built);
        assert_eq!(store.activity("api-abc123").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_superseded_run_is_dropped() {
        let (store, tracker) = setup().await;
        let old_run = tracker.begin_run("api-abc123").await.unwrap();
        let new_run = tracker.begin_run("api-abc123").await.unwrap();

        let outcome = tracker
            .transition("api-abc123", &old_run, DeployStatus::Cloning, "old", DeployPatch::default())
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Superseded);

        let err = tracker
            .patch(
                "api-abc123",
                &old_run,
                DeployPatch {
                    sha: Some("deadbeef".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_superseded());

        let deploy = store.find_deploy("api-abc123").await.unwrap().unwrap();
        assert_eq!(deploy.status, DeployStatus::Queued);
        assert_eq!(deploy.run_uuid.as_deref(), Some(new_run.as_str()));
        assert_eq!(deploy.sha, None);
    }

    #[tokio::test]
    async fn test_fail_keeps_build_logs() {
        let (store, tracker) = setup().await;
        let run = tracker.begin_run("api-abc123").await.unwrap();
        let err = DeployError::BuildFailed {
            message: "build job failed".to_string(),
            logs: "--- MAIN CONTAINER ---\nerror: exit 1".to_string(),
        };

        tracker.fail("api-abc123", &run, &err).await.unwrap();

        let deploy = store.find_deploy("api-abc123").await.unwrap().unwrap();
        assert_eq!(deploy.status, DeployStatus::BuildFailed);
        assert_eq!(deploy.status_message.as_deref(), Some("build job failed"));
        assert!(deploy.build_output.unwrap().contains("exit 1"));
    }
}
