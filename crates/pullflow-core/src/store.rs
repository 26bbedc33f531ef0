//! エンティティストア
//!
//! ビルド、デプロイ、アクティビティは [`DeployStore`] の背後に置く。
//! [`MemoryStore`] はすべてメモリに保持し、JSON スナップショットとして永続化できる
//! （`.pullflow/state.json`、前回分は `state.json.backup` として残す）。

use crate::error::{CoreError, Result};
use crate::model::{ActivityEntry, Build, Deploy, DeployPatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

const SNAPSHOT_VERSION: u32 = 1;
const STATE_DIR: &str = ".pullflow";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
/// デプロイごとにこれを超えた古いエントリは捨てる
pub const MAX_ACTIVITY_PER_DEPLOY: usize = 100;

/// ビルドとデプロイの読み取り・パッチ
///
/// 各メソッドは 1 つのアトミックな操作。同じデプロイへの並行パッチは
/// [`DeployStore::patch_deploy_for_run`] を除き後勝ち。
#[async_trait]
pub trait DeployStore: Send + Sync {
    async fn find_build(&self, build_uuid: &str) -> Result<Option<Build>>;

    async fn list_deploys(&self, build_uuid: &str) -> Result<Vec<Deploy>>;

    async fn find_deploy(&self, deploy_uuid: &str) -> Result<Option<Deploy>>;

    async fn find_deploy_by_service(
        &self,
        build_uuid: &str,
        service: &str,
    ) -> Result<Option<Deploy>>;

    async fn patch_deploy(&self, deploy_uuid: &str, patch: DeployPatch) -> Result<()>;

    /// デプロイがまだ `run_uuid` の所有である場合のみパッチする
    ///
    /// 新しい実行に引き継がれていれば `false` を返す。
    async fn patch_deploy_for_run(
        &self,
        deploy_uuid: &str,
        run_uuid: &str,
        patch: DeployPatch,
    ) -> Result<bool>;

    async fn record_activity(&self, entry: ActivityEntry) -> Result<()>;

    async fn activity(&self, deploy_uuid: &str) -> Result<Vec<ActivityEntry>>;

    /// 設定サービスのフラットな key/value ブロック
    async fn configuration_values(
        &self,
        service: &str,
        branch: Option<&str>,
    ) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub builds: BTreeMap<String, Build>,
    #[serde(default)]
    pub deploys: BTreeMap<String, Deploy>,
    /// `service` または `service@branch` -> 値
    #[serde(default)]
    pub configurations: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub activity: Vec<ActivityEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            updated_at: Utc::now(),
            builds: BTreeMap::new(),
            deploys: BTreeMap::new(),
            configurations: BTreeMap::new(),
            activity: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub async fn insert_build(&self, build: Build) {
        let mut state = self.inner.write().await;
        state.builds.insert(build.uuid.clone(), build);
        state.updated_at = Utc::now();
    }

    pub async fn insert_deploy(&self, deploy: Deploy) {
        let mut state = self.inner.write().await;
        state.deploys.insert(deploy.uuid.clone(), deploy);
        state.updated_at = Utc::now();
    }

    pub async fn set_configuration(
        &self,
        service: &str,
        branch: Option<&str>,
        values: BTreeMap<String, String>,
    ) {
        let key = match branch {
            Some(branch) => format!("{}@{}", service, branch),
            None => service.to_string(),
        };
        let mut state = self.inner.write().await;
        state.configurations.insert(key, values);
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.clone()
    }

    /// プロジェクトルート配下のスナップショットのパス
    pub fn state_path(root: impl AsRef<Path>) -> PathBuf {
        root.as_ref().join(STATE_DIR).join(STATE_FILE)
    }

    /// スナップショットを読み込む。ファイルがなければ空のストア
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("Snapshot not found, starting empty: {}", path.display());
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| io_error(path, e))?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(CoreError::SnapshotVersion {
                found: snapshot.version,
                supported: SNAPSHOT_VERSION,
            });
        }

        tracing::debug!(
            builds = snapshot.builds.len(),
            deploys = snapshot.deploys.len(),
            "Loaded snapshot"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// スナップショットを書き出す。前回のファイルはバックアップとして残す
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
            && !dir.exists()
        {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error(dir, e))?;
        }

        if path.exists() {
            let backup = path.with_file_name(STATE_BACKUP);
            fs::copy(path, &backup)
                .await
                .map_err(|e| io_error(&backup, e))?;
        }

        let mut snapshot = self.snapshot().await;
        snapshot.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(&snapshot)?;
        fs::write(path, content)
            .await
            .map_err(|e| io_error(path, e))?;

        tracing::debug!("Saved snapshot: {}", path.display());
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> CoreError {
    CoreError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

#[async_trait]
impl DeployStore for MemoryStore {
    async fn find_build(&self, build_uuid: &str) -> Result<Option<Build>> {
        Ok(self.inner.read().await.builds.get(build_uuid).cloned())
    }

    async fn list_deploys(&self, build_uuid: &str) -> Result<Vec<Deploy>> {
        let state = self.inner.read().await;
        Ok(state
            .deploys
            .values()
            .filter(|d| d.build_uuid == build_uuid)
            .cloned()
            .collect())
    }

    async fn find_deploy(&self, deploy_uuid: &str) -> Result<Option<Deploy>> {
        Ok(self.inner.read().await.deploys.get(deploy_uuid).cloned())
    }

    async fn find_deploy_by_service(
        &self,
        build_uuid: &str,
        service: &str,
    ) -> Result<Option<Deploy>> {
        let state = self.inner.read().await;
        Ok(state
            .deploys
            .values()
            .find(|d| d.build_uuid == build_uuid && d.service.name == service)
            .cloned())
    }

    async fn patch_deploy(&self, deploy_uuid: &str, patch: DeployPatch) -> Result<()> {
        let mut state = self.inner.write().await;
        let deploy = state
            .deploys
            .get_mut(deploy_uuid)
            .ok_or_else(|| CoreError::DeployNotFound(deploy_uuid.to_string()))?;
        deploy.apply(patch);
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn patch_deploy_for_run(
        &self,
        deploy_uuid: &str,
        run_uuid: &str,
        patch: DeployPatch,
    ) -> Result<bool> {
        let mut state = self.inner.write().await;
        let deploy = state
            .deploys
            .get_mut(deploy_uuid)
            .ok_or_else(|| CoreError::DeployNotFound(deploy_uuid.to_string()))?;

        if deploy.run_uuid.as_deref() != Some(run_uuid) {
            return Ok(false);
        }

        deploy.apply(patch);
        state.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_activity(&self, entry: ActivityEntry) -> Result<()> {
        let mut state = self.inner.write().await;
        let deploy_uuid = entry.deploy_uuid.clone();
        state.activity.push(entry);

        let count = state
            .activity
            .iter()
            .filter(|a| a.deploy_uuid == deploy_uuid)
            .count();
        if count > MAX_ACTIVITY_PER_DEPLOY
            && let Some(oldest) = state
                .activity
                .iter()
                .position(|a| a.deploy_uuid == deploy_uuid)
        {
            state.activity.remove(oldest);
        }
        Ok(())
    }

    async fn activity(&self, deploy_uuid: &str) -> Result<Vec<ActivityEntry>> {
        let state = self.inner.read().await;
        Ok(state
            .activity
            .iter()
            .filter(|a| a.deploy_uuid == deploy_uuid)
            .cloned()
            .collect())
    }

    async fn configuration_values(
        &self,
        service: &str,
        branch: Option<&str>,
    ) -> Result<BTreeMap<String, String>> {
        let state = self.inner.read().await;
        if let Some(branch) = branch
            && let Some(values) = state.configurations.get(&format!("{}@{}", service, branch))
        {
            return Ok(values.clone());
        }
        Ok(state
            .configurations
            .get(service)
            .cloned()
            .unwrap_or_default())
    }
}
