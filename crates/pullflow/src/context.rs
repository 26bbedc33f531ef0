use anyhow::Context;
use pullflow_config::Settings;
use pullflow_core::{Build, Deploy, DeployStore, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;

/// 各コマンドが扱う設定と状態スナップショット
pub struct AppContext {
    pub settings: Settings,
    pub state_path: PathBuf,
    pub store: Arc<MemoryStore>,
}

impl AppContext {
    pub async fn load(state: Option<PathBuf>, config: Option<PathBuf>) -> anyhow::Result<Self> {
        let settings = match config {
            Some(path) => {
                tracing::debug!("Loading settings from {}", path.display());
                pullflow_config::load_settings_from(&path)?
            }
            None => pullflow_config::load_settings(true)?,
        };

        let state_path = match state {
            Some(path) => path,
            None => MemoryStore::state_path(std::env::current_dir()?),
        };
        let store = MemoryStore::load(&state_path)
            .await
            .with_context(|| format!("failed to load state from {}", state_path.display()))?;
        tracing::debug!(state = %state_path.display(), "State loaded");

        Ok(Self {
            settings,
            state_path,
            store: Arc::new(store),
        })
    }

    pub async fn build(&self, uuid: &str) -> anyhow::Result<Build> {
        self.store
            .find_build(uuid)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Build '{}' not found in {}", uuid, self.state_path.display()))
    }

    pub async fn deploy(&self, build_uuid: &str, service: &str) -> anyhow::Result<Deploy> {
        self.store
            .find_deploy_by_service(build_uuid, service)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("Service '{}' is not part of build '{}'", service, build_uuid)
            })
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        self.store.save(&self.state_path).await?;
        tracing::debug!(state = %self.state_path.display(), "State saved");
        Ok(())
    }
}
