use pullflow_core::{
    ActivityEntry, Build, Deploy, DeployStatus, DeployStore, MemoryStore, ServiceDefinition,
};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub const BUILD_UUID: &str = "abc123";

/// 設定ファイルと状態スナップショットを持つ一時プロジェクト
pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn write_settings(&self, content: &str) -> PathBuf {
        let path = self.root.path().join("pullflow.yaml");
        fs::write(&path, content).unwrap();
        path
    }

    pub fn state_path(&self) -> PathBuf {
        MemoryStore::state_path(self.root.path())
    }

    /// api（env で db に依存）と db。どちらもアクティブ
    pub async fn write_state(&self) {
        let store = MemoryStore::new();
        store.insert_build(Build::new(BUILD_UUID)).await;

        let mut db = ServiceDefinition::new("db");
        db.docker_image = Some("postgres:16".to_string());

        let mut api = ServiceDefinition::new("api");
        api.repository = Some("acme/api".to_string());
        api.branch = Some("feature-x".to_string());
        api.dockerfile_path = Some("Dockerfile".to_string());
        api.env.insert(
            "DATABASE_URL".to_string(),
            "postgres://{{db_internalHostname}}:5432/app".to_string(),
        );
        api.env.insert("PORT".to_string(), "8080".to_string());

        let mut api_deploy = Deploy::new(api, BUILD_UUID, true);
        api_deploy.build_output = Some("--- MAIN CONTAINER ---\nbuilt api".to_string());

        store.insert_deploy(Deploy::new(db, BUILD_UUID, true)).await;
        store.insert_deploy(api_deploy).await;
        store
            .record_activity(ActivityEntry::new(
                "api-abc123",
                None,
                DeployStatus::Queued,
                Some("Queued for first build".to_string()),
            ))
            .await
            .unwrap();
        store.save(self.state_path()).await.unwrap();
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }
}
