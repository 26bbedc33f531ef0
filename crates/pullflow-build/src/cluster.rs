//! クラスタ API へのアクセス
//!
//! [`ClusterClient`] はビルドとデプロイのパイプラインが必要とする Kubernetes API の
//! 最小限の部分。[`KubeCluster`] は `kube` で実装し、テストは
//! インメモリのフェイクを使う。

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Pod};
use kube::Client;
use kube::api::{Api, ListParams, LogParams, PostParams};

/// コンテナログの読み取りオプション
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub tail_lines: Option<i64>,
    pub timestamps: bool,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace>;

    async fn read_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;

    async fn read_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn read_pod_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<String>;

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
    -> Result<ConfigMap>;

    /// フィールドセレクタに一致するコアイベント（例: `involvedObject.name=foo`）
    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>>;
}

/// kube の [`Client`] による [`ClusterClient`]
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// ローカルの kubeconfig か、クラスタ内のサービスアカウントからクライアントを作成
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), namespace).await?)
    }

    async fn read_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), job).await?)
    }

    async fn read_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let jobs = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(jobs.items)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn read_pod_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines: options.tail_lines,
            timestamps: options.timestamps,
            ..Default::default()
        };
        Ok(api.logs(pod, &params).await?)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }

    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let events = api
            .list(&ListParams::default().fields(field_selector))
            .await?;
        Ok(events.items)
    }
}
