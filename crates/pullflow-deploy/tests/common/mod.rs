use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Namespace, NamespaceStatus, Pod, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use pullflow_build::manifest::LABEL_SERVICE;
use pullflow_build::{ClusterClient, ImageRegistry, LogOptions};
use pullflow_config::Settings;
use pullflow_core::{Build, Deploy, MemoryStore, ServiceDefinition};
use pullflow_deploy::{
    ExternalPipeline, Orchestrator, PipelineRequest, PipelineRun, PipelineState, SourceControl,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const BUILD_UUID: &str = "abc123";
pub const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

/// ジョブは最初の読み取りで完了する。`failing` のサービスは失敗する
#[derive(Default)]
pub struct FakeCluster {
    pub namespaces: Mutex<HashMap<String, Namespace>>,
    pub jobs: Mutex<Vec<Job>>,
    pub config_maps: Mutex<Vec<ConfigMap>>,
    pub failing: HashSet<String>,
    /// サービス -> main コンテナのログ
    pub logs: HashMap<String, String>,
}

impl FakeCluster {
    pub fn job_names(&self) -> Vec<String> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|j| j.metadata.name.clone())
            .collect()
    }

    pub fn config_map(&self, name: &str) -> Option<ConfigMap> {
        self.config_maps
            .lock()
            .unwrap()
            .iter()
            .find(|cm| cm.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    fn find_job(&self, name: &str) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.metadata.name.as_deref() == Some(name))
            .cloned()
    }
}

fn service_of(job: &Job) -> String {
    job.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_SERVICE))
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> pullflow_build::Result<Namespace> {
        let mut created = namespace.clone();
        created.status = Some(NamespaceStatus {
            phase: Some("Active".to_string()),
            ..Default::default()
        });
        let name = created.metadata.name.clone().unwrap_or_default();
        self.namespaces.lock().unwrap().insert(name, created.clone());
        Ok(created)
    }

    async fn read_namespace(&self, name: &str) -> pullflow_build::Result<Option<Namespace>> {
        Ok(self.namespaces.lock().unwrap().get(name).cloned())
    }

    async fn create_job(&self, _namespace: &str, job: &Job) -> pullflow_build::Result<Job> {
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job.clone())
    }

    async fn read_job(&self, _namespace: &str, name: &str) -> pullflow_build::Result<Option<Job>> {
        Ok(self.find_job(name).map(|mut job| {
            let failed = self.failing.contains(&service_of(&job));
            job.status = Some(JobStatus {
                succeeded: Some(if failed { 0 } else { 1 }),
                failed: Some(if failed { 1 } else { 0 }),
                ..Default::default()
            });
            job
        }))
    }

    async fn list_jobs(&self, _namespace: &str, _selector: &str) -> pullflow_build::Result<Vec<Job>> {
        Ok(self.jobs.lock().unwrap().clone())
    }

    async fn list_pods(&self, _namespace: &str, selector: &str) -> pullflow_build::Result<Vec<Pod>> {
        let job_name = selector.trim_start_matches("job-name=");
        let Some(job) = self.find_job(job_name) else {
            return Ok(Vec::new());
        };
        let template = job
            .spec
            .and_then(|s| s.template.spec)
            .unwrap_or_else(PodSpec::default);
        Ok(vec![Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-pod", job_name)),
                ..Default::default()
            },
            spec: Some(template),
            ..Default::default()
        }])
    }

    async fn read_pod_log(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        _options: &LogOptions,
    ) -> pullflow_build::Result<String> {
        let job_name = pod.trim_end_matches("-pod");
        let service = self.find_job(job_name).map(|j| service_of(&j)).unwrap_or_default();
        if container.ends_with("-main") {
            if let Some(log) = self.logs.get(&service) {
                return Ok(log.clone());
            }
        }
        Ok(format!("{} done", container))
    }

    async fn create_config_map(
        &self,
        _namespace: &str,
        config_map: &ConfigMap,
    ) -> pullflow_build::Result<ConfigMap> {
        self.config_maps.lock().unwrap().push(config_map.clone());
        Ok(config_map.clone())
    }

    async fn list_events(&self, _namespace: &str, _selector: &str) -> pullflow_build::Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

/// ここに列挙したリポジトリは全タグを持つ
#[derive(Default)]
pub struct FakeRegistry {
    pub existing: Mutex<HashSet<String>>,
    pub lookups: AtomicUsize,
}

impl FakeRegistry {
    pub fn with(repositories: &[&str]) -> Self {
        let registry = Self::default();
        registry.push(repositories);
        registry
    }

    pub fn push(&self, repositories: &[&str]) {
        self.existing
            .lock()
            .unwrap()
            .extend(repositories.iter().map(|r| r.to_string()));
    }
}

#[async_trait]
impl ImageRegistry for FakeRegistry {
    async fn tag_exists(&self, repository: &str, _tag: &str) -> pullflow_build::Result<bool> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.existing.lock().unwrap().contains(repository))
    }
}

/// `missing` 以外のブランチはすべて [`SHA`] に解決される
#[derive(Default)]
pub struct FakeSource {
    pub missing: HashSet<String>,
    /// 参照でパニックするリポジトリ
    pub panicking: HashSet<String>,
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn latest_commit_sha(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> pullflow_deploy::Result<Option<String>> {
        let repository = format!("{}/{}", owner, repo);
        if self.panicking.contains(&repository) {
            panic!("lookup exploded for {}", repository);
        }
        if self.missing.contains(branch) {
            return Ok(None);
        }
        Ok(Some(SHA.to_string()))
    }

    async fn clone_token(&self, _owner: &str, _repo: &str) -> pullflow_deploy::Result<Option<String>> {
        Ok(Some("ghs_test".to_string()))
    }
}

pub struct FakePipeline {
    pub succeed: bool,
    pub requests: Mutex<Vec<PipelineRequest>>,
}

#[async_trait]
impl ExternalPipeline for FakePipeline {
    async fn trigger(
        &self,
        pipeline_id: &str,
        request: &PipelineRequest,
    ) -> pullflow_deploy::Result<PipelineRun> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(PipelineRun {
            id: format!("{}-run-1", pipeline_id),
            url: Some(format!("https://ci.example.com/{}/runs/1", pipeline_id)),
        })
    }

    async fn state(&self, _run_id: &str) -> pullflow_deploy::Result<PipelineState> {
        Ok(if self.succeed {
            PipelineState::Succeeded
        } else {
            PipelineState::Failed
        })
    }

    async fn logs(&self, run_id: &str) -> pullflow_deploy::Result<String> {
        Ok(format!("pipeline {} log", run_id))
    }
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.build.registry = Some("registry.test".to_string());
    settings.polling.job_poll_interval_secs = 1;
    settings.polling.dependency_poll_interval_secs = 1;
    settings.polling.dependency_dispatch_timeout_secs = 30;
    settings.polling.dependency_output_timeout_secs = 60;
    settings.polling.namespace_poll_interval_secs = 1;
    settings.polling.namespace_timeout_secs = 5;
    settings.polling.pipeline_poll_interval_secs = 1;
    settings
}

pub fn source_service(name: &str) -> ServiceDefinition {
    let mut service = ServiceDefinition::new(name);
    service.repository = Some(format!("acme/{}", name));
    service.branch = Some("feature-x".to_string());
    service.dockerfile_path = Some("Dockerfile".to_string());
    service
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub cluster: Arc<FakeCluster>,
    pub registry: Arc<FakeRegistry>,
    pub orchestrator: Orchestrator,
}

pub async fn harness(
    services: Vec<ServiceDefinition>,
    cluster: FakeCluster,
    registry: FakeRegistry,
    source: FakeSource,
    settings: Settings,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.insert_build(Build::new(BUILD_UUID)).await;
    for service in services {
        store.insert_deploy(Deploy::new(service, BUILD_UUID, true)).await;
    }

    let cluster = Arc::new(cluster);
    let registry = Arc::new(registry);
    let orchestrator = Orchestrator::new(
        store.clone(),
        cluster.clone(),
        registry.clone(),
        Arc::new(source),
        settings,
    )
    .unwrap();

    Harness {
        store,
        cluster,
        registry,
        orchestrator,
    }
}

#[allow(dead_code)]
pub fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
