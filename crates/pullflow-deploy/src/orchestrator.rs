//! デプロイのオーケストレーション
//!
//! [`Orchestrator::deploy_build`] はビルドの各デプロイで新しい実行を開始し、
//! ビルドの名前空間を確保してから、デプロイごとに監視付きタスクを 1 つ走らせる。
//! 失敗やパニックが起きても影響はそのタスクのデプロイだけに留まる。

use crate::dependency::{DependencyResolver, DependencyWait};
use crate::env::{EnvResolver, ResolvedEnv};
use crate::error::{DeployError, Result};
use crate::namespace::ensure_namespace;
use crate::pipeline::{ExternalPipeline, PipelineRequest, PipelineState, wait_for_pipeline};
use crate::source::SourceControl;
use crate::status::StatusTracker;
use crate::strategy::{Strategy, select_strategy};
use chrono::Utc;
use futures_util::FutureExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use pullflow_build::manifest::{
    LABEL_BUILD, LABEL_DEPLOY, LABEL_MANAGED_BY, LABEL_SERVICE, label_value,
};
use pullflow_build::{
    BackendProfile, BuildJobSpec, ClusterClient, ImageRegistry, JobMonitor, RestoreJobSpec,
    build_job_name, create_build_job, create_restore_job, image_tag, init_image_tag,
    image_reference, random_suffix, restore_job_name, split_image_tag, validate_tag,
};
use pullflow_config::{BuildSettings, Settings};
use pullflow_core::{
    Build, BuildBackend, BuildEngine, CoreError, Deploy, DeployPatch, DeployStatus, DeployStore,
};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;

/// 実行後の 1 デプロイの最終状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub deploy_uuid: String,
    pub service: String,
    pub status: DeployStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub build_uuid: String,
    pub outcomes: Vec<DeployOutcome>,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| !o.status.is_failure())
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeployOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failure())
    }
}

/// リビジョンとタグが決まった後にソースビルドで必要なもの一式
#[derive(Debug, Clone)]
pub struct BuildTarget {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub sha: String,
    pub registry: String,
    /// 出力先の完全な参照 `{registry}/{service}:{tag}`
    pub image: String,
    pub init_image: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn DeployStore>,
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<dyn ImageRegistry>,
    source: Arc<dyn SourceControl>,
    pipeline: Option<Arc<dyn ExternalPipeline>>,
    settings: Arc<Settings>,
    tracker: StatusTracker,
    env: EnvResolver,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DeployStore>,
        cluster: Arc<dyn ClusterClient>,
        registry: Arc<dyn ImageRegistry>,
        source: Arc<dyn SourceControl>,
        settings: Settings,
    ) -> Result<Self> {
        let env = EnvResolver::new(store.clone(), settings.defaults.clone())?;
        Ok(Self {
            tracker: StatusTracker::new(store.clone()),
            store,
            cluster,
            registry,
            source,
            pipeline: None,
            settings: Arc::new(settings),
            env,
        })
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn ExternalPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn env_resolver(&self) -> &EnvResolver {
        &self.env
    }

    /// ビルドの全デプロイを実行し、すべて完了するまで待つ
    #[tracing::instrument(skip(self))]
    pub async fn deploy_build(&self, build_uuid: &str) -> Result<BuildReport> {
        let build = self
            .store
            .find_build(build_uuid)
            .await?
            .ok_or_else(|| CoreError::BuildNotFound(build_uuid.to_string()))?;
        let deploys = self.store.list_deploys(build_uuid).await?;

        let mut runs = Vec::with_capacity(deploys.len());
        for deploy in deploys {
            let run_uuid = self.tracker.begin_run(&deploy.uuid).await?;
            runs.push((deploy, run_uuid));
        }

        let polling = &self.settings.polling;
        if let Err(e) = ensure_namespace(
            self.cluster.as_ref(),
            &build,
            polling.namespace_interval(),
            polling.namespace_timeout(),
        )
        .await
        {
            for (deploy, run_uuid) in &runs {
                self.tracker.fail(&deploy.uuid, run_uuid, &e).await?;
            }
            return Err(e);
        }

        tracing::info!(deploys = runs.len(), namespace = %build.namespace, "Starting deploys");

        let mut tasks = JoinSet::new();
        for (deploy, run_uuid) in runs {
            let this = self.clone();
            let build = build.clone();
            tasks.spawn(async move { this.supervise(build, deploy, run_uuid).await });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "Deploy task was aborted"),
            }
        }
        outcomes.sort_by(|a, b| a.service.cmp(&b.service));

        Ok(BuildReport {
            build_uuid: build.uuid,
            outcomes,
        })
    }

    /// 何が起きても 1 デプロイを終端状態まで進める
    async fn supervise(&self, build: Build, deploy: Deploy, run_uuid: String) -> DeployOutcome {
        let result = AssertUnwindSafe(self.run_deploy(&build, &deploy, &run_uuid))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DeployError::Internal(panic_message(panic.as_ref()))));

        match &result {
            Err(e) if e.is_superseded() => {
                tracing::debug!(deploy = %deploy.uuid, "Run superseded by a newer run");
            }
            Err(e) => {
                if let Err(write_err) = self.tracker.fail(&deploy.uuid, &run_uuid, e).await {
                    tracing::error!(
                        deploy = %deploy.uuid,
                        error = %write_err,
                        "Could not record deploy failure"
                    );
                }
            }
            Ok(()) => {}
        }

        let current = match self.store.find_deploy(&deploy.uuid).await {
            Ok(Some(current)) => current,
            _ => deploy.clone(),
        };
        DeployOutcome {
            deploy_uuid: current.uuid,
            service: current.service.name,
            status: current.status,
            message: current.status_message,
        }
    }

    #[tracing::instrument(skip_all, fields(deploy = %deploy.uuid, build = %build.uuid))]
    async fn run_deploy(&self, build: &Build, deploy: &Deploy, run_uuid: &str) -> Result<()> {
        let strategy = select_strategy(&deploy.service, deploy.branch_name.as_deref());
        tracing::debug!(strategy = strategy.name(), "Selected strategy");

        match strategy {
            Strategy::Passthrough { image } => {
                let (_, tag) = split_image_tag(&image);
                validate_tag(&tag)?;
                self.tracker
                    .advance(
                        &deploy.uuid,
                        run_uuid,
                        DeployStatus::Built,
                        format!("Using prebuilt image {}", image),
                        DeployPatch {
                            docker_image: Some(image),
                            ..Default::default()
                        },
                    )
                    .await
            }
            Strategy::Ready => {
                self.tracker
                    .advance(
                        &deploy.uuid,
                        run_uuid,
                        DeployStatus::Ready,
                        "Nothing to build",
                        DeployPatch::default(),
                    )
                    .await
            }
            Strategy::ExternalChart { chart } => {
                self.run_external_chart(deploy, run_uuid, &chart).await
            }
            Strategy::DatabaseRestore { snapshot } => {
                self.run_restore(build, deploy, run_uuid, &snapshot).await
            }
            Strategy::SourceBuild => self.run_source_build(build, deploy, run_uuid).await,
        }
    }

    async fn run_external_chart(&self, deploy: &Deploy, run_uuid: &str, chart: &str) -> Result<()> {
        let mut patch = DeployPatch::default();

        if let (Some((owner, repo)), Some(branch)) = (
            deploy.service.owner_and_repo(),
            deploy.branch_name.as_deref(),
        ) {
            match self.source.latest_commit_sha(owner, repo, branch).await {
                Ok(Some(sha)) => patch.sha = Some(sha),
                Ok(None) => tracing::debug!(branch, "No commit found for chart branch"),
                Err(e) => tracing::warn!(error = %e, "Commit lookup failed for chart"),
            }
        }

        self.tracker
            .advance(
                &deploy.uuid,
                run_uuid,
                DeployStatus::Built,
                format!("Using external chart {}", chart),
                patch,
            )
            .await
    }

    async fn run_source_build(&self, build: &Build, deploy: &Deploy, run_uuid: &str) -> Result<()> {
        let service = &deploy.service;
        let branch = deploy.branch_name.clone().unwrap_or_default();

        self.tracker
            .advance(
                &deploy.uuid,
                run_uuid,
                DeployStatus::Cloning,
                format!("Resolving latest commit of {}", branch),
                DeployPatch::default(),
            )
            .await?;

        let (owner, repo) = service
            .owner_and_repo()
            .ok_or_else(|| DeployError::RepositoryNotFound(service.name.clone()))?;
        let sha = self
            .source
            .latest_commit_sha(owner, repo, &branch)
            .await?
            .ok_or_else(|| DeployError::ShaNotFound {
                repository: format!("{}/{}", owner, repo),
                branch: branch.clone(),
            })?;
        self.tracker
            .patch(
                &deploy.uuid,
                run_uuid,
                DeployPatch {
                    sha: Some(sha.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let ResolvedEnv { mut env, init_env } = self.env.resolve(build, deploy).await?;
        let registry = self.settings.registry()?.to_string();

        let resolver = DependencyResolver::new(
            self.store.clone(),
            self.tracker.clone(),
            DependencyWait::from_settings(&self.settings.polling),
        );
        resolver.wait_and_resolve(deploy, run_uuid, &mut env).await?;
        self.publish_env(build, deploy, &env).await;

        let image_repo = format!("{}/{}", registry, service.name);
        let tag = image_tag(&sha, &env);
        let init_tag = service
            .init_dockerfile_path
            .as_ref()
            .map(|_| init_image_tag(&sha, &init_env));
        validate_tag(&tag)?;
        if let Some(init_tag) = &init_tag {
            validate_tag(init_tag)?;
        }
        let image = image_reference(&registry, &service.name, &tag);
        let init_image = init_tag
            .as_ref()
            .map(|t| image_reference(&registry, &service.name, t));

        let image_patch = DeployPatch {
            tag: Some(tag.clone()),
            init_tag: init_tag.clone(),
            docker_image: Some(image.clone()),
            init_docker_image: init_image.clone(),
            ..Default::default()
        };

        if self
            .images_exist(&image_repo, &tag, init_tag.as_deref())
            .await
        {
            let message = format!("Image {} already exists, skipping build", image);
            let output = cached_build_output(deploy, &tag).unwrap_or_else(|| message.clone());
            return self
                .tracker
                .advance(
                    &deploy.uuid,
                    run_uuid,
                    DeployStatus::Built,
                    message,
                    DeployPatch {
                        env: Some(env),
                        init_env: Some(init_env),
                        build_dispatch_id: Some(format!("cache:{}", tag)),
                        build_output: Some(output),
                        ..image_patch
                    },
                )
                .await;
        }

        let backend = service.backend(self.settings.build.engine);
        self.tracker
            .advance(
                &deploy.uuid,
                run_uuid,
                DeployStatus::Building,
                format!("Building {} with {}", image, backend.name()),
                DeployPatch {
                    backend: Some(backend.clone()),
                    env: Some(env.clone()),
                    init_env: Some(init_env.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let target = BuildTarget {
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch,
            sha,
            registry,
            image: image.clone(),
            init_image,
        };
        let logs = match &backend {
            BuildBackend::Native { engine } => {
                self.build_native(build, deploy, run_uuid, *engine, &target)
                    .await?
            }
            BuildBackend::ExternalCi { pipeline_id } => {
                self.build_external(deploy, run_uuid, pipeline_id, &target, &env)
                    .await?
            }
        };

        self.tracker
            .advance(
                &deploy.uuid,
                run_uuid,
                DeployStatus::Built,
                format!("Built {}", image),
                DeployPatch {
                    build_output: Some(logs),
                    ..image_patch
                },
            )
            .await
    }

    async fn build_native(
        &self,
        build: &Build,
        deploy: &Deploy,
        run_uuid: &str,
        engine: BuildEngine,
        target: &BuildTarget,
    ) -> Result<String> {
        let settings = &self.settings.build;
        let profile = BackendProfile::for_engine(engine, settings);

        let git_token = match self.source.clone_token(&target.owner, &target.repo).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "No clone credential, cloning anonymously");
                None
            }
        };

        let spec = build_job_spec(settings, build, deploy, profile, target, git_token);
        let job_name = spec.job_name.clone();

        self.cluster
            .create_job(&build.namespace, &create_build_job(&spec))
            .await?;
        self.tracker
            .patch(
                &deploy.uuid,
                run_uuid,
                DeployPatch {
                    build_dispatch_id: Some(job_name.clone()),
                    status_message: Some(format!("Build job {}", job_name)),
                    ..Default::default()
                },
            )
            .await?;

        self.monitor_job(&job_name, &build.namespace).await
    }

    async fn build_external(
        &self,
        deploy: &Deploy,
        run_uuid: &str,
        pipeline_id: &str,
        target: &BuildTarget,
        env: &BTreeMap<String, String>,
    ) -> Result<String> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| DeployError::PipelineUnavailable(pipeline_id.to_string()))?;

        let request = PipelineRequest {
            repository: format!("{}/{}", target.owner, target.repo),
            branch: target.branch.clone(),
            sha: target.sha.clone(),
            destination: target.image.clone(),
            init_destination: target.init_image.clone(),
            env: env.clone(),
        };
        let run = pipeline.trigger(pipeline_id, &request).await?;

        // 進捗の表現はパイプラインごとに異なるので URL をそのまま残す
        let message = match &run.url {
            Some(url) => format!("Pipeline run {}", url),
            None => format!("Pipeline run {}", run.id),
        };
        self.tracker
            .patch(
                &deploy.uuid,
                run_uuid,
                DeployPatch {
                    build_dispatch_id: Some(run.id.clone()),
                    status_message: Some(message),
                    ..Default::default()
                },
            )
            .await?;

        let polling = &self.settings.polling;
        let state = wait_for_pipeline(
            pipeline.as_ref(),
            &run.id,
            polling.pipeline_interval(),
            polling.pipeline_timeout(),
        )
        .await?;

        let logs = pipeline.logs(&run.id).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Pipeline logs unavailable");
            format!("logs unavailable: {}", e)
        });

        match state {
            PipelineState::Succeeded => Ok(logs),
            _ => Err(DeployError::BuildFailed {
                message: format!("Pipeline run {} failed", run.id),
                logs,
            }),
        }
    }

    async fn run_restore(
        &self,
        build: &Build,
        deploy: &Deploy,
        run_uuid: &str,
        snapshot: &str,
    ) -> Result<()> {
        let settings = &self.settings.build;
        let defaults = &self.settings.defaults;

        self.tracker
            .advance(
                &deploy.uuid,
                run_uuid,
                DeployStatus::Building,
                format!("Restoring snapshot {}", snapshot),
                DeployPatch::default(),
            )
            .await?;

        let host = deploy
            .internal_hostname
            .clone()
            .unwrap_or_else(|| deploy.uuid.clone());
        let job_name = restore_job_name(&deploy.uuid, &random_suffix());
        let spec = RestoreJobSpec {
            job_name: job_name.clone(),
            namespace: build.namespace.clone(),
            service_account: settings.service_account.clone(),
            service_name: deploy.service.name.clone(),
            deploy_uuid: deploy.uuid.clone(),
            build_uuid: build.uuid.clone(),
            snapshot: snapshot.to_string(),
            target_host: format!("{}.{}.{}", host, build.namespace, defaults.cluster_domain),
            image: settings.restore_image.clone(),
            resources: deploy.service.resources.or(&settings.resources),
            timeout_secs: settings.job_timeout_secs as i64,
            ttl_secs: settings.ttl_secs,
            triggered_at: Utc::now(),
        };

        self.cluster
            .create_job(&build.namespace, &create_restore_job(&spec))
            .await?;
        self.tracker
            .patch(
                &deploy.uuid,
                run_uuid,
                DeployPatch {
                    build_dispatch_id: Some(job_name.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let logs = self.monitor_job(&job_name, &build.namespace).await?;

        self.tracker
            .advance(
                &deploy.uuid,
                run_uuid,
                DeployStatus::Built,
                format!("Restored snapshot {}", snapshot),
                DeployPatch {
                    build_output: Some(logs),
                    ..Default::default()
                },
            )
            .await
    }

    /// 成功したジョブのログ。失敗時は [`DeployError::BuildFailed`]
    async fn monitor_job(&self, job_name: &str, namespace: &str) -> Result<String> {
        let monitor = JobMonitor::new(self.cluster.clone(), self.settings.polling.job_interval());
        let outcome = monitor
            .wait_for_job_and_get_logs(job_name, namespace, self.settings.build.job_timeout())
            .await?;

        if outcome.success {
            Ok(outcome.logs)
        } else {
            Err(DeployError::BuildFailed {
                message: outcome
                    .message
                    .unwrap_or_else(|| format!("Job {} {}", job_name, outcome.phase)),
                logs: outcome.logs,
            })
        }
    }

    /// イメージと任意の init イメージのレジストリヒット判定
    ///
    /// 参照に失敗した場合はミス扱い。
    async fn images_exist(&self, repository: &str, tag: &str, init_tag: Option<&str>) -> bool {
        for tag in std::iter::once(tag).chain(init_tag) {
            match self.registry.tag_exists(repository, tag).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    tracing::warn!(repository, tag, error = %e, "Registry lookup failed");
                    return false;
                }
            }
        }
        true
    }

    /// ベストエフォート。ConfigMap がなくてもデプロイは失敗させない
    async fn publish_env(&self, build: &Build, deploy: &Deploy, env: &BTreeMap<String, String>) {
        let config_map = env_config_map(build, deploy, env);
        if let Err(e) = self
            .cluster
            .create_config_map(&build.namespace, &config_map)
            .await
        {
            tracing::warn!(deploy = %deploy.uuid, error = %e, "Could not create env ConfigMap");
        }
    }
}

/// `tag` を最後にビルドした実行のビルドログ
///
/// `deploy` は今回の実行でリセットされる前の状態。依存元はこのログから
/// 抽出するため、キャッシュヒット時もプレースホルダーに置き換えない。
fn cached_build_output(deploy: &Deploy, tag: &str) -> Option<String> {
    if deploy.status != DeployStatus::Built || deploy.tag.as_deref() != Some(tag) {
        return None;
    }
    deploy.build_output.clone().filter(|output| !output.is_empty())
}

/// `deploy` を `target` へネイティブビルドする Job 仕様
pub fn build_job_spec(
    settings: &BuildSettings,
    build: &Build,
    deploy: &Deploy,
    profile: BackendProfile,
    target: &BuildTarget,
    git_token: Option<String>,
) -> BuildJobSpec {
    let service = &deploy.service;
    BuildJobSpec {
        job_name: build_job_name(&deploy.uuid, &random_suffix(), &target.sha),
        namespace: build.namespace.clone(),
        service_account: settings.service_account.clone(),
        service_name: service.name.clone(),
        deploy_uuid: deploy.uuid.clone(),
        build_uuid: build.uuid.clone(),
        repository: format!("{}/{}", target.owner, target.repo),
        git_host: settings.git_host.clone(),
        git_token,
        sha: target.sha.clone(),
        branch: target.branch.clone(),
        context_path: service.context_path.clone().unwrap_or_else(|| ".".to_string()),
        dockerfile_path: service
            .dockerfile_path
            .clone()
            .unwrap_or_else(|| "Dockerfile".to_string()),
        destination: target.image.clone(),
        init_dockerfile_path: service.init_dockerfile_path.clone(),
        init_destination: target.init_image.clone(),
        cache_ref: profile.cache_ref(&target.registry, &target.repo),
        build_args: service.build_args.clone(),
        profile,
        clone_image: settings.git_image.clone(),
        resources: service.resources.or(&settings.resources),
        timeout_secs: settings.job_timeout_secs as i64,
        ttl_secs: if service.static_build {
            Some(settings.static_ttl_secs)
        } else {
            settings.ttl_secs
        },
        triggered_at: Utc::now(),
    }
}

/// 解決済み env を持つ `{deploy}-env` ConfigMap
pub fn env_config_map(build: &Build, deploy: &Deploy, env: &BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(format!("{}-env", deploy.uuid)),
            namespace: Some(build.namespace.clone()),
            labels: Some(BTreeMap::from([
                (LABEL_MANAGED_BY.to_string(), "pullflow".to_string()),
                (LABEL_SERVICE.to_string(), label_value(deploy.name())),
                (LABEL_DEPLOY.to_string(), label_value(&deploy.uuid)),
                (LABEL_BUILD.to_string(), label_value(&build.uuid)),
            ])),
            ..Default::default()
        },
        data: Some(env.clone()),
        ..Default::default()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("deploy task panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("deploy task panicked: {}", msg)
    } else {
        "deploy task panicked".to_string()
    }
}
