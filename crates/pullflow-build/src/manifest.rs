//! Job マニフェストファクトリ
//!
//! ビルド要求を Kubernetes Job に変換する:
//! - init コンテナ `git-clone`: リビジョンを `emptyDir` のワークスペースへ shallow fetch
//! - `{engine}-main`: メインイメージをビルドして push
//! - `{engine}-init`: init イメージがあればビルドして push
//!
//! 構築処理は純粋。ジョブ名のランダム部分とトリガー時刻は
//! 入力として受け取る。

use crate::backend::{BackendProfile, BuildInvocation, WORKSPACE_DIR};
use crate::tag::short_sha;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec,
    ResourceRequirements as K8sResources, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use pullflow_core::ResourceRequirements;
use std::collections::BTreeMap;

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_SERVICE: &str = "pullflow.dev/service";
pub const LABEL_DEPLOY: &str = "pullflow.dev/deploy";
pub const LABEL_BUILD: &str = "pullflow.dev/build";
pub const LABEL_SHA: &str = "pullflow.dev/sha";
pub const LABEL_BRANCH: &str = "pullflow.dev/branch";
pub const LABEL_BACKEND: &str = "pullflow.dev/backend";
pub const LABEL_BUILD_METHOD: &str = "pullflow.dev/build-method";

pub const ANNOTATION_DOCKERFILE: &str = "pullflow.dev/dockerfile";
pub const ANNOTATION_DESTINATION: &str = "pullflow.dev/destination";
pub const ANNOTATION_TRIGGERED_AT: &str = "pullflow.dev/triggered-at";
pub const ANNOTATION_SNAPSHOT: &str = "pullflow.dev/snapshot";

pub const BUILD_METHOD_NATIVE: &str = "native";
pub const BUILD_METHOD_RESTORE: &str = "restore";

pub const CLONE_CONTAINER: &str = "git-clone";
pub const RESTORE_CONTAINER: &str = "restore";
const WORKSPACE_VOLUME: &str = "workspace";
const MAX_NAME_LEN: usize = 63;

/// ビルドジョブ 1 つを記述するのに必要なもの一式
#[derive(Debug, Clone)]
pub struct BuildJobSpec {
    pub job_name: String,
    pub namespace: String,
    pub service_account: String,
    pub service_name: String,
    pub deploy_uuid: String,
    pub build_uuid: String,
    /// `owner/repo`
    pub repository: String,
    pub git_host: String,
    /// 短命のクローン用認証情報。`GIT_TOKEN` として注入
    pub git_token: Option<String>,
    pub sha: String,
    pub branch: String,
    pub context_path: String,
    pub dockerfile_path: String,
    pub destination: String,
    pub init_dockerfile_path: Option<String>,
    pub init_destination: Option<String>,
    pub cache_ref: String,
    pub build_args: BTreeMap<String, String>,
    pub profile: BackendProfile,
    pub clone_image: String,
    pub resources: ResourceRequirements,
    pub timeout_secs: i64,
    /// ジョブ完了後の保持期間
    pub ttl_secs: Option<i32>,
    pub triggered_at: DateTime<Utc>,
}

/// `{deploy}-build-{random}-{short_sha}`（最大 63 文字）
pub fn build_job_name(deploy_uuid: &str, random: &str, sha: &str) -> String {
    let tail = format!("-build-{}-{}", random, short_sha(sha));
    bounded_name(deploy_uuid, &tail)
}

/// `{deploy}-restore-{random}`（最大 63 文字）
pub fn restore_job_name(deploy_uuid: &str, random: &str) -> String {
    bounded_name(deploy_uuid, &format!("-restore-{}", random))
}

/// 小文字英数字 5 文字
pub fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..5].to_string()
}

fn bounded_name(prefix: &str, tail: &str) -> String {
    let budget = MAX_NAME_LEN.saturating_sub(tail.len());
    let prefix: String = prefix
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(budget)
        .collect();
    format!("{}{}", prefix.trim_end_matches('-'), tail)
}

/// 任意のテキストを有効なラベル値に変換
pub fn label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

pub fn build_labels(spec: &BuildJobSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), "pullflow".to_string()),
        (LABEL_SERVICE.to_string(), label_value(&spec.service_name)),
        (LABEL_DEPLOY.to_string(), label_value(&spec.deploy_uuid)),
        (LABEL_BUILD.to_string(), label_value(&spec.build_uuid)),
        (LABEL_SHA.to_string(), short_sha(&spec.sha).to_string()),
        (LABEL_BRANCH.to_string(), label_value(&spec.branch)),
        (LABEL_BACKEND.to_string(), spec.profile.name().to_string()),
        (
            LABEL_BUILD_METHOD.to_string(),
            BUILD_METHOD_NATIVE.to_string(),
        ),
    ])
}

pub fn create_build_job(spec: &BuildJobSpec) -> Job {
    let labels = build_labels(spec);
    let annotations = BTreeMap::from([
        (
            ANNOTATION_DOCKERFILE.to_string(),
            spec.dockerfile_path.clone(),
        ),
        (ANNOTATION_DESTINATION.to_string(), spec.destination.clone()),
        (
            ANNOTATION_TRIGGERED_AT.to_string(),
            spec.triggered_at.to_rfc3339(),
        ),
    ]);

    let mut containers = vec![build_container(
        spec,
        "main",
        &spec.dockerfile_path,
        &spec.destination,
    )];
    if let (Some(dockerfile), Some(destination)) =
        (&spec.init_dockerfile_path, &spec.init_destination)
    {
        containers.push(build_container(spec, "init", dockerfile, destination));
    }

    Job {
        metadata: ObjectMeta {
            name: Some(spec.job_name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(spec.timeout_secs),
            ttl_seconds_after_finished: spec.ttl_secs,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(spec.service_account.clone()),
                    init_containers: Some(vec![clone_container(spec)]),
                    containers,
                    volumes: Some(vec![Volume {
                        name: WORKSPACE_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn workspace_mount() -> VolumeMount {
    VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_DIR.to_string(),
        ..Default::default()
    }
}

fn clone_container(spec: &BuildJobSpec) -> Container {
    let remote = format!("{}/{}.git", spec.git_host, spec.repository);
    let script = format!(
        "set -e\n\
         if [ -n \"$GIT_TOKEN\" ]; then URL=\"https://x-access-token:${{GIT_TOKEN}}@{remote}\"; \
         else URL=\"https://{remote}\"; fi\n\
         git init -q {dir}\n\
         cd {dir}\n\
         git remote add origin \"$URL\"\n\
         git fetch -q --depth 1 origin {sha}\n\
         git checkout -q FETCH_HEAD\n",
        remote = remote,
        dir = WORKSPACE_DIR,
        sha = spec.sha,
    );

    let mut env = Vec::new();
    if let Some(token) = &spec.git_token {
        env.push(EnvVar {
            name: "GIT_TOKEN".to_string(),
            value: Some(token.clone()),
            ..Default::default()
        });
    }

    Container {
        name: CLONE_CONTAINER.to_string(),
        image: Some(spec.clone_image.clone()),
        command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
        env: Some(env),
        volume_mounts: Some(vec![workspace_mount()]),
        ..Default::default()
    }
}

fn build_container(
    spec: &BuildJobSpec,
    role: &str,
    dockerfile_path: &str,
    destination: &str,
) -> Container {
    let invocation = BuildInvocation {
        context_path: &spec.context_path,
        dockerfile_path,
        destination,
        cache_ref: &spec.cache_ref,
        build_args: &spec.build_args,
    };

    Container {
        name: format!("{}-{}", spec.profile.name(), role),
        image: Some(spec.profile.image().to_string()),
        command: Some(spec.profile.command()),
        args: Some(spec.profile.args(&invocation)),
        env: Some(spec.profile.env()),
        volume_mounts: Some(vec![workspace_mount()]),
        resources: to_k8s_resources(&spec.resources),
        ..Default::default()
    }
}

fn to_k8s_resources(resources: &ResourceRequirements) -> Option<K8sResources> {
    if resources.is_empty() {
        return None;
    }

    let quantities = |cpu: &Option<String>, memory: &Option<String>| {
        let mut map = BTreeMap::new();
        if let Some(cpu) = cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        (!map.is_empty()).then_some(map)
    };

    Some(K8sResources {
        requests: quantities(&resources.cpu_request, &resources.memory_request),
        limits: quantities(&resources.cpu_limit, &resources.memory_limit),
        ..Default::default()
    })
}

/// データベーススナップショットのリストアジョブ
#[derive(Debug, Clone)]
pub struct RestoreJobSpec {
    pub job_name: String,
    pub namespace: String,
    pub service_account: String,
    pub service_name: String,
    pub deploy_uuid: String,
    pub build_uuid: String,
    pub snapshot: String,
    /// リストア先のデータベースホスト
    pub target_host: String,
    pub image: String,
    pub resources: ResourceRequirements,
    pub timeout_secs: i64,
    pub ttl_secs: Option<i32>,
    pub triggered_at: DateTime<Utc>,
}

pub fn create_restore_job(spec: &RestoreJobSpec) -> Job {
    let labels = BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), "pullflow".to_string()),
        (LABEL_SERVICE.to_string(), label_value(&spec.service_name)),
        (LABEL_DEPLOY.to_string(), label_value(&spec.deploy_uuid)),
        (LABEL_BUILD.to_string(), label_value(&spec.build_uuid)),
        (
            LABEL_BUILD_METHOD.to_string(),
            BUILD_METHOD_RESTORE.to_string(),
        ),
    ]);
    let annotations = BTreeMap::from([
        (ANNOTATION_SNAPSHOT.to_string(), spec.snapshot.clone()),
        (
            ANNOTATION_TRIGGERED_AT.to_string(),
            spec.triggered_at.to_rfc3339(),
        ),
    ]);

    let env = [
        ("RESTORE_SNAPSHOT", spec.snapshot.as_str()),
        ("TARGET_HOST", spec.target_host.as_str()),
        ("SERVICE_NAME", spec.service_name.as_str()),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    })
    .collect();

    Job {
        metadata: ObjectMeta {
            name: Some(spec.job_name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(spec.timeout_secs),
            ttl_seconds_after_finished: spec.ttl_secs,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(spec.service_account.clone()),
                    containers: vec![Container {
                        name: RESTORE_CONTAINER.to_string(),
                        image: Some(spec.image.clone()),
                        env: Some(env),
                        resources: to_k8s_resources(&spec.resources),
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
