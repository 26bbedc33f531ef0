//! ビルド名前空間の用意

use crate::error::{DeployError, Result};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use pullflow_build::ClusterClient;
use pullflow_build::manifest::{LABEL_BUILD, LABEL_MANAGED_BY, label_value};
use pullflow_core::Build;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

pub fn namespace_manifest(build: &Build) -> Namespace {
    let mut labels = BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), "pullflow".to_string()),
        (LABEL_BUILD.to_string(), label_value(&build.uuid)),
    ]);
    if let Some(pr) = build.pull_request_number {
        labels.insert("pullflow.dev/pull-request".to_string(), pr.to_string());
    }

    Namespace {
        metadata: ObjectMeta {
            name: Some(build.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn is_active(namespace: &Namespace) -> bool {
    namespace
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Active")
}

/// 必要ならビルドの名前空間を作成し、`Active` になるまで待つ
#[tracing::instrument(skip(cluster, build), fields(namespace = %build.namespace))]
pub async fn ensure_namespace(
    cluster: &dyn ClusterClient,
    build: &Build,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let name = build.namespace.as_str();

    match cluster.read_namespace(name).await? {
        Some(ns) if is_active(&ns) => return Ok(()),
        Some(_) => tracing::debug!("Namespace exists but is not active yet"),
        None => {
            tracing::info!("Creating namespace");
            if let Err(e) = cluster.create_namespace(&namespace_manifest(build)).await {
                // 作成競合に負けたか権限がない。判断は下のポーリングに任せる
                tracing::warn!(error = %e, "Namespace creation failed");
            }
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        match cluster.read_namespace(name).await {
            Ok(Some(ns)) if is_active(&ns) => {
                tracing::info!("Namespace is active");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read namespace, retrying"),
        }

        if Instant::now() >= deadline {
            return Err(DeployError::NamespaceTimeout {
                namespace: name.to_string(),
                seconds: timeout.as_secs(),
            });
        }

        tokio::time::sleep(interval).await;
    }
}
