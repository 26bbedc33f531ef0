//! ジョブモニター
//!
//! 投入したジョブを成功・失敗・タイムアウトのいずれかまでポーリングし、
//! Pod の全コンテナのログをセクション見出し付きで収集する。

use crate::cluster::{ClusterClient, LogOptions};
use crate::error::{BuildError, Result};
use crate::manifest::CLONE_CONTAINER;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const CLONE_SECTION: &str = "--- CLONE CONTAINER ---";
pub const MAIN_SECTION: &str = "--- MAIN CONTAINER ---";
pub const INIT_SECTION: &str = "--- INIT CONTAINER ---";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Succeeded,
    Failed,
    Timeout,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Succeeded => write!(f, "succeeded"),
            JobPhase::Failed => write!(f, "failed"),
            JobPhase::Timeout => write!(f, "timeout"),
        }
    }
}

/// ジョブの最終判定と取得したログ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub success: bool,
    pub phase: JobPhase,
    pub logs: String,
    pub pod_name: Option<String>,
    /// ジョブが報告した失敗理由（あれば）
    pub message: Option<String>,
}

/// Job が正常に完了したか
pub fn is_job_complete(job: &Job) -> bool {
    let succeeded = job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0);
    succeeded > 0 || has_condition(job, "Complete")
}

/// Job が失敗したか
///
/// `backoffLimit` はリトライ回数なので、上限 0 のジョブは最初の Pod が
/// 失敗した時点で終わり。
pub fn is_job_failed(job: &Job) -> bool {
    let failed = job.status.as_ref().and_then(|s| s.failed).unwrap_or(0);
    let backoff_limit = job.spec.as_ref().and_then(|s| s.backoff_limit).unwrap_or(0);
    failed > backoff_limit || has_condition(job, "Failed")
}

/// 失敗した Job から失敗メッセージを取り出す
pub fn job_failure_message(job: &Job) -> Option<String> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
                .and_then(|c| c.message.clone().or_else(|| c.reason.clone()))
        })
}

fn has_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
}

/// ジョブが作成した Pod。複数あれば新しい順
pub async fn find_job_pod(
    cluster: &dyn ClusterClient,
    namespace: &str,
    job_name: &str,
) -> Result<Pod> {
    let mut pods = cluster
        .list_pods(namespace, &format!("job-name={}", job_name))
        .await?;
    pods.sort_by(|a, b| {
        b.metadata
            .creation_timestamp
            .cmp(&a.metadata.creation_timestamp)
    });
    pods.into_iter()
        .next()
        .ok_or_else(|| BuildError::PodNotFound(job_name.to_string()))
}

pub struct JobMonitor {
    cluster: Arc<dyn ClusterClient>,
    poll_interval: Duration,
}

impl JobMonitor {
    pub fn new(cluster: Arc<dyn ClusterClient>, poll_interval: Duration) -> Self {
        Self {
            cluster,
            poll_interval,
        }
    }

    /// ジョブの終了を待ってログを収集
    ///
    /// ログが取れなくても判定は変わらない。
    #[tracing::instrument(skip(self), fields(job = %job_name, namespace = %namespace))]
    pub async fn wait_for_job_and_get_logs(
        &self,
        job_name: &str,
        namespace: &str,
        timeout: Duration,
    ) -> Result<JobOutcome> {
        let deadline = Instant::now() + timeout;

        let (phase, message) = loop {
            match self.cluster.read_job(namespace, job_name).await {
                Ok(Some(job)) => {
                    if is_job_complete(&job) {
                        break (JobPhase::Succeeded, None);
                    }
                    if is_job_failed(&job) {
                        break (JobPhase::Failed, job_failure_message(&job));
                    }
                }
                Ok(None) => {
                    tracing::debug!("Job not visible yet");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read job status, retrying");
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Job did not finish in time"
                );
                break (
                    JobPhase::Timeout,
                    Some(format!(
                        "job {} did not finish within {}s",
                        job_name,
                        timeout.as_secs()
                    )),
                );
            }

            tokio::time::sleep(self.poll_interval).await;
        };

        tracing::info!(phase = %phase, "Job finished");

        match self.collect_logs(job_name, namespace).await {
            Ok((pod_name, logs)) => Ok(JobOutcome {
                success: phase == JobPhase::Succeeded,
                phase,
                logs,
                pod_name: Some(pod_name),
                message,
            }),
            Err(e) if phase == JobPhase::Succeeded => {
                tracing::warn!(error = %e, "Job succeeded but logs could not be retrieved");
                Ok(self.confirm_success(job_name, namespace, &e).await)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not retrieve logs of unsuccessful job");
                Ok(JobOutcome {
                    success: false,
                    phase,
                    logs: format!("logs unavailable: {}", e),
                    pod_name: None,
                    message,
                })
            }
        }
    }

    /// ログ取得失敗後にジョブを直接読み直す。どちらでも成功は成功のまま
    async fn confirm_success(
        &self,
        job_name: &str,
        namespace: &str,
        err: &BuildError,
    ) -> JobOutcome {
        let logs = match self.cluster.read_job(namespace, job_name).await {
            Ok(Some(job)) if is_job_complete(&job) => {
                let completed = job
                    .status
                    .as_ref()
                    .and_then(|s| s.completion_time.as_ref())
                    .map(|t| format!(" at {}", t.0.to_rfc3339()))
                    .unwrap_or_default();
                format!(
                    "Job {} succeeded{}; logs unavailable: {}",
                    job_name, completed, err
                )
            }
            Ok(_) => format!("Job {} succeeded; logs unavailable: {}", job_name, err),
            Err(status_err) => {
                tracing::debug!(error = %status_err, "Secondary status check failed");
                format!("Job {} succeeded; logs unavailable", job_name)
            }
        };

        JobOutcome {
            success: true,
            phase: JobPhase::Succeeded,
            logs,
            pod_name: None,
            message: None,
        }
    }

    /// ジョブの Pod のセクション分けしたログ: clone、main、init、その他
    pub async fn collect_logs(
        &self,
        job_name: &str,
        namespace: &str,
    ) -> Result<(String, String)> {
        let pod = find_job_pod(self.cluster.as_ref(), namespace, job_name).await?;
        let pod_name = pod.metadata.name.clone().unwrap_or_default();

        let spec = pod.spec.as_ref();
        let init_containers: Vec<String> = spec
            .and_then(|s| s.init_containers.as_ref())
            .map(|cs| cs.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_else(|| vec![CLONE_CONTAINER.to_string()]);
        let containers: Vec<String> = spec
            .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default();

        let mut sections: Vec<(String, String)> = Vec::new();
        for name in &init_containers {
            let header = if name == CLONE_CONTAINER {
                CLONE_SECTION.to_string()
            } else {
                format!("--- {} CONTAINER ---", name.to_uppercase())
            };
            sections.push((header, name.clone()));
        }
        for name in containers.iter().filter(|n| n.ends_with("-main")) {
            sections.push((MAIN_SECTION.to_string(), name.clone()));
        }
        for name in containers.iter().filter(|n| n.ends_with("-init")) {
            sections.push((INIT_SECTION.to_string(), name.clone()));
        }
        for name in containers
            .iter()
            .filter(|n| !n.ends_with("-main") && !n.ends_with("-init"))
        {
            let header = format!("--- {} CONTAINER ---", name.to_uppercase());
            sections.push((header, name.clone()));
        }

        let mut output = String::new();
        for (header, container) in sections {
            match self
                .cluster
                .read_pod_log(namespace, &pod_name, &container, &LogOptions::default())
                .await
            {
                Ok(log) => {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&header);
                    output.push('\n');
                    output.push_str(log.trim_end());
                    output.push('\n');
                }
                Err(e) => {
                    tracing::warn!(
                        pod = %pod_name,
                        container = %container,
                        error = %e,
                        "Skipping container log"
                    );
                }
            }
        }

        Ok((pod_name, output))
    }
}
