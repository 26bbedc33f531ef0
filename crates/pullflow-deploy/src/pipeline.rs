//! 外部 CI パイプライン
//!
//! パイプラインはブラックボックス: ID でトリガーし、落ち着くまでポーリングしてから
//! ログを取得する。進捗として報告される内容は不透明な文字列のまま扱う。

use crate::error::{DeployError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// パイプラインに渡す入力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    pub repository: String,
    pub branch: String,
    pub sha: String,
    pub destination: String,
    pub init_destination: Option<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    pub id: String,
    /// 人が実行を追える場所
    pub url: Option<String>,
}

#[async_trait]
pub trait ExternalPipeline: Send + Sync {
    async fn trigger(&self, pipeline_id: &str, request: &PipelineRequest) -> Result<PipelineRun>;

    async fn state(&self, run_id: &str) -> Result<PipelineState>;

    async fn logs(&self, run_id: &str) -> Result<String>;
}

/// パイプラインの実行が終わるまでポーリング
#[tracing::instrument(skip(pipeline))]
pub async fn wait_for_pipeline(
    pipeline: &dyn ExternalPipeline,
    run_id: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<PipelineState> {
    let deadline = Instant::now() + timeout;

    loop {
        match pipeline.state(run_id).await {
            Ok(state) if state.is_finished() => return Ok(state),
            Ok(state) => tracing::debug!(?state, "Pipeline still running"),
            Err(e) => tracing::warn!(error = %e, "Failed to read pipeline state, retrying"),
        }

        if Instant::now() >= deadline {
            return Err(DeployError::Pipeline(format!(
                "run {} did not finish within {}s",
                run_id,
                timeout.as_secs()
            )));
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPipeline {
        polls: AtomicUsize,
        finish_after: usize,
    }

    #[async_trait]
    impl ExternalPipeline for CountingPipeline {
        async fn trigger(&self, _id: &str, _request: &PipelineRequest) -> Result<PipelineRun> {
            Ok(PipelineRun {
                id: "run-1".to_string(),
                url: None,
            })
        }

        async fn state(&self, _run_id: &str) -> Result<PipelineState> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.finish_after {
                Ok(PipelineState::Succeeded)
            } else {
                Ok(PipelineState::Running)
            }
        }

        async fn logs(&self, _run_id: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_finished() {
        let pipeline = CountingPipeline {
            polls: AtomicUsize::new(0),
            finish_after: 3,
        };
        let state = wait_for_pipeline(
            &pipeline,
            "run-1",
            Duration::from_secs(10),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(state, PipelineState::Succeeded);
        assert_eq!(pipeline.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let pipeline = CountingPipeline {
            polls: AtomicUsize::new(0),
            finish_after: usize::MAX,
        };
        let err = wait_for_pipeline(
            &pipeline,
            "run-1",
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DeployError::Pipeline(_)));
        assert_eq!(err.terminal_status(), pullflow_core::DeployStatus::BuildFailed);
    }
}
