//! ログビューア向けのビルドジョブの読み取り専用ビュー
//!
//! [`log_stream_descriptor`] はクライアントがどの Pod とコンテナからストリームするかを
//! 示し、[`job_events`] はジョブのクラスタイベントを要約する。

use crate::cluster::ClusterClient;
use crate::error::{BuildError, Result};
use crate::monitor::{find_job_pod, is_job_complete, is_job_failed};
use k8s_openapi::api::core::v1::{ContainerStatus, Event, Pod};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStreamDescriptor {
    pub status: StreamStatus,
    pub pod_name: Option<String>,
    pub websocket: WebsocketInfo,
    pub containers: Vec<ContainerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebsocketInfo {
    pub endpoint: String,
    pub parameters: StreamParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParameters {
    pub pod_name: Option<String>,
    pub namespace: String,
    pub follow: bool,
    pub tail_lines: i64,
    pub timestamps: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub name: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub name: String,
    pub namespace: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// ビルドジョブのログをどこからどうストリームするか
///
/// Pod が消えたジョブでも `NotFound` の記述子を返すので、
/// 呼び出し側は保存済みログにフォールバックできる。
#[tracing::instrument(skip(cluster, endpoint))]
pub async fn log_stream_descriptor(
    cluster: &dyn ClusterClient,
    namespace: &str,
    job_name: &str,
    endpoint: &str,
    tail_lines: i64,
    container: Option<&str>,
) -> Result<LogStreamDescriptor> {
    let job = cluster.read_job(namespace, job_name).await?;

    let pod = match find_job_pod(cluster, namespace, job_name).await {
        Ok(pod) => Some(pod),
        Err(BuildError::PodNotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let status = match &job {
        None => StreamStatus::NotFound,
        Some(job) if is_job_complete(job) => StreamStatus::Succeeded,
        Some(job) if is_job_failed(job) => StreamStatus::Failed,
        Some(_) if pod.as_ref().is_some_and(pod_is_running) => StreamStatus::Running,
        Some(_) => StreamStatus::Pending,
    };

    let pod_name = pod.as_ref().and_then(|p| p.metadata.name.clone());
    let containers = pod.as_ref().map(pod_containers).unwrap_or_default();
    let follow = matches!(status, StreamStatus::Running | StreamStatus::Pending);

    Ok(LogStreamDescriptor {
        status,
        pod_name: pod_name.clone(),
        websocket: WebsocketInfo {
            endpoint: endpoint.to_string(),
            parameters: StreamParameters {
                pod_name,
                namespace: namespace.to_string(),
                follow,
                tail_lines,
                timestamps: true,
                container: container.map(str::to_string),
            },
        },
        containers,
    })
}

/// 対象がジョブかその Pod のイベント。古い順
pub async fn job_events(
    cluster: &dyn ClusterClient,
    namespace: &str,
    job_name: &str,
) -> Result<Vec<EventSummary>> {
    let mut events = cluster
        .list_events(namespace, &format!("involvedObject.name={}", job_name))
        .await?;

    match find_job_pod(cluster, namespace, job_name).await {
        Ok(pod) => {
            if let Some(pod_name) = pod.metadata.name.as_deref() {
                let pod_events = cluster
                    .list_events(namespace, &format!("involvedObject.name={}", pod_name))
                    .await?;
                events.extend(pod_events);
            }
        }
        Err(BuildError::PodNotFound(_)) => {}
        Err(e) => return Err(e),
    }

    let mut summaries: Vec<EventSummary> = events.iter().map(summarize_event).collect();
    summaries.sort_by(|a, b| sort_key(a).cmp(sort_key(b)));
    Ok(summaries)
}

fn sort_key(event: &EventSummary) -> &str {
    event
        .last_timestamp
        .as_deref()
        .or(event.event_time.as_deref())
        .or(event.first_timestamp.as_deref())
        .unwrap_or("")
}

pub fn summarize_event(event: &Event) -> EventSummary {
    let source = event.source.as_ref().and_then(|s| {
        match (s.component.as_deref(), s.host.as_deref()) {
            (Some(component), Some(host)) => Some(format!("{}/{}", component, host)),
            (Some(component), None) => Some(component.to_string()),
            (None, Some(host)) => Some(host.to_string()),
            (None, None) => None,
        }
    });

    EventSummary {
        name: event.metadata.name.clone().unwrap_or_default(),
        namespace: event.metadata.namespace.clone().unwrap_or_default(),
        reason: event.reason.clone(),
        message: event.message.clone(),
        type_: event.type_.clone(),
        count: event.count,
        first_timestamp: event.first_timestamp.as_ref().map(|t| t.0.to_rfc3339()),
        last_timestamp: event.last_timestamp.as_ref().map(|t| t.0.to_rfc3339()),
        event_time: event.event_time.as_ref().map(|t| t.0.to_rfc3339()),
        source,
    }
}

fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

fn pod_containers(pod: &Pod) -> Vec<ContainerInfo> {
    let status = pod.status.as_ref();
    let statuses: Vec<&ContainerStatus> = status
        .into_iter()
        .flat_map(|s| {
            s.init_container_statuses
                .iter()
                .flatten()
                .chain(s.container_statuses.iter().flatten())
        })
        .collect();

    let spec_names = pod.spec.iter().flat_map(|spec| {
        spec.init_containers
            .iter()
            .flatten()
            .chain(spec.containers.iter())
            .map(|c| c.name.clone())
    });

    spec_names
        .map(|name| {
            let state = statuses
                .iter()
                .find(|s| s.name == name)
                .map(|s| container_state(s))
                .unwrap_or("waiting");
            ContainerInfo {
                name,
                state: state.to_string(),
            }
        })
        .collect()
}

fn container_state(status: &ContainerStatus) -> &'static str {
    match status.state.as_ref() {
        Some(state) if state.running.is_some() => "running",
        Some(state) if state.terminated.is_some() => "terminated",
        _ => "waiting",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LogOptions;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::batch::v1::{Job, JobStatus};
    use k8s_openapi::api::core::v1::{
        ConfigMap, Container, ContainerState, ContainerStateRunning, ContainerStateTerminated,
        EventSource, Namespace, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    struct FakeCluster {
        job: Option<Job>,
        pod: Option<Pod>,
        events: Vec<Event>,
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
            Ok(namespace.clone())
        }
        async fn read_namespace(&self, _name: &str) -> Result<Option<Namespace>> {
            Ok(None)
        }
        async fn create_job(&self, _namespace: &str, job: &Job) -> Result<Job> {
            Ok(job.clone())
        }
        async fn read_job(&self, _namespace: &str, _name: &str) -> Result<Option<Job>> {
            Ok(self.job.clone())
        }
        async fn list_jobs(&self, _namespace: &str, _selector: &str) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }
        async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
            Ok(self.pod.iter().cloned().collect())
        }
        async fn read_pod_log(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: &str,
            _options: &LogOptions,
        ) -> Result<String> {
            Ok(String::new())
        }
        async fn create_config_map(
            &self,
            _namespace: &str,
            config_map: &ConfigMap,
        ) -> Result<ConfigMap> {
            Ok(config_map.clone())
        }
        async fn list_events(&self, _namespace: &str, selector: &str) -> Result<Vec<Event>> {
            let name = selector.trim_start_matches("involvedObject.name=");
            Ok(self
                .events
                .iter()
                .filter(|e| e.involved_object.name.as_deref() == Some(name))
                .cloned()
                .collect())
        }
    }

    fn running_pod() -> Pod {
        let status = |name: &str, state: ContainerState| ContainerStatus {
            name: name.to_string(),
            state: Some(state),
            ..Default::default()
        };
        Pod {
            metadata: ObjectMeta {
                name: Some("api-build-x1-pod".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                init_containers: Some(vec![Container {
                    name: "git-clone".to_string(),
                    ..Default::default()
                }]),
                containers: vec![Container {
                    name: "kaniko-main".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                init_container_statuses: Some(vec![status(
                    "git-clone",
                    ContainerState {
                        terminated: Some(ContainerStateTerminated::default()),
                        ..Default::default()
                    },
                )]),
                container_statuses: Some(vec![status(
                    "kaniko-main",
                    ContainerState {
                        running: Some(ContainerStateRunning::default()),
                        ..Default::default()
                    },
                )]),
                ..Default::default()
            }),
        }
    }

    fn event(name: &str, object: &str, reason: &str, minute: u32) -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("env-abc123".to_string()),
                ..Default::default()
            },
            involved_object: k8s_openapi::api::core::v1::ObjectReference {
                name: Some(object.to_string()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            type_: Some("Normal".to_string()),
            count: Some(1),
            last_timestamp: Some(Time(Utc.with_ymd_and_hms(2026, 1, 1, 12, minute, 0).unwrap())),
            source: Some(EventSource {
                component: Some("job-controller".to_string()),
                host: None,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_descriptor_for_running_job() {
        let cluster = FakeCluster {
            job: Some(Job::default()),
            pod: Some(running_pod()),
            events: Vec::new(),
        };

        let descriptor = log_stream_descriptor(
            &cluster,
            "env-abc123",
            "api-build-x1",
            "/api/logs/stream",
            500,
            Some("kaniko-main"),
        )
        .await
        .unwrap();

        assert_eq!(descriptor.status, StreamStatus::Running);
        assert_eq!(descriptor.pod_name.as_deref(), Some("api-build-x1-pod"));
        assert!(descriptor.websocket.parameters.follow);
        assert_eq!(
            descriptor.containers,
            vec![
                ContainerInfo {
                    name: "git-clone".to_string(),
                    state: "terminated".to_string()
                },
                ContainerInfo {
                    name: "kaniko-main".to_string(),
                    state: "running".to_string()
                },
            ]
        );

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["podName"], "api-build-x1-pod");
        assert_eq!(json["websocket"]["parameters"]["tailLines"], 500);
        assert_eq!(json["websocket"]["parameters"]["container"], "kaniko-main");
    }

    #[tokio::test]
    async fn test_descriptor_for_missing_job() {
        let cluster = FakeCluster {
            job: None,
            pod: None,
            events: Vec::new(),
        };

        let descriptor =
            log_stream_descriptor(&cluster, "env-abc123", "gone", "/ws", 100, None)
                .await
                .unwrap();

        assert_eq!(descriptor.status, StreamStatus::NotFound);
        assert_eq!(descriptor.pod_name, None);
        assert!(!descriptor.websocket.parameters.follow);
        assert!(descriptor.containers.is_empty());

        let json = serde_json::to_value(&descriptor).unwrap();
        assert!(json["websocket"]["parameters"].get("container").is_none());
    }

    #[tokio::test]
    async fn test_descriptor_for_finished_job() {
        let cluster = FakeCluster {
            job: Some(Job {
                status: Some(JobStatus {
                    succeeded: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            pod: Some(running_pod()),
            events: Vec::new(),
        };

        let descriptor =
            log_stream_descriptor(&cluster, "env-abc123", "api-build-x1", "/ws", 100, None)
                .await
                .unwrap();
        assert_eq!(descriptor.status, StreamStatus::Succeeded);
        assert!(!descriptor.websocket.parameters.follow);
    }

    #[tokio::test]
    async fn test_job_events_include_pod_events_in_order() {
        let cluster = FakeCluster {
            job: Some(Job::default()),
            pod: Some(running_pod()),
            events: vec![
                event("e2", "api-build-x1-pod", "Pulled", 5),
                event("e1", "api-build-x1", "SuccessfulCreate", 1),
                event("e3", "other-job", "SuccessfulCreate", 2),
            ],
        };

        let events = job_events(&cluster, "env-abc123", "api-build-x1")
            .await
            .unwrap();

        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["e1", "e2"]);
        assert_eq!(events[0].source.as_deref(), Some("job-controller"));

        let json = serde_json::to_value(&events[1]).unwrap();
        assert_eq!(json["type"], "Normal");
        assert_eq!(json["reason"], "Pulled");
        assert!(json.get("firstTimestamp").is_none());
        assert!(json["lastTimestamp"].as_str().unwrap().starts_with("2026-01-01T12:05"));
    }
}
