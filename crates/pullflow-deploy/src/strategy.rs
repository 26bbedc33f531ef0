//! サービスごとのデプロイ戦略

use pullflow_core::{ServiceDefinition, ServiceKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// ビルド済みイメージをそのまま使う
    Passthrough { image: String },
    /// サービスのデータベースにスナップショットをリストア
    DatabaseRestore { snapshot: String },
    /// ビルド不要
    Ready,
    /// Dockerfile のない外部ホストのチャート
    ExternalChart { chart: String },
    /// ソースからイメージをビルド
    SourceBuild,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Passthrough { .. } => "passthrough",
            Self::DatabaseRestore { .. } => "database-restore",
            Self::Ready => "ready",
            Self::ExternalChart { .. } => "external-chart",
            Self::SourceBuild => "source-build",
        }
    }
}

/// 最初にマッチしたルールを採用
pub fn select_strategy(service: &ServiceDefinition, branch: Option<&str>) -> Strategy {
    if let Some(image) = non_empty(service.docker_image.as_deref()) {
        return Strategy::Passthrough {
            image: image.to_string(),
        };
    }

    if let Some(snapshot) = non_empty(service.restore_snapshot.as_deref()) {
        return Strategy::DatabaseRestore {
            snapshot: snapshot.to_string(),
        };
    }

    if service.kind == ServiceKind::Configuration || non_empty(branch).is_none() {
        return Strategy::Ready;
    }

    if let Some(chart) = non_empty(service.helm_chart.as_deref())
        && !service.has_dockerfile()
    {
        return Strategy::ExternalChart {
            chart: chart.to_string(),
        };
    }

    Strategy::SourceBuild
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceDefinition {
        let mut service = ServiceDefinition::new("api");
        service.repository = Some("acme/api".to_string());
        service.dockerfile_path = Some("Dockerfile".to_string());
        service
    }

    #[test]
    fn test_passthrough_wins() {
        let mut svc = service();
        svc.docker_image = Some("nginx:1.27".to_string());
        svc.helm_chart = Some("bitnami/nginx".to_string());
        assert_eq!(
            select_strategy(&svc, Some("main")),
            Strategy::Passthrough {
                image: "nginx:1.27".to_string()
            }
        );
    }

    #[test]
    fn test_no_branch_is_ready() {
        assert_eq!(select_strategy(&service(), None), Strategy::Ready);
        assert_eq!(select_strategy(&service(), Some("  ")), Strategy::Ready);
    }

    #[test]
    fn test_configuration_is_ready() {
        let mut svc = service();
        svc.kind = ServiceKind::Configuration;
        assert_eq!(select_strategy(&svc, Some("main")), Strategy::Ready);
    }

    #[test]
    fn test_chart_without_dockerfile() {
        let mut svc = service();
        svc.dockerfile_path = None;
        svc.helm_chart = Some("bitnami/redis".to_string());
        assert_eq!(
            select_strategy(&svc, Some("main")),
            Strategy::ExternalChart {
                chart: "bitnami/redis".to_string()
            }
        );

        svc.dockerfile_path = Some("Dockerfile".to_string());
        assert_eq!(select_strategy(&svc, Some("main")), Strategy::SourceBuild);
    }

    #[test]
    fn test_restore_snapshot() {
        let mut svc = ServiceDefinition::new("db");
        svc.kind = ServiceKind::Database;
        svc.restore_snapshot = Some("s3://snapshots/app-2026-01-01.dump".to_string());
        assert!(matches!(
            select_strategy(&svc, None),
            Strategy::DatabaseRestore { .. }
        ));
    }

    #[test]
    fn test_source_build() {
        let strategy = select_strategy(&service(), Some("feature-x"));
        assert_eq!(strategy, Strategy::SourceBuild);
        assert_eq!(strategy.name(), "source-build");
    }
}
