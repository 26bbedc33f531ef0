use super::DeployStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 受理された状態遷移 1 件。永続化された順に並ぶ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub deploy_uuid: String,
    pub run_uuid: Option<String>,
    pub status: DeployStatus,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        deploy_uuid: impl Into<String>,
        run_uuid: Option<String>,
        status: DeployStatus,
        message: Option<String>,
    ) -> Self {
        Self {
            deploy_uuid: deploy_uuid.into(),
            run_uuid,
            status,
            message,
            at: Utc::now(),
        }
    }
}
