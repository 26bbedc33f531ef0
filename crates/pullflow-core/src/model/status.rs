//! デプロイ状態のステートマシン

use serde::{Deserialize, Serialize};
use std::fmt;

/// ビルド実行内の 1 デプロイの状態
///
/// ```text
/// QUEUED -> CLONING -> [WAITING] -> BUILDING -> [WAITING] -> BUILT
///    |         |                        |
///    +---------+------------------------+--> ERROR | BUILD_FAILED
///    +--> READY (ビルド不要)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployStatus {
    /// 実行開始時にリセットされた状態。まだ何も起きていない
    #[default]
    Queued,
    /// ビルドするリビジョンを解決中
    Cloning,
    /// 別デプロイのビルド出力を待機中
    Waiting,
    /// バックエンドにビルドをディスパッチ済み
    Building,
    /// イメージ利用可能
    Built,
    /// 外部ホストの成果物。ビルド不要
    Ready,
    /// ビルド前後のオーケストレーションで失敗
    Error,
    /// ビルド自体が失敗
    BuildFailed,
}

impl DeployStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Built | Self::Ready | Self::Error | Self::BuildFailed
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::BuildFailed)
    }

    /// 1 回の実行内で `self` から `next` へ遷移できるか
    ///
    /// 同じ非終端状態への再遷移は許可する。状態メッセージを更新するため
    /// （例: 複数の依存を待っている間）。
    pub fn can_transition_to(self, next: DeployStatus) -> bool {
        use DeployStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next.is_failure() || self == next {
            return true;
        }

        match self {
            Queued => matches!(next, Cloning | Building | Built | Ready),
            Cloning => matches!(next, Waiting | Building | Built),
            Waiting => matches!(next, Building | Built),
            Building => matches!(next, Waiting | Built),
            Built | Ready | Error | BuildFailed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Cloning => "CLONING",
            Self::Waiting => "WAITING",
            Self::Building => "BUILDING",
            Self::Built => "BUILT",
            Self::Ready => "READY",
            Self::Error => "ERROR",
            Self::BuildFailed => "BUILD_FAILED",
        }
    }
}

impl fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
