//! pullflow のクラスタ内イメージビルド
//!
//! kaniko / buildkit バックエンドのビルド Job マニフェスト、Job の監視、
//! 決定的なイメージタグ、レジストリ参照、ログビューア向けの
//! ログ・イベントのビューを提供する。

pub mod auth;
pub mod backend;
pub mod cluster;
pub mod error;
pub mod manifest;
pub mod monitor;
pub mod registry;
pub mod stream;
pub mod tag;

pub use auth::{RegistryAuth, RegistryCredentials};
pub use backend::{BackendProfile, BuildInvocation};
pub use cluster::{ClusterClient, KubeCluster, LogOptions};
pub use error::{BuildError, Result};
pub use manifest::{
    BuildJobSpec, RestoreJobSpec, build_job_name, create_build_job, create_restore_job,
    random_suffix, restore_job_name,
};
pub use monitor::{JobMonitor, JobOutcome, JobPhase};
pub use registry::{HttpRegistry, ImageRegistry};
pub use stream::{EventSummary, LogStreamDescriptor, job_events, log_stream_descriptor};
pub use tag::{
    image_reference, image_tag, init_image_tag, short_sha, split_image_tag, validate_tag,
};
