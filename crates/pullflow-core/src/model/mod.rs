//! データモデル
//!
//! ビルドはデプロイを所有し、デプロイはサービス定義で記述され
//! [`DeployStatus`] を遷移していく。

mod activity;
mod build;
mod defaults;
mod deploy;
mod service;
mod status;

pub use activity::*;
pub use build::*;
pub use defaults::*;
pub use deploy::*;
pub use service::*;
pub use status::*;
