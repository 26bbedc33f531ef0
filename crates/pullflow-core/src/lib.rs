//! pullflow-core
//!
//! pullflow の各クレートで共有するデータモデル、エンティティストア、env テンプレート。

pub mod error;
pub mod model;
pub mod store;
pub mod template;

pub use error::{CoreError, Result};
pub use model::*;
pub use store::{DeployStore, MemoryStore, Snapshot};
pub use template::{
    HYPHEN_SENTINEL, NO_DEFAULT_ENV, RenderContext, TemplateRenderer, TokenBuilder, Tokens,
    build_extras, escape_hyphens, restore_hyphens, token_key,
};
