pub mod deploy;
pub mod logs;
pub mod manifest;
pub mod render;
pub mod status;
pub mod tokens;
