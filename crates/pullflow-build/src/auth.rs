//! レジストリ認証処理
//!
//! Docker の `config.json`（`$DOCKER_CONFIG` または `~/.docker`）を読む。
//! インラインの `auths` エントリを優先し、次に設定された credential helper を使う。

use crate::error::{BuildError, Result};
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default)]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64 エンコードされた `username:password`
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct RegistryAuth {
    config_path: PathBuf,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuth {
    pub fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self { config_path }
    }

    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// レジストリホストの認証情報。匿名アクセスなら `None`
    pub fn credentials_for(&self, registry: &str) -> Result<Option<RegistryCredentials>> {
        if !self.config_path.exists() {
            tracing::debug!("Docker config.json not found at {:?}", self.config_path);
            return Ok(None);
        }

        let config = self.load_docker_config()?;

        let entry = config.auths.get(registry).or_else(|| {
            config
                .auths
                .iter()
                .find(|(key, _)| strip_scheme(key) == registry)
                .map(|(_, entry)| entry)
        });
        if let Some(auth_entry) = entry
            && let Some(auth_b64) = &auth_entry.auth
            && let Some(creds) = decode_auth(auth_b64, registry)?
        {
            tracing::debug!("Found credentials in auths for {}", registry);
            return Ok(Some(creds));
        }

        if let Some(helper) = &config.creds_store {
            tracing::debug!("Trying credential helper: {}", helper);
            match self.get_from_helper(helper, registry) {
                Ok(Some(creds)) => return Ok(Some(creds)),
                Ok(None) => {}
                Err(e) => tracing::debug!("Credential helper failed: {}", e),
            }
        }

        tracing::debug!("No credentials found for {}", registry);
        Ok(None)
    }

    fn load_docker_config(&self) -> Result<DockerConfig> {
        let content =
            std::fs::read_to_string(&self.config_path).map_err(|e| BuildError::AuthFailed {
                registry: self.config_path.display().to_string(),
                message: format!("Failed to read config.json: {}", e),
            })?;

        serde_json::from_str(&content).map_err(|e| BuildError::AuthFailed {
            registry: self.config_path.display().to_string(),
            message: format!("Failed to parse config.json: {}", e),
        })
    }

    fn get_from_helper(&self, helper: &str, registry: &str) -> Result<Option<RegistryCredentials>> {
        let helper_cmd = format!("docker-credential-{}", helper);
        let auth_failed = |message: String| BuildError::AuthFailed {
            registry: registry.to_string(),
            message,
        };

        let mut child = Command::new(&helper_cmd)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| auth_failed(format!("Failed to run {}: {}", helper_cmd, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(registry.as_bytes())
                .map_err(|e| auth_failed(format!("Failed to write to {}: {}", helper_cmd, e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| auth_failed(format!("Credential helper failed: {}", e)))?;

        if !output.status.success() {
            tracing::debug!(
                "Credential helper has nothing for {}: {}",
                registry,
                String::from_utf8_lossy(&output.stderr)
            );
            return Ok(None);
        }

        let response: CredentialResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| auth_failed(format!("Bad credential helper response: {}", e)))?;

        Ok(Some(RegistryCredentials {
            username: response.username,
            password: response.secret,
        }))
    }
}

fn strip_scheme(key: &str) -> &str {
    key.trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(key)
}

fn decode_auth(auth_b64: &str, registry: &str) -> Result<Option<RegistryCredentials>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth_b64)
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Failed to decode auth: {}", e),
        })?;

    let auth_str = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
        registry: registry.to_string(),
        message: format!("Invalid UTF-8 in auth: {}", e),
    })?;

    Ok(auth_str
        .split_once(':')
        .map(|(username, password)| RegistryCredentials {
            username: username.to_string(),
            password: password.to_string(),
        }))
}
