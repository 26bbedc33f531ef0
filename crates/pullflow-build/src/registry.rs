//! レジストリのマニフェスト参照
//!
//! 「このタグは存在するか」だけに答える。マニフェストへの `HEAD` で十分。
//! `401` には 1 回だけ再試行する: `Bearer` チャレンジならベアラートークン、
//! `Basic` なら config.json の認証情報を使う。

use crate::auth::{RegistryAuth, RegistryCredentials};
use crate::error::{BuildError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use serde::Deserialize;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// `repository` はタグなしの `{registry}/{path}`
    async fn tag_exists(&self, repository: &str, tag: &str) -> Result<bool>;
}

/// Registry v2 HTTP API クライアント
pub struct HttpRegistry {
    http: reqwest::Client,
    auth: RegistryAuth,
}

impl HttpRegistry {
    pub fn new(auth: RegistryAuth) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth,
        }
    }

    async fn head_manifest(
        &self,
        url: &str,
        authorization: Option<&Authorization>,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.head(url).header(ACCEPT, MANIFEST_ACCEPT);
        request = match authorization {
            Some(Authorization::Bearer(token)) => request.bearer_auth(token),
            Some(Authorization::Basic(creds)) => {
                request.basic_auth(&creds.username, Some(&creds.password))
            }
            None => request,
        };
        Ok(request.send().await?)
    }

    async fn authorize(&self, host: &str, challenge: Option<&str>) -> Result<Authorization> {
        let unsupported = || BuildError::AuthFailed {
            registry: host.to_string(),
            message: "unsupported authentication challenge".to_string(),
        };

        let credentials = self.auth.credentials_for(host)?;
        match challenge.and_then(parse_challenge).ok_or_else(unsupported)? {
            Challenge::Bearer(challenge) => {
                let token = self.fetch_token(&challenge, credentials.as_ref()).await?;
                Ok(Authorization::Bearer(token))
            }
            Challenge::Basic => credentials
                .map(Authorization::Basic)
                .ok_or_else(|| BuildError::AuthFailed {
                    registry: host.to_string(),
                    message: "basic auth required but no credentials in config.json".to_string(),
                }),
        }
    }

    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<String> {
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let mut request = self.http.get(&challenge.realm).query(&query);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BuildError::AuthFailed {
                registry: challenge.realm.clone(),
                message: format!("token endpoint returned {}", response.status()),
            });
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| BuildError::AuthFailed {
                registry: challenge.realm.clone(),
                message: "token response carried no token".to_string(),
            })
    }
}

#[async_trait]
impl ImageRegistry for HttpRegistry {
    #[tracing::instrument(skip(self))]
    async fn tag_exists(&self, repository: &str, tag: &str) -> Result<bool> {
        let (host, path) = split_repository(repository)?;
        let url = manifest_url(host, path, tag);

        let mut response = self.head_manifest(&url, None).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let authorization = self.authorize(host, challenge.as_deref()).await?;
            response = self.head_manifest(&url, Some(&authorization)).await?;
        }

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(BuildError::RegistryResponse {
                url,
                status: status.as_u16(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

enum Authorization {
    Bearer(String),
    Basic(RegistryCredentials),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer(BearerChallenge),
    Basic,
}

/// `WWW-Authenticate` ヘッダーのスキーム。それ以外は `None`
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let scheme = header.trim().split(' ').next()?;
    if scheme.eq_ignore_ascii_case("basic") {
        Some(Challenge::Basic)
    } else {
        parse_bearer_challenge(header).map(Challenge::Bearer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// `Bearer realm="...",service="...",scope="..."` をパース
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    // scope の値はカンマを含みうるので `,` ではなく `",` で分割
    for part in params.split("\",") {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

fn split_repository(repository: &str) -> Result<(&str, &str)> {
    match repository.split_once('/') {
        Some((host, path)) if !host.is_empty() && !path.is_empty() => Ok((host, path)),
        _ => Err(BuildError::InvalidConfig(format!(
            "repository '{}' has no registry host",
            repository
        ))),
    }
}

/// ローカルレジストリは http、それ以外は https
pub fn manifest_url(host: &str, path: &str, tag: &str) -> String {
    let scheme = if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    };
    format!("{}://{}/v2/{}/manifests/{}", scheme, host, path, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:org/api:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service.as_deref(), Some("ghcr.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:org/api:pull"));
    }

    #[test]
    fn test_parse_bearer_challenge_with_comma_scope() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth.docker.io/token",scope="repository:lib/api:pull,push""#,
        )
        .unwrap();
        assert_eq!(challenge.scope.as_deref(), Some("repository:lib/api:pull,push"));
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn test_parse_challenge() {
        assert_eq!(parse_bearer_challenge(r#"Basic realm="registry""#), None);
        assert_eq!(parse_challenge(r#"Basic realm="registry""#), Some(Challenge::Basic));
        assert_eq!(parse_challenge("Bearer service=\"x\""), None);
        assert_eq!(parse_challenge("Negotiate"), None);
    }

    #[test]
    fn test_manifest_url() {
        assert_eq!(
            manifest_url("ghcr.io", "org/api", "abc1234-00ff"),
            "https://ghcr.io/v2/org/api/manifests/abc1234-00ff"
        );
        assert_eq!(
            manifest_url("localhost:5000", "api", "dev"),
            "http://localhost:5000/v2/api/manifests/dev"
        );
    }

    #[test]
    fn test_split_repository() {
        assert_eq!(
            split_repository("registry.example.com/team/api").unwrap(),
            ("registry.example.com", "team/api")
        );
        assert!(split_repository("api").is_err());
    }

    /// `ci:s3cret` の Basic 認証の背後で `HEAD /v2/api/manifests/v1` を返す
    async fn basic_auth_registry() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_lowercase();

                // base64("ci:s3cret")
                let response = if !request.contains("authorization: basic y2k6cznjcmv0") {
                    "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"registry\"\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                } else if request.starts_with("head /v2/api/manifests/v1 ") {
                    "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                } else {
                    "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        host
    }

    fn docker_config(dir: &std::path::Path, host: &str) -> RegistryAuth {
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            format!(r#"{{"auths":{{"{}":{{"auth":"Y2k6czNjcmV0"}}}}}}"#, host),
        )
        .unwrap();
        RegistryAuth::with_config_path(path)
    }

    #[tokio::test]
    async fn test_basic_challenge_retries_with_credentials() {
        let host = basic_auth_registry().await;
        let dir = tempfile::tempdir().unwrap();
        let registry = HttpRegistry::new(docker_config(dir.path(), &host));
        let repository = format!("{}/api", host);

        assert!(registry.tag_exists(&repository, "v1").await.unwrap());
        assert!(!registry.tag_exists(&repository, "v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_basic_challenge_without_credentials_fails() {
        let host = basic_auth_registry().await;
        let dir = tempfile::tempdir().unwrap();
        let registry = HttpRegistry::new(RegistryAuth::with_config_path(
            dir.path().join("config.json"),
        ));

        let err = registry
            .tag_exists(&format!("{}/api", host), "v1")
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::AuthFailed { .. }));
    }
}
