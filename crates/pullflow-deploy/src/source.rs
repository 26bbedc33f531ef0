//! ソース管理の参照

use crate::error::{DeployError, Result};
use async_trait::async_trait;
use pullflow_config::GithubSettings;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// `branch` の先頭コミット。ブランチがなければ `None`
    async fn latest_commit_sha(&self, owner: &str, repo: &str, branch: &str)
    -> Result<Option<String>>;

    /// クローン用コンテナが使う短命の認証情報
    async fn clone_token(&self, owner: &str, repo: &str) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

/// GitHub REST API クライアント
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_settings(settings: &GithubSettings) -> Self {
        Self::new(settings.api_url.clone(), settings.token())
    }

    fn branch_url(&self, owner: &str, repo: &str, branch: &str) -> String {
        format!(
            "{}/repos/{}/{}/branches/{}",
            self.api_url, owner, repo, branch
        )
    }
}

#[async_trait]
impl SourceControl for GithubClient {
    #[tracing::instrument(skip(self))]
    async fn latest_commit_sha(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<String>> {
        let mut request = self
            .http
            .get(self.branch_url(owner, repo, branch))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, "pullflow");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeployError::SourceControl(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: BranchResponse = response
                    .json()
                    .await
                    .map_err(|e| DeployError::SourceControl(e.to_string()))?;
                Ok(Some(body.commit.sha))
            }
            status => Err(DeployError::SourceControl(format!(
                "GET branch {}/{}@{} returned {}",
                owner, repo, branch, status
            ))),
        }
    }

    async fn clone_token(&self, _owner: &str, _repo: &str) -> Result<Option<String>> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_url() {
        let client = GithubClient::new("https://api.github.com/", None);
        assert_eq!(
            client.branch_url("acme", "api", "feature-x"),
            "https://api.github.com/repos/acme/api/branches/feature-x"
        );
    }

    #[test]
    fn test_branch_response_shape() {
        let body: BranchResponse = serde_json::from_str(
            r#"{"name":"main","commit":{"sha":"0123456789abcdef","url":"https://x"},"protected":false}"#,
        )
        .unwrap();
        assert_eq!(body.commit.sha, "0123456789abcdef");
    }
}
