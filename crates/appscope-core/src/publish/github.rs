use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BranchInfo, PipelineInfo, PublishError, Publisher, PullRequestInfo, PushInfo};
use crate::config::PublishConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const GITHUB_API_VERSION: &str = "2022-11-28";

#[derive(Deserialize)]
struct PullRequestBody {
    number: u64,
    html_url: String,
}

/// Publishes through a local clone (git CLI) and the GitHub REST API.
pub struct GitHubPublisher {
    repo_path: PathBuf,
    owner: String,
    repo: String,
    token: String,
    workflow: String,
    api_base: String,
    http: Client,
}

impl GitHubPublisher {
    pub fn from_config(config: &PublishConfig) -> Result<Self, PublishError> {
        let token = config
            .token
            .clone()
            .ok_or_else(|| PublishError::NotConfigured("APPSCOPE_GITHUB_TOKEN is not set".into()))?;
        if !config.repo_path.is_dir() {
            return Err(PublishError::NotConfigured(format!(
                "repository not found at {}",
                config.repo_path.display()
            )));
        }
        let http = Client::builder()
            .user_agent("appscope-core")
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| PublishError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            repo_path: config.repo_path.clone(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            token,
            workflow: config.workflow.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn git(&self, args: &[&str]) -> Result<String, PublishError> {
        let command = args.join(" ");
        debug!("git {command}");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| PublishError::Git {
                command: command.clone(),
                detail: format!("failed to run git: {e}"),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() { stdout } else { stderr };
        Err(PublishError::Git { command, detail })
    }

    fn repo_url(&self, tail: &str) -> String {
        format!("{}/repos/{}/{}/{tail}", self.api_base, self.owner, self.repo)
    }

    async fn api(
        &self,
        method: Method,
        url: &str,
        body: serde_json::Value,
    ) -> Result<(StatusCode, String), PublishError> {
        let resp = self
            .http
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| PublishError::Transport(format!("failed to read response: {e}")))?;
        Ok((status, text))
    }
}

#[async_trait]
impl Publisher for GitHubPublisher {
    async fn has_changes(&self) -> Result<bool, PublishError> {
        let status = self.git(&["status", "--porcelain"]).await?;
        Ok(!status.trim().is_empty())
    }

    async fn create_branch(&self, name: &str, base: &str) -> Result<BranchInfo, PublishError> {
        self.git(&["fetch", "origin", base]).await?;
        self.git(&["checkout", base]).await?;
        self.git(&["pull", "origin", base]).await?;
        let existed = !self
            .git(&["branch", "--list", name])
            .await?
            .trim()
            .is_empty();
        self.git(&["checkout", "-B", name, base]).await?;
        info!(branch = name, base, existed, "branch ready");
        Ok(BranchInfo {
            branch: name.to_string(),
            base: base.to_string(),
            existed,
        })
    }

    async fn commit_all(&self, message: &str) -> Result<(), PublishError> {
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "-m", message]).await?;
        Ok(())
    }

    async fn push(&self, name: &str) -> Result<PushInfo, PublishError> {
        match self.git(&["push", "--set-upstream", "origin", name]).await {
            Ok(output) => Ok(PushInfo {
                branch: name.to_string(),
                output,
            }),
            Err(PublishError::Git { detail, .. })
                if detail.contains("rejected") || detail.contains("non-fast-forward") =>
            {
                Err(PublishError::Conflict(format!("push of {name} rejected: {detail}")))
            }
            Err(err) => Err(err),
        }
    }

    async fn open_pull_request(
        &self,
        name: &str,
        base: &str,
        title: &str,
    ) -> Result<PullRequestInfo, PublishError> {
        let body = json!({
            "title": title,
            "head": format!("{}:{name}", self.owner),
            "base": base,
            "body": format!("Automated collection results from branch `{name}`."),
        });
        let (status, text) = self.api(Method::POST, &self.repo_url("pulls"), body).await?;
        match status.as_u16() {
            200 | 201 => {
                let pr: PullRequestBody = serde_json::from_str(&text)
                    .map_err(|e| PublishError::Transport(format!("unexpected pull request response: {e}")))?;
                Ok(PullRequestInfo {
                    number: pr.number,
                    url: pr.html_url,
                })
            }
            422 => Err(PublishError::Conflict(format!(
                "pull request for {name} rejected: {}",
                api_message(&text)
            ))),
            code => Err(PublishError::Api {
                status: code,
                body: api_message(&text),
            }),
        }
    }

    async fn trigger_pipeline(&self, git_ref: &str) -> Result<PipelineInfo, PublishError> {
        let url = self.repo_url(&format!("actions/workflows/{}/dispatches", self.workflow));
        let (status, text) = self.api(Method::POST, &url, json!({ "ref": git_ref })).await?;
        if status != StatusCode::NO_CONTENT {
            return Err(PublishError::Api {
                status: status.as_u16(),
                body: api_message(&text),
            });
        }
        Ok(PipelineInfo {
            workflow: self.workflow.clone(),
            git_ref: git_ref.to_string(),
        })
    }
}

/// GitHub error bodies carry a `message`; fall back to the raw text.
fn api_message(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| text.trim().to_string())
}
