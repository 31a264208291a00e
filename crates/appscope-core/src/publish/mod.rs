//! Publishing collected results to the rules repository.

mod github;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::PublishConfig;
use crate::model::Stage;
use crate::pipeline::stage::{SkipReason, StageContext, StageExecutor, StageOutcome};
use crate::stage_log::StageLogWriter;

pub use self::github::GitHubPublisher;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PublishError {
    #[error("publish conflict: {0}")]
    Conflict(String),
    #[error("git {command} failed: {detail}")]
    Git { command: String, detail: String },
    #[error("GitHub API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("GitHub request failed: {0}")]
    Transport(String),
    #[error("publish not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub branch: String,
    pub base: String,
    pub existed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushInfo {
    pub branch: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestInfo {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineInfo {
    pub workflow: String,
    pub git_ref: String,
}

/// Remote side of the publish stage. Each step can fail on its own; the
/// flow surfaces the first failure and does not roll back earlier steps.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn has_changes(&self) -> Result<bool, PublishError>;
    async fn create_branch(&self, name: &str, base: &str) -> Result<BranchInfo, PublishError>;
    async fn commit_all(&self, message: &str) -> Result<(), PublishError>;
    async fn push(&self, name: &str) -> Result<PushInfo, PublishError>;
    async fn open_pull_request(
        &self,
        name: &str,
        base: &str,
        title: &str,
    ) -> Result<PullRequestInfo, PublishError>;
    async fn trigger_pipeline(&self, git_ref: &str) -> Result<PipelineInfo, PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishReport {
    NoChanges,
    Published {
        branch: String,
        pull_request: PullRequestInfo,
        pipeline: PipelineInfo,
    },
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub base_branch: String,
    pub branch_prefix: String,
}

impl PublishSettings {
    pub fn branch_for(&self, package: &str) -> String {
        format!("{}{}", self.branch_prefix, package)
    }
}

impl From<&PublishConfig> for PublishSettings {
    fn from(config: &PublishConfig) -> Self {
        Self {
            base_branch: config.base_branch.clone(),
            branch_prefix: config.branch_prefix.clone(),
        }
    }
}

/// Runs the change check, then branch, commit, push, pull request and the
/// release hook, stopping at the first failing step.
pub async fn publish(
    publisher: &dyn Publisher,
    settings: &PublishSettings,
    ctx: &StageContext,
    log: &StageLogWriter,
) -> Result<PublishReport, PublishError> {
    let task_id = ctx.task_id.as_str();
    if !publisher.has_changes().await? {
        log.append(task_id, "[publish] working tree clean; nothing to publish");
        return Ok(PublishReport::NoChanges);
    }

    let branch = settings.branch_for(&ctx.package);
    let base = settings.base_branch.as_str();
    let info = publisher.create_branch(&branch, base).await?;
    log.append(
        task_id,
        &format!(
            "[publish] branch {} from {} ({})",
            info.branch,
            info.base,
            if info.existed { "reset" } else { "created" }
        ),
    );

    publisher
        .commit_all(&format!("Add rules for {} ({})", ctx.app_name, ctx.package))
        .await?;
    log.append(task_id, "[publish] committed changes");

    let pushed = publisher.push(&branch).await?;
    log.append(task_id, &format!("[publish] pushed {}", pushed.branch));

    let title = format!("{} ({})", ctx.app_name, ctx.package);
    let pull_request = publisher.open_pull_request(&branch, base, &title).await?;
    log.append(
        task_id,
        &format!("[publish] opened pull request #{} {}", pull_request.number, pull_request.url),
    );

    let pipeline = publisher.trigger_pipeline(base).await?;
    log.append(
        task_id,
        &format!("[publish] triggered {} on {}", pipeline.workflow, pipeline.git_ref),
    );
    info!(task_id, branch = %branch, pr = pull_request.number, "published");

    Ok(PublishReport::Published {
        branch,
        pull_request,
        pipeline,
    })
}

/// The publish step as a pipeline stage. Without a publisher it is skipped
/// as not configured.
pub struct PublishStage {
    publisher: Option<Arc<dyn Publisher>>,
    settings: PublishSettings,
}

impl PublishStage {
    pub fn new(publisher: Option<Arc<dyn Publisher>>, settings: PublishSettings) -> Self {
        Self {
            publisher,
            settings,
        }
    }
}

#[async_trait]
impl StageExecutor for PublishStage {
    fn stage(&self) -> Stage {
        Stage::Publish
    }

    fn label(&self) -> &str {
        "Publish"
    }

    fn available(&self) -> Result<(), SkipReason> {
        match self.publisher {
            Some(_) => Ok(()),
            None => Err(SkipReason::NotConfigured),
        }
    }

    fn command_line(&self, ctx: &StageContext) -> String {
        format!(
            "publish {} -> {}",
            self.settings.branch_for(&ctx.package),
            self.settings.base_branch
        )
    }

    async fn execute(&self, ctx: &StageContext, log: &StageLogWriter) -> StageOutcome {
        let Some(publisher) = self.publisher.as_deref() else {
            return StageOutcome::Skipped(SkipReason::NotConfigured);
        };
        match publish(publisher, &self.settings, ctx, log).await {
            Ok(PublishReport::NoChanges) => StageOutcome::Skipped(SkipReason::NoChanges),
            Ok(PublishReport::Published { pull_request, .. }) => {
                StageOutcome::success(format!("pull request #{} {}", pull_request.number, pull_request.url))
            }
            Err(err) => {
                log.append(&ctx.task_id, &format!("[publish] {err}"));
                StageOutcome::failure(None, err.to_string())
            }
        }
    }
}
