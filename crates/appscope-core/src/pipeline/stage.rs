use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{OutcomeKind, Stage, StageResult, TaskRecord};
use crate::stage_log::StageLogWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Optional stage whose entry point is missing.
    Unavailable,
    NoChanges,
    NotConfigured,
    Cancelled,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Unavailable => "unavailable",
            SkipReason::NoChanges => "no changes",
            SkipReason::NotConfigured => "not configured",
            SkipReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success { detail: String },
    Failure { exit_code: Option<i32>, detail: String },
    Skipped(SkipReason),
}

impl StageOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        StageOutcome::Success {
            detail: detail.into(),
        }
    }

    pub fn failure(exit_code: Option<i32>, detail: impl Into<String>) -> Self {
        StageOutcome::Failure {
            exit_code,
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StageOutcome::Success { .. } => Some(0),
            StageOutcome::Failure { exit_code, .. } => *exit_code,
            StageOutcome::Skipped(_) => None,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            StageOutcome::Success { .. } => OutcomeKind::Success,
            StageOutcome::Failure { .. } => OutcomeKind::Failure,
            StageOutcome::Skipped(_) => OutcomeKind::Skipped,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            StageOutcome::Success { detail } | StageOutcome::Failure { detail, .. } => {
                detail.clone()
            }
            StageOutcome::Skipped(reason) => reason.to_string(),
        }
    }

    /// Status word written to the Stage Log trailer.
    pub fn label(&self) -> String {
        match self {
            StageOutcome::Success { .. } => "success".into(),
            StageOutcome::Failure { .. } => "failure".into(),
            StageOutcome::Skipped(reason) => format!("skipped ({reason})"),
        }
    }

    pub fn to_result(
        &self,
        stage: Stage,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> StageResult {
        StageResult {
            stage,
            outcome: self.kind(),
            detail: self.detail(),
            exit_code: self.exit_code(),
            started_at,
            finished_at,
        }
    }
}

/// What a stage sees of the task it runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    pub task_id: String,
    pub package: String,
    pub app_name: String,
}

impl StageContext {
    pub fn for_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            package: record.package.clone(),
            app_name: record.app_name.clone(),
        }
    }

    /// Substitutes `{task_id}`, `{package}` and `{app_name}` in one argument.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{task_id}", &self.task_id)
            .replace("{package}", &self.package)
            .replace("{app_name}", &self.app_name)
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Human label used in messages ("Poker", "GKD", ...).
    fn label(&self) -> &str;

    /// `Err` carries the reason the stage is skipped without being attempted.
    fn available(&self) -> Result<(), SkipReason>;

    /// Printable command for the Stage Log header.
    fn command_line(&self, ctx: &StageContext) -> String;

    async fn execute(&self, ctx: &StageContext, log: &StageLogWriter) -> StageOutcome;
}
