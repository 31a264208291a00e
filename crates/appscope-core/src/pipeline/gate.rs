//! Gating between stages and folding stage outcomes into task updates.
//!
//! Stages run in order of decreasing value: a later stage can annotate the
//! task message but never undo what an earlier stage produced.

use crate::model::{Stage, TaskPatch, TaskStatus};
use crate::pipeline::stage::{SkipReason, StageOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Run(Stage),
    Finish,
}

pub fn next_step(stage: Stage, outcome: &StageOutcome) -> Next {
    match (stage, outcome) {
        (Stage::Primary, StageOutcome::Success { .. }) => Next::Run(Stage::Secondary),
        (Stage::Secondary, StageOutcome::Success { .. }) => Next::Run(Stage::Publish),
        _ => Next::Finish,
    }
}

/// Task update for `outcome`, or `None` when the task stays as it is.
/// `message` is the task's current message.
pub fn fold(stage: Stage, label: &str, outcome: &StageOutcome, message: &str) -> Option<TaskPatch> {
    match (stage, outcome) {
        (Stage::Primary, StageOutcome::Success { .. }) => Some(
            TaskPatch::new()
                .status(TaskStatus::Completed)
                .progress(1.0)
                .message(format!("{label} task finished")),
        ),
        (Stage::Primary, StageOutcome::Failure { detail, .. }) => {
            let text = if detail.trim().is_empty() {
                format!("{label} process failed")
            } else {
                detail.trim().to_string()
            };
            Some(TaskPatch::new().status(TaskStatus::Failed).message(text))
        }
        (Stage::Primary, StageOutcome::Skipped(SkipReason::Cancelled)) => Some(
            TaskPatch::new()
                .status(TaskStatus::Failed)
                .message(format!("Cancelled before {label}")),
        ),
        (Stage::Primary, StageOutcome::Skipped(reason)) => Some(
            TaskPatch::new()
                .status(TaskStatus::Failed)
                .message(format!("{label} stage {reason}")),
        ),
        (Stage::Secondary, StageOutcome::Failure { detail, .. }) => Some(
            TaskPatch::new().message(format!("Stage 1 completed, but Stage 2 failed: {}", detail.trim())),
        ),
        (Stage::Publish, StageOutcome::Failure { detail, .. }) => Some(TaskPatch::new().message(
            format!("Stage 1 and Stage 2 completed, but Publish failed: {}", detail.trim()),
        )),
        (Stage::Publish, StageOutcome::Success { detail }) => {
            Some(TaskPatch::new().message(format!("{message}; published: {detail}")))
        }
        _ => None,
    }
}
