use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const INITIAL_MESSAGE: &str = "Waiting...";

// Partial progress never reaches 1.0; that value is reserved for `completed`.
const MAX_PARTIAL_PROGRESS: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    /// Forward-only: `queued -> running -> {completed|failed}`. Re-stating the
    /// current status is allowed so message-only updates can carry it.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self == next || (!self.is_terminal() && next.rank() > self.rank())
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Primary,
    Secondary,
    Publish,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Primary => "primary",
            Stage::Secondary => "secondary",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Success,
    Failure,
    Skipped,
}

/// One attempted (or skipped) pipeline stage, as persisted on the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: OutcomeKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub package: String,
    pub app_name: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stages: Vec<StageResult>,
}

impl TaskRecord {
    pub fn new(task_id: String, package: String, app_name: String, timestamp: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            package,
            app_name,
            status: TaskStatus::Queued,
            progress: 0.0,
            message: INITIAL_MESSAGE.to_string(),
            log_path: None,
            timestamp,
            created_at: now,
            updated_at: now,
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().rev().find(|result| result.stage == stage)
    }

    /// Merges `patch` into the record. Rejects status regressions; everything
    /// else is normalised rather than refused.
    pub fn apply(&mut self, patch: TaskPatch) -> Result<(), (TaskStatus, TaskStatus)> {
        if let Some(next) = patch.status {
            if !self.status.can_transition_to(next) {
                return Err((self.status, next));
            }
            self.status = next;
        }
        if let Some(progress) = patch.progress {
            if progress.is_finite() {
                self.progress = self.progress.max(progress.clamp(0.0, 1.0));
            }
        }
        self.progress = match self.status {
            TaskStatus::Queued => 0.0,
            TaskStatus::Completed => 1.0,
            TaskStatus::Running | TaskStatus::Failed => self.progress.min(MAX_PARTIAL_PROGRESS),
        };
        if let Some(message) = patch.message {
            self.message = message;
        }
        if self.log_path.is_none() {
            self.log_path = patch.log_path;
        }
        if let Some(result) = patch.stage {
            self.stages.push(result);
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Partial update issued by the pipeline worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub log_path: Option<String>,
    pub stage: Option<StageResult>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn log_path(mut self, log_path: impl Into<String>) -> Self {
        self.log_path = Some(log_path.into());
        self
    }

    pub fn stage(mut self, result: StageResult) -> Self {
        self.stage = Some(result);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub package: String,
    pub app_name: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl SubmitRequest {
    pub fn new(package: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            app_name: app_name.into(),
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub task_id: String,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItemResult {
    pub package: String,
    pub task_id: Option<String>,
    pub is_new: bool,
    pub success: bool,
    pub message: String,
}

/// Answer to a status query. Missing tasks and store outages are values, not
/// errors, so pollers always get the same shape back.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    Task(TaskRecord),
    NotFound { task_id: String },
    StoreUnavailable { task_id: String, reason: String },
}

impl StatusReport {
    pub fn record(&self) -> Option<&TaskRecord> {
        match self {
            StatusReport::Task(record) => Some(record),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_backend: &'static str,
    pub active_workers: usize,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord::new("t1".into(), "com.example.app".into(), "Demo".into(), None)
    }

    #[test]
    fn new_record_is_queued_at_zero() {
        let record = record();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.progress, 0.0);
        assert_eq!(record.message, INITIAL_MESSAGE);
        assert!(record.log_path.is_none());
    }

    #[test]
    fn transitions_only_move_forward() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn apply_rejects_regression_and_leaves_record_alone() {
        let mut record = record();
        record.apply(TaskPatch::new().status(TaskStatus::Failed)).unwrap();
        let before = record.clone();
        let err = record
            .apply(TaskPatch::new().status(TaskStatus::Running).message("again"))
            .unwrap_err();
        assert_eq!(err, (TaskStatus::Failed, TaskStatus::Running));
        assert_eq!(record.message, before.message);
        assert_eq!(record.status, TaskStatus::Failed);
    }

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let mut record = record();
        record
            .apply(TaskPatch::new().status(TaskStatus::Running).progress(0.4))
            .unwrap();
        assert_eq!(record.progress, 0.4);
        record.apply(TaskPatch::new().progress(0.1)).unwrap();
        assert_eq!(record.progress, 0.4);
        record.apply(TaskPatch::new().progress(7.0)).unwrap();
        assert!(record.progress < 1.0);
        record.apply(TaskPatch::new().progress(f64::NAN)).unwrap();
        assert!(record.progress < 1.0 && record.progress >= 0.4);
        record.apply(TaskPatch::new().status(TaskStatus::Completed)).unwrap();
        assert_eq!(record.progress, 1.0);
    }

    #[test]
    fn queued_record_stays_at_zero_progress() {
        let mut record = record();
        record.apply(TaskPatch::new().progress(0.5)).unwrap();
        assert_eq!(record.progress, 0.0);
    }

    #[test]
    fn first_log_path_wins() {
        let mut record = record();
        record.apply(TaskPatch::new().log_path("/a.log")).unwrap();
        record.apply(TaskPatch::new().log_path("/b.log")).unwrap();
        assert_eq!(record.log_path.as_deref(), Some("/a.log"));
    }

    #[test]
    fn record_json_uses_lowercase_status() {
        let record = record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "queued");
        assert!(json.get("log_path").is_none());
        let back: TaskRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Completed".parse::<TaskStatus>(), Ok(TaskStatus::Completed));
        assert!("paused".parse::<TaskStatus>().is_err());
    }
}
