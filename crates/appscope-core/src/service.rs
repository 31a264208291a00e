//! `TaskService` gRPC surface. Handlers only convert between wire messages and
//! core types; all behavior lives in [`TaskManager`].

use std::path::PathBuf;

use appscope_proto::appscope::v1 as pb;
use appscope_proto::appscope::v1::task_service_server::TaskService;
use appscope_util::ts;
use chrono::{DateTime, Utc};
use tonic::{Request, Response, Status};
use tracing::warn;

use crate::config::CoreConfig;
use crate::export::{self, ExportError};
use crate::lifecycle::TaskManager;
use crate::model::{OutcomeKind, StageResult, StatusReport, SubmitRequest, TaskRecord, TaskStatus};

const DEFAULT_TAIL_LINES: usize = 200;

#[derive(Clone)]
pub struct TaskSvc {
    manager: TaskManager,
    collected_dir: PathBuf,
    exports_dir: PathBuf,
}

impl TaskSvc {
    pub fn new(manager: TaskManager, config: &CoreConfig) -> Self {
        Self {
            manager,
            collected_dir: config.collected_dir.clone(),
            exports_dir: config.exports_dir(),
        }
    }
}

fn required_id(id: Option<pb::Id>, field: &str) -> Result<String, Status> {
    id.map(|id| id.value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Status::invalid_argument(format!("{field} is required")))
}

fn pb_id(value: impl Into<String>) -> pb::Id {
    pb::Id { value: value.into() }
}

fn pb_time(at: DateTime<Utc>) -> pb::Timestamp {
    ts(at.timestamp_millis())
}

fn state_of(status: TaskStatus) -> pb::TaskState {
    match status {
        TaskStatus::Queued => pb::TaskState::Queued,
        TaskStatus::Running => pb::TaskState::Running,
        TaskStatus::Completed => pb::TaskState::Completed,
        TaskStatus::Failed => pb::TaskState::Failed,
    }
}

fn stage_to_pb(result: &StageResult) -> pb::StageResult {
    let outcome = match result.outcome {
        OutcomeKind::Success => pb::StageOutcomeKind::Success,
        OutcomeKind::Failure => pb::StageOutcomeKind::Failure,
        OutcomeKind::Skipped => pb::StageOutcomeKind::Skipped,
    };
    pb::StageResult {
        stage: result.stage.as_str().to_string(),
        outcome: outcome as i32,
        detail: result.detail.clone(),
        has_exit_code: result.exit_code.is_some(),
        exit_code: result.exit_code.unwrap_or_default(),
        started_at: Some(pb_time(result.started_at)),
        finished_at: Some(pb_time(result.finished_at)),
    }
}

fn record_to_pb(record: &TaskRecord) -> pb::TaskStatus {
    pb::TaskStatus {
        task_id: Some(pb_id(&record.task_id)),
        package: record.package.clone(),
        app_name: record.app_name.clone(),
        state: state_of(record.status) as i32,
        progress: record.progress,
        message: record.message.clone(),
        log_path: record.log_path.clone().unwrap_or_default(),
        timestamp: record.timestamp.clone().unwrap_or_default(),
        created_at: Some(pb_time(record.created_at)),
        updated_at: Some(pb_time(record.updated_at)),
        stages: record.stages.iter().map(stage_to_pb).collect(),
    }
}

/// Absent and unreadable tasks keep the regular response shape so pollers can
/// tell "gone" from "store down" without handling errors.
fn report_to_pb(report: StatusReport) -> pb::TaskStatus {
    match report {
        StatusReport::Task(record) => record_to_pb(&record),
        StatusReport::NotFound { task_id } => pb::TaskStatus {
            task_id: Some(pb_id(task_id)),
            state: pb::TaskState::NotFound as i32,
            message: "Task not found".into(),
            ..Default::default()
        },
        StatusReport::StoreUnavailable { task_id, reason } => pb::TaskStatus {
            task_id: Some(pb_id(task_id)),
            state: pb::TaskState::StoreUnavailable as i32,
            message: format!("Store unavailable: {reason}"),
            ..Default::default()
        },
    }
}

fn submit_from_pb(item: pb::SubmitTaskRequest) -> SubmitRequest {
    SubmitRequest {
        package: item.package,
        app_name: item.app_name,
        timestamp: Some(item.timestamp).filter(|ts| !ts.trim().is_empty()),
    }
}

impl From<ExportError> for Status {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::InvalidTaskId(_) => Status::invalid_argument(err.to_string()),
            ExportError::MissingSource(_) => Status::not_found(err.to_string()),
            ExportError::NotADirectory(_) | ExportError::Empty(_) => {
                Status::failed_precondition(err.to_string())
            }
            ExportError::Io(_) | ExportError::Zip(_) => Status::internal(err.to_string()),
        }
    }
}

#[tonic::async_trait]
impl TaskService for TaskSvc {
    async fn submit_task(
        &self,
        request: Request<pb::SubmitTaskRequest>,
    ) -> Result<Response<pb::SubmitTaskResponse>, Status> {
        let submission = self.manager.submit(submit_from_pb(request.into_inner())).await?;
        Ok(Response::new(pb::SubmitTaskResponse {
            task_id: Some(pb_id(submission.task_id)),
            is_new: submission.is_new,
        }))
    }

    async fn submit_batch(
        &self,
        request: Request<pb::SubmitBatchRequest>,
    ) -> Result<Response<pb::SubmitBatchResponse>, Status> {
        let items = request.into_inner().items;
        if items.is_empty() {
            return Err(Status::invalid_argument("items is required"));
        }
        let results = self
            .manager
            .submit_batch(items.into_iter().map(submit_from_pb).collect())
            .await;

        let mut response = pb::SubmitBatchResponse::default();
        for item in results {
            match (item.success, item.is_new) {
                (false, _) => response.failed += 1,
                (true, true) => response.submitted += 1,
                (true, false) => response.reused += 1,
            }
            response.results.push(pb::BatchItemResult {
                package: item.package,
                task_id: item.task_id.map(pb_id),
                is_new: item.is_new,
                success: item.success,
                message: item.message,
            });
        }
        Ok(Response::new(response))
    }

    async fn get_task_status(
        &self,
        request: Request<pb::GetTaskStatusRequest>,
    ) -> Result<Response<pb::GetTaskStatusResponse>, Status> {
        let task_id = required_id(request.into_inner().task_id, "task_id")?;
        let report = self.manager.get_status(&task_id).await;
        Ok(Response::new(pb::GetTaskStatusResponse {
            status: Some(report_to_pb(report)),
        }))
    }

    async fn find_task_by_package(
        &self,
        request: Request<pb::FindTaskByPackageRequest>,
    ) -> Result<Response<pb::FindTaskByPackageResponse>, Status> {
        let package = request.into_inner().package.trim().to_string();
        if package.is_empty() {
            return Err(Status::invalid_argument("package is required"));
        }
        let found = self.manager.find_by_package(&package).await?;
        Ok(Response::new(pb::FindTaskByPackageResponse {
            found: found.is_some(),
            task_id: found.map(pb_id),
        }))
    }

    async fn list_tasks(
        &self,
        request: Request<pb::ListTasksRequest>,
    ) -> Result<Response<pb::ListTasksResponse>, Status> {
        if request.into_inner().include_status {
            let records = self.manager.list_records().await?;
            return Ok(Response::new(pb::ListTasksResponse {
                task_ids: records.iter().map(|r| pb_id(&r.task_id)).collect(),
                tasks: records.iter().map(record_to_pb).collect(),
            }));
        }
        let ids = self.manager.list_all().await?;
        Ok(Response::new(pb::ListTasksResponse {
            task_ids: ids.into_iter().map(pb_id).collect(),
            tasks: Vec::new(),
        }))
    }

    async fn delete_task(
        &self,
        request: Request<pb::DeleteTaskRequest>,
    ) -> Result<Response<pb::DeleteTaskResponse>, Status> {
        let task_id = required_id(request.into_inner().task_id, "task_id")?;
        let deleted = self.manager.delete(&task_id).await?;
        Ok(Response::new(pb::DeleteTaskResponse { deleted }))
    }

    async fn cancel_task(
        &self,
        request: Request<pb::CancelTaskRequest>,
    ) -> Result<Response<pb::CancelTaskResponse>, Status> {
        let task_id = required_id(request.into_inner().task_id, "task_id")?;
        let accepted = self.manager.cancel(&task_id).await?;
        Ok(Response::new(pb::CancelTaskResponse { accepted }))
    }

    async fn health_check(
        &self,
        _request: Request<pb::HealthCheckRequest>,
    ) -> Result<Response<pb::HealthCheckResponse>, Status> {
        let report = self.manager.health().await;
        Ok(Response::new(pb::HealthCheckResponse {
            healthy: report.healthy,
            store_backend: report.store_backend.to_string(),
            checked_at: Some(pb_time(report.checked_at)),
            active_workers: u32::try_from(report.active_workers).unwrap_or(u32::MAX),
        }))
    }

    async fn get_task_log(
        &self,
        request: Request<pb::GetTaskLogRequest>,
    ) -> Result<Response<pb::GetTaskLogResponse>, Status> {
        let req = request.into_inner();
        let task_id = required_id(req.task_id, "task_id")?;
        let lines = match req.tail_lines {
            0 => DEFAULT_TAIL_LINES,
            n => n as usize,
        };
        let log = self.manager.stage_log();
        let log_path = log.path_for(&task_id).display().to_string();
        let response = match log.tail(&task_id, lines) {
            Some(lines) => pb::GetTaskLogResponse {
                found: true,
                log_path,
                lines,
            },
            None => pb::GetTaskLogResponse {
                found: false,
                log_path,
                lines: Vec::new(),
            },
        };
        Ok(Response::new(response))
    }

    async fn export_collected_data(
        &self,
        request: Request<pb::ExportCollectedDataRequest>,
    ) -> Result<Response<pb::ExportCollectedDataResponse>, Status> {
        let req = request.into_inner();
        let task_id = required_id(req.task_id, "task_id")?;
        let output = Some(req.output_path.trim())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let collected_dir = self.collected_dir.clone();
        let exports_dir = self.exports_dir.clone();

        let summary = tokio::task::spawn_blocking(move || {
            export::export_collected_data(&collected_dir, &exports_dir, &task_id, output.as_deref())
        })
        .await
        .map_err(|err| {
            warn!("export worker failed: {err}");
            Status::internal(format!("export worker failed: {err}"))
        })??;

        Ok(Response::new(pb::ExportCollectedDataResponse {
            output_path: summary.output_path.display().to_string(),
            file_count: u32::try_from(summary.file_count).unwrap_or(u32::MAX),
            bytes: summary.bytes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stage;

    #[test]
    fn missing_and_unreadable_tasks_keep_the_status_shape() {
        let missing = report_to_pb(StatusReport::NotFound {
            task_id: "t1".into(),
        });
        assert_eq!(missing.state, pb::TaskState::NotFound as i32);
        assert_eq!(missing.task_id.map(|id| id.value).as_deref(), Some("t1"));

        let down = report_to_pb(StatusReport::StoreUnavailable {
            task_id: "t2".into(),
            reason: "connection refused".into(),
        });
        assert_eq!(down.state, pb::TaskState::StoreUnavailable as i32);
        assert!(down.message.contains("connection refused"));
    }

    #[test]
    fn records_carry_stage_results() {
        let mut record = TaskRecord::new("t1".into(), "com.example".into(), "Demo".into(), None);
        let now = Utc::now();
        record.stages.push(StageResult {
            stage: Stage::Primary,
            outcome: OutcomeKind::Failure,
            detail: "boom".into(),
            exit_code: Some(2),
            started_at: now,
            finished_at: now,
        });
        let status = record_to_pb(&record);
        assert_eq!(status.state, pb::TaskState::Queued as i32);
        assert_eq!(status.message, "Waiting...");
        assert_eq!(status.stages.len(), 1);
        assert_eq!(status.stages[0].outcome, pb::StageOutcomeKind::Failure as i32);
        assert!(status.stages[0].has_exit_code);
        assert_eq!(status.stages[0].exit_code, 2);
    }

    #[test]
    fn blank_ids_are_rejected() {
        assert!(required_id(None, "task_id").is_err());
        assert!(required_id(Some(pb_id("  ")), "task_id").is_err());
        assert_eq!(required_id(Some(pb_id(" abc ")), "task_id").unwrap(), "abc");
    }
}
