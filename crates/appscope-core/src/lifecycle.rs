use std::sync::Arc;

use appscope_telemetry as telemetry;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{CoreConfig, TtlPolicy};
use crate::error::{StoreError, TaskError};
use crate::model::{
    BatchItemResult, HealthReport, StatusReport, SubmitRequest, Submission, TaskPatch, TaskRecord,
    TaskStatus,
};
use crate::pipeline::PipelineRunner;
use crate::stage_log::StageLogWriter;
use crate::store::{self, TaskStore};
use crate::supervisor::Supervisor;

const CLAIM_ATTEMPTS: usize = 3;
const MAX_PACKAGE_LEN: usize = 255;
const MAX_APP_NAME_LEN: usize = 256;

/// Owns task identity, status transitions and package dedup. Cheap to clone;
/// every clone shares the same store, runner and workers.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: TaskStore,
    ttl_policy: TtlPolicy,
    runner: PipelineRunner,
    supervisor: Supervisor,
}

impl TaskManager {
    pub fn new(store: TaskStore, ttl_policy: TtlPolicy, runner: PipelineRunner, worker_slots: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                ttl_policy,
                runner,
                supervisor: Supervisor::new(worker_slots),
            }),
        }
    }

    pub fn from_config(config: &CoreConfig) -> Result<Self, StoreError> {
        let kv = store::open(&config.store_url, config.store_password.as_deref())?;
        Ok(Self::new(
            TaskStore::new(kv, config.task_ttl),
            config.ttl_policy,
            PipelineRunner::from_config(config),
            config.worker_slots,
        ))
    }

    pub fn stage_log(&self) -> &StageLogWriter {
        self.inner.runner.log()
    }

    /// Returns the live task for the package if there is one; otherwise
    /// creates a queued task, claims the package and starts its worker.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, TaskError> {
        let request = validate(request)?;
        let store = &self.inner.store;

        if let Some(task_id) = self.find_by_package(&request.package).await? {
            info!(task_id, package = %request.package, "reusing live task");
            return Ok(Submission {
                task_id,
                is_new: false,
            });
        }

        for _ in 0..CLAIM_ATTEMPTS {
            let record = TaskRecord::new(
                Uuid::new_v4().to_string(),
                request.package.clone(),
                request.app_name.clone(),
                request.timestamp.clone(),
            );
            store.put(&record).await?;

            if store.claim_index(&record.package, &record.task_id).await? {
                let task_id = record.task_id.clone();
                info!(task_id, package = %record.package, "task submitted");
                telemetry::task_event("task.submitted", &task_id, &[("package", record.package.as_str())]);
                self.inner.supervisor.spawn(self.clone(), record);
                return Ok(Submission {
                    task_id,
                    is_new: true,
                });
            }

            // Another submission claimed the package between lookup and claim.
            store.delete(&record.task_id).await?;
            if let Some(task_id) = self.find_by_package(&request.package).await? {
                return Ok(Submission {
                    task_id,
                    is_new: false,
                });
            }
        }
        Err(TaskError::StoreUnavailable(format!(
            "could not claim package {}",
            request.package
        )))
    }

    /// Submits each item in order, one at a time. A failing item is
    /// reported in place and does not stop the batch.
    pub async fn submit_batch(&self, requests: Vec<SubmitRequest>) -> Vec<BatchItemResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let package = request.package.clone();
            let result = match self.submit(request).await {
                Ok(submission) => BatchItemResult {
                    package,
                    message: if submission.is_new {
                        "Task submitted".into()
                    } else {
                        "Task already exists".into()
                    },
                    task_id: Some(submission.task_id),
                    is_new: submission.is_new,
                    success: true,
                },
                Err(err) => BatchItemResult {
                    package,
                    task_id: None,
                    is_new: false,
                    success: false,
                    message: err.to_string(),
                },
            };
            results.push(result);
        }
        results
    }

    /// Live task id for `package`. An index entry whose record is gone is
    /// removed, unless it was re-claimed meanwhile.
    pub async fn find_by_package(&self, package: &str) -> Result<Option<String>, TaskError> {
        let store = &self.inner.store;
        let Some(task_id) = store.get_index(package).await? else {
            return Ok(None);
        };
        if store.get(&task_id).await?.is_some() {
            return Ok(Some(task_id));
        }
        if store.delete_index_if(package, &task_id).await? {
            info!(task_id, package, "dropped stale package index");
        }
        Ok(None)
    }

    pub async fn get_status(&self, task_id: &str) -> StatusReport {
        telemetry::task_event("task.status_queried", task_id, &[]);
        match self.inner.store.get(task_id).await {
            Ok(Some(record)) => StatusReport::Task(record),
            Ok(None) => StatusReport::NotFound {
                task_id: task_id.to_string(),
            },
            Err(err) => StatusReport::StoreUnavailable {
                task_id: task_id.to_string(),
                reason: err.to_string(),
            },
        }
    }

    /// Read-modify-write of one record. Only the task's own worker calls
    /// this, so there is no concurrent writer to lose updates to.
    pub async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<TaskRecord, TaskError> {
        let store = &self.inner.store;
        let mut record = store
            .get(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        record
            .apply(patch)
            .map_err(|(from, to)| TaskError::InvalidTransition { from, to })?;

        match self.inner.ttl_policy {
            TtlPolicy::Refresh => {
                store.put(&record).await?;
                if store.get_index(&record.package).await?.as_deref() == Some(task_id) {
                    store.put_index(&record.package, task_id).await?;
                }
            }
            TtlPolicy::Fixed => {
                if !store.put_keep_ttl(&record).await? {
                    return Err(TaskError::NotFound(task_id.to_string()));
                }
            }
        }
        Ok(record)
    }

    pub async fn list_all(&self) -> Result<Vec<String>, TaskError> {
        Ok(self.inner.store.list_task_ids().await?)
    }

    /// Records of every live task; ids that expire mid-listing are skipped.
    pub async fn list_records(&self) -> Result<Vec<TaskRecord>, TaskError> {
        let mut records = Vec::new();
        for task_id in self.list_all().await? {
            if let Some(record) = self.inner.store.get(&task_id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Removes the record and its package index entry. A running worker is
    /// asked to stop; its further updates find no record.
    pub async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        let store = &self.inner.store;
        let record = store.get(task_id).await?;
        if let Some(record) = &record {
            store.delete_index_if(&record.package, task_id).await?;
        }
        let deleted = store.delete(task_id).await?;
        self.inner.supervisor.cancel(task_id);
        if deleted {
            info!(task_id, "task deleted");
        }
        Ok(deleted || record.is_some())
    }

    /// Asks the task's worker to stop before its next stage.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, TaskError> {
        let record = self
            .inner
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        Ok(self.inner.supervisor.cancel(task_id))
    }

    /// Store reachability only.
    pub async fn health_check(&self) -> bool {
        match self.inner.store.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!("health check failed: {err}");
                false
            }
        }
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            healthy: self.health_check().await,
            store_backend: self.inner.store.backend_name(),
            active_workers: self.active_workers(),
            checked_at: Utc::now(),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.inner.supervisor.active()
    }

    pub async fn wait_idle(&self) {
        self.inner.supervisor.wait_idle().await
    }

    pub(crate) async fn run_pipeline(
        &self,
        record: &TaskRecord,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), TaskError> {
        self.inner.runner.run(self, record, cancel).await
    }

    /// Last-resort write from the supervisor. Never overrides a terminal
    /// status; failures here are only logged.
    pub(crate) async fn fail_unless_terminal(&self, task_id: &str, message: String) {
        match self.inner.store.get(task_id).await {
            Ok(Some(record)) if record.status.is_terminal() => {
                warn!(task_id, status = %record.status, "fault after terminal status: {message}");
            }
            Ok(Some(_)) => {
                let patch = TaskPatch::new().status(TaskStatus::Failed).message(message);
                match self.update(task_id, patch).await {
                    Ok(record) => {
                        telemetry::task_event("task.failed", task_id, &[("message", record.message.as_str())]);
                    }
                    Err(err) => warn!(task_id, "could not record task failure: {err}"),
                }
            }
            Ok(None) => warn!(task_id, "task gone before failure could be recorded: {message}"),
            Err(err) => warn!(task_id, "could not record task failure ({message}): {err}"),
        }
    }
}

fn validate(request: SubmitRequest) -> Result<SubmitRequest, TaskError> {
    let package = request.package.trim().to_string();
    if package.is_empty() {
        return Err(TaskError::InvalidRequest("package is required".into()));
    }
    if package.len() > MAX_PACKAGE_LEN
        || !package
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(TaskError::InvalidRequest(format!("malformed package: {package}")));
    }
    let app_name = request.app_name.trim().to_string();
    if app_name.is_empty() {
        return Err(TaskError::InvalidRequest("app_name is required".into()));
    }
    if app_name.chars().count() > MAX_APP_NAME_LEN || app_name.chars().any(char::is_control) {
        return Err(TaskError::InvalidRequest("malformed app_name".into()));
    }
    let timestamp = request
        .timestamp
        .map(|ts| ts.trim().to_string())
        .filter(|ts| !ts.is_empty());
    Ok(SubmitRequest {
        package,
        app_name,
        timestamp,
    })
}
