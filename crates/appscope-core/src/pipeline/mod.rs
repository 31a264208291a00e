//! The per-task stage sequence: primary collection, secondary enrichment,
//! publish.

pub mod gate;
pub mod process;
pub mod stage;

use std::sync::Arc;

use appscope_telemetry as telemetry;
use chrono::{Local, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::error::TaskError;
use crate::lifecycle::TaskManager;
use crate::model::{Stage, TaskPatch, TaskRecord, TaskStatus};
use crate::publish::{GitHubPublisher, PublishSettings, PublishStage, Publisher};
use crate::stage_log::{SegmentHeader, SegmentTrailer, StageLogWriter};

use self::gate::Next;
use self::process::ProcessStage;
use self::stage::{SkipReason, StageContext, StageExecutor, StageOutcome};

pub const START_MESSAGE: &str = "Engine started";

pub struct PipelineRunner {
    primary: Arc<dyn StageExecutor>,
    secondary: Arc<dyn StageExecutor>,
    publish: Arc<dyn StageExecutor>,
    log: StageLogWriter,
}

impl PipelineRunner {
    pub fn new(
        primary: Arc<dyn StageExecutor>,
        secondary: Arc<dyn StageExecutor>,
        publish: Arc<dyn StageExecutor>,
        log: StageLogWriter,
    ) -> Self {
        Self {
            primary,
            secondary,
            publish,
            log,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        let publisher: Option<Arc<dyn Publisher>> = match GitHubPublisher::from_config(&config.publish) {
            Ok(publisher) => Some(Arc::new(publisher)),
            Err(err) => {
                info!("publish stage disabled: {err}");
                None
            }
        };
        Self::new(
            Arc::new(ProcessStage::from_config(Stage::Primary, &config.collector)),
            Arc::new(ProcessStage::from_config(Stage::Secondary, &config.enricher)),
            Arc::new(PublishStage::new(publisher, PublishSettings::from(&config.publish))),
            StageLogWriter::new(config.logs_dir()),
        )
    }

    pub fn log(&self) -> &StageLogWriter {
        &self.log
    }

    fn executor(&self, stage: Stage) -> &dyn StageExecutor {
        match stage {
            Stage::Primary => self.primary.as_ref(),
            Stage::Secondary => self.secondary.as_ref(),
            Stage::Publish => self.publish.as_ref(),
        }
    }

    /// Runs every stage the gate allows and writes each outcome back through
    /// `manager`. Store failures abort the run with the error.
    pub async fn run(
        &self,
        manager: &TaskManager,
        record: &TaskRecord,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), TaskError> {
        let ctx = StageContext::for_record(record);
        let task_id = ctx.task_id.as_str();
        let log_path = self.log.path_for(task_id).display().to_string();

        let mut current = manager
            .update(
                task_id,
                TaskPatch::new()
                    .status(TaskStatus::Running)
                    .progress(0.0)
                    .message(START_MESSAGE)
                    .log_path(log_path),
            )
            .await?;
        telemetry::task_event("task.started", task_id, &[("package", ctx.package.as_str())]);
        info!(task_id, package = %ctx.package, "pipeline started");

        let mut next = Next::Run(Stage::Primary);
        while let Next::Run(stage) = next {
            let executor = self.executor(stage);
            let started_at = Utc::now();
            let cancelled = *cancel.borrow();
            let outcome = if cancelled {
                self.log.note(task_id, executor.label(), "skipped: cancelled");
                StageOutcome::Skipped(SkipReason::Cancelled)
            } else if let Err(reason) = executor.available() {
                self.log.note(task_id, executor.label(), &format!("skipped: {reason}"));
                StageOutcome::Skipped(reason)
            } else {
                self.attempt(executor, &ctx).await
            };
            let finished_at = Utc::now();

            info!(task_id, stage = %stage, outcome = %outcome.label(), "stage finished");
            telemetry::task_event(
                "task.stage",
                task_id,
                &[("stage", stage.as_str()), ("outcome", outcome.label().as_str())],
            );

            let patch = gate::fold(stage, executor.label(), &outcome, &current.message)
                .unwrap_or_default()
                .stage(outcome.to_result(stage, started_at, finished_at));
            current = manager.update(task_id, patch).await?;
            next = gate::next_step(stage, &outcome);
        }

        match current.status {
            TaskStatus::Completed => {
                telemetry::task_event("task.completed", task_id, &[("message", current.message.as_str())]);
            }
            TaskStatus::Failed => {
                telemetry::task_event("task.failed", task_id, &[("message", current.message.as_str())]);
            }
            status => warn!(task_id, %status, "pipeline ended without a terminal status"),
        }
        info!(task_id, status = %current.status, "pipeline finished");
        Ok(())
    }

    async fn attempt(&self, executor: &dyn StageExecutor, ctx: &StageContext) -> StageOutcome {
        let task_id = ctx.task_id.as_str();
        let command = executor.command_line(ctx);
        let stage_name = format!("{} ({})", executor.label(), executor.stage());
        self.log.create(
            task_id,
            &SegmentHeader {
                stage: &stage_name,
                package: &ctx.package,
                app_name: &ctx.app_name,
                command: &command,
                started_at: Local::now(),
            },
        );
        info!(task_id, "executing: {command}");

        let outcome = executor.execute(ctx, &self.log).await;

        self.log.finalize(
            task_id,
            &SegmentTrailer {
                status: &outcome.label(),
                exit_code: outcome.exit_code(),
                ended_at: Local::now(),
            },
        );
        outcome
    }
}
