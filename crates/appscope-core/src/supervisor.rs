//! Supervised background workers, one per submitted task.
//!
//! Workers wait for one of a fixed number of slots (one per attached device),
//! run the pipeline under `catch_unwind`, and always leave a terminal status
//! behind: a panic or a store error turns into `failed` unless the task
//! already finished.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{error, info, warn};

use crate::lifecycle::TaskManager;
use crate::model::TaskRecord;

pub const EXECUTION_ERROR_PREFIX: &str = "Task execution error";

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    slots: Arc<Semaphore>,
    workers: Mutex<HashMap<String, watch::Sender<bool>>>,
    idle: Notify,
}

impl Supervisor {
    pub fn new(slots: usize) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                slots: Arc::new(Semaphore::new(slots.max(1))),
                workers: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
        self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> usize {
        self.workers().len()
    }

    /// Starts a worker for `record` and returns immediately.
    pub fn spawn(&self, manager: TaskManager, record: TaskRecord) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.workers().insert(record.task_id.clone(), cancel_tx);

        let supervisor = self.clone();
        tokio::spawn(async move {
            let task_id = record.task_id.clone();
            let permit = match Arc::clone(&supervisor.inner.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(task_id, "worker slots closed; task not started");
                    supervisor.finish(&task_id);
                    return;
                }
            };

            let run = AssertUnwindSafe(manager.run_pipeline(&record, cancel_rx))
                .catch_unwind()
                .await;
            match run {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(task_id, "pipeline aborted: {err}");
                    manager
                        .fail_unless_terminal(&task_id, format!("{EXECUTION_ERROR_PREFIX}: {err}"))
                        .await;
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(task_id, "pipeline panicked: {reason}");
                    manager
                        .fail_unless_terminal(&task_id, format!("{EXECUTION_ERROR_PREFIX}: {reason}"))
                        .await;
                }
            }

            drop(permit);
            supervisor.finish(&task_id);
        });
    }

    /// Raises the cancel flag of a live worker.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.workers().get(task_id) {
            Some(cancel_tx) => {
                cancel_tx.send_replace(true);
                info!(task_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    fn finish(&self, task_id: &str) {
        let mut workers = self.workers();
        workers.remove(task_id);
        if workers.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }

    /// Resolves once no worker is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}
