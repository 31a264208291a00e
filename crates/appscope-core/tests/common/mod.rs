#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use appscope_core::model::Stage;
use appscope_core::pipeline::stage::{SkipReason, StageContext, StageExecutor, StageOutcome};
use appscope_core::pipeline::PipelineRunner;
use appscope_core::stage_log::StageLogWriter;
use appscope_core::error::StoreResult;
use appscope_core::store::{KvStore, MemoryKv, TaskStore, TASK_PREFIX};
use appscope_core::{StoreError, TaskManager, TtlPolicy};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

/// Scripted stage: counts calls and returns a fixed outcome, optionally after
/// a delay, a gate, or a panic.
pub struct FakeStage {
    stage: Stage,
    label: &'static str,
    availability: Result<(), SkipReason>,
    outcome: StageOutcome,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    panics: bool,
    pub started: Arc<Notify>,
    calls: AtomicUsize,
}

impl FakeStage {
    pub fn new(stage: Stage, label: &'static str, outcome: StageOutcome) -> Self {
        Self {
            stage,
            label,
            availability: Ok(()),
            outcome,
            delay: None,
            gate: None,
            panics: false,
            started: Arc::new(Notify::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn ok(stage: Stage, label: &'static str) -> Self {
        Self::new(stage, label, StageOutcome::success("exit code 0"))
    }

    pub fn unavailable(mut self, reason: SkipReason) -> Self {
        self.availability = Err(reason);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for FakeStage {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn label(&self) -> &str {
        self.label
    }

    fn available(&self) -> Result<(), SkipReason> {
        self.availability
    }

    fn command_line(&self, ctx: &StageContext) -> String {
        format!("fake-{} {}", self.stage, ctx.package)
    }

    async fn execute(&self, ctx: &StageContext, log: &StageLogWriter) -> StageOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        log.append(&ctx.task_id, &format!("[stdout] {} running for {}", self.label, ctx.package));
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics {
            panic!("{} crashed", self.label);
        }
        self.outcome.clone()
    }
}

/// Memory store that can be taken offline, or made to drop the next few
/// task record writes.
#[derive(Default)]
pub struct FlakyKv {
    inner: MemoryKv,
    down: AtomicBool,
    failing_record_writes: AtomicUsize,
}

impl FlakyKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_record_writes(&self, count: usize) {
        self.failing_record_writes.store(count, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }

    fn check_write(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        let consumed = key.starts_with(TASK_PREFIX)
            && self
                .failing_record_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if consumed {
            return Err(StoreError::Unavailable("write timed out".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FlakyKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_write(key)?;
        self.inner.set_ex(key, value, ttl).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_write(key)?;
        self.inner.set_nx_ex(key, value, ttl).await
    }

    async fn set_keep_ttl(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.check_write(key)?;
        self.inner.set_keep_ttl(key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete_if_eq(key, expected).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.scan_prefix(prefix).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    fn backend_name(&self) -> &'static str {
        "flaky-memory"
    }
}

pub struct Harness {
    pub manager: TaskManager,
    pub primary: Arc<FakeStage>,
    pub secondary: Arc<FakeStage>,
    pub publish: Arc<FakeStage>,
    pub logs: TempDir,
}

pub struct HarnessBuilder {
    primary: FakeStage,
    secondary: FakeStage,
    publish: FakeStage,
    ttl: Duration,
    policy: TtlPolicy,
    kv: Option<Arc<dyn KvStore>>,
}

impl HarnessBuilder {
    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn primary(mut self, stage: FakeStage) -> Self {
        self.primary = stage;
        self
    }

    pub fn secondary(mut self, stage: FakeStage) -> Self {
        self.secondary = stage;
        self
    }

    pub fn publish(mut self, stage: FakeStage) -> Self {
        self.publish = stage;
        self
    }

    pub fn ttl(mut self, ttl: Duration, policy: TtlPolicy) -> Self {
        self.ttl = ttl;
        self.policy = policy;
        self
    }

    pub fn build(self) -> Harness {
        let logs = tempfile::tempdir().unwrap();
        let primary = Arc::new(self.primary);
        let secondary = Arc::new(self.secondary);
        let publish = Arc::new(self.publish);
        let runner = PipelineRunner::new(
            primary.clone(),
            secondary.clone(),
            publish.clone(),
            StageLogWriter::new(logs.path()),
        );
        let kv = self.kv.unwrap_or_else(|| Arc::new(MemoryKv::new()));
        let store = TaskStore::new(kv, self.ttl);
        Harness {
            manager: TaskManager::new(store, self.policy, runner, 1),
            primary,
            secondary,
            publish,
            logs,
        }
    }
}

/// Every stage succeeds; publish reports a pull request.
pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        primary: FakeStage::ok(Stage::Primary, "Poker"),
        secondary: FakeStage::ok(Stage::Secondary, "GKD"),
        publish: FakeStage::new(
            Stage::Publish,
            "Publish",
            StageOutcome::success("pull request #1 https://example.test/pull/1"),
        ),
        ttl: Duration::from_secs(86_400),
        policy: TtlPolicy::Refresh,
        kv: None,
    }
}
