use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ProcessStageConfig;
use crate::model::Stage;
use crate::pipeline::stage::{SkipReason, StageContext, StageExecutor, StageOutcome};
use crate::stage_log::StageLogWriter;

const LOG_CHANNEL_CAPACITY: usize = 512;
const RECENT_LOG_LIMIT: usize = 20;
const MAX_MESSAGE_CHARS: usize = 2000;
// Grandchildren can keep the pipes open after the stage process exits.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

struct LogLine {
    stream: &'static str,
    line: String,
}

/// A stage backed by an external program.
pub struct ProcessStage {
    stage: Stage,
    label: String,
    program: String,
    entry: Option<PathBuf>,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ProcessStage {
    pub fn new(stage: Stage, label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            stage,
            label: label.into(),
            program: program.into(),
            entry: None,
            args: Vec::new(),
            workdir: None,
            timeout: None,
        }
    }

    pub fn from_config(stage: Stage, config: &ProcessStageConfig) -> Self {
        Self {
            stage,
            label: config.label.clone(),
            program: config.program.clone(),
            entry: config.entry.clone(),
            args: config.args.clone(),
            workdir: config.workdir.clone(),
            timeout: config.timeout,
        }
    }

    pub fn entry(mut self, entry: impl Into<PathBuf>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn argv(&self, ctx: &StageContext) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        if let Some(entry) = &self.entry {
            argv.push(entry.display().to_string());
        }
        argv.extend(self.args.iter().map(|arg| ctx.render(arg)));
        argv
    }
}

#[async_trait]
impl StageExecutor for ProcessStage {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn available(&self) -> Result<(), SkipReason> {
        match &self.entry {
            Some(entry) if !entry.exists() => Err(SkipReason::Unavailable),
            _ => Ok(()),
        }
    }

    fn command_line(&self, ctx: &StageContext) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.argv(ctx).into_iter().map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("\"{arg}\"")
            } else {
                arg
            }
        }));
        parts.join(" ")
    }

    async fn execute(&self, ctx: &StageContext, log: &StageLogWriter) -> StageOutcome {
        let task_id = ctx.task_id.as_str();
        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv(ctx))
            .env("APPSCOPE_TASK_ID", &ctx.task_id)
            .env("APPSCOPE_PACKAGE", &ctx.package)
            .env("APPSCOPE_APP_NAME", &ctx.app_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let detail = format!("failed to launch {}: {err}", self.program);
                log.append(task_id, &format!("[error] {detail}"));
                return StageOutcome::failure(None, detail);
            }
        };
        info!(task_id, stage = %self.stage, pid = ?child.id(), "stage process started");

        let (line_tx, mut line_rx) = mpsc::channel::<LogLine>(LOG_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, "stdout", line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, "stderr", line_tx));
        } else {
            drop(line_tx);
        }

        let deadline = self.timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        let expiry = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let mut stdout_tail = VecDeque::with_capacity(RECENT_LOG_LIMIT);
        let mut stderr_tail = VecDeque::with_capacity(RECENT_LOG_LIMIT);
        let mut lines_open = true;
        let mut timed_out = false;

        let status = loop {
            tokio::select! {
                line = line_rx.recv(), if lines_open => {
                    match line {
                        Some(line) => record_line(log, task_id, line, &mut stdout_tail, &mut stderr_tail),
                        None => lines_open = false,
                    }
                }
                result = child.wait() => break result,
                _ = &mut expiry, if !timed_out => {
                    timed_out = true;
                    warn!(task_id, stage = %self.stage, "stage timed out; killing process");
                    log.append(task_id, &format!("[error] {} timed out; killing process", self.label));
                    if let Err(err) = child.start_kill() {
                        warn!(task_id, "failed to kill stage process: {err}");
                    }
                }
            }
        };

        if lines_open {
            let _ = tokio::time::timeout(DRAIN_GRACE, async {
                while let Some(line) = line_rx.recv().await {
                    record_line(log, task_id, line, &mut stdout_tail, &mut stderr_tail);
                }
            })
            .await;
        }

        let status = match status {
            Ok(status) => status,
            Err(err) => {
                return StageOutcome::failure(None, format!("failed to wait for {}: {err}", self.label));
            }
        };
        let code = status.code();

        if timed_out {
            let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
            return StageOutcome::failure(code, format!("{} timed out after {secs}s", self.label));
        }
        if status.success() {
            return StageOutcome::success("exit code 0");
        }

        let tail = if !stderr_tail.is_empty() {
            collect_recent(&stderr_tail)
        } else {
            collect_recent(&stdout_tail)
        };
        let detail = if tail.trim().is_empty() {
            match code {
                Some(code) => format!("{} process failed (exit code {code})", self.label),
                None => format!("{} process failed", self.label),
            }
        } else {
            truncate_message(tail.trim())
        };
        StageOutcome::failure(code, detail)
    }
}

async fn read_lines<R>(reader: R, stream: &'static str, tx: mpsc::Sender<LogLine>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    // Drain to EOF even past undecodable bytes, or the child dies on SIGPIPE.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if !tx.is_closed() {
                    let _ = tx.send(LogLine { stream, line }).await;
                }
            }
            Err(err) => {
                warn!("failed to read stage {stream}: {err}");
                break;
            }
        }
    }
}

fn record_line(
    log: &StageLogWriter,
    task_id: &str,
    line: LogLine,
    stdout_tail: &mut VecDeque<String>,
    stderr_tail: &mut VecDeque<String>,
) {
    log.append(task_id, &format!("[{}] {}", line.stream, line.line));
    let tail = if line.stream == "stderr" {
        stderr_tail
    } else {
        stdout_tail
    };
    append_recent(tail, line.line);
}

fn append_recent(recent: &mut VecDeque<String>, line: String) {
    if recent.len() >= RECENT_LOG_LIMIT {
        recent.pop_front();
    }
    recent.push_back(line);
}

fn collect_recent(recent: &VecDeque<String>) -> String {
    let mut combined = String::new();
    for line in recent {
        combined.push_str(line);
        combined.push('\n');
    }
    combined
}

fn truncate_message(text: &str) -> String {
    let count = text.chars().count();
    if count <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    // Keep the end: the last lines usually name the error.
    let skipped: String = text.chars().skip(count - MAX_MESSAGE_CHARS).collect();
    format!("...{skipped}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StageContext {
        StageContext {
            task_id: "t1".into(),
            package: "com.example.app".into(),
            app_name: "Demo App".into(),
        }
    }

    #[test]
    fn command_line_renders_templates_and_quotes() {
        let stage = ProcessStage::new(Stage::Primary, "Poker", "python3")
            .args(["poker_engine.py", "--pkg", "{package}", "--app", "{app_name}"]);
        assert_eq!(
            stage.command_line(&ctx()),
            "python3 poker_engine.py --pkg com.example.app --app \"Demo App\""
        );
    }

    #[test]
    fn entry_point_gates_availability() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("enrich.py");
        let stage = ProcessStage::new(Stage::Secondary, "GKD", "python3")
            .entry(&entry)
            .args(["{task_id}"]);
        assert_eq!(stage.available(), Err(SkipReason::Unavailable));
        std::fs::write(&entry, "").unwrap();
        assert_eq!(stage.available(), Ok(()));
        assert_eq!(
            stage.command_line(&ctx()),
            format!("python3 {} t1", entry.display())
        );
    }

    #[test]
    fn recent_tail_is_bounded() {
        let mut recent = VecDeque::new();
        for i in 0..(RECENT_LOG_LIMIT + 5) {
            append_recent(&mut recent, format!("l{i}"));
        }
        assert_eq!(recent.len(), RECENT_LOG_LIMIT);
        assert_eq!(recent.front().map(String::as_str), Some("l5"));
    }

    #[test]
    fn long_messages_keep_their_end() {
        let text = "x".repeat(MAX_MESSAGE_CHARS + 10) + "END";
        let message = truncate_message(&text);
        assert!(message.starts_with("..."));
        assert!(message.ends_with("END"));
        assert_eq!(message.chars().count(), MAX_MESSAGE_CHARS + 3);
    }

    #[tokio::test]
    async fn success_streams_output_into_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = StageLogWriter::new(dir.path());
        let stage = ProcessStage::new(Stage::Primary, "Poker", "sh")
            .args(["-c", "echo collecting {package}; echo warn >&2"]);
        let outcome = stage.execute(&ctx(), &log).await;
        assert_eq!(outcome, StageOutcome::success("exit code 0"));
        let text = std::fs::read_to_string(log.path_for("t1")).unwrap();
        assert!(text.contains("[stdout] collecting com.example.app"));
        assert!(text.contains("[stderr] warn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn undecodable_output_does_not_break_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let log = StageLogWriter::new(dir.path());
        let stage = ProcessStage::new(Stage::Primary, "Poker", "sh").args([
            "-c",
            "printf 'bad \\377 byte\\n'; sleep 0.3; echo after; echo done; exit 0",
        ]);
        let outcome = stage.execute(&ctx(), &log).await;
        assert_eq!(outcome, StageOutcome::success("exit code 0"));
        let text = std::fs::read_to_string(log.path_for("t1")).unwrap();
        assert!(text.contains("[stdout] bad \u{FFFD} byte"));
        assert!(text.contains("[stdout] after"));
        assert!(text.contains("[stdout] done"));
    }

    #[tokio::test]
    async fn failure_prefers_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = StageLogWriter::new(dir.path());
        let stage = ProcessStage::new(Stage::Primary, "Poker", "sh")
            .args(["-c", "echo progress; echo device offline >&2; exit 3"]);
        let outcome = stage.execute(&ctx(), &log).await;
        assert_eq!(outcome, StageOutcome::failure(Some(3), "device offline"));
    }

    #[tokio::test]
    async fn silent_failure_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let log = StageLogWriter::new(dir.path());
        let stage = ProcessStage::new(Stage::Primary, "Poker", "sh").args(["-c", "exit 1"]);
        let outcome = stage.execute(&ctx(), &log).await;
        assert_eq!(
            outcome,
            StageOutcome::failure(Some(1), "Poker process failed (exit code 1)")
        );
    }

    #[tokio::test]
    async fn launch_error_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = StageLogWriter::new(dir.path());
        let stage = ProcessStage::new(Stage::Primary, "Poker", "/nonexistent/appscope-engine");
        match stage.execute(&ctx(), &log).await {
            StageOutcome::Failure { exit_code, detail } => {
                assert_eq!(exit_code, None);
                assert!(detail.starts_with("failed to launch /nonexistent/appscope-engine"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let log = StageLogWriter::new(dir.path());
        let stage = ProcessStage::new(Stage::Primary, "Poker", "sh")
            .args(["-c", "exec sleep 30"])
            .timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let outcome = stage.execute(&ctx(), &log).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        match outcome {
            StageOutcome::Failure { detail, .. } => assert!(detail.contains("timed out")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
