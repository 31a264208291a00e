//! Per-task, append-only audit log.
//!
//! One plain-text file per task, `task_<id>.log`. Every stage attempt is a
//! segment framed by a header (task, package, app, command, start time) and a
//! trailer (end time, status, exit code). Writes are best effort: a failure is
//! logged and never reaches task state.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Local};
use tracing::warn;

const RULE_WIDTH: usize = 80;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct SegmentHeader<'a> {
    pub stage: &'a str,
    pub package: &'a str,
    pub app_name: &'a str,
    pub command: &'a str,
    pub started_at: DateTime<Local>,
}

pub struct SegmentTrailer<'a> {
    pub status: &'a str,
    pub exit_code: Option<i32>,
    pub ended_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct StageLogWriter {
    dir: PathBuf,
}

impl StageLogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("task_{task_id}.log"))
    }

    /// Opens a new segment, creating the file on first use.
    pub fn create(&self, task_id: &str, header: &SegmentHeader<'_>) -> PathBuf {
        let rule = "=".repeat(RULE_WIDTH);
        let block = format!(
            "{rule}\nTask ID: {task_id}\nStage: {}\nPackage: {}\nApp: {}\nCommand: {}\nStarted at: {}\n{rule}\n",
            header.stage,
            header.package,
            header.app_name,
            header.command,
            header.started_at.format(TIME_FORMAT),
        );
        self.write(task_id, &block);
        self.path_for(task_id)
    }

    pub fn append(&self, task_id: &str, line: &str) {
        if line.ends_with('\n') {
            self.write(task_id, line);
        } else {
            self.write(task_id, &format!("{line}\n"));
        }
    }

    /// Single-line entry for a stage that was not attempted.
    pub fn note(&self, task_id: &str, stage: &str, text: &str) {
        let now = Local::now().format(TIME_FORMAT);
        self.append(task_id, &format!("[{now}] {stage}: {text}"));
    }

    pub fn finalize(&self, task_id: &str, trailer: &SegmentTrailer<'_>) {
        let rule = "=".repeat(RULE_WIDTH);
        let code = trailer
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none".into());
        let block = format!(
            "{rule}\nEnded at: {}\nStatus: {}\nReturn code: {code}\n{rule}\n\n",
            trailer.ended_at.format(TIME_FORMAT),
            trailer.status,
        );
        self.write(task_id, &block);
    }

    /// Last `lines` lines of the task's log, or `None` when there is no log.
    pub fn tail(&self, task_id: &str, lines: usize) -> Option<Vec<String>> {
        let file = File::open(self.path_for(task_id)).ok()?;
        let mut recent = VecDeque::with_capacity(lines.min(1024));
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            if lines == 0 {
                continue;
            }
            if recent.len() >= lines {
                recent.pop_front();
            }
            recent.push_back(line);
        }
        Some(recent.into_iter().collect())
    }

    fn write(&self, task_id: &str, text: &str) {
        if let Err(err) = self.try_write(task_id, text) {
            warn!(task_id, "stage log write failed: {err}");
        }
    }

    fn try_write(&self, task_id: &str, text: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(task_id))?;
        file.write_all(text.as_bytes())
    }
}
