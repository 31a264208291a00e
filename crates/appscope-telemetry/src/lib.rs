//! Opt-in journal of task lifecycle events.
//!
//! Events are queued on a bounded channel and appended as JSON lines by a
//! background thread, so callers on the async runtime never touch the disk.
//! A full queue drops the event.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

const EVENT_QUEUE_CAPACITY: usize = 256;
const MAX_JOURNAL_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct JournalOptions {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub enabled: bool,
    pub dir: PathBuf,
}

pub struct Journal {
    app_name: String,
    app_version: String,
    session_id: String,
    enabled: AtomicBool,
    seq: AtomicU64,
    sender: SyncSender<JournalEntry>,
}

#[derive(Serialize)]
struct JournalEntry {
    seq: u64,
    event_type: String,
    at_unix_millis: i64,
    app: String,
    version: String,
    session_id: String,
    properties: BTreeMap<String, String>,
}

static JOURNAL: OnceLock<Arc<Journal>> = OnceLock::new();

pub fn init(options: JournalOptions) -> Arc<Journal> {
    if let Some(existing) = JOURNAL.get() {
        existing.enabled.store(options.enabled, Ordering::Relaxed);
        return Arc::clone(existing);
    }

    let (journal, receiver) = Journal::new(&options);
    let journal = Arc::new(journal);
    start_writer_thread(options.dir.join(options.app_name), receiver);
    install_panic_hook(Arc::clone(&journal));

    let _ = JOURNAL.set(Arc::clone(&journal));
    journal
}

/// `APPSCOPE_TELEMETRY` switches the journal on; it lands under
/// `<data dir>/journal/<app>/events.jsonl`.
pub fn init_with_env(app_name: &'static str, app_version: &'static str) -> Arc<Journal> {
    init(JournalOptions {
        app_name,
        app_version,
        enabled: env_flag("APPSCOPE_TELEMETRY"),
        dir: data_dir().join("journal"),
    })
}

pub fn event(event_type: &str, properties: &[(&str, &str)]) {
    if let Some(journal) = JOURNAL.get() {
        journal.event(event_type, properties);
    }
}

/// Shorthand for events scoped to one task.
pub fn task_event(event_type: &str, task_id: &str, properties: &[(&str, &str)]) {
    if let Some(journal) = JOURNAL.get() {
        let mut props = Vec::with_capacity(properties.len() + 1);
        props.push(("task_id", task_id));
        props.extend_from_slice(properties);
        journal.event(event_type, &props);
    }
}

impl Journal {
    fn new(options: &JournalOptions) -> (Self, Receiver<JournalEntry>) {
        let (sender, receiver) = sync_channel(EVENT_QUEUE_CAPACITY);
        let journal = Journal {
            app_name: options.app_name.to_string(),
            app_version: options.app_version.to_string(),
            session_id: new_session_id(),
            enabled: AtomicBool::new(options.enabled),
            seq: AtomicU64::new(0),
            sender,
        };
        (journal, receiver)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn event(&self, event_type: &str, properties: &[(&str, &str)]) {
        if !self.is_enabled() {
            return;
        }
        let _ = self.sender.try_send(self.entry(event_type, properties));
    }

    fn entry(&self, event_type: &str, properties: &[(&str, &str)]) -> JournalEntry {
        let mut map = BTreeMap::new();
        for (key, value) in properties {
            if !key.trim().is_empty() {
                map.insert((*key).to_string(), (*value).to_string());
            }
        }
        JournalEntry {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            event_type: event_type.to_string(),
            at_unix_millis: now_millis(),
            app: self.app_name.clone(),
            version: self.app_version.clone(),
            session_id: self.session_id.clone(),
            properties: map,
        }
    }
}

fn start_writer_thread(dir: PathBuf, receiver: Receiver<JournalEntry>) {
    std::thread::spawn(move || {
        while let Ok(entry) = receiver.recv() {
            write_entry(&dir, &entry);
        }
    });
}

// Also fires for worker panics that the task supervisor catches.
fn install_panic_hook(journal: Arc<Journal>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.clone()
        } else {
            "panic".to_string()
        };
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_default();
        journal.event(
            "panic",
            &[("message", message.as_str()), ("location", location.as_str())],
        );
        default_hook(info);
    }));
}

fn write_entry(dir: &Path, entry: &JournalEntry) {
    if let Err(err) = fs::create_dir_all(dir) {
        eprintln!("journal: failed to create {}: {err}", dir.display());
        return;
    }

    let path = dir.join("events.jsonl");
    if rotate_if_needed(&path, MAX_JOURNAL_BYTES).is_err() {
        return;
    }

    let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("journal: failed to open {}: {err}", path.display());
            return;
        }
    };
    if let Ok(line) = serde_json::to_string(entry) {
        let _ = writeln!(file, "{line}");
    }
}

fn rotate_if_needed(path: &Path, limit: u64) -> std::io::Result<()> {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() >= limit {
            let rotated = path.with_extension("jsonl.1");
            let _ = fs::remove_file(&rotated);
            fs::rename(path, rotated)?;
        }
    }
    Ok(())
}

fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("APPSCOPE_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim());
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/appscope")
    } else {
        PathBuf::from("/tmp/appscope")
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn new_session_id() -> String {
    let now = now_millis();
    let pid = std::process::id();
    format!("{now:x}-{pid:x}")
}
