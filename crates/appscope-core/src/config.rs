use std::path::PathBuf;
use std::time::Duration;

use appscope_util::{data_dir, env_path, env_string, env_u64, task_addr};
use tracing::warn;

pub const DEFAULT_TASK_TTL_SECS: u64 = 86_400;
pub const DEFAULT_COLLECTOR_RUN_TIME_SECS: u64 = 600;
/// Fixed allowance on top of the collector's configured run time.
pub const COLLECTOR_TIMEOUT_OVERHEAD: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlPolicy {
    /// Every write re-arms the full TTL.
    Refresh,
    /// The deadline is fixed when the task is created.
    Fixed,
}

impl TtlPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "refresh" => Some(TtlPolicy::Refresh),
            "fixed" => Some(TtlPolicy::Fixed),
            _ => None,
        }
    }
}

/// An external process stage. `entry`, when set, is passed as the first
/// argument and its presence on disk gates the stage.
#[derive(Debug, Clone)]
pub struct ProcessStageConfig {
    pub label: String,
    pub program: String,
    pub entry: Option<PathBuf>,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub repo_path: PathBuf,
    pub base_branch: String,
    pub branch_prefix: String,
    pub owner: String,
    pub repo: String,
    pub token: Option<String>,
    pub workflow: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub addr: String,
    pub data_dir: PathBuf,
    pub store_url: String,
    pub store_password: Option<String>,
    pub task_ttl: Duration,
    pub ttl_policy: TtlPolicy,
    pub worker_slots: usize,
    pub collector: ProcessStageConfig,
    pub enricher: ProcessStageConfig,
    pub publish: PublishConfig,
    pub collected_dir: PathBuf,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let collector_dir = env_path("APPSCOPE_COLLECTOR_WORKDIR").unwrap_or_else(|| PathBuf::from("../poker"));
        let run_time = env_u64("APPSCOPE_COLLECTOR_RUN_TIME_SECS", DEFAULT_COLLECTOR_RUN_TIME_SECS);
        let collector = ProcessStageConfig {
            label: env_string("APPSCOPE_COLLECTOR_LABEL").unwrap_or_else(|| "Poker".into()),
            program: env_string("APPSCOPE_COLLECTOR_PROGRAM").unwrap_or_else(|| "python3".into()),
            entry: None,
            args: split_args(
                &env_string("APPSCOPE_COLLECTOR_ARGS")
                    .unwrap_or_else(|| "poker_engine.py --pkg {package} --app {app_name}".into()),
            ),
            workdir: Some(collector_dir.clone()),
            timeout: Some(Duration::from_secs(run_time) + COLLECTOR_TIMEOUT_OVERHEAD),
        };

        let enricher_dir = env_path("APPSCOPE_ENRICHER_WORKDIR").unwrap_or_else(|| PathBuf::from("../gkd"));
        let enricher_entry = env_path("APPSCOPE_ENRICHER_ENTRY")
            .map(|entry| if entry.is_absolute() { entry } else { enricher_dir.join(entry) })
            .unwrap_or_else(|| enricher_dir.join("gkd_engine.py"));
        let enricher = ProcessStageConfig {
            label: env_string("APPSCOPE_ENRICHER_LABEL").unwrap_or_else(|| "GKD".into()),
            program: env_string("APPSCOPE_ENRICHER_PROGRAM").unwrap_or_else(|| "python3".into()),
            entry: Some(enricher_entry),
            args: vec!["{task_id}".into()],
            workdir: Some(enricher_dir),
            timeout: None,
        };

        let owner = env_string("APPSCOPE_GITHUB_OWNER").unwrap_or_else(|| "dgliang".into());
        let repo = env_string("APPSCOPE_GITHUB_REPO").unwrap_or_else(|| "GKD_subscription".into());
        let publish = PublishConfig {
            repo_path: env_path("APPSCOPE_PUBLISH_REPO_PATH")
                .unwrap_or_else(|| PathBuf::from("../GKD_subscription")),
            base_branch: env_string("APPSCOPE_PUBLISH_BASE_BRANCH").unwrap_or_else(|| "main".into()),
            branch_prefix: env_string("APPSCOPE_PUBLISH_BRANCH_PREFIX")
                .unwrap_or_else(|| "collect/".into()),
            owner,
            repo,
            token: env_string("APPSCOPE_GITHUB_TOKEN"),
            workflow: env_string("APPSCOPE_GITHUB_WORKFLOW")
                .unwrap_or_else(|| "build_release.yml".into()),
            api_base: env_string("APPSCOPE_GITHUB_API_BASE")
                .unwrap_or_else(|| "https://api.github.com".into()),
        };

        let ttl_policy = match env_string("APPSCOPE_TTL_POLICY") {
            Some(raw) => TtlPolicy::parse(&raw).unwrap_or_else(|| {
                warn!("ignoring invalid APPSCOPE_TTL_POLICY={raw}, using refresh");
                TtlPolicy::Refresh
            }),
            None => TtlPolicy::Refresh,
        };

        let collected_dir =
            env_path("APPSCOPE_COLLECTED_DIR").unwrap_or_else(|| collector_dir.join("collectData"));

        Self {
            addr: task_addr(),
            data_dir: data_dir(),
            store_url: env_string("APPSCOPE_STORE_URL").unwrap_or_else(|| "memory".into()),
            store_password: env_string("APPSCOPE_STORE_PASSWORD"),
            task_ttl: Duration::from_secs(env_u64("APPSCOPE_TASK_TTL_SECS", DEFAULT_TASK_TTL_SECS).max(1)),
            ttl_policy,
            worker_slots: env_u64("APPSCOPE_WORKER_SLOTS", 1).max(1) as usize,
            collector,
            enricher,
            publish,
            collected_dir,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs").join("tasks")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }
}

/// Splits a command template on whitespace; double quotes group words.
pub fn split_args(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for ch in raw.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }
    args
}
