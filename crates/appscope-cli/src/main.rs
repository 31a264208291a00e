use std::path::PathBuf;
use std::time::Duration;

use appscope_proto::appscope::v1::{
    device_service_client::DeviceServiceClient, task_service_client::TaskServiceClient,
    CancelTaskRequest, DeleteTaskRequest, ExportCollectedDataRequest, FindTaskByPackageRequest,
    GetAppInfoRequest, GetTaskLogRequest, GetTaskStatusRequest, HealthCheckRequest, Id,
    ListAppsRequest, ListDevicesRequest, ListPackagesRequest, ListTasksRequest, StageOutcomeKind,
    SubmitBatchRequest, SubmitBatchResponse, SubmitTaskRequest, TaskState, TaskStatus,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tonic::transport::Channel;

#[derive(Parser)]
#[command(name = "appscope-cli", version, about = "AppScope task and device CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Submit one app for collection
    Submit {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        package: String,
        app_name: String,
        /// Free-form submission time, stored with the task
        #[arg(long)]
        timestamp: Option<String>,
    },
    /// Submit every entry of a JSON file: [{"package": .., "app_name": ..}, ..]
    Batch {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        file: PathBuf,
    },
    /// Show a task's status
    Status {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        task_id: String,
    },
    /// Poll a task until it finishes
    Watch {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        task_id: String,
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
    },
    /// Find the live task for a package
    Find {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        package: String,
    },
    /// List live tasks
    List {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        /// Include each task's status
        #[arg(long)]
        status: bool,
    },
    /// Delete a task and free its package
    Delete {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        task_id: String,
    },
    /// Ask a running task to stop before its next stage
    Cancel {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        task_id: String,
    },
    /// Check the task service and its store
    Health {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
    },
    /// Print the tail of a task's stage log
    Log {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        task_id: String,
        #[arg(long, default_value_t = 200)]
        lines: u32,
    },
    /// Zip a task's collected data
    Export {
        #[arg(long, default_value_t = appscope_util::task_addr())]
        addr: String,
        task_id: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Device commands (DeviceService)
    Device {
        #[command(subcommand)]
        cmd: DeviceCmd,
    },
}

#[derive(Subcommand)]
enum DeviceCmd {
    /// List attached devices
    List {
        #[arg(long, default_value_t = appscope_util::device_addr())]
        addr: String,
        #[arg(long)]
        include_offline: bool,
    },
    /// List third-party packages
    Packages {
        #[arg(long, default_value_t = appscope_util::device_addr())]
        addr: String,
        #[arg(long, default_value = "")]
        serial: String,
    },
    /// Resolve one package's label
    AppInfo {
        #[arg(long, default_value_t = appscope_util::device_addr())]
        addr: String,
        #[arg(long, default_value = "")]
        serial: String,
        package: String,
    },
    /// List third-party apps with labels
    Apps {
        #[arg(long, default_value_t = appscope_util::device_addr())]
        addr: String,
        #[arg(long, default_value = "")]
        serial: String,
    },
    /// Submit every third-party app on the device as a task
    SubmitAll {
        #[arg(long, default_value_t = appscope_util::device_addr())]
        addr: String,
        #[arg(long, default_value_t = appscope_util::task_addr())]
        task_addr: String,
        #[arg(long, default_value = "")]
        serial: String,
        /// Skip apps whose label could not be resolved
        #[arg(long)]
        skip_unknown: bool,
    },
}

#[derive(Deserialize)]
struct BatchEntry {
    package: String,
    app_name: String,
    #[serde(default)]
    timestamp: Option<String>,
}

fn id(value: String) -> Option<Id> {
    Some(Id { value })
}

fn state_name(state: i32) -> &'static str {
    match TaskState::try_from(state) {
        Ok(TaskState::Queued) => "queued",
        Ok(TaskState::Running) => "running",
        Ok(TaskState::Completed) => "completed",
        Ok(TaskState::Failed) => "failed",
        Ok(TaskState::NotFound) => "not_found",
        Ok(TaskState::StoreUnavailable) => "store_unavailable",
        _ => "unknown",
    }
}

fn outcome_name(outcome: i32) -> &'static str {
    match StageOutcomeKind::try_from(outcome) {
        Ok(StageOutcomeKind::Success) => "success",
        Ok(StageOutcomeKind::Failure) => "failure",
        Ok(StageOutcomeKind::Skipped) => "skipped",
        _ => "unknown",
    }
}

fn print_status(status: &TaskStatus) {
    let task_id = status.task_id.as_ref().map(|i| i.value.as_str()).unwrap_or_default();
    println!(
        "task_id={task_id}\tstate={}\tprogress={:.2}\tpackage={}\tapp={}",
        state_name(status.state),
        status.progress,
        status.package,
        status.app_name
    );
    println!("message={}", status.message);
    if !status.log_path.is_empty() {
        println!("log={}", status.log_path);
    }
    for stage in &status.stages {
        let code = if stage.has_exit_code {
            stage.exit_code.to_string()
        } else {
            "-".into()
        };
        println!(
            "  {}\t{}\texit={code}\t{}",
            stage.stage,
            outcome_name(stage.outcome),
            stage.detail
        );
    }
}

fn print_batch(resp: &SubmitBatchResponse) {
    for item in &resp.results {
        let task_id = item.task_id.as_ref().map(|i| i.value.as_str()).unwrap_or("-");
        println!("{}\t{}\tnew={}\t{}", item.package, task_id, item.is_new, item.message);
    }
    println!(
        "submitted={}\treused={}\tfailed={}",
        resp.submitted, resp.reused, resp.failed
    );
}

fn is_terminal(state: i32) -> bool {
    !matches!(
        TaskState::try_from(state),
        Ok(TaskState::Queued) | Ok(TaskState::Running)
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Submit {
            addr,
            package,
            app_name,
            timestamp,
        } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client
                .submit_task(SubmitTaskRequest {
                    package,
                    app_name,
                    timestamp: timestamp.unwrap_or_default(),
                })
                .await?
                .into_inner();
            let task_id = resp.task_id.map(|i| i.value).unwrap_or_default();
            println!("task_id={task_id}\tnew={}", resp.is_new);
        }
        Cmd::Batch { addr, file } => {
            let entries: Vec<BatchEntry> = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            let items = entries
                .into_iter()
                .map(|entry| SubmitTaskRequest {
                    package: entry.package,
                    app_name: entry.app_name,
                    timestamp: entry.timestamp.unwrap_or_default(),
                })
                .collect();
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client
                .submit_batch(SubmitBatchRequest { items })
                .await?
                .into_inner();
            print_batch(&resp);
        }
        Cmd::Status { addr, task_id } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client
                .get_task_status(GetTaskStatusRequest { task_id: id(task_id) })
                .await?
                .into_inner();
            if let Some(status) = resp.status {
                print_status(&status);
            }
        }
        Cmd::Watch {
            addr,
            task_id,
            interval_secs,
        } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let interval = Duration::from_secs(interval_secs.max(1));
            let mut last = None;
            loop {
                let resp = client
                    .get_task_status(GetTaskStatusRequest {
                        task_id: id(task_id.clone()),
                    })
                    .await?
                    .into_inner();
                let Some(status) = resp.status else { break };
                let seen = (status.state, status.message.clone());
                if last.as_ref() != Some(&seen) {
                    println!(
                        "[{}] {:.0}% {}",
                        state_name(status.state),
                        status.progress * 100.0,
                        status.message
                    );
                    last = Some(seen);
                }
                if is_terminal(status.state) {
                    print_status(&status);
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        }
        Cmd::Find { addr, package } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client
                .find_task_by_package(FindTaskByPackageRequest { package })
                .await?
                .into_inner();
            match resp.task_id.filter(|_| resp.found) {
                Some(task_id) => println!("task_id={}", task_id.value),
                None => println!("no live task"),
            }
        }
        Cmd::List { addr, status } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client
                .list_tasks(ListTasksRequest {
                    include_status: status,
                })
                .await?
                .into_inner();
            if status {
                for task in resp.tasks {
                    let task_id = task.task_id.map(|i| i.value).unwrap_or_default();
                    println!(
                        "{task_id}\t{}\t{}\t{}\t{}",
                        state_name(task.state),
                        task.package,
                        task.app_name,
                        task.message
                    );
                }
            } else {
                for task_id in resp.task_ids {
                    println!("{}", task_id.value);
                }
            }
        }
        Cmd::Delete { addr, task_id } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client
                .delete_task(DeleteTaskRequest { task_id: id(task_id) })
                .await?
                .into_inner();
            println!("deleted={}", resp.deleted);
        }
        Cmd::Cancel { addr, task_id } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client
                .cancel_task(CancelTaskRequest { task_id: id(task_id) })
                .await?
                .into_inner();
            println!("accepted={}", resp.accepted);
        }
        Cmd::Health { addr } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client.health_check(HealthCheckRequest {}).await?.into_inner();
            println!(
                "healthy={}\tstore={}\tactive_workers={}",
                resp.healthy, resp.store_backend, resp.active_workers
            );
            if !resp.healthy {
                std::process::exit(1);
            }
        }
        Cmd::Log {
            addr,
            task_id,
            lines,
        } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client
                .get_task_log(GetTaskLogRequest {
                    task_id: id(task_id),
                    tail_lines: lines,
                })
                .await?
                .into_inner();
            if !resp.found {
                eprintln!("no log at {}", resp.log_path);
            }
            for line in resp.lines {
                println!("{line}");
            }
        }
        Cmd::Export {
            addr,
            task_id,
            output,
        } => {
            let mut client = TaskServiceClient::new(connect(&addr).await?);
            let resp = client
                .export_collected_data(ExportCollectedDataRequest {
                    task_id: id(task_id),
                    output_path: output.map(|p| p.display().to_string()).unwrap_or_default(),
                })
                .await?
                .into_inner();
            println!(
                "output={}\tfiles={}\tbytes={}",
                resp.output_path, resp.file_count, resp.bytes
            );
        }

        Cmd::Device { cmd } => match cmd {
            DeviceCmd::List {
                addr,
                include_offline,
            } => {
                let mut client = DeviceServiceClient::new(connect(&addr).await?);
                let resp = client
                    .list_devices(ListDevicesRequest { include_offline })
                    .await?
                    .into_inner();
                for d in resp.devices {
                    println!("{}\t{}\t{}", d.serial, d.state, d.model);
                }
            }
            DeviceCmd::Packages { addr, serial } => {
                let mut client = DeviceServiceClient::new(connect(&addr).await?);
                let resp = client
                    .list_packages(ListPackagesRequest { serial })
                    .await?
                    .into_inner();
                for package in resp.packages {
                    println!("{package}");
                }
            }
            DeviceCmd::AppInfo {
                addr,
                serial,
                package,
            } => {
                let mut client = DeviceServiceClient::new(connect(&addr).await?);
                let resp = client
                    .get_app_info(GetAppInfoRequest { serial, package })
                    .await?
                    .into_inner();
                if let Some(app) = resp.app {
                    println!("{}\t{}\t{}", app.package, app.app_name, app.apk_path);
                }
            }
            DeviceCmd::Apps { addr, serial } => {
                let mut client = DeviceServiceClient::new(connect(&addr).await?);
                let resp = client.list_apps(ListAppsRequest { serial }).await?.into_inner();
                for app in resp.apps {
                    println!("{}\t{}", app.package, app.app_name);
                }
            }
            DeviceCmd::SubmitAll {
                addr,
                task_addr,
                serial,
                skip_unknown,
            } => {
                let mut devices = DeviceServiceClient::new(connect(&addr).await?);
                let apps = devices
                    .list_apps(ListAppsRequest { serial })
                    .await?
                    .into_inner()
                    .apps;
                let items: Vec<SubmitTaskRequest> = apps
                    .into_iter()
                    .filter(|app| app.label_resolved || !skip_unknown)
                    .map(|app| SubmitTaskRequest {
                        package: app.package,
                        app_name: app.app_name,
                        timestamp: String::new(),
                    })
                    .collect();
                if items.is_empty() {
                    println!("no apps to submit");
                    return Ok(());
                }
                let mut tasks = TaskServiceClient::new(connect(&task_addr).await?);
                let resp = tasks
                    .submit_batch(SubmitBatchRequest { items })
                    .await?
                    .into_inner();
                print_batch(&resp);
            }
        },
    }

    Ok(())
}

async fn connect(addr: &str) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = format!("http://{addr}");
    Ok(Channel::from_shared(endpoint)?.connect().await?)
}
