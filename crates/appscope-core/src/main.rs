use std::time::Duration;

use appscope_core::service::TaskSvc;
use appscope_core::store::redact_url;
use appscope_core::{CoreConfig, TaskManager};
use appscope_proto::appscope::v1::task_service_server::TaskServiceServer;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    appscope_util::init_tracing()?;
    appscope_util::init_service_telemetry("appscope-core", env!("CARGO_PKG_VERSION"), "task");

    let config = CoreConfig::from_env();
    info!(
        store = %redact_url(&config.store_url),
        ttl_secs = config.task_ttl.as_secs(),
        ttl_policy = ?config.ttl_policy,
        worker_slots = config.worker_slots,
        "appscope-core starting"
    );

    let manager = TaskManager::from_config(&config)?;
    if !manager.health_check().await {
        // Serve anyway; requests report the store as unavailable until it answers.
        warn!("task store is not reachable at startup");
    }

    let svc = TaskSvc::new(manager.clone(), &config);
    appscope_util::serve_grpc_until(
        "appscope-core (TaskService)",
        &config.addr,
        |server| server.add_service(TaskServiceServer::new(svc)),
        async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {err}");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        },
    )
    .await?;

    if manager.active_workers() > 0 {
        info!(active = manager.active_workers(), "waiting for running tasks");
        if tokio::time::timeout(SHUTDOWN_GRACE, manager.wait_idle()).await.is_err() {
            warn!("tasks still running after {}s; exiting", SHUTDOWN_GRACE.as_secs());
        }
    }
    Ok(())
}
