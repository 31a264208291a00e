mod aapt;
mod adb;
mod service;

use appscope_proto::appscope::v1::device_service_server::DeviceServiceServer;
use service::DeviceSvc;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    appscope_util::init_tracing()?;
    appscope_util::init_service_telemetry("appscope-device", env!("CARGO_PKG_VERSION"), "device");

    let addr = appscope_util::device_addr();
    appscope_util::serve_grpc_until(
        "appscope-device (DeviceService)",
        &addr,
        |server| server.add_service(DeviceServiceServer::new(DeviceSvc)),
        async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {err}");
                std::future::pending::<()>().await;
            }
        },
    )
    .await
}
