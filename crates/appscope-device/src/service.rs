use appscope_proto::appscope::v1::{
    device_service_server::DeviceService, AppInfo, GetAppInfoRequest, GetAppInfoResponse,
    ListAppsRequest, ListAppsResponse, ListDevicesRequest, ListDevicesResponse,
    ListPackagesRequest, ListPackagesResponse,
};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::aapt;
use crate::adb::{self, adb_failure_message, adb_failure_status};

pub(crate) const UNKNOWN_LABEL: &str = "unknown";

#[derive(Clone, Default)]
pub(crate) struct DeviceSvc;

/// Why a label could not be resolved. Tool absence is fatal for the request;
/// anything per-package degrades to `unknown`.
enum LabelError {
    Fatal(Status),
    Unresolved(String),
}

async fn resolve_app(serial: &str, package: &str) -> Result<AppInfo, LabelError> {
    let apk = match adb::apk_path(serial, package).await {
        Ok(Some(apk)) => apk,
        Ok(None) => return Err(LabelError::Unresolved(format!("package {package} not found"))),
        Err(err @ adb::AdbFailure::NotFound) => return Err(LabelError::Fatal(adb_failure_status(err))),
        Err(err) => return Err(LabelError::Unresolved(adb_failure_message(&err))),
    };

    let local = tempfile::Builder::new()
        .prefix("appscope-")
        .suffix(".apk")
        .tempfile()
        .map_err(|e| LabelError::Fatal(Status::internal(format!("temp file: {e}"))))?;
    if let Err(err) = adb::pull(serial, &apk, local.path()).await {
        return Err(LabelError::Unresolved(format!(
            "pull of {apk} failed: {}",
            adb_failure_message(&err)
        )));
    }

    let badging = match aapt::dump_badging(local.path()).await {
        Ok(badging) => badging,
        Err(err @ aapt::AaptFailure::NotFound) => return Err(LabelError::Fatal(err.status())),
        Err(err) => return Err(LabelError::Unresolved(err.status().message().to_string())),
    };
    // `local` is removed on drop.
    let label = aapt::parse_label(&badging);
    Ok(AppInfo {
        package: package.to_string(),
        label_resolved: label.is_some(),
        app_name: label.unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
        apk_path: apk,
    })
}

fn unknown_app(package: &str) -> AppInfo {
    AppInfo {
        package: package.to_string(),
        app_name: UNKNOWN_LABEL.to_string(),
        label_resolved: false,
        apk_path: String::new(),
    }
}

#[tonic::async_trait]
impl DeviceService for DeviceSvc {
    async fn list_devices(
        &self,
        request: Request<ListDevicesRequest>,
    ) -> Result<Response<ListDevicesResponse>, Status> {
        let req = request.into_inner();
        let devices = adb::list_devices(req.include_offline)
            .await
            .map_err(adb_failure_status)?;
        Ok(Response::new(ListDevicesResponse { devices }))
    }

    async fn list_packages(
        &self,
        request: Request<ListPackagesRequest>,
    ) -> Result<Response<ListPackagesResponse>, Status> {
        let req = request.into_inner();
        let packages = adb::third_party_packages(&req.serial)
            .await
            .map_err(adb_failure_status)?;
        Ok(Response::new(ListPackagesResponse { packages }))
    }

    async fn get_app_info(
        &self,
        request: Request<GetAppInfoRequest>,
    ) -> Result<Response<GetAppInfoResponse>, Status> {
        let req = request.into_inner();
        let package = req.package.trim();
        if package.is_empty() {
            return Err(Status::invalid_argument("package is required"));
        }
        let app = match resolve_app(&req.serial, package).await {
            Ok(app) => app,
            Err(LabelError::Fatal(status)) => return Err(status),
            Err(LabelError::Unresolved(reason)) => {
                warn!(package, "label not resolved: {reason}");
                unknown_app(package)
            }
        };
        Ok(Response::new(GetAppInfoResponse { app: Some(app) }))
    }

    async fn list_apps(
        &self,
        request: Request<ListAppsRequest>,
    ) -> Result<Response<ListAppsResponse>, Status> {
        let serial = request.into_inner().serial;
        let packages = adb::third_party_packages(&serial)
            .await
            .map_err(adb_failure_status)?;
        info!(count = packages.len(), "resolving app labels");

        let mut apps = Vec::with_capacity(packages.len());
        for (i, package) in packages.iter().enumerate() {
            let app = match resolve_app(&serial, package).await {
                Ok(app) => app,
                Err(LabelError::Fatal(status)) => return Err(status),
                Err(LabelError::Unresolved(reason)) => {
                    warn!(package, "label not resolved: {reason}");
                    unknown_app(package)
                }
            };
            info!("[{}/{}] {} -> {}", i + 1, packages.len(), package, app.app_name);
            apps.push(app);
        }
        Ok(Response::new(ListAppsResponse { apps }))
    }
}
