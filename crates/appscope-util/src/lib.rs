use std::{net::SocketAddr, path::PathBuf};

use appscope_proto::appscope::v1::Timestamp;
use appscope_telemetry as telemetry;
use tonic::transport::{server::Router, Server};
use tracing::{info, warn};

pub const DEFAULT_TASK_ADDR: &str = "127.0.0.1:50061";
pub const DEFAULT_DEVICE_ADDR: &str = "127.0.0.1:50062";

pub const TASK_ADDR_ENV: &str = "APPSCOPE_TASK_ADDR";
pub const DEVICE_ADDR_ENV: &str = "APPSCOPE_DEVICE_ADDR";

pub fn env_addr(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn task_addr() -> String {
    env_addr(TASK_ADDR_ENV, DEFAULT_TASK_ADDR)
}

pub fn device_addr() -> String {
    env_addr(DEVICE_ADDR_ENV, DEFAULT_DEVICE_ADDR)
}

/// Non-empty value of `key`, trimmed.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses `key` as a u64; unset or malformed values fall back to `default`.
pub fn env_u64(key: &str, default: u64) -> u64 {
    match env_string(key) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring invalid {key}={raw}, using {default}");
                default
            }
        },
        None => default,
    }
}

pub fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(|value| expand_user(&value))
}

pub fn data_dir() -> PathBuf {
    if let Some(dir) = env_path("APPSCOPE_DATA_DIR") {
        return dir;
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/appscope")
    } else {
        PathBuf::from("/tmp/appscope")
    }
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn ts(unix_millis: i64) -> Timestamp {
    Timestamp { unix_millis }
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

pub fn init_service_telemetry(app_name: &'static str, app_version: &'static str, service_name: &str) {
    telemetry::init_with_env(app_name, app_version);
    telemetry::event("service.start", &[("service", service_name)]);
}

/// Builds the router with `add_service` and serves it until `shutdown` resolves.
pub async fn serve_grpc_until<F, S>(
    app_name: &str,
    addr: &str,
    add_service: F,
    shutdown: S,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut Server) -> Router,
    S: std::future::Future<Output = ()>,
{
    let addr: SocketAddr = addr.parse()?;
    info!("{app_name} listening on {addr}");
    let mut server = Server::builder();
    add_service(&mut server)
        .serve_with_shutdown(addr, shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_user_leaves_plain_paths_alone() {
        assert_eq!(expand_user("/opt/tools"), PathBuf::from("/opt/tools"));
        assert_eq!(expand_user("relative/dir"), PathBuf::from("relative/dir"));
    }

    #[test]
    fn env_u64_falls_back_on_garbage() {
        std::env::set_var("APPSCOPE_UTIL_TEST_U64", "not-a-number");
        assert_eq!(env_u64("APPSCOPE_UTIL_TEST_U64", 7), 7);
        std::env::set_var("APPSCOPE_UTIL_TEST_U64", " 42 ");
        assert_eq!(env_u64("APPSCOPE_UTIL_TEST_U64", 7), 42);
        std::env::remove_var("APPSCOPE_UTIL_TEST_U64");
        assert_eq!(env_u64("APPSCOPE_UTIL_TEST_U64", 7), 7);
    }
}
