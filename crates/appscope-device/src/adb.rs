use std::{io, path::Path, path::PathBuf, process::Output, time::Duration};

use appscope_proto::appscope::v1::{Device, KeyValue};
use tokio::process::Command;

const ADB_TIMEOUT: Duration = Duration::from_secs(60);
const NOT_FOUND_HINT: &str = "adb not found (set APPSCOPE_ADB_PATH or ANDROID_SDK_ROOT)";

#[derive(Debug)]
pub(crate) enum AdbFailure {
    NotFound,
    Io(String),
    Timeout,
    Exit {
        status: i32,
        stdout: String,
        stderr: String,
    },
}

pub(crate) fn adb_path() -> PathBuf {
    for key in ["APPSCOPE_ADB_PATH", "ADB_PATH"] {
        if let Some(path) = appscope_util::env_path(key) {
            return path;
        }
    }
    if let Ok(sdk_root) =
        std::env::var("ANDROID_SDK_ROOT").or_else(|_| std::env::var("ANDROID_HOME"))
    {
        let tools = PathBuf::from(&sdk_root).join("platform-tools");
        for name in ["adb", "adb.exe"] {
            let candidate = tools.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from("adb")
}

/// `-s <serial>` when a device is named; otherwise adb picks the only one.
fn device_args<'a>(serial: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = Vec::with_capacity(rest.len() + 2);
    if !serial.trim().is_empty() {
        args.push("-s");
        args.push(serial.trim());
    }
    args.extend_from_slice(rest);
    args
}

pub(crate) async fn adb_output(args: &[&str]) -> Result<Output, AdbFailure> {
    let mut cmd = Command::new(adb_path());
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    let output = match tokio::time::timeout(ADB_TIMEOUT, cmd.output()).await {
        Ok(result) => result.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                AdbFailure::NotFound
            } else {
                AdbFailure::Io(e.to_string())
            }
        })?,
        Err(_) => return Err(AdbFailure::Timeout),
    };

    if output.status.success() {
        Ok(output)
    } else {
        Err(AdbFailure::Exit {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub(crate) fn format_adb_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let mut out = String::new();

    if !stdout.is_empty() {
        out.push_str("stdout:\n");
        out.push_str(stdout);
        out.push('\n');
    }
    if !stderr.is_empty() {
        out.push_str("stderr:\n");
        out.push_str(stderr);
        out.push('\n');
    }
    out
}

fn format_adb_failure_message(status: i32, stdout: &str, stderr: &str) -> String {
    let detail = format_adb_output(stdout, stderr);
    if detail.trim().is_empty() {
        format!("adb command failed with exit {status}")
    } else {
        format!("adb command failed with exit {status}: {}", detail.trim())
    }
}

pub(crate) fn adb_failure_message(err: &AdbFailure) -> String {
    match err {
        AdbFailure::NotFound => NOT_FOUND_HINT.into(),
        AdbFailure::Io(msg) => msg.clone(),
        AdbFailure::Timeout => format!("adb timed out after {}s", ADB_TIMEOUT.as_secs()),
        AdbFailure::Exit {
            status,
            stdout,
            stderr,
        } => format_adb_failure_message(*status, stdout, stderr),
    }
}

pub(crate) fn adb_failure_status(err: AdbFailure) -> tonic::Status {
    match err {
        AdbFailure::NotFound => tonic::Status::failed_precondition(NOT_FOUND_HINT),
        AdbFailure::Io(msg) => tonic::Status::internal(format!("adb failed: {msg}")),
        AdbFailure::Timeout => tonic::Status::deadline_exceeded(adb_failure_message(&err)),
        AdbFailure::Exit {
            status,
            stdout,
            stderr,
        } => tonic::Status::unavailable(format_adb_failure_message(status, &stdout, &stderr)),
    }
}

pub(crate) fn parse_adb_devices(output: &str, include_offline: bool) -> Vec<Device> {
    let mut devices = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices attached") || line.starts_with('*') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };
        if !include_offline && state != "device" {
            continue;
        }

        let mut model = String::new();
        let mut details = Vec::new();
        for part in parts {
            match part.split_once(':') {
                Some(("model", value)) => {
                    model = value.to_string();
                    details.push(kv("model", value));
                }
                Some((key, value)) => details.push(kv(key, value)),
                None => details.push(kv("info", part)),
            }
        }

        devices.push(Device {
            serial: serial.to_string(),
            state: state.to_string(),
            model,
            details,
        });
    }
    devices
}

fn kv(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

pub(crate) async fn list_devices(include_offline: bool) -> Result<Vec<Device>, AdbFailure> {
    let output = adb_output(&["devices", "-l"]).await?;
    Ok(parse_adb_devices(&stdout_of(&output), include_offline))
}

/// Lines of the form `package:<name>`; anything else is ignored.
pub(crate) fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) async fn third_party_packages(serial: &str) -> Result<Vec<String>, AdbFailure> {
    let output = adb_output(&device_args(serial, &["shell", "pm", "list", "packages", "-3"])).await?;
    Ok(parse_package_list(&stdout_of(&output)))
}

/// Base APK path from `pm path`. Split installs list several; the first line
/// is the base.
pub(crate) fn parse_apk_path(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::trim)
        .find(|path| !path.is_empty())
        .map(str::to_string)
}

pub(crate) async fn apk_path(serial: &str, package: &str) -> Result<Option<String>, AdbFailure> {
    match adb_output(&device_args(serial, &["shell", "pm", "path", package])).await {
        Ok(output) => Ok(parse_apk_path(&stdout_of(&output))),
        Err(AdbFailure::Exit { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

pub(crate) async fn pull(serial: &str, remote: &str, local: &Path) -> Result<(), AdbFailure> {
    let local = local.display().to_string();
    adb_output(&device_args(serial, &["pull", remote, &local])).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_device_listing() {
        let output = "List of devices attached\n\
                      * daemon started successfully\n\
                      R58M1234ABC    device usb:1-1 product:beyond1 model:SM_G973F device:beyond1 transport_id:3\n\
                      emulator-5554  offline transport_id:1\n\n";
        let online = parse_adb_devices(output, false);
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].serial, "R58M1234ABC");
        assert_eq!(online[0].model, "SM_G973F");
        assert!(online[0]
            .details
            .iter()
            .any(|kv| kv.key == "transport_id" && kv.value == "3"));

        let all = parse_adb_devices(output, true);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].state, "offline");
    }

    #[test]
    fn parses_package_listing() {
        let output = "package:com.tencent.mm\r\npackage:com.eg.android.AlipayGphone\n\nWARNING: linker\n";
        assert_eq!(
            parse_package_list(output),
            vec!["com.tencent.mm", "com.eg.android.AlipayGphone"]
        );
    }

    #[test]
    fn base_apk_comes_first() {
        let output = "package:/data/app/~~x==/com.example-1/base.apk\npackage:/data/app/~~x==/com.example-1/split_config.arm64_v8a.apk\n";
        assert_eq!(
            parse_apk_path(output).as_deref(),
            Some("/data/app/~~x==/com.example-1/base.apk")
        );
        assert_eq!(parse_apk_path(""), None);
    }

    #[test]
    fn serial_is_optional() {
        assert_eq!(device_args("", &["shell", "ls"]), vec!["shell", "ls"]);
        assert_eq!(device_args("abc", &["shell"]), vec!["-s", "abc", "shell"]);
    }

    #[test]
    fn missing_adb_is_a_precondition() {
        let status = adb_failure_status(AdbFailure::NotFound);
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        let status = adb_failure_status(AdbFailure::Exit {
            status: 1,
            stdout: String::new(),
            stderr: "error: no devices/emulators found".into(),
        });
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("no devices"));
    }
}
