use std::{io, path::Path, path::PathBuf, time::Duration};

use tokio::process::Command;

const AAPT_TIMEOUT: Duration = Duration::from_secs(30);
// Most specific locale first.
const LABEL_KEYS: [&str; 3] = [
    "application-label-zh-CN:",
    "application-label-zh:",
    "application-label:",
];

#[derive(Debug)]
pub(crate) enum AaptFailure {
    NotFound,
    Io(String),
    Timeout,
}

impl AaptFailure {
    pub(crate) fn status(&self) -> tonic::Status {
        match self {
            AaptFailure::NotFound => tonic::Status::failed_precondition(
                "aapt not found (set APPSCOPE_AAPT_PATH or install Android build-tools)",
            ),
            AaptFailure::Io(msg) => tonic::Status::internal(format!("aapt failed: {msg}")),
            AaptFailure::Timeout => tonic::Status::deadline_exceeded(format!(
                "aapt timed out after {}s",
                AAPT_TIMEOUT.as_secs()
            )),
        }
    }
}

pub(crate) fn aapt_path() -> PathBuf {
    appscope_util::env_path("APPSCOPE_AAPT_PATH").unwrap_or_else(|| PathBuf::from("aapt"))
}

/// Raw `aapt dump badging` output. A non-zero exit still yields whatever
/// aapt printed; damaged APKs often carry a usable label.
pub(crate) async fn dump_badging(apk: &Path) -> Result<String, AaptFailure> {
    let mut cmd = Command::new(aapt_path());
    cmd.args(["dump", "badging"])
        .arg(apk)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    match tokio::time::timeout(AAPT_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Ok(String::from_utf8_lossy(&output.stdout).to_string()),
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => Err(AaptFailure::NotFound),
        Ok(Err(e)) => Err(AaptFailure::Io(e.to_string())),
        Err(_) => Err(AaptFailure::Timeout),
    }
}

/// Application label from badging output, preferring `zh-CN`, then `zh`,
/// then the default.
pub(crate) fn parse_label(badging: &str) -> Option<String> {
    LABEL_KEYS.iter().find_map(|key| {
        badging.lines().find_map(|line| {
            let rest = line.trim().strip_prefix(key)?;
            let value = rest.strip_prefix('\'')?;
            let end = value.find('\'')?;
            let label = value[..end].trim();
            (!label.is_empty()).then(|| label.to_string())
        })
    })
}
