use std::time::Duration;

use bollard::Docker;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Endpoint consulted by the background version check.
const CHECK_VERSION_URL: &str = "https://api.slimbox.dev/v1/version-check";

/// The tool's own version.
pub fn current() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionCheckInfo {
    pub latest: String,
    #[serde(default)]
    pub outdated: bool,
}

/// Launch the version check in the background. The receiver resolves with
/// the outcome (or `None` when disabled/unreachable) and is awaited right
/// before the terminal report is written.
pub fn check_async(enabled: bool) -> oneshot::Receiver<Option<VersionCheckInfo>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let info = if enabled { check().await } else { None };
        let _ = tx.send(info);
    });
    rx
}

async fn check() -> Option<VersionCheckInfo> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .ok()?;

    let resp = client
        .get(CHECK_VERSION_URL)
        .query(&[("current", current())])
        .send()
        .await
        .ok()?;

    if !resp.status().is_success() {
        debug!(status = %resp.status(), "version check rejected");
        return None;
    }

    resp.json().await.ok()
}

/// Print the version-check outcome once the run is over.
pub fn print_check(info: Option<&VersionCheckInfo>) {
    match info {
        Some(info) if info.outdated => {
            info!(
                current = current(),
                latest = %info.latest,
                "a newer version is available"
            );
        }
        Some(_) => debug!("version is current"),
        None => debug!("no version check result"),
    }
}

/// Log the daemon's version, for debug runs.
pub async fn print_docker(docker: &Docker) {
    match docker.version().await {
        Ok(version) => info!(
            version = version.version.as_deref().unwrap_or("unknown"),
            api = version.api_version.as_deref().unwrap_or("unknown"),
            "docker daemon"
        ),
        Err(err) => debug!(error = %err, "could not read the daemon version"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_check_resolves_none() {
        let rx = check_async(false);
        assert!(rx.await.unwrap().is_none());
    }

    #[test]
    fn test_current_version_is_set() {
        assert!(!current().is_empty());
    }
}
