use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File name the sensor uses for the container report it leaves in the
/// shared volume.
pub const CONTAINER_REPORT_FILE: &str = "creport.json";

/// Where a command report lands when the user gives no explicit location.
pub const DEFAULT_REPORT_FILE: &str = "slimbox.report.json";

/// Terminal and intermediate states recorded in command reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmdState {
    Started,
    Completed,
    Done,
    Error,
    Exited,
}

/// Metadata captured about an image that took part in the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub all_names: Vec<String>,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub size_human: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub docker_version: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub exposed_ports: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetadata {
    #[serde(default, rename = "type")]
    pub sys_type: String,
    #[serde(default)]
    pub release: String,
    #[serde(default)]
    pub os: String,
}

/// One base-image layer recorded while reconstructing the Dockerfile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageLayerInfo {
    pub full_name: String,
    pub id: String,
}

/// What the sensor writes into the shared volume. Only the pieces the
/// orchestrator consumes are modeled; unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerReport {
    #[serde(default)]
    pub system: SystemMetadata,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub executables: Vec<String>,
    #[serde(default)]
    pub syscalls: Vec<String>,
}

impl ContainerReport {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading container report {}", path.display()))?;
        serde_json::from_str(&data).context("parsing container report")
    }
}

/// Accumulated record of one `build` invocation, written at the end of the
/// run whatever the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub state: CmdState,
    pub image_reference: String,
    #[serde(default)]
    pub image_stack: Vec<ImageLayerInfo>,
    #[serde(default)]
    pub source_image: ImageMetadata,
    #[serde(default)]
    pub minified_image: String,
    #[serde(default)]
    pub minified_image_size: i64,
    #[serde(default)]
    pub minified_image_size_human: String,
    #[serde(default)]
    pub minified_by: f64,
    #[serde(default)]
    pub minified_image_has_data: bool,
    #[serde(default)]
    pub artifact_location: String,
    #[serde(default)]
    pub container_report_name: String,
    #[serde(default)]
    pub seccomp_profile_name: String,
    #[serde(default)]
    pub apparmor_profile_name: String,
    #[serde(default)]
    pub system: SystemMetadata,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(skip)]
    location: PathBuf,
}

impl BuildReport {
    pub fn new(location: &str, image_reference: &str) -> Self {
        Self {
            state: CmdState::Started,
            image_reference: image_reference.to_string(),
            image_stack: Vec::new(),
            source_image: ImageMetadata::default(),
            minified_image: String::new(),
            minified_image_size: 0,
            minified_image_size_human: String::new(),
            minified_by: 0.0,
            minified_image_has_data: false,
            artifact_location: String::new(),
            container_report_name: String::new(),
            seccomp_profile_name: String::new(),
            apparmor_profile_name: String::new(),
            system: SystemMetadata::default(),
            error: String::new(),
            location: report_location(location),
        }
    }

    pub async fn save(&self) -> Result<()> {
        save_report(&self.location, self).await
    }
}

/// Accumulated record of one `profile` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReport {
    pub state: CmdState,
    pub original_image: String,
    #[serde(default)]
    pub artifact_location: String,
    #[serde(default)]
    pub container_report_name: String,
    #[serde(default)]
    pub seccomp_profile_name: String,
    #[serde(default)]
    pub apparmor_profile_name: String,

    #[serde(skip)]
    location: PathBuf,
}

impl ProfileReport {
    pub fn new(location: &str, original_image: &str) -> Self {
        Self {
            state: CmdState::Started,
            original_image: original_image.to_string(),
            artifact_location: String::new(),
            container_report_name: String::new(),
            seccomp_profile_name: String::new(),
            apparmor_profile_name: String::new(),
            location: report_location(location),
        }
    }

    pub async fn save(&self) -> Result<()> {
        save_report(&self.location, self).await
    }
}

fn report_location(location: &str) -> PathBuf {
    if location.is_empty() {
        PathBuf::from(DEFAULT_REPORT_FILE)
    } else {
        PathBuf::from(shellexpand::tilde(location).as_ref())
    }
}

async fn save_report<T: Serialize>(location: &Path, report: &T) -> Result<()> {
    if let Some(parent) = location.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating report directory {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(location, json)
        .await
        .with_context(|| format!("writing command report {}", location.display()))?;
    Ok(())
}

/// Render a byte count the way humans read image sizes.
pub fn human_size(bytes: i64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes.max(0), UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
