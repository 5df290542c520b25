use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::models::{HistoryResponseItem, ImageInspect as ImageInspectResponse};
use bollard::Docker;
use tracing::{debug, info};

use crate::docker;
use crate::inspectors::ImageInspect;
use crate::report::ImageLayerInfo;

/// File the reconstructed fat-image instructions are written to.
pub const FAT_DOCKERFILE_FILE: &str = "Dockerfile.fat";

/// Metadata extracted from the target image.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub id: String,
    pub virtual_size: i64,
    pub created: String,
    pub author: String,
    pub docker_version: String,
    pub architecture: String,
    pub user: String,
    pub exposed_ports: Vec<String>,
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub labels: HashMap<String, String>,
    pub volumes: Vec<String>,
}

/// Identity of the image record in the local store.
#[derive(Debug, Clone, Default)]
pub struct ImageRecordInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// What we can recover about the image's build instructions from its
/// layer history.
#[derive(Debug, Clone, Default)]
pub struct DockerfileInfo {
    pub lines: Vec<String>,
    /// EXPOSE entries in declaration order (oldest layer first)
    pub exposed_ports: Vec<String>,
    pub exe_user: String,
    pub all_users: Vec<String>,
    pub image_stack: Vec<ImageLayerInfo>,
}

/// Docker-backed image inspector.
pub struct ImageInspector {
    docker: Docker,
    pub image_ref: String,
    raw: Option<ImageInspectResponse>,
    image_info: ImageInfo,
    image_record: ImageRecordInfo,
    dockerfile_info: Option<DockerfileInfo>,
    artifact_location: PathBuf,
    slim_image_repo: String,
    seccomp_profile_name: String,
    app_armor_profile_name: String,
}

impl ImageInspector {
    /// Look the image up; a missing image is not an error here, the
    /// orchestrator checks `no_image` and exits cleanly.
    pub async fn new(docker: Docker, image_ref: &str) -> Result<Self> {
        let raw = match docker.inspect_image(image_ref).await {
            Ok(resp) => Some(resp),
            Err(err) if docker::is_not_found(&err) => None,
            Err(err) => return Err(err).context("inspecting target image"),
        };

        Ok(Self {
            docker,
            image_ref: image_ref.to_string(),
            raw,
            image_info: ImageInfo::default(),
            image_record: ImageRecordInfo::default(),
            dockerfile_info: None,
            artifact_location: PathBuf::new(),
            slim_image_repo: String::new(),
            seccomp_profile_name: String::new(),
            app_armor_profile_name: String::new(),
        })
    }
}

#[async_trait]
impl ImageInspect for ImageInspector {
    fn no_image(&self) -> bool {
        self.raw.is_none()
    }

    async fn inspect(&mut self) -> Result<()> {
        let Some(raw) = self.raw.clone() else {
            bail!("image not found: {}", self.image_ref);
        };

        let config = raw.config.clone().unwrap_or_default();

        let mut exposed_ports: Vec<String> = config
            .exposed_ports
            .as_ref()
            .map(|ports| ports.keys().cloned().collect())
            .unwrap_or_default();
        exposed_ports.sort();

        let mut volumes: Vec<String> = config
            .volumes
            .as_ref()
            .map(|vols| vols.keys().cloned().collect())
            .unwrap_or_default();
        volumes.sort();

        self.image_info = ImageInfo {
            id: raw.id.clone().unwrap_or_default(),
            virtual_size: raw.size.unwrap_or_default(),
            created: raw.created.clone().unwrap_or_default(),
            author: raw.author.clone().unwrap_or_default(),
            docker_version: raw.docker_version.clone().unwrap_or_default(),
            architecture: raw.architecture.clone().unwrap_or_default(),
            user: config.user.clone().unwrap_or_default(),
            exposed_ports,
            env: config.env.clone().unwrap_or_default(),
            entrypoint: config.entrypoint.clone().unwrap_or_default(),
            cmd: config.cmd.clone().unwrap_or_default(),
            working_dir: config.working_dir.clone().unwrap_or_default(),
            labels: config.labels.clone().unwrap_or_default(),
            volumes,
        };

        self.image_record = ImageRecordInfo {
            id: self.image_info.id.clone(),
            repo_tags: raw.repo_tags.clone().unwrap_or_default(),
        };

        self.slim_image_repo = slim_image_repo(&self.image_record.repo_tags);
        let profile_base = profile_base_name(&self.image_record.repo_tags);
        self.seccomp_profile_name = format!("{}-seccomp.json", profile_base);
        self.app_armor_profile_name = format!("{}-apparmor-profile", profile_base);

        debug!(id = %self.image_info.id, size = self.image_info.virtual_size, "image inspected");
        Ok(())
    }

    async fn process_collected_data(&mut self) -> Result<()> {
        let history = self
            .docker
            .image_history(&self.image_ref)
            .await
            .context("reading image history")?;

        let info = reverse_dockerfile_from_history(&history);

        if !self.artifact_location.as_os_str().is_empty() {
            let path = self.artifact_location.join(FAT_DOCKERFILE_FILE);
            let content = format!("{}\n", info.lines.join("\n"));
            tokio::fs::write(&path, content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "reconstructed fat image instructions");
        }

        self.dockerfile_info = Some(info);
        Ok(())
    }

    fn image_info(&self) -> &ImageInfo {
        &self.image_info
    }

    fn image_record(&self) -> &ImageRecordInfo {
        &self.image_record
    }

    fn dockerfile_info(&self) -> Option<&DockerfileInfo> {
        self.dockerfile_info.as_ref()
    }

    fn artifact_location(&self) -> &Path {
        &self.artifact_location
    }

    fn set_artifact_location(&mut self, location: &Path) {
        self.artifact_location = location.to_path_buf();
    }

    fn slim_image_repo(&self) -> &str {
        &self.slim_image_repo
    }

    fn seccomp_profile_name(&self) -> &str {
        &self.seccomp_profile_name
    }

    fn app_armor_profile_name(&self) -> &str {
        &self.app_armor_profile_name
    }

    fn show_fat_image_instructions(&self) {
        if let Some(info) = &self.dockerfile_info {
            println!("image instructions for {}:", self.image_ref);
            for line in &info.lines {
                println!("  {}", line);
            }
        }
    }
}

/// Repo name the minified image gets by default: `nginx:latest` ->
/// `nginx.slim`.
fn slim_image_repo(repo_tags: &[String]) -> String {
    match repo_tags.first() {
        Some(tag) => {
            let repo = tag.split(':').next().unwrap_or(tag);
            format!("{}.slim", repo)
        }
        None => "slimbox-image.slim".to_string(),
    }
}

fn profile_base_name(repo_tags: &[String]) -> String {
    match repo_tags.first() {
        Some(tag) => tag.replace(['/', ':'], "-"),
        None => "slimbox-image".to_string(),
    }
}

/// Rebuild the build instructions from the layer history. The runtime
/// returns history newest-first; declaration order is the reverse.
pub fn reverse_dockerfile_from_history(history: &[HistoryResponseItem]) -> DockerfileInfo {
    let mut info = DockerfileInfo::default();

    for item in history.iter().rev() {
        let created_by = item.created_by.trim();
        if created_by.is_empty() {
            continue;
        }

        let line = match created_by.split_once("#(nop)") {
            Some((_, instruction)) => instruction.trim().to_string(),
            None => {
                let run = created_by
                    .strip_prefix("/bin/sh -c ")
                    .unwrap_or(created_by)
                    .trim();
                format!("RUN {}", run)
            }
        };

        if let Some(ports) = line.strip_prefix("EXPOSE ") {
            for port in ports.split_whitespace() {
                info.exposed_ports.push(port.to_string());
            }
        } else if let Some(user) = line.strip_prefix("USER ") {
            info.all_users.push(user.trim().to_string());
        }

        if let Some(tag) = item.tags.first() {
            info.image_stack.push(ImageLayerInfo {
                full_name: tag.clone(),
                id: item.id.clone(),
            });
        }

        info.lines.push(line);
    }

    info.exe_user = info.all_users.last().cloned().unwrap_or_default();
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_item(created_by: &str, tags: &[&str]) -> HistoryResponseItem {
        HistoryResponseItem {
            id: "sha256:layer".to_string(),
            created: 0,
            created_by: created_by.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            size: 0,
            comment: String::new(),
        }
    }

    #[test]
    fn test_reverse_dockerfile_ordering_and_ports() {
        // newest first, as the daemon reports it
        let history = vec![
            history_item("/bin/sh -c #(nop)  CMD [\"nginx\"]", &[]),
            history_item("/bin/sh -c #(nop)  EXPOSE 443/tcp", &[]),
            history_item("/bin/sh -c #(nop)  EXPOSE 80/tcp", &[]),
            history_item("/bin/sh -c apt-get update", &[]),
            history_item("/bin/sh -c #(nop)  USER app", &["debian:stable"]),
        ];

        let info = reverse_dockerfile_from_history(&history);

        assert_eq!(info.exposed_ports, vec!["80/tcp", "443/tcp"]);
        assert_eq!(info.all_users, vec!["app"]);
        assert_eq!(info.exe_user, "app");
        assert_eq!(info.lines[0], "USER app");
        assert_eq!(info.lines[1], "RUN apt-get update");
        assert_eq!(info.lines.last().unwrap(), "CMD [\"nginx\"]");
        assert_eq!(info.image_stack.len(), 1);
        assert_eq!(info.image_stack[0].full_name, "debian:stable");
    }

    #[test]
    fn test_slim_image_repo_derivation() {
        assert_eq!(slim_image_repo(&["nginx:latest".to_string()]), "nginx.slim");
        assert_eq!(slim_image_repo(&["my/app:1.2".to_string()]), "my/app.slim");
        assert_eq!(slim_image_repo(&[]), "slimbox-image.slim");
    }

    #[test]
    fn test_profile_base_name_sanitized() {
        assert_eq!(
            profile_base_name(&["my/app:1.2".to_string()]),
            "my-app-1.2"
        );
    }
}
