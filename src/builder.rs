use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::config::{ContainerOverrides, ImageNewInstructions};
use crate::inspectors::image::ImageInfo;

/// Builds the minified image from the harvested file tree plus the
/// metadata carried over (or overridden) from the fat image.
pub struct ImageBuilder {
    docker: Docker,
    pub repo_name: String,
    pub has_data: bool,
    artifact_dir: PathBuf,
    show_build_logs: bool,
    pub build_log: String,
}

impl ImageBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        docker: Docker,
        tag: &str,
        image: &ImageInfo,
        artifact_dir: &Path,
        show_build_logs: bool,
        selectors: &[String],
        overrides: &ContainerOverrides,
        instructions: &ImageNewInstructions,
    ) -> Result<Self> {
        let files_dir = artifact_dir.join("files");
        let has_data = files_dir.is_dir()
            && files_dir
                .read_dir()
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);

        let dockerfile = generate_dockerfile(image, selectors, overrides, instructions, has_data);
        let dockerfile_path = artifact_dir.join("Dockerfile");
        std::fs::write(&dockerfile_path, dockerfile)
            .with_context(|| format!("writing {}", dockerfile_path.display()))?;
        debug!(path = %dockerfile_path.display(), "minified image instructions written");

        Ok(Self {
            docker,
            repo_name: tag.to_string(),
            has_data,
            artifact_dir: artifact_dir.to_path_buf(),
            show_build_logs,
            build_log: String::new(),
        })
    }

    pub async fn build(&mut self) -> Result<()> {
        let mut context = tar::Builder::new(Vec::new());
        context
            .append_path_with_name(self.artifact_dir.join("Dockerfile"), "Dockerfile")
            .context("adding Dockerfile to the build context")?;
        let files_dir = self.artifact_dir.join("files");
        if files_dir.is_dir() {
            context
                .append_dir_all("files", &files_dir)
                .context("adding file artifacts to the build context")?;
        }
        let context = context.into_inner().context("finishing the build context")?;

        let options = BuildImageOptions::<String> {
            dockerfile: "Dockerfile".to_string(),
            t: self.repo_name.clone(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(update) = stream.next().await {
            let update = update.context("building the minified image")?;
            if let Some(msg) = update.stream {
                self.build_log.push_str(&msg);
            }
            if let Some(err) = update.error {
                bail!("minified image build failed: {}", err);
            }
        }

        if self.show_build_logs {
            println!("build logs ====================");
            println!("{}", self.build_log);
            println!("end of build logs =============");
        }

        info!(tag = %self.repo_name, "minified image built");
        Ok(())
    }
}

/// Builds the un-instrumented "fat" image from a user-supplied Dockerfile
/// and context directory (the `--from-dockerfile` path into `build`).
pub struct BasicImageBuilder {
    docker: Docker,
    pub repo_name: String,
    dockerfile: String,
    context_dir: PathBuf,
    show_build_logs: bool,
    pub build_log: String,
}

impl BasicImageBuilder {
    pub fn new(
        docker: Docker,
        tag: &str,
        dockerfile: &str,
        context_dir: &Path,
        show_build_logs: bool,
    ) -> Self {
        Self {
            docker,
            repo_name: tag.to_string(),
            dockerfile: dockerfile.to_string(),
            context_dir: context_dir.to_path_buf(),
            show_build_logs,
            build_log: String::new(),
        }
    }

    pub async fn build(&mut self) -> Result<()> {
        let mut context = tar::Builder::new(Vec::new());
        context
            .append_dir_all(".", &self.context_dir)
            .with_context(|| format!("adding {} to the build context", self.context_dir.display()))?;
        let context = context.into_inner().context("finishing the build context")?;

        let options = BuildImageOptions::<String> {
            dockerfile: self.dockerfile.clone(),
            t: self.repo_name.clone(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(update) = stream.next().await {
            let update = update.context("building the basic image")?;
            if let Some(msg) = update.stream {
                self.build_log.push_str(&msg);
            }
            if let Some(err) = update.error {
                bail!("basic image build failed: {}", err);
            }
        }

        if self.show_build_logs {
            println!("build logs (basic image) ====================");
            println!("{}", self.build_log);
            println!("end of build logs (basic image) =============");
        }

        info!(tag = %self.repo_name, "basic image built");
        Ok(())
    }
}

/// Name for the intermediate fat image. A custom tag may carry at most one
/// `:`; anything else is a parameter error the caller turns into an exit.
pub fn fat_image_repo_name(custom_tag: &str) -> Result<String> {
    let parts: Vec<&str> = custom_tag.split(':').collect();
    match parts.as_slice() {
        [name] => Ok(format!("{}.fat", name)),
        [name, tag] => Ok(format!("{}.fat:{}", name, tag)),
        _ => bail!("malformed custom image tag: {}", custom_tag),
    }
}

/// Fallback fat image name when the user supplied no tag.
pub fn default_fat_image_repo_name() -> String {
    format!(
        "slimbox-tmp-fat-image.{}.{}",
        std::process::id(),
        chrono::Utc::now().format("%Y%m%d%H%M%S")
    )
}

/// Assemble the minified image's build instructions.
///
/// Base metadata comes from the fat image; each selector in `selectors`
/// swaps in the matching override; new instructions are applied on top.
fn generate_dockerfile(
    image: &ImageInfo,
    selectors: &[String],
    overrides: &ContainerOverrides,
    instructions: &ImageNewInstructions,
    has_data: bool,
) -> String {
    let selected = |name: &str| selectors.iter().any(|s| s == name);

    let mut lines = vec!["FROM scratch".to_string()];
    if has_data {
        lines.push("COPY files /".to_string());
    }

    let mut env = if selected("env") && !overrides.env.is_empty() {
        overrides.env.clone()
    } else {
        image.env.clone()
    };
    env.extend(instructions.env.iter().cloned());
    for entry in &env {
        lines.push(format!("ENV {}", entry));
    }

    let mut labels = image.labels.clone();
    if selected("label") {
        labels.extend(overrides.labels.clone());
    }
    labels.extend(instructions.labels.clone());
    let mut label_keys: Vec<&String> = labels.keys().collect();
    label_keys.sort();
    for key in label_keys {
        lines.push(format!("LABEL {}=\"{}\"", key, labels[key]));
    }

    let mut volumes = image.volumes.clone();
    volumes.extend(instructions.volumes.iter().cloned());
    for volume in &volumes {
        lines.push(format!("VOLUME {}", volume));
    }

    let workdir = if selected("workdir") && !overrides.workdir.is_empty() {
        &overrides.workdir
    } else if !instructions.workdir.is_empty() {
        &instructions.workdir
    } else {
        &image.working_dir
    };
    if !workdir.is_empty() {
        lines.push(format!("WORKDIR {}", workdir));
    }

    let mut expose = if selected("expose") && !overrides.expose.is_empty() {
        overrides.expose.clone()
    } else {
        image.exposed_ports.clone()
    };
    for port in &instructions.expose {
        if !expose.contains(port) {
            expose.push(port.clone());
        }
    }
    for port in &expose {
        lines.push(format!("EXPOSE {}", port));
    }

    let user = if selected("user") && !overrides.user.is_empty() {
        &overrides.user
    } else {
        &image.user
    };
    if !user.is_empty() {
        lines.push(format!("USER {}", user));
    }

    let entrypoint: &[String] = if selected("entrypoint") {
        if overrides.clear_entrypoint {
            &[]
        } else {
            &overrides.entrypoint
        }
    } else {
        &image.entrypoint
    };
    if !entrypoint.is_empty() {
        lines.push(format!("ENTRYPOINT {}", exec_form(entrypoint)));
    }

    let cmd: &[String] = if selected("cmd") {
        if overrides.clear_cmd {
            &[]
        } else {
            &overrides.cmd
        }
    } else {
        &image.cmd
    };
    if !cmd.is_empty() {
        lines.push(format!("CMD {}", exec_form(cmd)));
    }

    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');
    dockerfile
}

fn exec_form(parts: &[String]) -> String {
    serde_json::to_string(parts).unwrap_or_else(|err| {
        warn!(error = %err, "could not render exec form");
        String::from("[]")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_image() -> ImageInfo {
        ImageInfo {
            id: "sha256:fat".to_string(),
            user: "www".to_string(),
            exposed_ports: vec!["80/tcp".to_string()],
            env: vec!["PATH=/usr/bin".to_string()],
            entrypoint: vec!["/usr/sbin/nginx".to_string()],
            cmd: vec!["-g".to_string(), "daemon off;".to_string()],
            working_dir: "/srv".to_string(),
            labels: HashMap::from([("vendor".to_string(), "acme".to_string())]),
            ..Default::default()
        }
    }

    #[test]
    fn test_dockerfile_carries_fat_image_metadata() {
        let dockerfile = generate_dockerfile(
            &sample_image(),
            &[],
            &ContainerOverrides::default(),
            &ImageNewInstructions::default(),
            true,
        );

        assert!(dockerfile.starts_with("FROM scratch\nCOPY files /\n"));
        assert!(dockerfile.contains("ENV PATH=/usr/bin"));
        assert!(dockerfile.contains("LABEL vendor=\"acme\""));
        assert!(dockerfile.contains("WORKDIR /srv"));
        assert!(dockerfile.contains("EXPOSE 80/tcp"));
        assert!(dockerfile.contains("USER www"));
        assert!(dockerfile.contains("ENTRYPOINT [\"/usr/sbin/nginx\"]"));
        assert!(dockerfile.contains("CMD [\"-g\",\"daemon off;\"]"));
    }

    #[test]
    fn test_dockerfile_selector_overrides() {
        let overrides = ContainerOverrides {
            cmd: vec!["serve".to_string()],
            user: "root".to_string(),
            clear_entrypoint: true,
            ..Default::default()
        };
        let selectors = vec![
            "cmd".to_string(),
            "user".to_string(),
            "entrypoint".to_string(),
        ];

        let dockerfile = generate_dockerfile(
            &sample_image(),
            &selectors,
            &overrides,
            &ImageNewInstructions::default(),
            false,
        );

        assert!(!dockerfile.contains("COPY files /"));
        assert!(!dockerfile.contains("ENTRYPOINT"));
        assert!(dockerfile.contains("CMD [\"serve\"]"));
        assert!(dockerfile.contains("USER root"));
    }

    #[test]
    fn test_dockerfile_new_instructions_added() {
        let instructions = ImageNewInstructions {
            env: vec!["MODE=slim".to_string()],
            expose: vec!["8443/tcp".to_string()],
            labels: HashMap::from([("minified".to_string(), "true".to_string())]),
            ..Default::default()
        };

        let dockerfile = generate_dockerfile(
            &sample_image(),
            &[],
            &ContainerOverrides::default(),
            &instructions,
            true,
        );

        assert!(dockerfile.contains("ENV MODE=slim"));
        assert!(dockerfile.contains("EXPOSE 80/tcp"));
        assert!(dockerfile.contains("EXPOSE 8443/tcp"));
        assert!(dockerfile.contains("LABEL minified=\"true\""));
    }

    #[test]
    fn test_fat_image_repo_name() {
        assert_eq!(fat_image_repo_name("myapp").unwrap(), "myapp.fat");
        assert_eq!(fat_image_repo_name("myapp:1.0").unwrap(), "myapp.fat:1.0");
        assert!(fat_image_repo_name("reg:5000/app:1").is_err());
    }
}
