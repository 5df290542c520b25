use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortMap};
use bollard::Docker;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ContainerOverrides, VolumeMount};
use crate::inspectors::image::ImageInfo;
use crate::inspectors::ContainerInspect;
use crate::paths::{sensor_mount_point, ImageStateDirs};
use crate::report::{ContainerReport, CONTAINER_REPORT_FILE};

/// Control ports the sensor listens on inside the container; published to
/// the host like the service ports but never probed.
pub const CMD_PORT: &str = "65501/tcp";
pub const EVT_PORT: &str = "65502/tcp";

/// Archive the sensor leaves next to its report.
const FILES_ARCHIVE: &str = "files.tar";

/// Grace period for the target to flush monitor data on stop.
const STOP_TIMEOUT_SECS: i64 = 9;

/// Everything tunable about the instrumented run.
#[derive(Debug, Clone, Default)]
pub struct ContainerRunOpts {
    pub overrides: ContainerOverrides,
    pub links: Vec<String>,
    pub etc_hosts_maps: Vec<String>,
    pub dns_servers: Vec<String>,
    pub dns_search_domains: Vec<String>,
    pub volume_mounts: Vec<VolumeMount>,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub include_bins: Vec<String>,
    pub include_exes: Vec<String>,
    pub include_shell: bool,
    pub show_container_logs: bool,
}

/// What the sensor reads from the shared volume before it launches the
/// target application.
#[derive(Debug, Serialize)]
struct SensorConfig<'a> {
    app_entrypoint: &'a [String],
    app_cmd: &'a [String],
    include_paths: &'a [String],
    exclude_paths: &'a [String],
    include_bins: &'a [String],
    include_exes: &'a [String],
    include_shell: bool,
}

/// Docker-backed container inspector: runs the instrumented copy of the
/// target image and harvests what the sensor collected.
pub struct ContainerInspector {
    docker: Docker,
    image: ImageInfo,
    dirs: ImageStateDirs,
    opts: ContainerRunOpts,
    seccomp_profile_name: String,
    app_armor_profile_name: String,

    container_name: String,
    container_id: String,
    port_bindings: PortMap,
    docker_host_ip: String,
}

impl ContainerInspector {
    pub fn new(
        docker: Docker,
        image: ImageInfo,
        dirs: ImageStateDirs,
        opts: ContainerRunOpts,
        seccomp_profile_name: &str,
        app_armor_profile_name: &str,
    ) -> Self {
        Self {
            docker,
            image,
            dirs,
            opts,
            seccomp_profile_name: seccomp_profile_name.to_string(),
            app_armor_profile_name: app_armor_profile_name.to_string(),
            container_name: format!("slimbox-{}", Uuid::new_v4().simple()),
            container_id: String::new(),
            port_bindings: PortMap::new(),
            docker_host_ip: crate::docker::host_ip(),
        }
    }

    fn write_sensor_config(&self) -> Result<()> {
        let overrides = &self.opts.overrides;
        let entrypoint: &[String] = if overrides.clear_entrypoint {
            &[]
        } else if !overrides.entrypoint.is_empty() {
            &overrides.entrypoint
        } else {
            &self.image.entrypoint
        };
        let cmd: &[String] = if overrides.clear_cmd {
            &[]
        } else if !overrides.cmd.is_empty() {
            &overrides.cmd
        } else {
            &self.image.cmd
        };

        let config = SensorConfig {
            app_entrypoint: entrypoint,
            app_cmd: cmd,
            include_paths: &self.opts.include_paths,
            exclude_paths: &self.opts.exclude_paths,
            include_bins: &self.opts.include_bins,
            include_exes: &self.opts.include_exes,
            include_shell: self.opts.include_shell,
        };

        let path = self.dirs.volume.join("sensor.conf.json");
        let json = serde_json::to_string_pretty(&config)?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing sensor config {}", path.display()))?;
        Ok(())
    }

    fn exposed_ports(&self) -> HashMap<String, HashMap<(), ()>> {
        let mut ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in &self.image.exposed_ports {
            ports.insert(normalize_port_key(port), HashMap::new());
        }
        for port in &self.opts.overrides.expose {
            ports.insert(normalize_port_key(port), HashMap::new());
        }
        ports.insert(CMD_PORT.to_string(), HashMap::new());
        ports.insert(EVT_PORT.to_string(), HashMap::new());
        ports
    }

    fn binds(&self) -> Vec<String> {
        let mut binds = vec![format!(
            "{}:{}",
            self.dirs.volume.display(),
            sensor_mount_point()
        )];
        for mount in &self.opts.volume_mounts {
            if mount.options.is_empty() {
                binds.push(format!("{}:{}", mount.source, mount.destination));
            } else {
                binds.push(format!(
                    "{}:{}:{}",
                    mount.source, mount.destination, mount.options
                ));
            }
        }
        binds
    }

    fn host_port_for(&self, container_port: &str) -> Option<String> {
        self.port_bindings
            .get(container_port)?
            .as_ref()?
            .first()?
            .host_port
            .clone()
    }

    /// Open the sensor's command channel and exchange one line.
    async fn send_monitor_command(&self, command: &str) -> Result<String> {
        let host_port = self
            .host_port_for(CMD_PORT)
            .context("sensor command port is not bound")?;
        let addr = format!("{}:{}", self.docker_host_ip, host_port);

        let mut stream = timeout(Duration::from_secs(10), TcpStream::connect(&addr))
            .await
            .context("connecting to the sensor command port timed out")?
            .with_context(|| format!("connecting to the sensor command port at {}", addr))?;

        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\n").await?;

        let mut reader = BufReader::new(stream);
        let mut ack = String::new();
        timeout(Duration::from_secs(30), reader.read_line(&mut ack))
            .await
            .context("waiting for the sensor acknowledgement timed out")?
            .context("reading the sensor acknowledgement")?;
        Ok(ack.trim().to_string())
    }

    /// Wait for the sensor's startup event so probing does not race the
    /// target application launch. Best effort.
    async fn await_monitor_started(&self) {
        let Some(host_port) = self.host_port_for(EVT_PORT) else {
            debug!("sensor event port is not bound");
            return;
        };
        let addr = format!("{}:{}", self.docker_host_ip, host_port);

        let attempt = async {
            let stream = TcpStream::connect(&addr).await?;
            let mut reader = BufReader::new(stream);
            let mut event = String::new();
            reader.read_line(&mut event).await?;
            Ok::<String, std::io::Error>(event.trim().to_string())
        };

        match timeout(Duration::from_secs(5), attempt).await {
            Ok(Ok(event)) => debug!(event = %event, "sensor event"),
            Ok(Err(err)) => debug!(error = %err, "sensor event channel not readable"),
            Err(_) => debug!("no sensor startup event within 5s"),
        }
    }

    async fn dump_container_logs(&self) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut logs = self.docker.logs(&self.container_id, Some(options));

        println!("container logs ({}) ====================", self.container_name);
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(output) => print!("{}", output),
                Err(err) => {
                    warn!(error = %err, "reading container logs failed");
                    break;
                }
            }
        }
        println!("end of container logs =============");
    }
}

#[async_trait]
impl ContainerInspect for ContainerInspector {
    async fn run_container(&mut self) -> Result<()> {
        self.write_sensor_config()?;

        let overrides = &self.opts.overrides;
        let sensor_entrypoint = vec![format!("{}/bin/slimbox-sensor", sensor_mount_point())];

        let host_config = HostConfig {
            binds: Some(self.binds()),
            publish_all_ports: Some(true),
            cap_add: Some(vec!["SYS_PTRACE".to_string()]),
            security_opt: Some(vec!["apparmor:unconfined".to_string()]),
            links: some_if_not_empty(&self.opts.links),
            extra_hosts: some_if_not_empty(&self.opts.etc_hosts_maps),
            dns: some_if_not_empty(&self.opts.dns_servers),
            dns_search: some_if_not_empty(&self.opts.dns_search_domains),
            network_mode: if overrides.network.is_empty() {
                None
            } else {
                Some(overrides.network.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(self.image.id.clone()),
            entrypoint: Some(sensor_entrypoint),
            env: some_if_not_empty(&overrides.env),
            user: if overrides.user.is_empty() {
                None
            } else {
                Some(overrides.user.clone())
            },
            working_dir: if overrides.workdir.is_empty() {
                None
            } else {
                Some(overrides.workdir.clone())
            },
            labels: if overrides.labels.is_empty() {
                None
            } else {
                Some(overrides.labels.clone())
            },
            exposed_ports: Some(self.exposed_ports()),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.container_name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .with_context(|| format!("creating container {}", self.container_name))?;

        self.docker
            .start_container(&self.container_name, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("starting container {}", self.container_name))?;

        let inspected = self
            .docker
            .inspect_container(&self.container_name, None::<InspectContainerOptions>)
            .await
            .context("inspecting the started container")?;

        self.container_id = inspected.id.unwrap_or_default();
        self.port_bindings = inspected
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default();

        info!(
            name = %self.container_name,
            id = %self.container_id,
            ports = ?self.port_bindings.keys().collect::<Vec<_>>(),
            "instrumented container running"
        );

        self.await_monitor_started().await;
        Ok(())
    }

    fn container_name(&self) -> &str {
        &self.container_name
    }

    fn container_id(&self) -> &str {
        &self.container_id
    }

    fn host_port_list(&self) -> String {
        let mut ports: Vec<String> = self
            .port_bindings
            .values()
            .filter_map(|bindings| bindings.as_ref()?.first()?.host_port.clone())
            .collect();
        ports.sort_unstable();
        ports.join(",")
    }

    fn host_port_info(&self) -> String {
        let mut pairs: Vec<String> = self
            .port_bindings
            .iter()
            .filter_map(|(container_port, bindings)| {
                let host_port = bindings.as_ref()?.first()?.host_port.clone()?;
                Some(format!("{} => {}", container_port, host_port))
            })
            .collect();
        pairs.sort_unstable();
        pairs.join(", ")
    }

    fn docker_host_ip(&self) -> &str {
        &self.docker_host_ip
    }

    fn port_bindings(&self) -> &PortMap {
        &self.port_bindings
    }

    fn cmd_port(&self) -> &str {
        CMD_PORT
    }

    fn evt_port(&self) -> &str {
        EVT_PORT
    }

    async fn finish_monitoring(&mut self) {
        match self.send_monitor_command("cmd.monitor.finish").await {
            Ok(ack) => debug!(ack = %ack, "monitor finished"),
            Err(err) => warn!(error = %err, "could not signal the monitor to finish"),
        }
    }

    async fn shutdown_container(&mut self) -> Result<()> {
        if self.opts.show_container_logs {
            self.dump_container_logs().await;
        }

        self.docker
            .stop_container(
                &self.container_name,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
            .with_context(|| format!("stopping container {}", self.container_name))?;

        self.docker
            .remove_container(
                &self.container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("removing container {}", self.container_name))?;

        info!(name = %self.container_name, "container shut down");
        Ok(())
    }

    fn has_collected_data(&self) -> bool {
        self.dirs
            .volume
            .join("artifacts")
            .join(CONTAINER_REPORT_FILE)
            .is_file()
    }

    async fn process_collected_data(&self) -> Result<()> {
        let collected = self.dirs.volume.join("artifacts");
        let report_path = collected.join(CONTAINER_REPORT_FILE);

        let report = ContainerReport::load(&report_path)?;
        crate::paths::copy_into(&report_path, &self.dirs.artifacts)?;

        let archive = collected.join(FILES_ARCHIVE);
        if archive.is_file() {
            let files_dir = self.dirs.artifacts.join("files");
            unpack_files_archive(&archive, &files_dir)?;
        } else {
            warn!(path = %archive.display(), "sensor left no file archive");
        }

        let seccomp = generate_seccomp_profile(&report);
        tokio::fs::write(
            self.dirs.artifacts.join(&self.seccomp_profile_name),
            serde_json::to_string_pretty(&seccomp)?,
        )
        .await
        .context("writing seccomp profile")?;

        let apparmor = generate_apparmor_profile(&self.app_armor_profile_name, &report);
        tokio::fs::write(
            self.dirs.artifacts.join(&self.app_armor_profile_name),
            apparmor,
        )
        .await
        .context("writing apparmor profile")?;

        info!(location = %self.dirs.artifacts.display(), "container artifacts processed");
        Ok(())
    }
}

fn some_if_not_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

fn normalize_port_key(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{}/tcp", port)
    }
}

/// Unpack the sensor's file archive, refusing entries that would land
/// outside the destination tree.
fn unpack_files_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("creating {}", dest.display()))?;

    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("opening {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(file);

    for entry in archive.entries().context("reading file archive")? {
        let mut entry = entry.context("reading file archive entry")?;
        let path: PathBuf = entry.path().context("archive entry path")?.into_owned();
        let path_str = path.to_string_lossy();

        if path_str.contains("..") || path.is_absolute() {
            warn!(path = %path_str, "skipping archive entry outside the target tree");
            continue;
        }

        if !entry
            .unpack_in(dest)
            .with_context(|| format!("unpacking {}", path_str))?
        {
            debug!(path = %path_str, "archive entry skipped");
        }
    }

    Ok(())
}

/// Allowlist profile for the syscalls the monitor saw the target make.
fn generate_seccomp_profile(report: &ContainerReport) -> serde_json::Value {
    serde_json::json!({
        "defaultAction": "SCMP_ACT_ERRNO",
        "architectures": ["SCMP_ARCH_X86_64", "SCMP_ARCH_X86"],
        "syscalls": [{
            "names": report.syscalls,
            "action": "SCMP_ACT_ALLOW"
        }]
    })
}

fn generate_apparmor_profile(name: &str, report: &ContainerReport) -> String {
    let mut profile = String::new();
    profile.push_str("#include <tunables/global>\n\n");
    profile.push_str(&format!(
        "profile {} flags=(attach_disconnected,mediate_deleted) {{\n",
        name
    ));
    profile.push_str("  network,\n");
    for file in &report.files {
        profile.push_str(&format!("  {} r,\n", file));
    }
    for exe in &report.executables {
        profile.push_str(&format!("  {} rix,\n", exe));
    }
    profile.push_str("}\n");
    profile
}
