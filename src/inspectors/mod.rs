pub mod container;
pub mod image;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use bollard::models::PortMap;

use crate::inspectors::image::{DockerfileInfo, ImageInfo, ImageRecordInfo};

/// Capability surface the orchestrator needs from an image inspector.
/// Implementations backed by other container runtimes are substitutable.
#[async_trait]
pub trait ImageInspect {
    /// True when the referenced image does not exist in the runtime.
    fn no_image(&self) -> bool;

    /// Extract image metadata.
    async fn inspect(&mut self) -> Result<()>;

    /// Derive secondary data (reconstructed Dockerfile, user/port lists)
    /// and stage it under the artifact location.
    async fn process_collected_data(&mut self) -> Result<()>;

    fn image_info(&self) -> &ImageInfo;
    fn image_record(&self) -> &ImageRecordInfo;
    fn dockerfile_info(&self) -> Option<&DockerfileInfo>;

    fn artifact_location(&self) -> &Path;
    fn set_artifact_location(&mut self, location: &Path);

    /// Repo name to tag the minified image with when the user gives none.
    fn slim_image_repo(&self) -> &str;
    fn seccomp_profile_name(&self) -> &str;
    fn app_armor_profile_name(&self) -> &str;

    /// Print the reconstructed build instructions of the fat image.
    fn show_fat_image_instructions(&self);
}

/// Capability surface the orchestrator needs from a container inspector.
#[async_trait]
pub trait ContainerInspect {
    /// Start the instrumented container and publish its port map.
    async fn run_container(&mut self) -> Result<()>;

    fn container_name(&self) -> &str;
    fn container_id(&self) -> &str;

    /// Comma list of bound host ports, for the operator hint line.
    fn host_port_list(&self) -> String;
    /// `container => host` pairs, for the operator hint line.
    fn host_port_info(&self) -> String;

    /// Address probe traffic uses to reach the published ports.
    fn docker_host_ip(&self) -> &str;
    /// Container-port to host-binding map as published by the runtime.
    fn port_bindings(&self) -> &PortMap;

    /// Reserved control ports (command/event channel); never probed.
    fn cmd_port(&self) -> &str;
    fn evt_port(&self) -> &str;

    /// Tell the in-container monitor to stop collecting. Errors are
    /// logged, not surfaced; monitoring always counts as finished.
    async fn finish_monitoring(&mut self);

    /// Stop and remove the container.
    async fn shutdown_container(&mut self) -> Result<()>;

    /// Whether the monitor left a report behind.
    fn has_collected_data(&self) -> bool;

    /// Harvest the collected artifacts into the artifact location.
    async fn process_collected_data(&self) -> Result<()>;
}
