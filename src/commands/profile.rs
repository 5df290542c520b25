use anyhow::Result;
use tracing::{info, warn};

use crate::cli::args::ProfileArgs;
use crate::commands::common;
use crate::docker;
use crate::inspectors::container::ContainerInspector;
use crate::inspectors::image::ImageInspector;
use crate::inspectors::{ContainerInspect, ImageInspect};
use crate::paths;
use crate::report::{human_size, CmdState, ProfileReport, CONTAINER_REPORT_FILE};
use crate::version;

const PREFIX: &str = "slimbox[profile]:";

/// Drive one `profile` run: same pipeline as `build` minus the minified
/// image, leaving only the harvested artifacts and profiles behind.
pub async fn cmd_profile(args: ProfileArgs, debug: bool, check_version: bool) -> Result<()> {
    let version_rx = version::check_async(check_version);
    let mut report = ProfileReport::new(&args.target.report, &args.target.target);

    let outcome = run_profile(&args, debug, &mut report).await;
    if outcome.is_err() {
        report.state = CmdState::Error;
    }

    let version_info = version_rx.await.ok().flatten();
    version::print_check(version_info.as_ref());

    if let Err(err) = report.save().await {
        warn!(error = %err, "could not save the command report");
    }

    outcome
}

async fn run_profile(args: &ProfileArgs, debug: bool, report: &mut ProfileReport) -> Result<()> {
    let docker = docker::connect()?;
    let exercise_opts = args.probe.exercise_opts()?;

    println!("{} state=started", PREFIX);
    println!("{} info=params target={}", PREFIX, args.target.target);

    if debug {
        version::print_docker(&docker).await;
    }

    let overrides = args.container.overrides()?;
    if !common::confirm_network(&docker, &overrides.network).await {
        println!(
            "{} info=param.error status=unknown.network value={}",
            PREFIX, overrides.network
        );
        println!("{} state=exited version={}", PREFIX, version::current());
        std::process::exit(-111);
    }

    let mut image_inspector = ImageInspector::new(docker.clone(), &args.target.target).await?;
    if image_inspector.no_image() {
        println!("{} target image not found - {}", PREFIX, args.target.target);
        println!("{} state=exited", PREFIX);
        report.state = CmdState::Exited;
        return Ok(());
    }

    println!("{} state=image.inspection.start", PREFIX);
    info!("inspecting the fat image metadata");
    image_inspector.inspect().await?;

    let dirs =
        paths::prepare_image_state_dirs(&args.target.state_path, &image_inspector.image_info().id)?;
    image_inspector.set_artifact_location(&dirs.artifacts);

    let size = image_inspector.image_info().virtual_size;
    println!(
        "{} info=image id={} size.bytes={} size.human={}",
        PREFIX,
        image_inspector.image_info().id,
        size,
        human_size(size)
    );

    info!("processing the fat image info");
    image_inspector.process_collected_data().await?;

    println!("{} state=image.inspection.done", PREFIX);
    println!("{} state=container.inspection.start", PREFIX);

    let run_opts = args.container.run_opts(args.target.show_clogs)?;
    let mut container_inspector = ContainerInspector::new(
        docker.clone(),
        image_inspector.image_info().clone(),
        dirs.clone(),
        run_opts,
        image_inspector.seccomp_profile_name(),
        image_inspector.app_armor_profile_name(),
    );

    info!("starting the instrumented container");
    container_inspector.run_container().await?;
    common::print_container_info(PREFIX, &container_inspector);

    info!("watching the container monitor");
    let exposed_ports = image_inspector
        .dockerfile_info()
        .map(|d| d.exposed_ports.clone())
        .unwrap_or_default();
    if !common::exercise_container(PREFIX, &mut container_inspector, &exposed_ports, &exercise_opts)
        .await?
    {
        report.state = CmdState::Exited;
        return Ok(());
    }

    println!("{} state=container.inspection.artifact.processing", PREFIX);

    if !container_inspector.has_collected_data() {
        image_inspector.show_fat_image_instructions();
        println!(
            "{} info=results status='no data collected. (version: {})'",
            PREFIX,
            version::current()
        );
        println!("{} state=exited", PREFIX);
        report.state = CmdState::Exited;
        return Ok(());
    }

    info!("processing the instrumented container info");
    container_inspector.process_collected_data().await?;

    println!("{} state=container.inspection.done", PREFIX);
    println!("{} state=completed", PREFIX);
    report.state = CmdState::Completed;

    report.artifact_location = dirs.artifacts.display().to_string();
    report.container_report_name = CONTAINER_REPORT_FILE.to_string();
    report.seccomp_profile_name = image_inspector.seccomp_profile_name().to_string();
    report.apparmor_profile_name = image_inspector.app_armor_profile_name().to_string();

    if !args.target.copy_meta_artifacts.is_empty() {
        let names = [
            CONTAINER_REPORT_FILE,
            image_inspector.seccomp_profile_name(),
            image_inspector.app_armor_profile_name(),
        ];
        if !common::copy_meta_artifacts(&dirs.artifacts, &names, &args.target.copy_meta_artifacts)
            .await
        {
            println!("{} info=artifacts message='could not copy meta artifacts'", PREFIX);
        }
    }

    println!("{} state=done", PREFIX);
    report.state = CmdState::Done;
    Ok(())
}
