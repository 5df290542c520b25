use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::builder::{self, BasicImageBuilder, ImageBuilder};
use crate::cli::args::BuildArgs;
use crate::commands::common;
use crate::config;
use crate::docker;
use crate::inspectors::container::ContainerInspector;
use crate::inspectors::image::ImageInspector;
use crate::inspectors::{ContainerInspect, ImageInspect};
use crate::paths;
use crate::report::{
    human_size, BuildReport, CmdState, ContainerReport, ImageMetadata, CONTAINER_REPORT_FILE,
};
use crate::version;

const PREFIX: &str = "slimbox[build]:";

/// Drive one `build` run end to end. The report is written whatever the
/// outcome; the version check launched here is joined right before that.
pub async fn cmd_build(args: BuildArgs, debug: bool, check_version: bool) -> Result<()> {
    let version_rx = version::check_async(check_version);
    let mut report = BuildReport::new(&args.target.report, &args.target.target);

    let outcome = run_build(&args, debug, &mut report).await;
    if let Err(err) = &outcome {
        report.state = CmdState::Error;
        report.error = format!("{:#}", err);
    }

    let version_info = version_rx.await.ok().flatten();
    version::print_check(version_info.as_ref());

    if let Err(err) = report.save().await {
        warn!(error = %err, "could not save the command report");
    }

    outcome
}

async fn run_build(args: &BuildArgs, debug: bool, report: &mut BuildReport) -> Result<()> {
    let docker = docker::connect()?;
    let exercise_opts = args.probe.exercise_opts()?;

    println!("{} state=started", PREFIX);
    if args.from_dockerfile.is_empty() {
        println!(
            "{} info=params target={} continue.mode={}",
            PREFIX, args.target.target, exercise_opts.continue_after
        );
    } else {
        println!(
            "{} info=params context={}/file={} continue.mode={}",
            PREFIX, args.target.target, args.from_dockerfile, exercise_opts.continue_after
        );
    }

    let mut image_ref = args.target.target.clone();
    if !args.from_dockerfile.is_empty() {
        println!("{} state=building message='building basic image'", PREFIX);

        let fat_tag = if args.tag.is_empty() {
            builder::default_fat_image_repo_name()
        } else {
            match builder::fat_image_repo_name(&args.tag) {
                Ok(tag) => tag,
                Err(_) => {
                    println!(
                        "{} info=param.error status=malformed.custom.image.tag value={}",
                        PREFIX, args.tag
                    );
                    println!("{} state=exited version={}", PREFIX, version::current());
                    std::process::exit(-1);
                }
            }
        };
        println!("{} info=basic.image.name value={}", PREFIX, fat_tag);

        let mut fat_builder = BasicImageBuilder::new(
            docker.clone(),
            &fat_tag,
            &args.from_dockerfile,
            Path::new(&args.target.target),
            args.show_blogs,
        );
        fat_builder.build().await.context("building the basic image")?;
        println!("{} state=basic.image.build.completed", PREFIX);

        image_ref = fat_tag;
    }

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

    let mut image_inspector = ImageInspector::new(docker.clone(), &image_ref).await?;
    if image_inspector.no_image() {
        println!("{} target image not found - {}", PREFIX, image_ref);
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

    if let Some(dockerfile) = image_inspector.dockerfile_info() {
        if !dockerfile.exe_user.is_empty() {
            println!(
                "{} info=image.users exe='{}' all='{}'",
                PREFIX,
                dockerfile.exe_user,
                dockerfile.all_users.join(",")
            );
        }
        if !dockerfile.image_stack.is_empty() {
            report.image_stack = dockerfile.image_stack.clone();
            for (index, layer) in dockerfile.image_stack.iter().enumerate() {
                println!(
                    "{} info=image.stack index={} name='{}' id='{}'",
                    PREFIX, index, layer.full_name, layer.id
                );
            }
        }
        if !dockerfile.exposed_ports.is_empty() {
            println!(
                "{} info=image.exposed_ports list='{}'",
                PREFIX,
                dockerfile.exposed_ports.join(",")
            );
        }
    }

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
            "{} info=results status='no data collected (no minified image generated). (version: {})'",
            PREFIX,
            version::current()
        );
        println!("{} state=exited", PREFIX);
        report.state = CmdState::Exited;
        return Ok(());
    }

    info!("processing the instrumented container info");
    container_inspector.process_collected_data().await?;

    let target_tag = if args.tag.is_empty() {
        image_inspector.slim_image_repo().to_string()
    } else {
        args.tag.clone()
    };

    println!("{} state=container.inspection.done", PREFIX);
    println!("{} state=building message='building minified image'", PREFIX);

    let selectors = config::parse_override_selectors(&args.image_overrides)?;
    let instructions = args.new_instructions()?;
    let mut image_builder = ImageBuilder::new(
        docker.clone(),
        &target_tag,
        image_inspector.image_info(),
        &dirs.artifacts,
        args.show_blogs,
        &selectors,
        &overrides,
        &instructions,
    )?;

    if !image_builder.has_data {
        warn!("no data artifacts");
    }

    image_builder.build().await?;

    println!("{} state=completed", PREFIX);
    report.state = CmdState::Completed;

    let mut minified_inspector =
        ImageInspector::new(docker.clone(), &image_builder.repo_name).await?;
    if minified_inspector.no_image() {
        println!(
            "{} info=results message='minified image not found - {}'",
            PREFIX, image_builder.repo_name
        );
        println!("{} state=exited", PREFIX);
        report.state = CmdState::Exited;
        return Ok(());
    }

    match minified_inspector.inspect().await {
        Ok(()) => {
            let source = image_inspector.image_info();
            let minified = minified_inspector.image_info();

            report.minified_by = source.virtual_size as f64 / minified.virtual_size.max(1) as f64;
            report.source_image = source_image_metadata(&image_inspector);
            report.minified_image_size = minified.virtual_size;
            report.minified_image_size_human = human_size(minified.virtual_size);

            println!(
                "{} info=results status='MINIFIED BY {:.2}X [{} ({}) => {} ({})]'",
                PREFIX,
                report.minified_by,
                report.source_image.size,
                report.source_image.size_human,
                report.minified_image_size,
                report.minified_image_size_human
            );
        }
        Err(err) => {
            warn!(error = %err, "could not inspect the minified image");
            report.state = CmdState::Error;
            report.error = format!("{:#}", err);
        }
    }

    report.minified_image = image_builder.repo_name.clone();
    report.minified_image_has_data = image_builder.has_data;
    report.artifact_location = dirs.artifacts.display().to_string();
    report.container_report_name = CONTAINER_REPORT_FILE.to_string();
    report.seccomp_profile_name = image_inspector.seccomp_profile_name().to_string();
    report.apparmor_profile_name = image_inspector.app_armor_profile_name().to_string();

    println!(
        "{} info=results  image.name={} image.size='{}' data={}",
        PREFIX, report.minified_image, report.minified_image_size_human, report.minified_image_has_data
    );
    println!(
        "{} info=results  artifacts.location='{}'",
        PREFIX, report.artifact_location
    );
    println!(
        "{} info=results  artifacts.report={}",
        PREFIX, report.container_report_name
    );
    println!("{} info=results  artifacts.dockerfile.original=Dockerfile.fat", PREFIX);
    println!("{} info=results  artifacts.dockerfile.new=Dockerfile", PREFIX);
    println!(
        "{} info=results  artifacts.seccomp={}",
        PREFIX, report.seccomp_profile_name
    );
    println!(
        "{} info=results  artifacts.apparmor={}",
        PREFIX, report.apparmor_profile_name
    );

    match ContainerReport::load(&dirs.artifacts.join(CONTAINER_REPORT_FILE)) {
        Ok(container_report) => report.system = container_report.system,
        Err(err) => info!(error = %err, "could not read the container report"),
    }

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

    if args.remove_file_artifacts {
        info!("removing temporary artifacts");
        if let Err(err) = tokio::fs::remove_dir_all(dirs.artifacts.join("files")).await {
            warn!(error = %err, "could not remove file artifacts");
        }
    }

    println!("{} state=done", PREFIX);
    if report.state == CmdState::Completed {
        report.state = CmdState::Done;
    }
    Ok(())
}

fn source_image_metadata(inspector: &ImageInspector) -> ImageMetadata {
    let info = inspector.image_info();
    let record = inspector.image_record();
    ImageMetadata {
        name: record.repo_tags.first().cloned().unwrap_or_default(),
        all_names: record.repo_tags.clone(),
        id: record.id.clone(),
        size: info.virtual_size,
        size_human: human_size(info.virtual_size),
        create_time: info.created.clone(),
        author: info.author.clone(),
        docker_version: info.docker_version.clone(),
        architecture: info.architecture.clone(),
        user: info.user.clone(),
        exposed_ports: info.exposed_ports.clone(),
    }
}
