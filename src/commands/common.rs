//! Pieces shared by the `build` and `profile` orchestrations: the
//! network preflight, the continue-after gate, the runtime exercise
//! phase, and meta-artifact copying.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bollard::network::ListNetworksOptions;
use bollard::Docker;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::config::{ContinueAfter, HttpProbeCmd, HttpProbeOpts};
use crate::inspectors::ContainerInspect;
use crate::probe::{ports, HttpProbe};

/// Networks that exist without being listed by the daemon.
const BUILTIN_NETWORKS: &[&str] = &["", "default", "bridge", "host", "none"];

/// Check that the requested network exists before any container work.
pub async fn confirm_network(docker: &Docker, network: &str) -> bool {
    if BUILTIN_NETWORKS.contains(&network) {
        return true;
    }

    match docker.list_networks(None::<ListNetworksOptions<String>>).await {
        Ok(networks) => networks
            .iter()
            .any(|n| n.name.as_deref() == Some(network)),
        Err(err) => {
            warn!(error = %err, "could not list networks");
            false
        }
    }
}

/// Block until the selected continue-after condition fires. Exactly one
/// resolution per call; policies never coalesce.
pub async fn wait_for_continue(
    prefix: &str,
    mode: &ContinueAfter,
    probe_done: Option<watch::Receiver<bool>>,
) -> Result<()> {
    match mode {
        ContinueAfter::Enter => {
            println!(
                "{} info=prompt message='USER INPUT REQUIRED, PRESS <ENTER> WHEN YOU ARE DONE USING THE CONTAINER'",
                prefix
            );
            let mut line = String::new();
            BufReader::new(tokio::io::stdin())
                .read_line(&mut line)
                .await
                .context("reading standard input")?;
        }
        ContinueAfter::Signal => {
            println!(
                "{} info=prompt message='send SIGUSR1 when you are done using the container'",
                prefix
            );
            let mut sigusr1 =
                signal(SignalKind::user_defined1()).context("installing the SIGUSR1 handler")?;
            sigusr1.recv().await;
            println!("{} info=event message='got SIGUSR1'", prefix);
        }
        ContinueAfter::Timeout(secs) => {
            println!(
                "{} info=prompt message='waiting for the target container ({} seconds)'",
                prefix, secs
            );
            sleep(Duration::from_secs(*secs)).await;
            println!(
                "{} info=event message='done waiting for the target container'",
                prefix
            );
        }
        ContinueAfter::Probe => {
            println!(
                "{} info=prompt message='waiting for the HTTP probe to finish'",
                prefix
            );
            let Some(mut done) = probe_done else {
                bail!("probe gate selected but no probe is running");
            };
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
            println!("{} info=event message='HTTP probe is done'", prefix);
        }
    }
    Ok(())
}

/// Everything the exercise phase needs beyond the container itself.
#[derive(Debug, Clone)]
pub struct ExerciseOpts {
    pub do_http_probe: bool,
    pub probe_cmds: Vec<HttpProbeCmd>,
    pub probe_opts: HttpProbeOpts,
    pub continue_after: ContinueAfter,
}

/// Run the exercise phase: launch the probe if requested, hold at the
/// gate, then finish monitoring and shut the container down.
///
/// Returns `false` for the probe-unreachable clean abort (the container
/// is already shut down and `state=exited` printed); `true` when the
/// pipeline should continue to artifact processing.
pub async fn exercise_container<C: ContainerInspect>(
    prefix: &str,
    container: &mut C,
    exposed_ports: &[String],
    opts: &ExerciseOpts,
) -> Result<bool> {
    // the probe gate only makes sense with a probe running
    let do_probe = opts.do_http_probe || opts.continue_after == ContinueAfter::Probe;
    let mut probe_done = None;

    if do_probe {
        let plan = ports::plan(
            container.port_bindings(),
            exposed_ports,
            container.cmd_port(),
            container.evt_port(),
            &opts.probe_opts.target_ports,
        );

        if plan.is_empty() {
            println!(
                "{} state=http.probe.error error='no exposed ports' message='expose your service port or disable HTTP probing if the application has no network services'",
                prefix
            );
            info!("shutting down the target container");
            container.finish_monitoring().await;
            if let Err(err) = container.shutdown_container().await {
                warn!(error = %err, "container shutdown failed");
            }
            println!("{} state=exited", prefix);
            return Ok(false);
        }

        let mut probe = HttpProbe::new(
            plan,
            opts.probe_cmds.clone(),
            opts.probe_opts.clone(),
            container.docker_host_ip().to_string(),
            prefix.to_string(),
        );
        probe.start();
        probe_done = Some(probe.done());
    }

    wait_for_continue(prefix, &opts.continue_after, probe_done).await?;

    println!("{} state=container.inspection.finishing", prefix);
    container.finish_monitoring().await;

    info!("shutting down the target container");
    if let Err(err) = container.shutdown_container().await {
        warn!(error = %err, "container shutdown failed");
    }

    Ok(true)
}

/// The operator hint line printed once the container is up.
pub fn print_container_info<C: ContainerInspect>(prefix: &str, container: &C) {
    println!(
        "{} info=container name={} id={} target.port.list=[{}] target.port.info=[{}] message='YOU CAN USE THESE PORTS TO INTERACT WITH THE CONTAINER'",
        prefix,
        container.container_name(),
        container.container_id(),
        container.host_port_list(),
        container.host_port_info()
    );
}

/// Duplicate the container report and security profiles to a
/// user-chosen directory. Returns false when any copy failed.
pub async fn copy_meta_artifacts(artifact_dir: &Path, names: &[&str], dest: &str) -> bool {
    let dest = PathBuf::from(shellexpand::tilde(dest).as_ref());
    let mut all_copied = true;
    for name in names {
        if name.is_empty() {
            continue;
        }
        let src = artifact_dir.join(name);
        if let Err(err) = crate::paths::copy_into(&src, &dest) {
            warn!(artifact = %name, error = %err, "could not copy meta artifact");
            all_copied = false;
        }
    }
    all_copied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_gate_waits_full_duration() {
        let start = tokio::time::Instant::now();
        wait_for_continue("slimbox[test]:", &ContinueAfter::Timeout(2), None)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_probe_gate_resolves_on_done() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });

        wait_for_continue("slimbox[test]:", &ContinueAfter::Probe, Some(rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_probe_gate_resolves_immediately_after_done() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        drop(tx);

        wait_for_continue("slimbox[test]:", &ContinueAfter::Probe, Some(rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_probe_gate_without_probe_is_an_error() {
        let result = wait_for_continue("slimbox[test]:", &ContinueAfter::Probe, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_copy_meta_artifacts() {
        let temp = tempfile::TempDir::new().unwrap();
        let artifact_dir = temp.path().join("artifacts");
        std::fs::create_dir_all(&artifact_dir).unwrap();
        std::fs::write(artifact_dir.join("creport.json"), b"{}").unwrap();

        let dest = temp.path().join("meta");
        let ok = copy_meta_artifacts(&artifact_dir, &["creport.json"], dest.to_str().unwrap()).await;

        assert!(ok);
        assert!(dest.join("creport.json").is_file());

        let failed =
            copy_meta_artifacts(&artifact_dir, &["missing-profile"], dest.to_str().unwrap()).await;
        assert!(!failed);
    }
}
