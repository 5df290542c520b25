//! Conversions from the raw clap arguments into the typed configuration
//! the orchestration consumes.

use anyhow::Result;

use crate::cli::args::{BuildArgs, ContainerArgs, ProbeArgs};
use crate::commands::common::ExerciseOpts;
use crate::config::{
    self, ContainerOverrides, ContinueAfter, HttpProbeCmd, HttpProbeOpts, ImageNewInstructions,
    VolumeMount,
};
use crate::inspectors::container::ContainerRunOpts;

impl ProbeArgs {
    pub fn probe_opts(&self) -> HttpProbeOpts {
        HttpProbeOpts {
            retry_count: self.http_probe_retry_count,
            retry_wait: self.http_probe_retry_wait,
            probe_full: self.http_probe_full,
            target_ports: self.http_probe_ports.clone(),
        }
    }

    pub fn probe_cmds(&self) -> Result<Vec<HttpProbeCmd>> {
        let mut cmds = Vec::new();
        for spec in &self.http_probe_cmd {
            cmds.push(HttpProbeCmd::parse(spec)?);
        }
        if !self.http_probe_cmd_file.is_empty() {
            cmds.extend(config::load_probe_cmd_file(&self.http_probe_cmd_file)?);
        }
        if cmds.is_empty() {
            cmds.push(HttpProbeCmd::default_probe());
        }
        Ok(cmds)
    }

    pub fn continue_after(&self) -> Result<ContinueAfter> {
        self.continue_after.parse()
    }

    pub fn exercise_opts(&self) -> Result<ExerciseOpts> {
        Ok(ExerciseOpts {
            do_http_probe: self.http_probe,
            probe_cmds: self.probe_cmds()?,
            probe_opts: self.probe_opts(),
            continue_after: self.continue_after()?,
        })
    }
}

impl ContainerArgs {
    pub fn overrides(&self) -> Result<ContainerOverrides> {
        Ok(ContainerOverrides {
            entrypoint: if self.entrypoint.is_empty() {
                Vec::new()
            } else {
                config::parse_exec(&self.entrypoint)?
            },
            clear_entrypoint: self.clear_entrypoint,
            cmd: if self.cmd.is_empty() {
                Vec::new()
            } else {
                config::parse_exec(&self.cmd)?
            },
            clear_cmd: self.clear_cmd,
            workdir: self.workdir.clone(),
            env: self.env.clone(),
            user: self.user.clone(),
            network: self.network.clone(),
            expose: self.expose.clone(),
            labels: config::parse_labels(&self.labels)?,
        })
    }

    pub fn run_opts(&self, show_container_logs: bool) -> Result<ContainerRunOpts> {
        let volume_mounts = self
            .mounts
            .iter()
            .map(|m| VolumeMount::parse(m))
            .collect::<Result<Vec<_>>>()?;

        Ok(ContainerRunOpts {
            overrides: self.overrides()?,
            links: self.links.clone(),
            etc_hosts_maps: self.etc_hosts_maps.clone(),
            dns_servers: self.dns_servers.clone(),
            dns_search_domains: self.dns_search_domains.clone(),
            volume_mounts,
            include_paths: self.include_paths.clone(),
            exclude_paths: self.exclude_paths.clone(),
            include_bins: self.include_bins.clone(),
            include_exes: self.include_exes.clone(),
            include_shell: self.include_shell,
            show_container_logs,
        })
    }
}

impl BuildArgs {
    pub fn new_instructions(&self) -> Result<ImageNewInstructions> {
        Ok(ImageNewInstructions {
            workdir: self.new_workdir.clone(),
            env: self.new_env.clone(),
            expose: self.new_expose.clone(),
            volumes: self.new_volumes.clone(),
            labels: config::parse_labels(&self.new_labels)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::cli::args::{Cli, Commands};
    use crate::config::ContinueAfter;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments should parse")
    }

    #[test]
    fn test_build_defaults() {
        let cli = parse(&["slimbox", "build", "nginx:latest"]);
        let Commands::Build(args) = cli.cmd else {
            panic!("expected build");
        };

        assert_eq!(args.target.target, "nginx:latest");
        assert!(args.probe.http_probe);
        assert_eq!(args.probe.continue_after().unwrap(), ContinueAfter::Enter);

        let cmds = args.probe.probe_cmds().unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].method, "GET");
        assert_eq!(cmds[0].resource, "/");
    }

    #[test]
    fn test_probe_flags() {
        let cli = parse(&[
            "slimbox",
            "build",
            "--http-probe-cmd",
            "POST:/v1/items",
            "--http-probe-retry-count",
            "3",
            "--http-probe-ports",
            "8080,8443",
            "--continue-after",
            "probe",
            "app:1.0",
        ]);
        let Commands::Build(args) = cli.cmd else {
            panic!("expected build");
        };

        let opts = args.probe.probe_opts();
        assert_eq!(opts.retry_count, 3);
        assert_eq!(opts.target_ports, vec![8080, 8443]);
        assert_eq!(args.probe.continue_after().unwrap(), ContinueAfter::Probe);

        let cmds = args.probe.probe_cmds().unwrap();
        assert_eq!(cmds[0].method, "POST");
    }

    #[test]
    fn test_container_overrides_parse() {
        let cli = parse(&[
            "slimbox",
            "profile",
            "--entrypoint",
            r#"["sh","-c","./run.sh"]"#,
            "--env",
            "A=1,B=2",
            "--label",
            "team=core",
            "--mount",
            "/data:/app/data:ro",
            "app:1.0",
        ]);
        let Commands::Profile(args) = cli.cmd else {
            panic!("expected profile");
        };

        let overrides = args.container.overrides().unwrap();
        assert_eq!(overrides.entrypoint, vec!["sh", "-c", "./run.sh"]);
        assert_eq!(overrides.env, vec!["A=1", "B=2"]);
        assert_eq!(overrides.labels["team"], "core");

        let run_opts = args.container.run_opts(false).unwrap();
        assert_eq!(run_opts.volume_mounts.len(), 1);
        assert_eq!(run_opts.volume_mounts[0].options, "ro");
    }

    #[test]
    fn test_repeatable_flags_do_not_consume_target() {
        // value-taking repeatable flags must not swallow the image ref
        let cli = parse(&[
            "slimbox",
            "build",
            "--env",
            "A=1",
            "--expose",
            "9000",
            "nginx:alpine",
        ]);
        let Commands::Build(args) = cli.cmd else {
            panic!("expected build");
        };
        assert_eq!(args.target.target, "nginx:alpine");
    }

    #[test]
    fn test_continue_after_timeout_form() {
        let cli = parse(&["slimbox", "profile", "--continue-after", "30", "app"]);
        let Commands::Profile(args) = cli.cmd else {
            panic!("expected profile");
        };
        assert_eq!(
            args.probe.continue_after().unwrap(),
            ContinueAfter::Timeout(30)
        );
    }
}
