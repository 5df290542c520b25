use clap::{ArgAction, Args, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(
    name = "slimbox",
    version,
    about = "Minify container images by watching what the application actually uses"
)]
pub struct Cli {
    /// Verbose diagnostics
    #[arg(long, global = true)]
    pub debug: bool,

    /// Check for a newer release in the background
    #[arg(long, global = true, default_value_t = true, action = ArgAction::Set)]
    pub check_version: bool,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a minified copy of a container image
    Build(BuildArgs),
    /// Run and observe an image without building anything
    Profile(ProfileArgs),
    /// Print version information
    Version,
    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ============================================================================
// Shared argument groups
// ============================================================================

#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Target image (or build context directory with --from-dockerfile)
    pub target: String,

    /// Directory for slimbox state (defaults to ~/.slimbox)
    #[arg(long, default_value = "")]
    pub state_path: String,

    /// Where to write the command report
    #[arg(long, default_value = "")]
    pub report: String,

    /// Copy the container report and security profiles to this directory
    #[arg(long, default_value = "")]
    pub copy_meta_artifacts: String,

    /// Show the target container logs on shutdown
    #[arg(long)]
    pub show_clogs: bool,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Exercise exposed ports over HTTP while the container runs
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub http_probe: bool,

    /// Probe command: RESOURCE or METHOD:RESOURCE (repeatable)
    #[arg(long = "http-probe-cmd", value_delimiter = ',')]
    pub http_probe_cmd: Vec<String>,

    /// JSON file with full probe commands
    #[arg(long, default_value = "")]
    pub http_probe_cmd_file: String,

    /// Attempts per (port, command, protocol); 0 means the engine default
    #[arg(long, default_value_t = 0)]
    pub http_probe_retry_count: u32,

    /// Base backoff seconds between attempts; 0 means the engine defaults
    #[arg(long, default_value_t = 0)]
    pub http_probe_retry_wait: u64,

    /// Probe only these container ports
    #[arg(long = "http-probe-ports", value_delimiter = ',')]
    pub http_probe_ports: Vec<u16>,

    /// Keep probing every port after the first success
    #[arg(long)]
    pub http_probe_full: bool,

    /// When to stop exercising: enter | signal | probe | <seconds>
    #[arg(long, default_value = "enter")]
    pub continue_after: String,
}

#[derive(Args, Debug)]
pub struct ContainerArgs {
    /// Override the app entrypoint (command line or JSON array)
    #[arg(long, default_value = "")]
    pub entrypoint: String,

    /// Override the app cmd (command line or JSON array)
    #[arg(long, default_value = "")]
    pub cmd: String,

    /// Launch the app with no entrypoint
    #[arg(long)]
    pub clear_entrypoint: bool,

    /// Launch the app with no cmd
    #[arg(long)]
    pub clear_cmd: bool,

    /// Override the working directory
    #[arg(long, default_value = "")]
    pub workdir: String,

    /// Environment vars KEY=VALUE (repeat or comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub env: Vec<String>,

    /// Run the container as this user
    #[arg(long, default_value = "")]
    pub user: String,

    /// Attach the container to this network
    #[arg(long, default_value = "")]
    pub network: String,

    /// Additional ports to expose: PORT[/PROTO]
    #[arg(long, value_delimiter = ',')]
    pub expose: Vec<String>,

    /// Container labels KEY=VALUE (repeatable)
    #[arg(long = "label", action = ArgAction::Append)]
    pub labels: Vec<String>,

    /// Links to other containers
    #[arg(long = "link", value_delimiter = ',')]
    pub links: Vec<String>,

    /// Extra /etc/hosts entries HOST:IP
    #[arg(long = "etc-hosts-map", value_delimiter = ',')]
    pub etc_hosts_maps: Vec<String>,

    /// DNS servers for the container
    #[arg(long = "dns", value_delimiter = ',')]
    pub dns_servers: Vec<String>,

    /// DNS search domains for the container
    #[arg(long = "dns-search", value_delimiter = ',')]
    pub dns_search_domains: Vec<String>,

    /// Bind mount(s): SOURCE:DESTINATION[:OPTIONS]
    #[arg(long = "mount", action = ArgAction::Append)]
    pub mounts: Vec<String>,

    /// Always keep this path in the minified image
    #[arg(long = "include-path", action = ArgAction::Append)]
    pub include_paths: Vec<String>,

    /// Never keep this path in the minified image
    #[arg(long = "exclude-path", action = ArgAction::Append)]
    pub exclude_paths: Vec<String>,

    /// Keep this binary and its libraries
    #[arg(long = "include-bin", action = ArgAction::Append)]
    pub include_bins: Vec<String>,

    /// Keep this executable and its libraries
    #[arg(long = "include-exe", action = ArgAction::Append)]
    pub include_exes: Vec<String>,

    /// Keep a shell in the minified image
    #[arg(long)]
    pub include_shell: bool,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub probe: ProbeArgs,

    #[command(flatten)]
    pub container: ContainerArgs,

    /// Tag for the minified image (defaults to <repo>.slim)
    #[arg(long, default_value = "")]
    pub tag: String,

    /// Build the fat image first from this Dockerfile (target is the context)
    #[arg(long, default_value = "")]
    pub from_dockerfile: String,

    /// Fat-image settings the overrides replace: "all" or a comma list
    #[arg(long, default_value = "")]
    pub image_overrides: String,

    /// Show image build logs
    #[arg(long)]
    pub show_blogs: bool,

    /// Remove the staged file artifacts after the build
    #[arg(long)]
    pub remove_file_artifacts: bool,

    /// Extra ENV for the minified image
    #[arg(long = "new-env", value_delimiter = ',')]
    pub new_env: Vec<String>,

    /// Extra LABEL for the minified image (KEY=VALUE)
    #[arg(long = "new-label", action = ArgAction::Append)]
    pub new_labels: Vec<String>,

    /// Extra EXPOSE for the minified image
    #[arg(long = "new-expose", value_delimiter = ',')]
    pub new_expose: Vec<String>,

    /// Extra VOLUME for the minified image
    #[arg(long = "new-volume", action = ArgAction::Append)]
    pub new_volumes: Vec<String>,

    /// WORKDIR for the minified image
    #[arg(long, default_value = "")]
    pub new_workdir: String,
}

#[derive(Args, Debug)]
pub struct ProfileArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub probe: ProbeArgs,

    #[command(flatten)]
    pub container: ContainerArgs,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}
