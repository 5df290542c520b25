use anyhow::Result;
use clap::Parser;
use slimbox::cli::{Cli, Commands};
use slimbox::commands;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first so --debug can raise the filter
    let cli = Cli::parse();

    let default_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_target(false)
        .init();

    // Dispatch to the appropriate command handler
    let result = match cli.cmd {
        Commands::Build(args) => commands::cmd_build(args, cli.debug, cli.check_version).await,
        Commands::Profile(args) => commands::cmd_profile(args, cli.debug, cli.check_version).await,
        Commands::Version => {
            commands::cmd_version();
            Ok(())
        }
        Commands::Completions(args) => {
            commands::cmd_completions(args);
            Ok(())
        }
    };

    // Handle errors
    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}
