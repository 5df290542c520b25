pub mod build;
pub mod common;
pub mod profile;

use std::io;

use clap::CommandFactory;
use clap_complete::generate;

use crate::cli::args::{Cli, CompletionsArgs};

pub use build::cmd_build;
pub use profile::cmd_profile;

/// Print version information.
pub fn cmd_version() {
    println!("slimbox {}", crate::version::current());
}

/// Generate shell completions to stdout.
pub fn cmd_completions(args: CompletionsArgs) {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "slimbox", &mut io::stdout());
}
