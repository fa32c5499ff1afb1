pub mod commands;
pub mod global;

use clap::Parser;

use crate::cli::commands::Command;
use crate::cli::global::GlobalArgs;

#[derive(Parser, Debug)]
#[command(
    name = "keelscan",
    version,
    about = "Scan container images and validate Kubernetes manifests against backend policy"
)]
pub struct CommandLineArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

pub fn parse_args() -> CommandLineArgs {
    CommandLineArgs::parse()
}
