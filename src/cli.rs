use std::path::PathBuf;
use structopt::StructOpt;

/// The tunnel server command-line interface.
#[derive(Debug, StructOpt)]
#[structopt(name = "tunneld")]
#[non_exhaustive]
pub struct Cli {
    /// Path to a configuration file.
    #[structopt(long)]
    pub config: Option<PathBuf>,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    Run(Run),
    ShowConfig(ShowConfig),
}

/// Run the tunnel server.
#[derive(Debug, StructOpt)]
#[non_exhaustive]
pub struct Run {}

/// Print the effective configuration and exit.
#[derive(Debug, StructOpt)]
#[non_exhaustive]
pub struct ShowConfig {}
