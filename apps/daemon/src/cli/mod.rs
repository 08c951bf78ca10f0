mod actions;
mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[clap(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Force verbose logging.
    #[clap(short = 'v', long = "verbose")]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print build information and exit.
    Info,
    /// Print compiled-in default paths and exit.
    Paths,
    /// Print the version and exit.
    Version,
}

impl Cli {
    pub async fn exec(self) -> eyre::Result<()> {
        match &self.command {
            None => actions::run(self).await,
            Some(Command::Info) => actions::info(),
            Some(Command::Paths) => actions::paths(),
            Some(Command::Version) => actions::version(),
        }
    }
}

pub async fn run() -> eyre::Result<()> {
    Cli::parse().exec().await
}
