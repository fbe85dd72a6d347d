use clap::Parser;
use std::path::PathBuf;

/// Multi-process HTTP gateway with a supervised worker pool
#[derive(Parser, Debug)]
#[command(name = "forkgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,
}
