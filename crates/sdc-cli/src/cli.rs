use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "sdc",
    about = "Inspect, verify and pack SDC block files",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Block settings (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the blocks of a file
    Info(InfoArgs),
    /// Load every block and check its checksum
    Verify(VerifyArgs),
    /// Write the decoded payload of one block
    Extract(ExtractArgs),
    /// Write files as the blocks of a new document
    Pack(PackArgs),
}

#[derive(Args)]
pub struct InfoArgs {
    pub file: PathBuf,
}

#[derive(Args)]
pub struct VerifyArgs {
    pub file: PathBuf,
}

#[derive(Args)]
pub struct ExtractArgs {
    pub file: PathBuf,
    pub index: usize,
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct PackArgs {
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
    #[arg(short, long)]
    pub output: PathBuf,
    /// Codec for every block: none, zlib or zstd
    #[arg(long)]
    pub compression: Option<String>,
    /// Leave out the block index
    #[arg(long)]
    pub no_index: bool,
    /// Leave spare room after each block for later updates
    #[arg(long)]
    pub pad: bool,
}
