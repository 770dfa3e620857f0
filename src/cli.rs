use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// installer-core - run installer module sequences
#[derive(Parser)]
#[command(name = "installer-core")]
#[command(about = "Runs an installer's module sequence against a shared global store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every module in the settings file's sequence
    Run {
        /// Path to the settings file
        settings: PathBuf,

        /// Write global storage as JSON once the run ends
        #[arg(long, value_name = "PATH")]
        dump_json: Option<PathBuf>,

        /// Write global storage as YAML once the run ends
        #[arg(long, value_name = "PATH")]
        dump_yaml: Option<PathBuf>,
    },
    /// Validate a settings file and every module configuration in it
    Validate {
        /// Path to the settings file to validate
        settings: PathBuf,
    },
    /// Print one value from a saved global storage file
    Lookup {
        /// JSON or YAML store file (chosen by extension)
        store: PathBuf,

        /// Key to resolve, e.g. `partition.efiSystemPartition`
        key: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
