//! Command line options.

use std::path::PathBuf;

use clap::Parser;

/// System-wide keyboard remapping with multi-key compose sequences.
#[derive(Parser, Debug)]
#[command(name = "umlautd", version, about)]
pub struct Options {
    /// Enable debug logging.
    #[arg(short, long)]
    pub debug: bool,

    /// Configuration directory [default: $XDG_CONFIG_HOME/umlaut].
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

impl Options {
    pub fn load() -> Self {
        Self::parse()
    }
}
