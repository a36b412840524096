use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Container fleet monitor for the local Docker daemon.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "fleetwatch.toml")]
    pub config: PathBuf,

    /// Directory for the JSON verdict log. Overrides the config file.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
