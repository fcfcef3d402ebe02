use anyhow::Result;
use clap::Parser;

use crate::inpainting::{InpaintingCliArgs, InpaintingConfig};

/// Feed camera or file frames through a calculator graph and overlay the
/// computed inpainting region on the result.
#[derive(Debug, Parser)]
#[command(name = "inpainting", version)]
pub struct Cli {
    #[command(flatten)]
    pub args: InpaintingCliArgs,
}

/// Parse the process arguments into a run configuration.
pub fn parse_config() -> Result<InpaintingConfig> {
    let cli = Cli::parse();
    InpaintingConfig::try_from(cli.args)
}
