use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use color_eyre::eyre::{bail, Result};
use stevedore_lib::package::{self, ImageFormat};
use tracing::info;

#[derive(Debug, Parser)]
pub struct Options {
    /// Directory holding image_config.json and the downloaded layer directories
    #[arg(long = "image-dir", short = 'C', value_name = "DIR")]
    image_dir: PathBuf,

    /// Path of the archive to write
    #[arg(long = "output", short = 'o', value_name = "FILE")]
    output: PathBuf,

    /// Archive format to produce
    #[arg(long, short, default_value_t = ImageFormat::V2, value_parser = ImageFormat::from_str)]
    format: ImageFormat,

    /// Compress the archive with gzip
    #[arg(short = 'z', long)]
    gzip: bool,
}

pub async fn main(opts: Options) -> Result<()> {
    if !opts.image_dir.is_dir() {
        bail!("image dir must be an existing directory: {}", opts.image_dir.display());
    }
    if opts.output.is_dir() {
        bail!("output must not be a directory: {}", opts.output.display());
    }

    package::assemble(&opts.image_dir, None, opts.format).await?;
    package::tar_dir(&opts.image_dir, &opts.output, opts.gzip).await?;

    info!(archive = %opts.output.display(), "image directory packaged");
    println!("{}", opts.output.display());
    Ok(())
}
