use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use color_eyre::eyre::Result;
use stevedore_lib::{package::ImageFormat, Platform};
use tracing::info;

use crate::{parse_reference, GlobalOptions};

#[derive(Debug, Parser)]
pub struct Options {
    /// Image reference being pulled (e.g. docker.io/library/ubuntu:latest)
    image: String,

    /// Directory to save the archive into; must already exist
    #[arg(long = "save-to", value_name = "DIR")]
    save_to: PathBuf,

    /// Platform to select from multi-arch images (e.g. linux/amd64)
    ///
    /// Defaults to the host platform.
    #[arg(long, short, value_parser = Platform::from_str)]
    platform: Option<Platform>,

    /// Archive format to produce
    #[arg(long, short, default_value_t = ImageFormat::V2, value_parser = ImageFormat::from_str)]
    format: ImageFormat,
}

pub async fn main(global: GlobalOptions, opts: Options) -> Result<()> {
    let reference = parse_reference(&opts.image)?;
    let registry = global.registry(&reference)?;

    info!(%reference, "pulling image");
    let archive = registry
        .pull()
        .reference(&reference)
        .save_dir(opts.save_to)
        .maybe_platform(opts.platform)
        .format(opts.format)
        .call()
        .await?;

    println!("{}", archive.display());
    Ok(())
}
