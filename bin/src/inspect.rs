use std::str::FromStr;

use clap::Parser;
use color_eyre::eyre::Result;
use stevedore_lib::Platform;
use tracing::info;

use crate::{parse_reference, GlobalOptions};

#[derive(Debug, Parser)]
pub struct Options {
    /// Image reference being inspected (e.g. docker.io/library/ubuntu:latest)
    image: String,

    /// Platform to resolve from multi-arch images (e.g. linux/amd64)
    ///
    /// Defaults to the host platform when the image is multi-arch.
    #[arg(long, short, value_parser = Platform::from_str)]
    platform: Option<Platform>,
}

pub async fn main(global: GlobalOptions, opts: Options) -> Result<()> {
    let reference = parse_reference(&opts.image)?;
    let registry = global.registry(&reference)?;

    let resolved = registry.resolve(&reference, opts.platform.as_ref()).await?;
    info!(digest = %resolved.digest, layers = resolved.manifest.layers.len(), "resolved image");

    println!("{}", serde_json::to_string_pretty(&resolved.config)?);
    Ok(())
}
