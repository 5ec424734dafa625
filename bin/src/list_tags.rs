use clap::Parser;
use color_eyre::eyre::{bail, Result};
use stevedore_lib::Version;
use tracing::info;

use crate::{parse_reference, GlobalOptions};

#[derive(Debug, Parser)]
pub struct Options {
    /// Repository to list (e.g. docker.io/library/ubuntu)
    image: String,

    /// Maximum number of tags to return
    #[arg(long)]
    limit: Option<u32>,

    /// Return only tags lexically after this one (pagination)
    #[arg(long)]
    last: Option<String>,
}

pub async fn main(global: GlobalOptions, opts: Options) -> Result<()> {
    let reference = parse_reference(&opts.image)?;
    if reference.version != Version::None {
        bail!("list-tags takes a bare repository name, without a tag or digest");
    }

    let registry = global.registry(&reference)?;
    let listing = registry
        .list_tags(&reference, opts.limit, opts.last.as_deref())
        .await?;

    info!(repository = %listing.name, count = listing.tags.len(), "listed tags");
    for tag in listing.tags {
        println!("{tag}");
    }
    Ok(())
}
