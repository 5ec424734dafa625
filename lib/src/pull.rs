//! The end-to-end pull: resolve, download layers into a private working
//! directory, assemble the archive layout, and move the result into place.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_tempfile::TempDir;
use bon::bon;
use tokio::{fs, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    chain_ids,
    package::{self, ImageFormat, CONFIG_FILE, LAYER_FILE},
    registry::Registry,
    Error, Platform, Reference, Result,
};

/// How many layers download at once unless the caller says otherwise.
pub const DEFAULT_CONCURRENCY: usize = 5;

#[bon]
impl Registry {
    /// Pull an image and save it as an archive under `save_dir`.
    ///
    /// Layers download through a bounded worker pool into a working directory
    /// private to this pull; chain IDs pair with layers by manifest index, so
    /// completion order doesn't matter. The finished archive lands in
    /// `save_dir` only once it is complete, and the working directory is
    /// removed on every exit path — `save_dir` is never left holding a
    /// partial archive.
    ///
    /// Returns the path of the saved archive.
    #[builder]
    pub async fn pull(
        &self,
        /// The image to pull.
        #[builder(into)]
        reference: Reference,

        /// Directory to save the finished archive into; must already exist.
        #[builder(into)]
        save_dir: PathBuf,

        /// Platform to select from multi-arch images; the host platform when
        /// omitted.
        platform: Option<Platform>,

        /// Archive layout; Docker V2 when omitted.
        format: Option<ImageFormat>,

        /// Wrap the archive in gzip.
        gzip: Option<bool>,

        /// Maximum concurrent layer downloads.
        concurrency: Option<usize>,

        /// Cooperative cancellation handle. Cancelling closes in-flight
        /// downloads, removes the working directory, and surfaces
        /// [`Error::Cancelled`]; cached tokens survive.
        cancel: Option<CancellationToken>,
    ) -> Result<PathBuf> {
        let format = format.unwrap_or_default();
        let gzip = gzip.unwrap_or(false);
        let width = concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1);
        let cancel = cancel.unwrap_or_default();

        let save_dir_ok = fs::metadata(&save_dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !save_dir_ok {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("save directory does not exist: {}", save_dir.display()),
            )));
        }

        let resolved = self.resolve(&reference, platform.as_ref()).await?;
        let chain = chain_ids(&resolved.config.rootfs.diff_ids);

        let workdir = TempDir::new().await?;
        let work = workdir.dir_path().clone();

        let semaphore = Arc::new(Semaphore::new(width));
        let mut downloads = JoinSet::new();
        for (index, (layer, chain_id)) in resolved.manifest.layers.iter().zip(&chain).enumerate() {
            let registry = self.clone();
            let reference = reference.clone();
            let layer = layer.clone();
            let dest = work.join(chain_id.as_hex()).join(LAYER_FILE);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            downloads.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    outcome = registry.download_blob(&reference, &layer, &dest) => {
                        outcome.map(|bytes| (index, bytes))
                    }
                }
            });
        }

        let mut failure: Option<Error> = None;
        while let Some(joined) = downloads.join_next().await {
            match joined {
                Ok(Ok((index, bytes))) => debug!(layer = index, bytes, "layer complete"),
                Ok(Err(err)) => {
                    downloads.abort_all();
                    failure.get_or_insert(err);
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    downloads.abort_all();
                    failure.get_or_insert(Error::Io(std::io::Error::other(err)));
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        fs::write(work.join(CONFIG_FILE), &resolved.config_bytes).await?;
        package::assemble(&work, Some(&reference), format).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let staging = work.with_extension("archive");
        if let Err(err) = package::tar_dir(&work, &staging, gzip).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err);
        }

        let target = save_dir.join(package::archive_name(&reference, gzip));
        persist(&staging, &target).await?;

        info!(archive = %target.display(), "pull complete");
        Ok(target)
    }
}

/// Move the finished archive into place, copying across filesystems when a
/// plain rename can't. Nothing with the final name appears until the content
/// is complete.
async fn persist(staging: &Path, target: &Path) -> Result<()> {
    if fs::rename(staging, target).await.is_ok() {
        return Ok(());
    }

    let partial = target.with_extension("partial");
    let outcome = async {
        fs::copy(staging, &partial).await?;
        fs::rename(&partial, target).await
    }
    .await;

    let _ = fs::remove_file(staging).await;
    if outcome.is_err() {
        let _ = fs::remove_file(&partial).await;
    }
    outcome.map_err(Error::Io)
}
