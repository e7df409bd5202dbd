//! The archive pipeline: lister → fetch pool → tar writer → manifest
//! writer.
//!
//! Exactly one task appends to the archive and manifest streams; the
//! concurrency lives entirely in the fetch pool.  Any fatal error aborts
//! the run, the in-flight multipart uploads, and whatever half-written
//! output already landed: a partial archive/manifest pair is never left
//! behind as if it were usable.

use futures::StreamExt;
use object_store::buffered::BufWriter;

use crate::{
    error::{Error, Result},
    fetch::{fetch_ordered, RetryPolicy},
    manifest::{ManifestRecord, ManifestSink, ManifestWriter},
    store::{list_descriptors, StoreHandle},
    tarball::TarWriter,
};

/// Knobs threaded through the pipeline; never a process-wide global.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Fetch pool width.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Replace an existing manifest/archive instead of refusing.
    pub overwrite: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            concurrency: 8,
            retry: RetryPolicy::default(),
            overwrite: false,
        }
    }
}

/// Outcome of a completed archive run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Objects archived; equals the manifest row count.
    pub objects: u64,
    /// Sum of unpadded payload sizes.
    pub payload_bytes: u64,
    /// Final archive length, including padding and terminator.
    pub archive_len: u64,
}

/// Archive every object under `src` into `archive`, writing one manifest
/// row per object to `manifest`.
pub async fn archive(
    src: &StoreHandle,
    manifest: &StoreHandle,
    archive: &StoreHandle,
    config: &ArchiveConfig,
) -> Result<ArchiveSummary> {
    if !config.overwrite {
        for dest in [manifest, archive] {
            if dest.exists().await? {
                return Err(Error::WouldOverwrite(dest.url().to_string()));
            }
        }
    }

    log::info!("archiving {} -> {} + {}", src.url(), archive.url(), manifest.url());

    match run_pipeline(src, manifest, archive, config).await {
        Ok(summary) => {
            log::info!(
                "archived {} objects ({} payload bytes) into {} bytes",
                summary.objects,
                summary.payload_bytes,
                summary.archive_len
            );
            Ok(summary)
        }
        Err(e) => {
            // all-or-nothing: a half-written pair must not look usable
            archive.discard().await;
            manifest.discard().await;
            Err(e)
        }
    }
}

async fn run_pipeline(
    src: &StoreHandle,
    manifest: &StoreHandle,
    archive: &StoreHandle,
    config: &ArchiveConfig,
) -> Result<ArchiveSummary> {
    let mut tar = TarWriter::new(archive.writer());
    let mut rows = ManifestWriter::create(manifest);

    let payload_bytes = match fill(src, config, &mut tar, &mut rows).await {
        Ok(bytes) => bytes,
        Err(e) => {
            rows.abort().await;
            abort_upload(tar).await;
            return Err(e);
        }
    };

    let objects = match rows.finish().await {
        Ok(objects) => objects,
        Err(e) => {
            abort_upload(tar).await;
            return Err(e);
        }
    };
    let archive_len = tar.finish().await?;

    Ok(ArchiveSummary {
        objects,
        payload_bytes,
        archive_len,
    })
}

async fn fill(
    src: &StoreHandle,
    config: &ArchiveConfig,
    tar: &mut TarWriter<BufWriter>,
    rows: &mut ManifestSink,
) -> Result<u64> {
    let mut entries = fetch_ordered(
        src.store(),
        list_descriptors(src),
        config.concurrency,
        config.retry.clone(),
    );

    let mut payload_bytes = 0u64;
    while let Some(item) = entries.next().await {
        let (desc, body) = item?;
        let entry = tar.append(&desc, &body).await?;
        log::debug!("{} at offset {} ({} bytes)", desc.key, entry.offset, entry.size);
        payload_bytes += entry.size;
        rows.write(&ManifestRecord::new(&desc, &entry)).await?;
    }

    // an archive of zero objects is never written
    if tar.position() == 0 {
        return Err(Error::EmptySource(src.url().to_string()));
    }
    Ok(payload_bytes)
}

/// Abandon the archive upload without writing the terminator.
async fn abort_upload(tar: TarWriter<BufWriter>) {
    let mut upload = tar.into_inner();
    if let Err(e) = upload.abort().await {
        log::warn!("could not abort archive upload: {e}");
    }
}
