//! The extractor: retrieve one original file with a single range read.
//!
//! The manifest index is built once per load; a key that is not in the
//! manifest fails before any request goes to the archive store.  The
//! payload bytes are returned verbatim: the archive stream is never
//! compressed, so there is nothing to decode.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, Result},
    manifest::{ManifestIndex, ManifestRecord},
    store::StoreHandle,
};

/// Locate `key` in the index and stream its payload from `archive` into
/// `out`.  Returns the number of bytes written.
pub async fn extract(
    index: &ManifestIndex,
    archive: &StoreHandle,
    key: &str,
    out: &mut (impl AsyncWrite + Unpin),
) -> Result<u64> {
    let row: &ManifestRecord = index
        .get(key)
        .ok_or_else(|| Error::NotFound(key.to_string()))?;

    let body = archive.read_range(row.tar_data_offset, row.tar_size).await?;
    out.write_all(&body).await?;
    out.flush().await?;

    log::debug!(
        "extracted {key}: {} bytes from offset {}",
        row.tar_size,
        row.tar_data_offset
    );
    Ok(row.tar_size)
}
