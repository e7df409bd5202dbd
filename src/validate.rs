//! The validator: prove that every manifest row still locates the bytes it
//! claims to.
//!
//! For each row, one range read over `[TarDataOffset, TarDataOffset +
//! TarSize)` is checksummed and compared against the recorded `TarMD5`.
//! Nothing aborts on first failure: every mismatch is collected and
//! reported together, so one corrupt entry never hides another.  With a
//! live source handle the listing is additionally cross-checked for
//! drift.

use std::{collections::HashMap, fmt};

use futures::{stream, StreamExt};
use md5::{Digest, Md5};
use object_store::ObjectStoreExt;

use crate::{
    error::{Error, Result},
    fetch::RetryPolicy,
    manifest::{ManifestReader, ManifestRecord},
    store::{list_descriptors, StoreHandle},
    TAR_BLOCK_SIZE,
};

#[derive(Debug, Clone)]
pub struct ValidateConfig {
    /// Width of the range-read pool.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        ValidateConfig {
            concurrency: 8,
            retry: RetryPolicy::default(),
        }
    }
}

/// One failed check, naming the offending key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub key: String,
    pub detail: String,
}

impl Mismatch {
    fn new(key: &str, detail: impl Into<String>) -> Self {
        Mismatch {
            key: key.to_string(),
            detail: detail.into(),
        }
    }
}

/// Every mismatch found across all rows, surfaced as one failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MismatchReport {
    pub rows: u64,
    pub mismatches: Vec<Mismatch>,
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "validation failed: {} mismatches across {} rows",
            self.mismatches.len(),
            self.rows
        )?;
        for m in &self.mismatches {
            writeln!(f, "  {}: {}", m.key, m.detail)?;
        }
        Ok(())
    }
}

/// Outcome of a clean validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateSummary {
    pub rows: u64,
    pub payload_bytes: u64,
}

/// Validate `archive` against `manifest`, optionally cross-checking the
/// live `source` listing for drift.  Returns Ok only with zero mismatches.
pub async fn validate(
    manifest: &StoreHandle,
    archive: &StoreHandle,
    source: Option<&StoreHandle>,
    config: &ValidateConfig,
) -> Result<ValidateSummary> {
    let reader = ManifestReader::open(manifest).await?;
    let rows = reader.read_rows()?;

    let mut mismatches = structural_mismatches(&rows, archive.len().await?);
    mismatches.extend(content_mismatches(archive, &rows, config).await);
    if let Some(source) = source {
        mismatches.extend(drift_mismatches(source, &rows).await?);
    }

    let report = MismatchReport {
        rows: rows.len() as u64,
        mismatches,
    };
    if !report.mismatches.is_empty() {
        return Err(Error::Validation(report));
    }

    log::info!("validated {} rows against {}", rows.len(), archive.url());
    Ok(ValidateSummary {
        rows: rows.len() as u64,
        payload_bytes: rows.iter().map(|r| r.tar_size).sum(),
    })
}

/// Offset bookkeeping checks that need no I/O: uniqueness, alignment,
/// monotonicity, and containment within the archive length.
fn structural_mismatches(rows: &[ManifestRecord], archive_len: u64) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    let mut seen = HashMap::new();
    let mut previous_end = 0u64;

    for row in rows {
        if let Some(first) = seen.insert(row.key.as_str(), row.tar_offset) {
            mismatches.push(Mismatch::new(
                &row.key,
                format!("duplicate key (first at offset {first})"),
            ));
            continue;
        }
        if row.tar_offset % TAR_BLOCK_SIZE != 0 {
            mismatches.push(Mismatch::new(
                &row.key,
                format!("TarOffset {} is not 512-aligned", row.tar_offset),
            ));
        }
        if row.tar_offset < previous_end {
            mismatches.push(Mismatch::new(
                &row.key,
                format!(
                    "TarOffset {} overlaps the previous entry, which ends at {previous_end}",
                    row.tar_offset
                ),
            ));
        }
        if Some(row.tar_data_offset) != row.tar_offset.checked_add(TAR_BLOCK_SIZE) {
            mismatches.push(Mismatch::new(
                &row.key,
                format!(
                    "TarDataOffset {} is not TarOffset {} + 512",
                    row.tar_data_offset, row.tar_offset
                ),
            ));
        }
        // checked arithmetic throughout: a malformed row must report, not panic
        match row.tar_data_offset.checked_add(row.tar_size) {
            None => mismatches.push(Mismatch::new(
                &row.key,
                format!(
                    "TarDataOffset {} + TarSize {} overflows",
                    row.tar_data_offset, row.tar_size
                ),
            )),
            Some(end) if end > archive_len => mismatches.push(Mismatch::new(
                &row.key,
                format!("entry ends at {end} but the archive is {archive_len} bytes"),
            )),
            Some(_) => {}
        }
        let padded = row.tar_size.checked_add(511).map_or(u64::MAX, |n| n & !511);
        previous_end = row.tar_data_offset.saturating_add(padded);
    }

    mismatches
}

/// Range-read every payload and compare its checksum to the recorded one.
/// Reads run through a bounded pool; completion order does not matter
/// here, so the pool is unordered.
async fn content_mismatches(
    archive: &StoreHandle,
    rows: &[ManifestRecord],
    config: &ValidateConfig,
) -> Vec<Mismatch> {
    stream::iter(rows)
        .map(|row| check_row(archive, row, &config.retry))
        .buffer_unordered(config.concurrency.max(1))
        .filter_map(|check| async move { check })
        .collect()
        .await
}

async fn check_row(
    archive: &StoreHandle,
    row: &ManifestRecord,
    retry: &RetryPolicy,
) -> Option<Mismatch> {
    let store = archive.store();
    let path = archive.path().clone();
    let range = row.tar_data_offset..row.tar_data_offset + row.tar_size;

    let body = if row.tar_size == 0 {
        bytes::Bytes::new()
    } else {
        match retry
            .run(|| async { store.get_range(&path, range.clone()).await })
            .await
        {
            Ok(body) => body,
            Err((attempts, e)) => {
                return Some(Mismatch::new(
                    &row.key,
                    format!("range read failed after {attempts} attempts: {e}"),
                ))
            }
        }
    };

    if body.len() as u64 != row.tar_size {
        return Some(Mismatch::new(
            &row.key,
            format!("short range read: wanted {}, got {}", row.tar_size, body.len()),
        ));
    }

    let digest = hex::encode(Md5::digest(&body));
    if digest != row.tar_md5 {
        return Some(Mismatch::new(
            &row.key,
            format!("checksum mismatch: manifest {} archive {digest}", row.tar_md5),
        ));
    }

    None
}

/// Compare the manifest against a fresh listing of the source prefix:
/// keys that disappeared, keys whose size changed, and keys the manifest
/// does not cover.
async fn drift_mismatches(
    source: &StoreHandle,
    rows: &[ManifestRecord],
) -> Result<Vec<Mismatch>> {
    let mut live = HashMap::new();
    let mut listing = list_descriptors(source);
    while let Some(desc) = listing.next().await {
        let desc = desc?;
        live.insert(desc.key, desc.size);
    }

    let mut mismatches = Vec::new();
    for row in rows {
        match live.remove(&row.key) {
            None => mismatches.push(Mismatch::new(&row.key, "missing from live source")),
            Some(size) if size != row.size => mismatches.push(Mismatch::new(
                &row.key,
                format!("live size {size} differs from manifest size {}", row.size),
            )),
            Some(_) => {}
        }
    }
    for (key, _) in live {
        mismatches.push(Mismatch::new(&key, "listed in source but not in manifest"));
    }
    Ok(mismatches)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn row(key: &str, offset: u64, size: u64) -> ManifestRecord {
        ManifestRecord {
            bucket: String::new(),
            key: key.to_string(),
            size,
            last_modified: chrono::Utc::now(),
            etag: String::new(),
            storage_class: "STANDARD".to_string(),
            version_id: String::new(),
            tar_md5: "0".repeat(32),
            tar_offset: offset,
            tar_data_offset: offset + 512,
            tar_size: size,
        }
    }

    #[test]
    fn test_structural_clean() {
        let rows = vec![row("a", 0, 10), row("b", 1024, 20), row("c", 2048, 30)];
        assert_eq!(structural_mismatches(&rows, 4096), vec![]);
    }

    #[test]
    fn test_structural_misalignment() {
        let mut rows = vec![row("a", 0, 10)];
        rows[0].tar_offset = 100;
        rows[0].tar_data_offset = 612;
        let found = structural_mismatches(&rows, 4096);
        assert_eq!(found.len(), 1);
        assert!(found[0].detail.contains("not 512-aligned"));
    }

    #[test]
    fn test_structural_header_inside_previous_payload() {
        // "a" spans [0, 1536): header block plus 600 bytes padded to 1024,
        // so a header at 1024 sits inside its payload
        let rows = vec![row("a", 0, 600), row("b", 1024, 10)];
        let found = structural_mismatches(&rows, 8192);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "b");
        assert!(found[0].detail.contains("overlaps"));
    }

    #[test]
    fn test_structural_rejects_overflowing_row() {
        let mut rows = vec![row("x", 0, 0)];
        rows[0].tar_offset = u64::MAX - 4095;
        rows[0].tar_data_offset = u64::MAX - 3583;
        rows[0].tar_size = 8000;
        let found = structural_mismatches(&rows, 4096);
        assert_eq!(found.len(), 1);
        assert!(found[0].detail.contains("overflows"));
    }

    #[test]
    fn test_structural_duplicate_and_overrun() {
        let rows = vec![row("a", 0, 10), row("a", 1024, 10), row("b", 2048, 9000)];
        let found = structural_mismatches(&rows, 4096);
        let details: Vec<_> = found.iter().map(|m| (m.key.as_str(), m.detail.as_str())).collect();
        assert!(details.iter().any(|(k, d)| *k == "a" && d.contains("duplicate")));
        assert!(details.iter().any(|(k, d)| *k == "b" && d.contains("archive is 4096 bytes")));
    }

    #[test]
    fn test_report_display_names_every_key() {
        let report = MismatchReport {
            rows: 3,
            mismatches: vec![
                Mismatch::new("one", "checksum mismatch"),
                Mismatch::new("two", "missing from live source"),
            ],
        };
        let text = report.to_string();
        assert!(text.contains("2 mismatches across 3 rows"));
        assert!(text.contains("one: checksum"));
        assert!(text.contains("two: missing"));
    }
}
