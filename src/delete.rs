//! The deleter: remove source objects that a manifest proves archived.
//!
//! Keys go to the backend in batches no larger than the batch-delete
//! limit, one bulk request per batch where the store supports it rather
//! than one round trip per key.  Deletion is idempotent: a key that is
//! already gone counts as a success.  A per-key failure never aborts the
//! remaining work; the full per-key outcome comes back in the report.
//!
//! Dry-run is the default; nothing is deleted until the caller confirms.

use crate::{
    error::Result,
    fetch::RetryPolicy,
    manifest::ManifestRecord,
    store::{DeleteOutcome, StoreHandle},
};

/// Largest number of keys per delete batch (the S3 DeleteObjects limit).
pub const MAX_DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub struct DeleteConfig {
    /// Actually delete.  When false (the default), only report what would
    /// be deleted.
    pub confirm: bool,
    pub retry: RetryPolicy,
}

impl Default for DeleteConfig {
    fn default() -> Self {
        DeleteConfig {
            confirm: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Complete per-key outcome of a delete run.  Partial success is a valid
/// outcome and is reported, not hidden behind an error.
#[derive(Debug, Default)]
pub struct DeleteReport {
    /// Keys listed in the manifest.
    pub requested: usize,
    /// Keys removed by this run.
    pub deleted: usize,
    /// Keys that were already absent (counted as success).
    pub already_absent: usize,
    /// Keys that could not be deleted, with the final error.
    pub failed: Vec<(String, String)>,
}

/// Delete every key listed in `rows` from `source`'s backend, in batches
/// of at most [`MAX_DELETE_BATCH`].  Keys a batch could not delete are
/// retried in a smaller batch until the attempt budget is spent.
///
/// In dry-run mode the report only carries the requested count.
pub async fn delete(
    source: &StoreHandle,
    rows: &[ManifestRecord],
    config: &DeleteConfig,
) -> Result<DeleteReport> {
    let mut report = DeleteReport {
        requested: rows.len(),
        ..DeleteReport::default()
    };

    if !config.confirm {
        log::info!("dry run: {} keys would be deleted", rows.len());
        return Ok(report);
    }

    let attempts = config.retry.attempts.max(1);
    for batch in rows.chunks(MAX_DELETE_BATCH) {
        let mut keys: Vec<String> = batch.iter().map(|row| row.key.clone()).collect();
        let mut delay = config.retry.initial_delay;

        for attempt in 1..=attempts {
            let mut failed = Vec::new();
            for (key, outcome) in source.delete_batch(&keys).await {
                match outcome {
                    DeleteOutcome::Deleted => report.deleted += 1,
                    DeleteOutcome::AlreadyAbsent => report.already_absent += 1,
                    DeleteOutcome::Failed(error) => failed.push((key, error)),
                }
            }

            if failed.is_empty() {
                break;
            }
            if attempt == attempts {
                for (key, error) in failed {
                    log::warn!("could not delete {key}: {error}");
                    report
                        .failed
                        .push((key, format!("after {attempt} attempts: {error}")));
                }
                break;
            }

            log::warn!(
                "attempt {attempt}/{attempts}: {} keys failed, retrying in {delay:?}",
                failed.len()
            );
            keys = failed.into_iter().map(|(key, _)| key).collect();
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    log::info!(
        "deleted {} keys ({} already absent, {} failed)",
        report.deleted,
        report.already_absent,
        report.failed.len()
    );
    Ok(report)
}
