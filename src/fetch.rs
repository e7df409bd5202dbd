//! The fetch pool: bounded-width concurrent body retrieval whose results
//! come back in listing order.
//!
//! `buffered(width)` is the order-restoring sequencer: up to `width`
//! fetches run at once, completions may land in any order, but the
//! consumer sees them strictly in the order the lister produced them.
//! That determinism is what makes archive byte layout reproducible and
//! range reads computable from the manifest alone.  Peak transient memory
//! is bounded by `width × max-object-size`.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt};
use object_store::{ObjectStore, ObjectStoreExt};

use crate::{
    error::{Error, Result},
    store::ObjectDescriptor,
};

/// Bounded exponential backoff for per-object operations (fetch, delete).
/// Listing is never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 8,
            initial_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or the attempt budget is spent, sleeping
    /// between attempts.  Returns the last error with the attempt count.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> std::result::Result<T, (u32, object_store::Error)>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, object_store::Error>>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    log::warn!("attempt {attempt}/{} failed, retrying in {delay:?}: {e}", self.attempts);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }
}

async fn fetch_body(
    store: &Arc<dyn ObjectStore>,
    desc: &ObjectDescriptor,
    retry: &RetryPolicy,
) -> Result<Bytes> {
    retry
        .run(|| async { store.get(&desc.location).await?.bytes().await })
        .await
        .map_err(|(attempts, source)| Error::Fetch {
            key: desc.key.clone(),
            attempts,
            source,
        })
}

/// Drive the listing through a pool of `width` concurrent fetches,
/// yielding `(descriptor, body)` pairs in listing order.
///
/// A body shorter or longer than the listed size is a fatal
/// [`Error::SizeMismatch`]: the listing and the live object disagree and
/// the archive run cannot be trusted.
pub fn fetch_ordered(
    store: Arc<dyn ObjectStore>,
    listing: BoxStream<'static, Result<ObjectDescriptor>>,
    width: usize,
    retry: RetryPolicy,
) -> impl Stream<Item = Result<(ObjectDescriptor, Bytes)>> {
    listing
        .map(move |item| {
            let store = Arc::clone(&store);
            let retry = retry.clone();
            async move {
                let desc = item?;
                let body = fetch_body(&store, &desc, &retry).await?;
                if body.len() as u64 != desc.size {
                    return Err(Error::SizeMismatch {
                        key: desc.key,
                        listed: desc.size,
                        fetched: body.len() as u64,
                    });
                }
                Ok((desc, body))
            }
        })
        .buffered(width.max(1))
}
