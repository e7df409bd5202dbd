//! Manifest rows: the CSV index that maps every archived object to its
//! byte location inside the archive.
//!
//! Rows are written incrementally, one flushed row per completed tar
//! entry, so manifest writing uses constant memory regardless of object
//! count.  A manifest whose path ends in `.gz` is transparently
//! gzip-compressed on write and decompressed on read; the archive stream
//! itself is never compressed.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_compression::tokio::write::GzipEncoder;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use object_store::buffered::BufWriter;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, Result},
    store::{ObjectDescriptor, StoreHandle},
    tarball::TarEntry,
};

/// One archived object: the source inventory fields plus its location in
/// the archive.  Immutable once written; row order equals listing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "LastModifiedDate", with = "rfc3339")]
    pub last_modified: DateTime<Utc>,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "StorageClass")]
    pub storage_class: String,
    #[serde(rename = "VersionId")]
    pub version_id: String,
    #[serde(rename = "TarMD5")]
    pub tar_md5: String,
    #[serde(rename = "TarOffset")]
    pub tar_offset: u64,
    #[serde(rename = "TarDataOffset")]
    pub tar_data_offset: u64,
    #[serde(rename = "TarSize")]
    pub tar_size: u64,
}

impl ManifestRecord {
    pub fn new(desc: &ObjectDescriptor, entry: &TarEntry) -> Self {
        ManifestRecord {
            bucket: desc.bucket.clone(),
            key: desc.key.clone(),
            size: desc.size,
            last_modified: desc.last_modified,
            etag: desc.etag.clone(),
            storage_class: desc.storage_class.clone(),
            version_id: desc.version_id.clone(),
            tar_md5: entry.md5.clone(),
            tar_offset: entry.offset,
            tar_data_offset: entry.data_offset,
            tar_size: entry.size,
        }
    }
}

/// `LastModifiedDate` is ISO-8601 with an explicit UTC offset
/// (`2021-03-04T05:06:07+00:00`), matching S3 inventory reports.
mod rfc3339 {
    use super::*;
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, false))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> std::result::Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

fn is_gzip(handle: &StoreHandle) -> bool {
    handle.path().as_ref().ends_with(".gz")
}

/// Incremental manifest writer: header row first, then one serialized and
/// flushed row per archive entry, in entry order.
pub struct ManifestWriter<W> {
    out: W,
    rows: u64,
}

/// The writer type produced by [`ManifestWriter::create`]: a (possibly
/// gzip-compressing) stream over a multipart upload.
pub type ManifestSink = ManifestWriter<ManifestStream>;

impl ManifestWriter<()> {
    pub fn create(dest: &StoreHandle) -> ManifestSink {
        let upload = dest.writer();
        let out = if is_gzip(dest) {
            ManifestStream::Gzip(GzipEncoder::new(upload))
        } else {
            ManifestStream::Plain(upload)
        };
        ManifestWriter { out, rows: 0 }
    }
}

impl ManifestWriter<ManifestStream> {
    /// Abandon the manifest upload after a fatal pipeline error, dropping
    /// any multipart parts already sent.
    pub async fn abort(self) {
        self.out.abort().await;
    }
}

/// The output stream behind [`ManifestWriter::create`]: a multipart
/// upload, gzip-compressed when the manifest path ends in `.gz`.
pub enum ManifestStream {
    Plain(BufWriter),
    Gzip(GzipEncoder<BufWriter>),
}

impl ManifestStream {
    async fn abort(self) {
        let mut upload = match self {
            ManifestStream::Plain(upload) => upload,
            ManifestStream::Gzip(encoder) => encoder.into_inner(),
        };
        if let Err(e) = upload.abort().await {
            log::warn!("could not abort manifest upload: {e}");
        }
    }
}

impl AsyncWrite for ManifestStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ManifestStream::Plain(w) => Pin::new(w).poll_write(cx, buf),
            ManifestStream::Gzip(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ManifestStream::Plain(w) => Pin::new(w).poll_flush(cx),
            ManifestStream::Gzip(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ManifestStream::Plain(w) => Pin::new(w).poll_shutdown(cx),
            ManifestStream::Gzip(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

impl<W: AsyncWrite + Unpin> ManifestWriter<W> {
    pub fn new(out: W) -> Self {
        ManifestWriter { out, rows: 0 }
    }

    /// Serialize and flush one row.  The header row is emitted along with
    /// the first record.
    pub async fn write(&mut self, record: &ManifestRecord) -> Result<()> {
        let mut row = csv::WriterBuilder::new()
            .has_headers(self.rows == 0)
            .from_writer(Vec::new());
        row.serialize(record)?;
        let bytes = row
            .into_inner()
            .map_err(|e| Error::Write(e.into_error()))?;
        self.out.write_all(&bytes).await?;
        self.rows += 1;
        Ok(())
    }

    /// Complete the stream (including the gzip trailer and multipart
    /// upload, where applicable).  Returns the number of rows written.
    pub async fn finish(mut self) -> Result<u64> {
        self.out.shutdown().await?;
        Ok(self.rows)
    }
}

/// A loaded manifest.  The serialized bytes are fetched (and decompressed)
/// once; rows are then deserialized lazily by the csv reader.
pub struct ManifestReader {
    url: String,
    bytes: Vec<u8>,
}

impl ManifestReader {
    pub async fn open(handle: &StoreHandle) -> Result<Self> {
        let raw = handle.read_all().await?;
        let bytes = if is_gzip(handle) {
            gunzip(&raw).await?
        } else {
            raw.to_vec()
        };
        Ok(ManifestReader {
            url: handle.url().to_string(),
            bytes,
        })
    }

    /// Iterate the rows in manifest order.
    pub fn rows(&self) -> impl Iterator<Item = Result<ManifestRecord>> + '_ {
        csv::Reader::from_reader(self.bytes.as_slice())
            .into_deserialize()
            .map(|row| row.map_err(Error::from))
    }

    /// Collect all rows, failing on an empty manifest.
    pub fn read_rows(&self) -> Result<Vec<ManifestRecord>> {
        let rows = self.rows().collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Err(Error::EmptyManifest(self.url.clone()));
        }
        Ok(rows)
    }

    /// Build the key-addressed lookup index used by `extract`.
    pub fn index(&self) -> Result<ManifestIndex> {
        ManifestIndex::from_rows(self.rows())
    }
}

async fn gunzip(raw: &Bytes) -> Result<Vec<u8>> {
    let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(raw.as_ref());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await?;
    Ok(out)
}

/// Pre-built key → row map, constructed once per manifest load so that a
/// lookup miss costs no I/O at all.
pub struct ManifestIndex {
    map: HashMap<String, ManifestRecord>,
}

impl ManifestIndex {
    pub fn from_rows(rows: impl IntoIterator<Item = Result<ManifestRecord>>) -> Result<Self> {
        let mut map = HashMap::new();
        for row in rows {
            let row = row?;
            let key = row.key.clone();
            if map.insert(key.clone(), row).is_some() {
                return Err(Error::DuplicateKey(key));
            }
        }
        Ok(ManifestIndex { map })
    }

    pub fn get(&self, key: &str) -> Option<&ManifestRecord> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
