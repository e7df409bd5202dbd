//! The archive writer: ustar headers, payload padding, offset bookkeeping.
//!
//! The writer is the single owner of the output stream during creation.
//! It tracks the stream position itself, so the offsets it hands back are
//! exactly the offsets a later range read must use.  Every entry is one
//! 512-byte header block followed by the payload padded to the next
//! 512-byte boundary; the archive ends with two all-zero blocks.

use md5::{Digest, Md5};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, Result},
    store::ObjectDescriptor,
    TAR_BLOCK_SIZE,
};

/// Pad a length up to the next 512-byte block boundary.
pub(crate) fn pad_to_block(len: u64) -> u64 {
    (len + 511) & !511
}

/// Byte locations of one completed archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    /// Offset of the entry's header block.  Always 512-aligned.
    pub offset: u64,
    /// Offset of the first payload byte, `offset + 512`.
    pub data_offset: u64,
    /// Unpadded payload length.
    pub size: u64,
    /// Lowercase hex MD5 of the payload, computed as it was written.
    pub md5: String,
}

/// Sequential tar writer over any async byte sink.
pub struct TarWriter<W> {
    out: W,
    pos: u64,
}

impl<W: AsyncWrite + Unpin> TarWriter<W> {
    pub fn new(out: W) -> Self {
        TarWriter { out, pos: 0 }
    }

    /// Current stream position; equal to the next entry's `TarOffset`.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Append one object: header block, payload, zero padding.  Returns
    /// the entry's offsets and streaming checksum.
    pub async fn append(&mut self, desc: &ObjectDescriptor, body: &[u8]) -> Result<TarEntry> {
        let header = make_header(desc, body.len() as u64)?;

        let offset = self.pos;
        self.out.write_all(header.as_bytes()).await?;

        let mut md5 = Md5::new();
        md5.update(body);
        self.out.write_all(body).await?;

        let size = body.len() as u64;
        let padding = pad_to_block(size) - size;
        if padding > 0 {
            self.out.write_all(&ZEROS[..padding as usize]).await?;
        }

        self.pos += TAR_BLOCK_SIZE + pad_to_block(size);

        Ok(TarEntry {
            offset,
            data_offset: offset + TAR_BLOCK_SIZE,
            size,
            md5: hex::encode(md5.finalize()),
        })
    }

    /// Give back the underlying stream without writing the terminator,
    /// so an abort path can abandon the upload.
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Write the two-block end-of-archive terminator and complete the
    /// underlying stream.  Returns the total archive length.
    pub async fn finish(mut self) -> Result<u64> {
        self.out.write_all(&ZEROS).await?;
        self.out.write_all(&ZEROS).await?;
        self.pos += 2 * TAR_BLOCK_SIZE;
        self.out.shutdown().await?;
        Ok(self.pos)
    }
}

static ZEROS: [u8; TAR_BLOCK_SIZE as usize] = [0u8; TAR_BLOCK_SIZE as usize];

/// Build the 512-byte ustar header for one entry.
///
/// Keys that need a GNU long-name pseudo entry are rejected instead:
/// emitting one would put a second header block in front of the payload
/// and break the `TarDataOffset = TarOffset + 512` bookkeeping that range
/// reads rely on.
fn make_header(desc: &ObjectDescriptor, size: u64) -> Result<tar::Header> {
    if desc.key.is_empty() || desc.key.ends_with('/') {
        return Err(Error::InvalidKey {
            key: desc.key.clone(),
            reason: "cannot be stored as a tar file entry".to_string(),
        });
    }

    let mut header = tar::Header::new_ustar();
    header.set_path(&desc.key).map_err(|e| Error::InvalidKey {
        key: desc.key.clone(),
        reason: e.to_string(),
    })?;
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(desc.last_modified.timestamp().max(0) as u64);
    header.set_cksum();
    Ok(header)
}
