//! Checksummed snapshot files.
//!
//! Hash-tree snapshots, the collision table and the GC history share one
//! framing: `[magic: 4 bytes][format: u32][body][crc32: u32]`, with the CRC
//! covering everything before it. Writes go to a `.tmp` sibling that is
//! fsynced and renamed over the target, so a reader only ever sees a
//! complete old file or a complete new one.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

const TMP_SUFFIX: &str = "tmp";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("bad magic in {0}")]
    BadMagic(PathBuf),

    #[error("unsupported format {found} in {path} (expected {expected})")]
    UnsupportedFormat {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("checksum mismatch in {0}")]
    ChecksumMismatch(PathBuf),
}

/// Writes `body` framed with `magic`/`format` and a trailing CRC.
pub(crate) fn write_framed(
    path: &Path,
    magic: &[u8; 4],
    format: u32,
    body: &[u8],
) -> Result<(), SnapshotError> {
    let mut bytes = Vec::with_capacity(body.len() + 12);
    magic.encode_to(&mut bytes)?;
    format.encode_to(&mut bytes)?;
    bytes.extend_from_slice(body);
    let checksum = crc32fast::hash(&bytes);
    checksum.encode_to(&mut bytes)?;

    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.{TMP_SUFFIX}", ext.to_string_lossy()),
        None => TMP_SUFFIX.to_string(),
    });
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        fsync_dir(dir)?;
    }
    Ok(())
}

/// Reads a framed file and returns its verified body.
pub(crate) fn read_framed(
    path: &Path,
    magic: &[u8; 4],
    format: u32,
) -> Result<Vec<u8>, SnapshotError> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;

    if buf.len() < 12 {
        return Err(SnapshotError::ChecksumMismatch(path.to_path_buf()));
    }
    let (found_magic, _) = <[u8; 4]>::decode_from(&buf)?;
    if &found_magic != magic {
        return Err(SnapshotError::BadMagic(path.to_path_buf()));
    }
    let (found_format, _) = u32::decode_from(&buf[4..])?;
    if found_format != format {
        return Err(SnapshotError::UnsupportedFormat {
            path: path.to_path_buf(),
            found: found_format,
            expected: format,
        });
    }

    let crc_at = buf.len() - 4;
    let (stored, _) = u32::decode_from(&buf[crc_at..])?;
    let mut hasher = Crc32::new();
    hasher.update(&buf[..crc_at]);
    if hasher.finalize() != stored {
        return Err(SnapshotError::ChecksumMismatch(path.to_path_buf()));
    }

    buf.truncate(crc_at);
    buf.drain(..8);
    Ok(buf)
}

pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
