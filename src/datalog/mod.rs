//! # Data Log
//!
//! Append-only record storage split into bounded **chunk** files
//! (`000.data`, `001.data`, ...). Every write lands at the end of the
//! active (highest) chunk; when a record would push the active chunk past
//! `data_file_max`, a new chunk is started.
//!
//! # On-disk record layout
//!
//! ```text
//! [crc32 u32][timestamp u32][flag u32][version i32][key_len u32][value_len u32][key][value]
//! ```
//!
//! All integers are little-endian. The CRC covers every byte after the CRC
//! field itself, so torn writes and bit rot are both detected.
//!
//! # Access paths
//!
//! - [`DataLog::append`] — serialized behind the append mutex.
//! - [`DataLog::read_at`] — positional reads through cached read-only
//!   handles (`pread`), no locking against appenders.
//! - [`DataStreamReader`] — sequential scan used by recovery and GC.
//! - [`DataStreamWriter`] — GC output, either appending to a chunk or
//!   building a replacement for it in a temporary file.

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::encoding::{Decode, Encode, EncodingError};
use crate::position::Position;
use crate::record::{Payload, Record, RecordFlag, VersionedMeta};

/// Fixed part of every record, CRC included.
pub const RECORD_HEADER_SIZE: usize = 24;

const DATA_SUFFIX: &str = "data";
const GC_TMP_SUFFIX: &str = "data.gc";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DataLogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Stored checksum does not match the record bytes.
    #[error("checksum mismatch at {0}")]
    ChecksumMismatch(Position),

    /// The position points past the end of its chunk or into a torn record.
    #[error("truncated record at {0}")]
    Truncated(Position),

    #[error("record of {size} bytes exceeds data_file_max ({max})")]
    RecordTooLarge { size: usize, max: u32 },

    #[error("chunk {0} does not exist")]
    MissingChunk(u32),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Record framing
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    crc: u32,
    timestamp: u32,
    flag: u32,
    version: i32,
    key_len: u32,
    value_len: u32,
}

impl RecordHeader {
    fn body_len(&self) -> usize {
        self.key_len as usize + self.value_len as usize
    }
}

impl Encode for RecordHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.crc.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        self.flag.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.key_len.encode_to(buf)?;
        self.value_len.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for RecordHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (crc, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (timestamp, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (flag, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = i32::decode_from(&buf[offset..])?;
        offset += n;
        let (key_len, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (value_len, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                crc,
                timestamp,
                flag,
                version,
                key_len,
                value_len,
            },
            offset,
        ))
    }
}

/// Serializes a record with its checksum.
pub(crate) fn encode_record(record: &Record) -> Result<Vec<u8>, DataLogError> {
    let key_len = u32::try_from(record.key.len())
        .map_err(|_| EncodingError::LengthOverflow("key longer than u32::MAX".into()))?;
    let value_len = u32::try_from(record.payload.value.len())
        .map_err(|_| EncodingError::LengthOverflow("value longer than u32::MAX".into()))?;
    let header = RecordHeader {
        crc: 0,
        timestamp: record.payload.timestamp,
        flag: record.payload.flag.to_u32(),
        version: record.payload.meta.version,
        key_len,
        value_len,
    };

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + header.body_len());
    header.encode_to(&mut buf)?;
    buf.extend_from_slice(&record.key);
    buf.extend_from_slice(&record.payload.value);

    let crc = crc32fast::hash(&buf[4..]);
    buf[..4].copy_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Builds a record from its header and body after checking the CRC.
/// `None` means the bytes are not a valid record.
fn decode_record(header_bytes: &[u8], body: &[u8]) -> Option<Record> {
    let (header, _) = RecordHeader::decode_from(header_bytes).ok()?;
    if body.len() != header.body_len() {
        return None;
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_bytes[4..RECORD_HEADER_SIZE]);
    hasher.update(body);
    if hasher.finalize() != header.crc {
        return None;
    }

    let (key, value) = body.split_at(header.key_len as usize);
    let value = value.to_vec();
    Some(Record {
        key: key.to_vec(),
        payload: Payload {
            meta: VersionedMeta {
                version: header.version,
                value_hash: crate::key::value_hash(&value),
            },
            timestamp: header.timestamp,
            flag: RecordFlag::from_u32(header.flag),
            value,
        },
    })
}

/// On-disk size of a record.
pub(crate) fn record_size(record: &Record) -> u32 {
    (RECORD_HEADER_SIZE + record.key.len() + record.payload.value.len()) as u32
}

/// Cuts the chunk at `path` back to the end of its last valid record so
/// new appends follow readable data. Returns the resulting size.
fn trim_torn_tail(path: &Path, chunk: u32, size: u32) -> Result<u32, DataLogError> {
    let mut reader = DataStreamReader::new(chunk, File::open(path)?, 0, size)?;
    while reader.next()?.is_some() {}
    if reader.broken_bytes() == 0 {
        return Ok(size);
    }
    let valid = reader.offset();
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(u64::from(valid))?;
    file.sync_all()?;
    warn!(chunk, size, valid, "active chunk had a torn tail, truncated");
    Ok(valid)
}

pub(crate) fn chunk_file_name(chunk: u32) -> String {
    format!("{chunk:03}.{DATA_SUFFIX}")
}

fn parse_chunk_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(DATA_SUFFIX)?.strip_suffix('.')?;
    if stem.contains('.') {
        return None;
    }
    stem.parse().ok()
}

// ------------------------------------------------------------------------------------------------
// DataLog
// ------------------------------------------------------------------------------------------------

struct Appender {
    chunk: u32,
    offset: u32,
    file: Option<File>,
}

/// The per-bucket data log.
pub struct DataLog {
    home: PathBuf,
    data_file_max: u32,

    appender: Mutex<Appender>,

    /// Bytes present per chunk. Chunks absent here have no file.
    sizes: RwLock<BTreeMap<u32, u32>>,

    /// Read-only handles for positional reads, keyed by chunk.
    readers: Mutex<HashMap<u32, Arc<File>>>,
}

impl DataLog {
    /// Opens the data log in `home`, resuming appends at the end of the
    /// highest existing chunk.
    ///
    /// Fails if the directory cannot be listed.
    pub fn open(home: impl AsRef<Path>, data_file_max: u32) -> Result<Self, DataLogError> {
        let home = home.as_ref().to_path_buf();

        let mut sizes = BTreeMap::new();
        for entry in fs::read_dir(&home)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(chunk) = name.to_str().and_then(parse_chunk_file_name) else {
                if name.to_string_lossy().ends_with(GC_TMP_SUFFIX) {
                    warn!(file = %name.to_string_lossy(), "removing unfinished GC output");
                    fs::remove_file(entry.path())?;
                }
                continue;
            };
            let len = entry.metadata()?.len();
            let len = u32::try_from(len).map_err(|_| {
                DataLogError::Internal(format!("chunk {chunk} is larger than 4 GiB"))
            })?;
            sizes.insert(chunk, len);
        }

        if let Some((&last, &len)) = sizes.last_key_value() {
            let valid = trim_torn_tail(&home.join(chunk_file_name(last)), last, len)?;
            sizes.insert(last, valid);
        }
        let (chunk, offset) = sizes
            .last_key_value()
            .map(|(&c, &s)| (c, s))
            .unwrap_or((0, 0));

        info!(
            home = %home.display(),
            chunks = sizes.len(),
            active_chunk = chunk,
            "data log opened"
        );

        Ok(Self {
            home,
            data_file_max,
            appender: Mutex::new(Appender {
                chunk,
                offset,
                file: None,
            }),
            sizes: RwLock::new(sizes),
            readers: Mutex::new(HashMap::new()),
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn chunk_path(&self, chunk: u32) -> PathBuf {
        self.home.join(chunk_file_name(chunk))
    }

    /// Appends a record and returns where it landed.
    pub fn append(&self, record: &Record) -> Result<Position, DataLogError> {
        let bytes = encode_record(record)?;
        if bytes.len() as u64 > u64::from(self.data_file_max) {
            return Err(DataLogError::RecordTooLarge {
                size: bytes.len(),
                max: self.data_file_max,
            });
        }

        let mut app = self.lock_appender()?;

        if app.offset > 0 && u64::from(app.offset) + bytes.len() as u64 > u64::from(self.data_file_max)
        {
            if let Some(file) = app.file.take() {
                file.sync_data()?;
            }
            app.chunk += 1;
            app.offset = 0;
            debug!(chunk = app.chunk, "data log rotated");
        }

        if app.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.chunk_path(app.chunk))?;
            app.file = Some(file);
        }
        let Some(file) = app.file.as_mut() else {
            return Err(DataLogError::Internal("appender has no file".into()));
        };
        file.write_all(&bytes)?;

        let pos = Position::new(app.chunk, app.offset);
        app.offset += bytes.len() as u32;
        self.sizes
            .write()
            .map_err(|_| DataLogError::Internal("RwLock poisoned".into()))?
            .insert(app.chunk, app.offset);

        trace!(%pos, size = bytes.len(), "record appended");
        Ok(pos)
    }

    /// Reads and verifies the record at `pos`.
    pub fn read_at(&self, pos: Position) -> Result<Record, DataLogError> {
        let file = self.reader(pos.chunk_id)?;

        let mut header = [0u8; RECORD_HEADER_SIZE];
        file.read_exact_at(&mut header, u64::from(pos.offset))
            .map_err(|e| eof_as_truncated(e, pos))?;
        let (parsed, _) = RecordHeader::decode_from(&header)?;

        let mut body = vec![0u8; parsed.body_len()];
        file.read_exact_at(&mut body, u64::from(pos.offset) + RECORD_HEADER_SIZE as u64)
            .map_err(|e| eof_as_truncated(e, pos))?;

        decode_record(&header, &body).ok_or(DataLogError::ChecksumMismatch(pos))
    }

    /// Sequential reader over a whole chunk.
    pub fn stream_reader(&self, chunk: u32) -> Result<DataStreamReader, DataLogError> {
        self.stream_reader_from(chunk, 0)
    }

    /// Sequential reader starting at `offset` within `chunk`.
    pub fn stream_reader_from(
        &self,
        chunk: u32,
        offset: u32,
    ) -> Result<DataStreamReader, DataLogError> {
        let size = self
            .chunk_size(chunk)?
            .ok_or(DataLogError::MissingChunk(chunk))?;
        let file = File::open(self.chunk_path(chunk))?;
        DataStreamReader::new(chunk, file, offset, size)
    }

    /// Opens a GC writer targeting `chunk`.
    ///
    /// With `in_place` the output goes to a temporary file that replaces the
    /// chunk on [`DataStreamWriter::close`]; until then the chunk stays
    /// intact. Otherwise records are appended to the chunk (created if
    /// missing).
    pub fn stream_writer(
        &self,
        chunk: u32,
        in_place: bool,
    ) -> Result<DataStreamWriter, DataLogError> {
        let target = self.chunk_path(chunk);
        let (path, file, offset) = if in_place {
            let tmp = self.home.join(format!("{chunk:03}.{GC_TMP_SUFFIX}"));
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            (tmp, file, 0)
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)?;
            let len = file.metadata()?.len() as u32;
            (target.clone(), file, len)
        };

        debug!(chunk, in_place, offset, "GC stream writer opened");
        Ok(DataStreamWriter {
            chunk,
            path,
            target,
            in_place,
            writer: BufWriter::new(file),
            offset,
        })
    }

    /// Records the new state of a chunk after a GC writer closed on it.
    pub(crate) fn register_rewritten(&self, chunk: u32, size: u32) -> Result<(), DataLogError> {
        self.evict_reader(chunk)?;
        self.sizes
            .write()
            .map_err(|_| DataLogError::Internal("RwLock poisoned".into()))?
            .insert(chunk, size);
        Ok(())
    }

    /// Cuts `chunk` down to `size` bytes.
    pub fn truncate(&self, chunk: u32, size: u32) -> Result<(), DataLogError> {
        let file = OpenOptions::new().write(true).open(self.chunk_path(chunk))?;
        file.set_len(u64::from(size))?;
        file.sync_all()?;
        self.register_rewritten(chunk, size)?;
        debug!(chunk, size, "chunk truncated");
        Ok(())
    }

    /// Deletes a chunk file. The active chunk cannot be deleted.
    pub fn delete(&self, chunk: u32) -> Result<(), DataLogError> {
        if chunk >= self.active_chunk()? {
            return Err(DataLogError::Internal(format!(
                "refusing to delete active chunk {chunk}"
            )));
        }
        self.evict_reader(chunk)?;
        match fs::remove_file(self.chunk_path(chunk)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.sizes
            .write()
            .map_err(|_| DataLogError::Internal("RwLock poisoned".into()))?
            .remove(&chunk);
        info!(chunk, "chunk deleted");
        Ok(())
    }

    /// Byte size of every chunk present, ascending by chunk id.
    pub fn chunk_sizes(&self) -> Result<BTreeMap<u32, u32>, DataLogError> {
        Ok(self
            .sizes
            .read()
            .map_err(|_| DataLogError::Internal("RwLock poisoned".into()))?
            .clone())
    }

    pub fn chunk_size(&self, chunk: u32) -> Result<Option<u32>, DataLogError> {
        Ok(self
            .sizes
            .read()
            .map_err(|_| DataLogError::Internal("RwLock poisoned".into()))?
            .get(&chunk)
            .copied())
    }

    /// The chunk currently receiving appends.
    pub fn active_chunk(&self) -> Result<u32, DataLogError> {
        Ok(self.lock_appender()?.chunk)
    }

    /// Highest chunk with a file on disk, if any.
    pub fn max_chunk(&self) -> Result<Option<u32>, DataLogError> {
        Ok(self
            .sizes
            .read()
            .map_err(|_| DataLogError::Internal("RwLock poisoned".into()))?
            .last_key_value()
            .map(|(&c, _)| c))
    }

    /// Forces appended data to stable storage.
    pub fn flush(&self) -> Result<(), DataLogError> {
        let app = self.lock_appender()?;
        if let Some(file) = app.file.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn lock_appender(&self) -> Result<std::sync::MutexGuard<'_, Appender>, DataLogError> {
        self.appender
            .lock()
            .map_err(|_| DataLogError::Internal("Mutex poisoned".into()))
    }

    fn reader(&self, chunk: u32) -> Result<Arc<File>, DataLogError> {
        let mut readers = self
            .readers
            .lock()
            .map_err(|_| DataLogError::Internal("Mutex poisoned".into()))?;
        if let Some(file) = readers.get(&chunk) {
            return Ok(Arc::clone(file));
        }
        let file = match File::open(self.chunk_path(chunk)) {
            Ok(f) => Arc::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DataLogError::MissingChunk(chunk));
            }
            Err(e) => return Err(e.into()),
        };
        readers.insert(chunk, Arc::clone(&file));
        Ok(file)
    }

    fn evict_reader(&self, chunk: u32) -> Result<(), DataLogError> {
        self.readers
            .lock()
            .map_err(|_| DataLogError::Internal("Mutex poisoned".into()))?
            .remove(&chunk);
        Ok(())
    }
}

fn eof_as_truncated(e: io::Error, pos: Position) -> DataLogError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        DataLogError::Truncated(pos)
    } else {
        DataLogError::Io(e)
    }
}

// ------------------------------------------------------------------------------------------------
// Stream reader
// ------------------------------------------------------------------------------------------------

/// Sequential reader over one chunk.
///
/// Yields `(record, offset)` pairs until the end of the chunk or the first
/// record that fails to parse. Everything from that record on is counted by
/// [`DataStreamReader::broken_bytes`] and never yielded.
pub struct DataStreamReader {
    chunk: u32,
    reader: BufReader<File>,
    offset: u32,
    size: u32,
    broken: u32,
}

impl DataStreamReader {
    fn new(chunk: u32, file: File, offset: u32, size: u32) -> Result<Self, DataLogError> {
        let mut reader = BufReader::with_capacity(256 * 1024, file);
        io::Seek::seek(&mut reader, io::SeekFrom::Start(u64::from(offset)))?;
        Ok(Self {
            chunk,
            reader,
            offset,
            size,
            broken: 0,
        })
    }

    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    /// Offset of the next record to be read.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Bytes skipped because they did not form a valid record.
    pub fn broken_bytes(&self) -> u32 {
        self.broken
    }

    pub fn next(&mut self) -> Result<Option<(Record, u32)>, DataLogError> {
        if self.offset >= self.size || self.broken > 0 {
            return Ok(None);
        }

        let remaining = self.size - self.offset;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        if (remaining as usize) < RECORD_HEADER_SIZE {
            return Ok(self.mark_broken());
        }
        if !self.fill(&mut header)? {
            return Ok(self.mark_broken());
        }
        let (parsed, _) = RecordHeader::decode_from(&header)?;

        let total = RECORD_HEADER_SIZE as u64 + parsed.body_len() as u64;
        if total > u64::from(remaining) {
            return Ok(self.mark_broken());
        }
        let mut body = vec![0u8; parsed.body_len()];
        if !self.fill(&mut body)? {
            return Ok(self.mark_broken());
        }

        match decode_record(&header, &body) {
            Some(record) => {
                let at = self.offset;
                self.offset += total as u32;
                Ok(Some((record, at)))
            }
            None => Ok(self.mark_broken()),
        }
    }

    /// Reads exactly `buf.len()` bytes; `false` if the file ended first.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool, DataLogError> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn mark_broken(&mut self) -> Option<(Record, u32)> {
        self.broken = self.size - self.offset;
        warn!(
            chunk = self.chunk,
            offset = self.offset,
            broken_bytes = self.broken,
            "unreadable record, ignoring rest of chunk"
        );
        None
    }
}

// ------------------------------------------------------------------------------------------------
// Stream writer
// ------------------------------------------------------------------------------------------------

/// GC output for one destination chunk.
pub struct DataStreamWriter {
    chunk: u32,
    path: PathBuf,
    target: PathBuf,
    in_place: bool,
    writer: BufWriter<File>,
    offset: u32,
}

impl DataStreamWriter {
    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    pub fn in_place(&self) -> bool {
        self.in_place
    }

    /// Bytes written to the destination so far, counting what it held before.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Writes a record and returns its offset in the destination chunk.
    pub fn append(&mut self, record: &Record) -> Result<u32, DataLogError> {
        let bytes = encode_record(record)?;
        self.writer.write_all(&bytes)?;
        let at = self.offset;
        self.offset += bytes.len() as u32;
        Ok(at)
    }

    /// Flushes and syncs the output; an in-place writer then atomically
    /// replaces its chunk. Returns the final chunk size.
    pub fn close(self, log: &DataLog) -> Result<u32, DataLogError> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| DataLogError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        if self.in_place {
            fs::rename(&self.path, &self.target)?;
            crate::snapshot::fsync_dir(log.home())?;
        }
        log.register_rewritten(self.chunk, self.offset)?;
        debug!(chunk = self.chunk, size = self.offset, "GC stream writer closed");
        Ok(self.offset)
    }
}
