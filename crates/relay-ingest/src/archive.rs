//! Forward-only zip entry reader
//!
//! Parses local file headers as bytes arrive, so neither the archive nor any
//! nested archive ever has to be seekable or held in memory. The reader owns
//! the one cursor over its source; an [`ArchiveEntry`] borrows that cursor,
//! so the next header cannot be requested while an entry is still alive.
//! Dropping an entry drains whatever payload is left.
//!
//! Entries written by single-pass writers defer their CRC and sizes to a
//! data descriptor after the payload. Deflated ones are still readable here:
//! the deflate stream marks its own end, and the descriptor that follows it
//! is checked against what was actually inflated.

use std::io::{self, BufRead, Read};

use flate2::bufread::DeflateDecoder;
use flate2::Crc;
use tracing::trace;
use zip::result::ZipError;

use crate::error::{classify_read_error, IngestError, Result};

const LOCAL_FILE_HEADER: u32 = 0x0403_4b50;
const CENTRAL_DIRECTORY_HEADER: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIRECTORY: u32 = 0x0605_4b50;
const ZIP64_END_OF_CENTRAL_DIRECTORY: u32 = 0x0606_4b50;
const ARCHIVE_EXTRA_DATA: u32 = 0x0806_4b50;
const DATA_DESCRIPTOR: u32 = 0x0807_4b50;

const LOCAL_HEADER_LEN: usize = 30;
const CURSOR_CAPACITY: usize = 8 * 1024;

const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;
const ZIP64_EXTRA_FIELD: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// What the next four bytes of the cursor announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Record {
    LocalFile,
    /// Central directory or trailer: no entries follow
    Trailer,
    Unknown(u32),
}

impl Record {
    fn from_signature(signature: u32) -> Self {
        match signature {
            LOCAL_FILE_HEADER => Record::LocalFile,
            CENTRAL_DIRECTORY_HEADER
            | END_OF_CENTRAL_DIRECTORY
            | ZIP64_END_OF_CENTRAL_DIRECTORY
            | ARCHIVE_EXTRA_DATA => Record::Trailer,
            other => Record::Unknown(other),
        }
    }
}

/// Fixed part of a local file header
#[derive(Debug, Clone, Copy)]
struct LocalHeader {
    flags: u16,
    method: u16,
    name_len: u16,
    extra_len: u16,
}

impl LocalHeader {
    fn parse(raw: &[u8]) -> Self {
        Self {
            flags: le_u16(raw, 6),
            method: le_u16(raw, 8),
            name_len: le_u16(raw, 26),
            extra_len: le_u16(raw, 28),
        }
    }

    fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }
}

fn le_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

fn le_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

/// Owned, buffered read cursor that can look ahead at the next record
///
/// Lookahead never consumes: peeked bytes are served again by `Read` and
/// `BufRead`, and only consumed bytes count towards [`position`](Self::position).
pub struct ArchiveCursor<R> {
    inner: R,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    position: u64,
}

impl<R: Read> ArchiveCursor<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0; CURSOR_CAPACITY].into_boxed_slice(),
            start: 0,
            end: 0,
            position: 0,
        }
    }

    /// Bytes handed out so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Buffer up to `wanted` bytes without consuming them; fewer only at end of input
    fn peek(&mut self, wanted: usize) -> io::Result<&[u8]> {
        debug_assert!(wanted <= self.buf.len());

        if self.end - self.start < wanted && self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        while self.end - self.start < wanted {
            match self.inner.read(&mut self.buf[self.end..]) {
                Ok(0) => break,
                Ok(n) => self.end += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(&self.buf[self.start..self.end])
    }

    fn peek_record(&mut self) -> Result<Record> {
        let position = self.position;
        let head = self.peek(4).map_err(classify_read_error)?;
        if head.len() < 4 {
            return Err(IngestError::IncompleteInput(format!(
                "archive ended at byte {} without a central directory",
                position + head.len() as u64
            )));
        }
        Ok(Record::from_signature(le_u32(head, 0)))
    }

    fn peek_local_header(&mut self) -> Result<LocalHeader> {
        let position = self.position;
        let raw = self.peek(LOCAL_HEADER_LEN).map_err(classify_read_error)?;
        if raw.len() < LOCAL_HEADER_LEN {
            return Err(IngestError::IncompleteInput(format!(
                "local header at byte {} cut off after {} bytes",
                position,
                raw.len()
            )));
        }
        Ok(LocalHeader::parse(raw))
    }
}

impl<R: Read> Read for ArchiveCursor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Large reads skip the buffer once it is empty
        if self.start == self.end && buf.len() >= self.buf.len() {
            let n = self.inner.read(buf)?;
            self.position += n as u64;
            return Ok(n);
        }

        let n = {
            let available = self.fill_buf()?;
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            n
        };
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for ArchiveCursor<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.start == self.end {
            self.start = 0;
            self.end = self.inner.read(&mut self.buf)?;
        }
        Ok(&self.buf[self.start..self.end])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.end - self.start);
        self.start += amt;
        self.position += amt as u64;
    }
}

/// Deflated payload whose CRC and sizes trail it in a data descriptor
///
/// The bufread decoder consumes exactly the deflate stream, leaving the
/// cursor on the descriptor once inflation ends.
struct DescriptorPayload<'a, R: Read> {
    decoder: DeflateDecoder<&'a mut ArchiveCursor<R>>,
    crc: Crc,
    inflated: u64,
    zip64: bool,
    finished: bool,
}

impl<R: Read> DescriptorPayload<'_, R> {
    fn at_end_of_input(&mut self) -> bool {
        self.decoder
            .get_mut()
            .fill_buf()
            .map(|rest| rest.is_empty())
            .unwrap_or(false)
    }

    fn verify_descriptor(&mut self) -> io::Result<()> {
        let compressed = self.decoder.total_in();
        let cursor = self.decoder.get_mut();

        let mut word = [0u8; 4];
        cursor.read_exact(&mut word)?;
        let mut crc = u32::from_le_bytes(word);
        // The signature is optional
        if crc == DATA_DESCRIPTOR {
            cursor.read_exact(&mut word)?;
            crc = u32::from_le_bytes(word);
        }

        let (compressed_size, size) = if self.zip64 {
            let mut compressed_size = [0u8; 8];
            let mut size = [0u8; 8];
            cursor.read_exact(&mut compressed_size)?;
            cursor.read_exact(&mut size)?;
            (u64::from_le_bytes(compressed_size), u64::from_le_bytes(size))
        } else {
            let mut sizes = [0u8; 8];
            cursor.read_exact(&mut sizes)?;
            (le_u32(&sizes, 0) as u64, le_u32(&sizes, 4) as u64)
        };

        let actual_crc = self.crc.sum();
        if crc != actual_crc || size != self.inflated || compressed_size != compressed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "data descriptor disagrees with payload: crc {:#010x} vs {:#010x}, \
                     size {} vs {}, compressed {} vs {}",
                    crc, actual_crc, size, self.inflated, compressed_size, compressed
                ),
            ));
        }
        Ok(())
    }
}

impl<R: Read> Read for DescriptorPayload<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }

        let n = match self.decoder.read(buf) {
            Ok(n) => n,
            // A deflate stream cut off by the end of input is a truncation
            Err(e) if e.kind() != io::ErrorKind::Interrupted && self.at_end_of_input() => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()));
            },
            Err(e) => return Err(e),
        };

        if n == 0 {
            self.finished = true;
            self.verify_descriptor()?;
        } else {
            self.crc.update(&buf[..n]);
            self.inflated += n as u64;
        }
        Ok(n)
    }
}

impl<R: Read> Drop for DescriptorPayload<'_, R> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = io::copy(self, &mut io::sink());
        }
    }
}

/// One member of an archive, valid until the reader advances
pub struct ArchiveEntry<'a> {
    path: String,
    kind: EntryKind,
    declared_size: Option<u64>,
    consumed: u64,
    payload: Box<dyn Read + 'a>,
}

impl ArchiveEntry<'_> {
    /// Name exactly as declared in the local header
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Uncompressed size from the local header, `None` when it trails the payload
    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    /// Payload bytes read so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Read and discard the rest of the payload
    pub fn drain(&mut self) -> Result<u64> {
        io::copy(self, &mut io::sink()).map_err(classify_read_error)
    }

    fn short_of_declared(&self) -> bool {
        self.declared_size.is_some_and(|size| self.consumed < size)
    }

    fn truncated(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "entry '{}' ended after {} of {} bytes",
                self.path,
                self.consumed,
                self.declared_size.unwrap_or_default()
            ),
        )
    }
}

impl Read for ArchiveEntry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.payload.read(buf) {
            Ok(0) if !buf.is_empty() && self.short_of_declared() => Err(self.truncated()),
            Ok(n) => {
                self.consumed += n as u64;
                Ok(n)
            },
            // The zip layer reports a cut-off stream as a CRC or inflate
            // failure; the byte count tells the two apart.
            Err(e) if e.kind() != io::ErrorKind::Interrupted && self.short_of_declared() => {
                trace!(path = %self.path, error = %e, "payload read failed before declared size");
                Err(self.truncated())
            },
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ArchiveEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveEntry")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("declared_size", &self.declared_size)
            .field("consumed", &self.consumed)
            .finish()
    }
}

/// Lazy, ordered sequence of entries over a single-pass byte stream
pub struct EntryReader<R> {
    cursor: ArchiveCursor<R>,
    entries_read: u64,
    finished: bool,
}

impl<R: Read> EntryReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            cursor: ArchiveCursor::new(source),
            entries_read: 0,
            finished: false,
        }
    }

    /// Headers returned so far, directories included
    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }

    /// Advance to the next local file header
    ///
    /// Returns `Ok(None)` once the central directory is reached. An archive
    /// with no entries at all is just a trailer and yields `Ok(None)` at once.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'_>>> {
        if self.finished {
            return Ok(None);
        }

        match self.cursor.peek_record()? {
            Record::LocalFile => {},
            Record::Trailer => {
                self.finished = true;
                trace!(entries = self.entries_read, "reached central directory");
                return Ok(None);
            },
            Record::Unknown(signature) => {
                return Err(IngestError::Decode(format!(
                    "unexpected record signature {:#010x} at byte {}",
                    signature,
                    self.cursor.position()
                )));
            },
        }

        let offset = self.cursor.position();
        let header = self.cursor.peek_local_header()?;
        if header.has_data_descriptor() {
            let entry = open_descriptor_entry(&mut self.cursor, header, offset)?;
            self.entries_read += 1;
            return Ok(Some(entry));
        }

        let file = match zip::read::read_zipfile_from_stream(&mut self.cursor) {
            Ok(Some(file)) => file,
            Ok(None) => {
                self.finished = true;
                return Ok(None);
            },
            Err(e) => return Err(classify_zip_error(e, offset)),
        };

        self.entries_read += 1;
        let path = file.name().to_string();
        let kind = if file.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let declared_size = file.size();
        trace!(%path, ?kind, declared_size, offset, "read local header");

        Ok(Some(ArchiveEntry {
            path,
            kind,
            declared_size: Some(declared_size),
            consumed: 0,
            payload: Box::new(file),
        }))
    }
}

/// Consume a local header whose sizes trail the payload and set up inflation
fn open_descriptor_entry<R: Read>(
    cursor: &mut ArchiveCursor<R>,
    header: LocalHeader,
    offset: u64,
) -> Result<ArchiveEntry<'_>> {
    let mut fixed = [0u8; LOCAL_HEADER_LEN];
    cursor.read_exact(&mut fixed).map_err(classify_read_error)?;
    let mut name = vec![0u8; header.name_len as usize];
    cursor.read_exact(&mut name).map_err(classify_read_error)?;
    let mut extra = vec![0u8; header.extra_len as usize];
    cursor.read_exact(&mut extra).map_err(classify_read_error)?;

    let path = String::from_utf8_lossy(&name).into_owned();
    if header.flags & FLAG_ENCRYPTED != 0 {
        return Err(IngestError::Decode(format!(
            "entry '{}' at byte {} is encrypted",
            path, offset
        )));
    }
    match header.method {
        METHOD_DEFLATED => {},
        METHOD_STORED => {
            return Err(IngestError::Decode(format!(
                "stored entry '{}' at byte {} has no size before its payload",
                path, offset
            )));
        },
        other => {
            return Err(IngestError::Decode(format!(
                "entry '{}' at byte {} uses unsupported compression method {}",
                path, offset, other
            )));
        },
    }

    let kind = if path.ends_with('/') {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    let zip64 = has_zip64_extra(&extra);
    trace!(%path, ?kind, zip64, offset, "read local header with trailing data descriptor");

    Ok(ArchiveEntry {
        path,
        kind,
        declared_size: None,
        consumed: 0,
        payload: Box::new(DescriptorPayload {
            decoder: DeflateDecoder::new(cursor),
            crc: Crc::new(),
            inflated: 0,
            zip64,
            finished: false,
        }),
    })
}

fn has_zip64_extra(mut extra: &[u8]) -> bool {
    while extra.len() >= 4 {
        let id = le_u16(extra, 0);
        let len = le_u16(extra, 2) as usize;
        if id == ZIP64_EXTRA_FIELD {
            return true;
        }
        extra = extra.get(4 + len..).unwrap_or_default();
    }
    false
}

fn classify_zip_error(err: ZipError, offset: u64) -> IngestError {
    match err {
        ZipError::Io(e) => classify_read_error(e),
        other => IngestError::Decode(format!("local header at byte {}: {}", offset, other)),
    }
}
