//! The tar binding of the archive engine.
//!
//! `TarReader` walks a tar stream one 512-byte header at a time and hands out entry data in
//! bounded blocks.  The compression filter is sniffed from the first bytes of the file so plain,
//! gzip, bzip2, xz and zstd compressed archives all open the same way.  Header interpretation (including
//! GNU long names and PAX extensions) leans on the `tar` crate's `Header` and `PaxExtensions`.

use std::{
    ffi::OsStr,
    fs::File,
    io::{self, BufRead, BufReader, ErrorKind, Read},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use tar::{EntryType as TarEntryType, Header, PaxExtensions};

use crate::{
    archive::{ArchiveEngine, EntryHeader, EntryReader, EntryType, ExtractOptions},
    disk::DiskWriter,
    util::read_exactish,
};

const TAR_BLOCK_SIZE: usize = 512;
/// Upper bound on GNU long name/link and PAX header payloads.
const MAX_EXTENSION_SIZE: u64 = 1024 * 1024;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// The compression filter detected on an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Filter {
    fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(GZIP_MAGIC) {
            Filter::Gzip
        } else if magic.starts_with(BZIP2_MAGIC)
            && magic.get(3).is_some_and(|level| (b'1'..=b'9').contains(level))
        {
            Filter::Bzip2
        } else if magic.starts_with(XZ_MAGIC) {
            Filter::Xz
        } else if magic.starts_with(ZSTD_MAGIC) {
            Filter::Zstd
        } else {
            Filter::None
        }
    }
}

/// Archive engine for (optionally compressed) tar archives, extracting through [`DiskWriter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TarEngine;

impl ArchiveEngine for TarEngine {
    type Reader = TarReader;
    type Writer = DiskWriter;

    fn open_read(&self, path: &Path, block_size: usize) -> io::Result<TarReader> {
        let file = File::open(path).map_err(|e| {
            io::Error::new(e.kind(), format!("Failed to open '{}': {e}", path.display()))
        })?;
        TarReader::new(file, block_size)
    }

    fn open_disk_writer(&self, options: ExtractOptions) -> io::Result<DiskWriter> {
        Ok(DiskWriter::new(options))
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg.into())
}

/// Verifies the header checksum: the sum of all header bytes with the checksum field itself
/// counted as spaces.
fn checksum_ok(header: &Header) -> bool {
    let Ok(stored) = header.cksum() else {
        return false;
    };
    let bytes = header.as_bytes();
    let sum: u32 = bytes[..148]
        .iter()
        .chain(&[b' '; 8])
        .chain(&bytes[156..])
        .map(|b| u32::from(*b))
        .sum();
    sum == stored
}

/// Size of an entry's data rounded up to whole blocks.
fn padded_size(size: u64) -> io::Result<u64> {
    size.checked_next_multiple_of(TAR_BLOCK_SIZE as u64)
        .ok_or_else(|| invalid_data("Damaged tar archive"))
}

/// Reads a numeric header field, taking a field of only NULs or spaces as 0.
fn numeric_field<T: Default>(field: &[u8], parse: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
    if field.iter().all(|b| *b == 0 || *b == b' ') {
        Ok(T::default())
    } else {
        parse()
    }
}

fn trim_nul(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(bytes))
}

/// Extension records that apply to the next real entry.
#[derive(Debug, Default)]
struct Extensions {
    path: Option<Vec<u8>>,
    link: Option<Vec<u8>>,
    size: Option<u64>,
    mtime: Option<i64>,
    uid: Option<u64>,
    gid: Option<u64>,
}

impl Extensions {
    fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> io::Result<T> {
        value
            .parse()
            .map_err(|_| invalid_data(format!("Invalid PAX {key} value {value:?}")))
    }

    fn merge_pax(&mut self, data: &[u8]) -> io::Result<()> {
        for item in PaxExtensions::new(data) {
            let extension = item?;
            let key = extension.key().map_err(|e| invalid_data(e.to_string()))?;

            match key {
                "path" => self.path = Some(extension.value_bytes().to_vec()),
                "linkpath" => self.link = Some(extension.value_bytes().to_vec()),
                "size" | "mtime" | "uid" | "gid" => {
                    let value = extension.value().map_err(|e| invalid_data(e.to_string()))?;
                    match key {
                        "size" => self.size = Some(Self::parse_number(key, value)?),
                        "uid" => self.uid = Some(Self::parse_number(key, value)?),
                        "gid" => self.gid = Some(Self::parse_number(key, value)?),
                        _ => {
                            // fractional seconds are dropped
                            let secs = value.split('.').next().unwrap_or(value);
                            self.mtime = Some(Self::parse_number(key, secs)?);
                        }
                    }
                }
                _ => trace!("ignoring PAX record {key}"),
            }
        }
        Ok(())
    }
}

/// A read session over a tar archive.
pub struct TarReader {
    stream: Box<dyn Read>,
    filter: Filter,
    /// The first header block, read at open time to recognize the format.
    first: Option<[u8; TAR_BLOCK_SIZE]>,
    /// Unread data bytes of the current entry.
    remaining: u64,
    /// Padding following the current entry's data.
    padding: u64,
    offset: u64,
    buffer: Vec<u8>,
    finished: bool,
}

impl std::fmt::Debug for TarReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarReader")
            .field("filter", &self.filter)
            .field("remaining", &self.remaining)
            .field("offset", &self.offset)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl TarReader {
    /// Starts a read session over `source`, which may be compressed.
    ///
    /// Fails if the stream is not a tar archive.  An empty stream is accepted as an archive with
    /// no entries.
    pub fn new(source: impl Read + 'static, block_size: usize) -> io::Result<Self> {
        let block_size = block_size.max(TAR_BLOCK_SIZE);
        let mut source = BufReader::with_capacity(block_size, source);
        let filter = Filter::detect(source.fill_buf()?);

        let stream: Box<dyn Read> = match filter {
            Filter::None => Box::new(source),
            Filter::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(source)),
            Filter::Bzip2 => Box::new(bzip2::bufread::MultiBzDecoder::new(source)),
            Filter::Xz => Box::new(xz2::bufread::XzDecoder::new_multi_decoder(source)),
            Filter::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(source)?),
        };

        let mut reader = Self {
            stream,
            filter,
            first: None,
            remaining: 0,
            padding: 0,
            offset: 0,
            buffer: vec![0; block_size],
            finished: false,
        };

        let mut block = [0u8; TAR_BLOCK_SIZE];
        match read_exactish(&mut reader.stream, &mut block) {
            Ok(true) => {}
            Ok(false) => reader.finished = true,
            // too short to hold even a single header
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(invalid_data("Unrecognized archive format"))
            }
            Err(e) => return Err(e),
        }
        if !reader.finished {
            if block != [0u8; TAR_BLOCK_SIZE] && !checksum_ok(Header::from_byte_slice(&block)) {
                return Err(invalid_data("Unrecognized archive format"));
            }
            reader.first = Some(block);
        }

        debug!("opened tar archive (filter {filter:?})");
        Ok(reader)
    }

    /// The compression filter detected at open time.
    pub fn filter(&self) -> Filter {
        self.filter
    }

    fn discard(&mut self, mut count: u64) -> io::Result<()> {
        while count > 0 {
            let chunk = count.min(self.buffer.len() as u64) as usize;
            self.stream
                .read_exact(&mut self.buffer[..chunk])
                .map_err(|e| match e.kind() {
                    ErrorKind::UnexpectedEof => invalid_data("Truncated tar archive"),
                    _ => e,
                })?;
            count -= chunk as u64;
        }
        Ok(())
    }

    fn read_block(&mut self) -> io::Result<Option<[u8; TAR_BLOCK_SIZE]>> {
        if let Some(block) = self.first.take() {
            return Ok(Some(block));
        }
        let mut block = [0u8; TAR_BLOCK_SIZE];
        match read_exactish(&mut self.stream, &mut block) {
            Ok(true) => Ok(Some(block)),
            Ok(false) => Ok(None),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(invalid_data("Truncated tar archive"))
            }
            Err(e) => Err(e),
        }
    }

    /// Reads the whole payload of an extension header (GNU long name, PAX record...).
    fn read_extension(&mut self, size: u64) -> io::Result<Vec<u8>> {
        if size > MAX_EXTENSION_SIZE {
            return Err(invalid_data("Oversized extension header"));
        }
        let padding = padded_size(size)? - size;
        let mut data = vec![0u8; size as usize];
        self.stream
            .read_exact(&mut data)
            .map_err(|_| invalid_data("Truncated tar archive"))?;
        self.discard(padding)?;
        Ok(data)
    }

    fn entry_type(header: &Header) -> io::Result<EntryType> {
        Ok(match header.entry_type() {
            TarEntryType::Regular | TarEntryType::Continuous => EntryType::Regular,
            TarEntryType::Directory => EntryType::Directory,
            TarEntryType::Symlink => EntryType::Symlink,
            TarEntryType::Link => EntryType::Hardlink,
            TarEntryType::Char => EntryType::CharacterDevice,
            TarEntryType::Block => EntryType::BlockDevice,
            TarEntryType::Fifo => EntryType::Fifo,
            other => {
                return Err(invalid_data(format!(
                    "Unsupported tar entry type {:?}",
                    other.as_byte() as char
                )))
            }
        })
    }
}

impl EntryReader for TarReader {
    fn next_entry(&mut self) -> io::Result<Option<EntryHeader>> {
        self.skip_data()?;

        let mut ext = Extensions::default();
        let mut gnu_longname: Option<Vec<u8>> = None;
        let mut gnu_longlink: Option<Vec<u8>> = None;

        loop {
            if self.finished {
                return Ok(None);
            }
            let Some(block) = self.read_block()? else {
                self.finished = true;
                return Ok(None);
            };
            if block == [0u8; TAR_BLOCK_SIZE] {
                self.finished = true;
                return Ok(None);
            }

            let header = Header::from_byte_slice(&block);
            if !checksum_ok(header) {
                return Err(invalid_data("Damaged tar archive"));
            }
            let size = header.entry_size()?;

            match header.entry_type() {
                TarEntryType::GNULongName => {
                    gnu_longname = Some(trim_nul(self.read_extension(size)?));
                    continue;
                }
                TarEntryType::GNULongLink => {
                    gnu_longlink = Some(trim_nul(self.read_extension(size)?));
                    continue;
                }
                TarEntryType::XHeader => {
                    let data = self.read_extension(size)?;
                    ext.merge_pax(&data)?;
                    continue;
                }
                TarEntryType::XGlobalHeader => {
                    // global records are not carried over to later entries
                    self.read_extension(size)?;
                    continue;
                }
                _ => {}
            }

            let entry_type = Self::entry_type(header)?;
            let path = ext
                .path
                .take()
                .or(gnu_longname.take())
                .unwrap_or_else(|| header.path_bytes().into_owned());
            let link_target = ext
                .link
                .take()
                .or(gnu_longlink.take())
                .or_else(|| header.link_name_bytes().map(|name| name.into_owned()))
                .filter(|_| matches!(entry_type, EntryType::Symlink | EntryType::Hardlink));
            let device = match entry_type {
                EntryType::CharacterDevice | EntryType::BlockDevice => {
                    match (header.device_major()?, header.device_minor()?) {
                        (Some(major), Some(minor)) => Some((major, minor)),
                        _ => return Err(invalid_data("Device entry without device numbers")),
                    }
                }
                _ => None,
            };

            let size = ext.size.unwrap_or(size);
            let entry = EntryHeader {
                path: path_from_bytes(&path),
                entry_type,
                mode: header.mode()? & 0o7777,
                size,
                uid: match ext.uid {
                    Some(uid) => uid,
                    None => numeric_field(&header.as_old().uid, || header.uid())?,
                },
                gid: match ext.gid {
                    Some(gid) => gid,
                    None => numeric_field(&header.as_old().gid, || header.gid())?,
                },
                mtime: match ext.mtime {
                    Some(mtime) => mtime,
                    None => numeric_field(&header.as_old().mtime, || header.mtime())? as i64,
                },
                link_target: link_target.map(|target| path_from_bytes(&target)),
                device,
            };

            self.padding = padded_size(size)? - size;
            self.remaining = size;
            self.offset = 0;

            trace!("entry {:?} {:?} {} bytes", entry.path, entry.entry_type, entry.size);
            return Ok(Some(entry));
        }
    }

    fn read_data_block(&mut self) -> io::Result<Option<(u64, &[u8])>> {
        if self.remaining == 0 {
            let padding = std::mem::take(&mut self.padding);
            self.discard(padding)?;
            return Ok(None);
        }

        let want = self.remaining.min(self.buffer.len() as u64) as usize;
        let n = loop {
            match self.stream.read(&mut self.buffer[..want]) {
                Ok(0) => return Err(invalid_data("Truncated tar archive")),
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        let offset = self.offset;
        self.remaining -= n as u64;
        self.offset += n as u64;
        Ok(Some((offset, &self.buffer[..n])))
    }

    fn skip_data(&mut self) -> io::Result<()> {
        let count = std::mem::take(&mut self.remaining) + std::mem::take(&mut self.padding);
        self.discard(count)
    }
}
