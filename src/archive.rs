//! The archive engine contract.
//!
//! Image operations only ever drive an archive through the narrow interface defined here: iterate
//! entry headers, read or skip entry data in blocks, and re-emit entries to a disk-backed writer.
//! The container format, the compression filter and the on-disk writer semantics all live behind
//! these traits.

use std::{
    io,
    path::{Path, PathBuf},
};

/// The type of node an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    Directory,
    Symlink,
    /// A hard link to an earlier entry, named by `EntryHeader::link_target`.
    Hardlink,
    CharacterDevice,
    BlockDevice,
    Fifo,
}

/// Header metadata of a single archive entry.
///
/// The writer consumes the header as-is, so rewriting `path` (or `link_target` for hard links)
/// before calling [`EntryWriter::write_header`] is how an entry gets re-homed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub path: PathBuf,
    pub entry_type: EntryType,
    /// Permission bits, including setuid/setgid/sticky.
    pub mode: u32,
    /// Declared size of the entry data in bytes.
    pub size: u64,
    pub uid: u64,
    pub gid: u64,
    /// Modification time in seconds since the epoch.
    pub mtime: i64,
    /// Symlink target or, for hard links, the path of the linked entry.
    pub link_target: Option<PathBuf>,
    /// `(major, minor)` for device nodes.
    pub device: Option<(u32, u32)>,
}

impl EntryHeader {
    pub fn is_regular(&self) -> bool {
        self.entry_type == EntryType::Regular
    }

    pub fn is_directory(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}

/// Which pieces of entry metadata the disk writer restores.
///
/// The default restores timestamps and permissions but leaves ownership to the extracting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Restore modification times.
    pub time: bool,
    /// Restore the exact permission bits instead of masking them with the umask.
    pub perm: bool,
    /// Restore the owning uid/gid.
    pub owner: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            time: true,
            perm: true,
            owner: false,
        }
    }
}

/// A read session over one archive.
///
/// Data reads apply to the entry most recently returned by `next_entry()`.  Any data of that
/// entry which was not read is skipped by the following `next_entry()` call.
pub trait EntryReader {
    /// Advances to the next entry, returning `None` at the end of the archive.
    fn next_entry(&mut self) -> io::Result<Option<EntryHeader>>;

    /// Returns the next block of data of the current entry along with its offset inside the
    /// entry, or `None` once the entry's data is exhausted.  Blocks may be short.
    fn read_data_block(&mut self) -> io::Result<Option<(u64, &[u8])>>;

    /// Discards the remaining data of the current entry.
    fn skip_data(&mut self) -> io::Result<()>;
}

/// A write session that materializes entries on disk.
///
/// A writer must release its resources when dropped even if `close()` was never called, but any
/// error arising at that point is lost.  Calling `close()` is the only way to observe them.
pub trait EntryWriter {
    /// Creates the node described by `header`.
    fn write_header(&mut self, header: &EntryHeader) -> io::Result<()>;

    /// Writes `data` at `offset` inside the current entry.
    fn write_data_block(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Completes the current entry, applying its metadata.
    fn finish_entry(&mut self) -> io::Result<()>;

    /// Flushes all deferred work.
    fn close(&mut self) -> io::Result<()>;
}

/// A factory for read and write sessions.
pub trait ArchiveEngine {
    type Reader: EntryReader;
    type Writer: EntryWriter;

    /// Opens `path` for reading, detecting the compression filter and archive format.
    fn open_read(&self, path: &Path, block_size: usize) -> io::Result<Self::Reader>;

    /// Creates a writer that puts entries on disk at the paths named in their headers.
    fn open_disk_writer(&self, options: ExtractOptions) -> io::Result<Self::Writer>;
}
