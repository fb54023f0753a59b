//! Materializing archive entries on disk.
//!
//! `DiskWriter` creates each node at the path named in the entry header, creating missing parent
//! directories on the way and replacing any existing non-directory node.  Directory permissions
//! and timestamps are applied when the writer is closed, deepest paths first, so populating a
//! directory neither disturbs its mtime nor trips over a read-only mode.

use std::{
    fs::{self, File},
    io,
    os::unix::fs::{lchown, FileExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use log::{debug, trace};
use rustix::{
    fs::{
        linkat, makedev, mkdirat, mknodat, openat, statat, symlinkat, unlinkat, utimensat,
        AtFlags, FileType, Mode, OFlags, Timespec, Timestamps, CWD,
    },
    io::Errno,
};

use crate::archive::{EntryHeader, EntryType, EntryWriter, ExtractOptions};

fn with_path<'a>(path: &'a Path, what: &str) -> impl FnOnce(io::Error) -> io::Error + 'a {
    let what = what.to_string();
    move |e| io::Error::new(e.kind(), format!("{what} '{}': {e}", path.display()))
}

fn errno_with_path<'a>(path: &'a Path, what: &str) -> impl FnOnce(Errno) -> io::Error + 'a {
    let inner = with_path(path, what);
    move |e| inner(e.into())
}

/// The process umask.  Reading it means setting it, so it is read once per process.
fn process_umask() -> u32 {
    static UMASK: OnceLock<u32> = OnceLock::new();
    *UMASK.get_or_init(|| {
        let umask = rustix::process::umask(Mode::empty());
        rustix::process::umask(umask);
        umask.bits() as u32
    })
}

#[derive(Debug)]
struct DirFixup {
    path: PathBuf,
    mode: u32,
    mtime: i64,
}

#[derive(Debug)]
struct Current {
    header: EntryHeader,
    file: Option<File>,
}

/// A write session that puts entries on disk.
#[derive(Debug)]
pub struct DiskWriter {
    options: ExtractOptions,
    umask: u32,
    current: Option<Current>,
    fixups: Vec<DirFixup>,
    closed: bool,
}

impl DiskWriter {
    pub fn new(options: ExtractOptions) -> Self {
        Self {
            options,
            umask: process_umask(),
            current: None,
            fixups: vec![],
            closed: false,
        }
    }

    fn final_mode(&self, mode: u32) -> u32 {
        if self.options.perm {
            mode & 0o7777
        } else {
            mode & 0o777 & !self.umask
        }
    }

    /// Removes whatever non-directory node exists at `path`.  Returns true if `path` is an
    /// existing directory, which is left alone.
    fn clear_path(path: &Path) -> io::Result<bool> {
        match statat(CWD, path, AtFlags::SYMLINK_NOFOLLOW) {
            Ok(stat) if FileType::from_raw_mode(stat.st_mode) == FileType::Directory => Ok(true),
            Ok(_) => {
                unlinkat(CWD, path, AtFlags::empty())
                    .map_err(errno_with_path(path, "Can't remove"))?;
                Ok(false)
            }
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(errno_with_path(path, "Can't stat")(e)),
        }
    }

    fn create_node(&mut self, header: &EntryHeader) -> io::Result<Option<File>> {
        let path = header.path.as_path();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(with_path(parent, "Can't create directory"))?;
        }

        let is_dir = Self::clear_path(path)?;
        if is_dir && header.entry_type != EntryType::Directory {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Can't replace directory '{}'", path.display()),
            ));
        }

        let link_target = || {
            header.link_target.as_deref().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Link entry '{}' has no target", path.display()),
                )
            })
        };
        let create = errno_with_path(path, "Can't create");
        let placeholder = Mode::from_raw_mode(0o600);

        match header.entry_type {
            EntryType::Directory => {
                if !is_dir {
                    // writable until the fixup pass sets the real mode
                    match mkdirat(CWD, path, Mode::from_raw_mode(0o700)) {
                        Ok(()) | Err(Errno::EXIST) => {}
                        Err(e) => return Err(create(e)),
                    }
                }
                self.fixups.push(DirFixup {
                    path: path.to_path_buf(),
                    mode: self.final_mode(header.mode),
                    mtime: header.mtime,
                });
                Ok(None)
            }
            EntryType::Regular => {
                let fd = openat(
                    CWD,
                    path,
                    OFlags::CREATE | OFlags::EXCL | OFlags::WRONLY | OFlags::CLOEXEC,
                    placeholder,
                )
                .map_err(create)?;
                Ok(Some(File::from(fd)))
            }
            EntryType::Symlink => {
                symlinkat(link_target()?, CWD, path).map_err(create)?;
                Ok(None)
            }
            EntryType::Hardlink => {
                linkat(CWD, link_target()?, CWD, path, AtFlags::empty()).map_err(create)?;
                if header.size > 0 {
                    let fd = openat(CWD, path, OFlags::WRONLY | OFlags::CLOEXEC, placeholder)
                        .map_err(errno_with_path(path, "Can't open"))?;
                    Ok(Some(File::from(fd)))
                } else {
                    Ok(None)
                }
            }
            EntryType::Fifo => {
                mknodat(CWD, path, FileType::Fifo, placeholder, 0).map_err(create)?;
                Ok(None)
            }
            EntryType::CharacterDevice | EntryType::BlockDevice => {
                let file_type = match header.entry_type {
                    EntryType::CharacterDevice => FileType::CharacterDevice,
                    _ => FileType::BlockDevice,
                };
                let (major, minor) = header.device.ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Device entry '{}' has no device numbers", path.display()),
                    )
                })?;
                mknodat(CWD, path, file_type, placeholder, makedev(major, minor))
                    .map_err(create)?;
                Ok(None)
            }
        }
    }

    fn set_times(path: &Path, mtime: i64) -> io::Result<()> {
        let time = Timespec {
            tv_sec: mtime,
            tv_nsec: 0,
        };
        let times = Timestamps {
            last_access: time,
            last_modification: time,
        };
        utimensat(CWD, path, &times, AtFlags::SYMLINK_NOFOLLOW)
            .map_err(errno_with_path(path, "Can't restore time"))
    }

    fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(with_path(path, "Can't restore permissions"))
    }

    fn apply_fixups(&mut self) -> io::Result<()> {
        let mut fixups = std::mem::take(&mut self.fixups);
        // children before their parents
        fixups.sort_by(|a, b| b.path.cmp(&a.path));

        let mut result = Ok(());
        for fixup in fixups {
            trace!("directory fixup {:?} mode {:o}", fixup.path, fixup.mode);
            let mut outcome = Self::set_mode(&fixup.path, fixup.mode);
            if self.options.time {
                outcome = outcome.and(Self::set_times(&fixup.path, fixup.mtime));
            }
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            Err(io::Error::other("Write session is already closed"))
        } else {
            Ok(())
        }
    }
}

impl EntryWriter for DiskWriter {
    fn write_header(&mut self, header: &EntryHeader) -> io::Result<()> {
        self.ensure_open()?;
        self.current = None;

        trace!("creating {:?} ({:?})", header.path, header.entry_type);
        let file = self.create_node(header)?;
        self.current = Some(Current {
            header: header.clone(),
            file,
        });
        Ok(())
    }

    fn write_data_block(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        match &self.current {
            Some(Current {
                header,
                file: Some(file),
            }) => file
                .write_all_at(data, offset)
                .map_err(with_path(&header.path, "Write failed for")),
            Some(Current { header, file: None }) => {
                trace!("discarding {} data bytes for {:?}", data.len(), header.path);
                Ok(())
            }
            None => Err(io::Error::other("Data written without an entry header")),
        }
    }

    fn finish_entry(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        let Some(Current { header, file }) = self.current.take() else {
            return Ok(());
        };
        let path = header.path.as_path();

        if let Some(file) = file {
            // a sparse tail is never written as data
            let len = file
                .metadata()
                .map_err(with_path(path, "Can't stat"))?
                .len();
            if len < header.size {
                file.set_len(header.size)
                    .map_err(with_path(path, "Can't extend"))?;
            }
        }

        if self.options.owner {
            let (uid, gid) = (u32::try_from(header.uid), u32::try_from(header.gid));
            match (uid, gid) {
                (Ok(uid), Ok(gid)) => lchown(path, Some(uid), Some(gid))
                    .map_err(with_path(path, "Can't restore owner"))?,
                _ => debug!("owner of {path:?} out of range, not restored"),
            }
        }

        match header.entry_type {
            // deferred to close()
            EntryType::Directory => {}
            // symlink permissions are meaningless on Linux
            EntryType::Symlink => {
                if self.options.time {
                    Self::set_times(path, header.mtime)?;
                }
            }
            _ => {
                Self::set_mode(path, self.final_mode(header.mode))?;
                if self.options.time {
                    Self::set_times(path, header.mtime)?;
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.current = None;
        self.apply_fixups()
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("error closing disk writer: {e}");
        }
    }
}
