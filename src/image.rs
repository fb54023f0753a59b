//! Manifest + rootfs images.
//!
//! An [`Image`] is bound to the path of an archive and nothing else: it does not check that the
//! path exists and caches none of the archive's contents.  Each operation opens a fresh read
//! session, streams the archive from the start and releases the session on every exit path.
//!
//! A valid image holds exactly three kinds of entries, after stripping a leading `./`:
//!
//!  - the `manifest` regular file, exactly once
//!  - the `rootfs` directory
//!  - descendants of `rootfs`
//!
//! Known gaps: validation doesn't require any rootfs descendant to exist, and neither validation
//! nor extraction rejects `..` components inside rootfs paths.

use std::{
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use log::{debug, trace};

use crate::{
    archive::{ArchiveEngine, EntryHeader, EntryReader, EntryType, EntryWriter, ExtractOptions},
    error::{ImageError, Result},
    tarball::TarEngine,
    util::join_under,
    MANIFEST_FILENAME, READ_BLOCK_SIZE, ROOTFS_FILENAME,
};

/// Rootfs-relative paths in archive order, duplicates included.
pub type FileList = Vec<PathBuf>;

/// The verdict of [`Image::validate_structure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid(String),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }

    /// The reason an image was rejected, if it was.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Validity::Valid => None,
            Validity::Invalid(reason) => Some(reason.as_str()),
        }
    }
}

/// Strips a single leading `./` from an entry path.
///
/// A path consisting only of `./` (or shorter) is returned unchanged.
pub fn normalize(path: &[u8]) -> &[u8] {
    match path.strip_prefix(b"./") {
        Some(rest) if !rest.is_empty() => rest,
        _ => path,
    }
}

fn entry_path(header: &EntryHeader) -> &[u8] {
    normalize(header.path.as_os_str().as_bytes())
}

/// Returns the part of `path` after the `rootfs` prefix, if `path` is strictly longer than the
/// prefix.
///
/// This is a literal prefix match: `rootfsx` counts as being under rootfs, with a remainder of
/// `x`.
fn strip_rootfs(path: &[u8]) -> Option<&[u8]> {
    path.strip_prefix(ROOTFS_FILENAME.as_bytes())
        .filter(|rest| !rest.is_empty())
}

/// A manifest + rootfs image archive.
#[derive(Debug, Clone)]
pub struct Image<E: ArchiveEngine = TarEngine> {
    path: PathBuf,
    engine: E,
}

impl Image<TarEngine> {
    /// Binds an image to the archive at `path`, read with the tar engine.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_engine(path, TarEngine)
    }
}

impl<E: ArchiveEngine> Image<E> {
    /// Binds an image to the archive at `path`, read with `engine`.
    pub fn with_engine(path: impl Into<PathBuf>, engine: E) -> Self {
        Self {
            path: path.into(),
            engine,
        }
    }

    /// The archive this image is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<E::Reader> {
        debug!("opening {:?}", self.path);
        self.engine
            .open_read(&self.path, READ_BLOCK_SIZE)
            .map_err(ImageError::open)
    }

    /// Lists the contents of the rootfs.
    ///
    /// Every entry whose normalized path is strictly longer than `rootfs` and starts with it
    /// contributes its path with the `rootfs` prefix removed, so `rootfs/a` is listed as `/a`.
    /// An image without rootfs entries yields an empty list.
    pub fn list_rootfs_files(&self) -> Result<FileList> {
        let mut reader = self.open()?;
        let mut files = FileList::new();

        while let Some(header) = reader.next_entry().map_err(ImageError::read)? {
            if let Some(rest) = strip_rootfs(entry_path(&header)) {
                files.push(PathBuf::from(OsStr::from_bytes(rest)));
            }
            reader.skip_data().map_err(ImageError::read)?;
        }

        Ok(files)
    }

    /// Checks that the archive has the manifest + rootfs layout.
    ///
    /// This only looks at entry headers.  It stops at the first offending entry; a failure to
    /// open or read the archive is also reported as `Invalid`.
    pub fn validate_structure(&self) -> Validity {
        match self.check_structure() {
            Ok(()) => Validity::Valid,
            Err(err) => {
                debug!("{:?} is not a valid image: {err}", self.path);
                Validity::Invalid(err.message().to_string())
            }
        }
    }

    fn check_structure(&self) -> Result<()> {
        let mut reader = self.open()?;
        let mut manifest_count = 0;

        while let Some(header) = reader.next_entry().map_err(ImageError::read)? {
            let path = entry_path(&header);

            if path == MANIFEST_FILENAME.as_bytes() {
                manifest_count += 1;
                if manifest_count > 1 {
                    return Err(ImageError::Structure(
                        "multiple manifest entries present".to_string(),
                    ));
                }
                if !header.is_regular() {
                    return Err(ImageError::Structure(
                        "manifest is not a regular file".to_string(),
                    ));
                }
            } else if path == ROOTFS_FILENAME.as_bytes() {
                if !header.is_directory() {
                    return Err(ImageError::Structure(
                        "rootfs is not a directory".to_string(),
                    ));
                }
            } else if strip_rootfs(path).is_none() {
                return Err(ImageError::Structure(format!(
                    "{} is not under rootfs",
                    OsStr::from_bytes(path).to_string_lossy()
                )));
            }

            trace!("{:?} ok", header.path);
            reader.skip_data().map_err(ImageError::read)?;
        }

        Ok(())
    }

    /// Returns the raw contents of the first `manifest` entry.
    ///
    /// Later entries named `manifest` are never looked at; use
    /// [`validate_structure()`](Self::validate_structure) to reject duplicates.
    pub fn read_manifest(&self) -> Result<Vec<u8>> {
        let mut reader = self.open()?;

        while let Some(header) = reader.next_entry().map_err(ImageError::read)? {
            if entry_path(&header) == MANIFEST_FILENAME.as_bytes() {
                if !header.is_regular() {
                    return Err(ImageError::Structure(
                        "manifest is not a regular file".to_string(),
                    ));
                }

                let mut manifest = Vec::new();
                while let Some((_, block)) = reader.read_data_block().map_err(ImageError::read)? {
                    manifest.extend_from_slice(block);
                }
                debug!("read {} byte manifest", manifest.len());
                return Ok(manifest);
            }
            reader.skip_data().map_err(ImageError::read)?;
        }

        Err(ImageError::Structure(
            "Archive did not contain a manifest".to_string(),
        ))
    }

    /// Extracts the rootfs below `target_dir`, with the default metadata options.
    ///
    /// See [`extract_rootfs_with()`](Self::extract_rootfs_with).
    pub fn extract_rootfs(&self, target_dir: impl AsRef<Path>) -> Result<()> {
        self.extract_rootfs_with(target_dir, ExtractOptions::default())
    }

    /// Extracts the rootfs below `target_dir`, stripping the `rootfs` prefix from every path.
    ///
    /// The manifest entry is never written.  Every other entry is re-homed by cutting the length
    /// of `rootfs` off its literal path, without normalizing first, so an archive whose entries
    /// start with `./rootfs` is not re-homed correctly.  Hard-link targets are re-homed the same
    /// way.
    ///
    /// Extraction stops at the first error and leaves whatever was written so far in place.
    pub fn extract_rootfs_with(
        &self,
        target_dir: impl AsRef<Path>,
        options: ExtractOptions,
    ) -> Result<()> {
        let target_dir = target_dir.as_ref();
        let mut writer = self
            .engine
            .open_disk_writer(options)
            .map_err(ImageError::write)?;
        let mut reader = self.open()?;

        while let Some(mut header) = reader.next_entry().map_err(ImageError::read)? {
            let path = header.path.as_os_str().as_bytes();

            if path == MANIFEST_FILENAME.as_bytes() {
                reader.skip_data().map_err(ImageError::read)?;
                continue;
            }

            header.path = rehome(target_dir, path)?;
            if header.entry_type == EntryType::Hardlink {
                if let Some(target) = header.link_target.take() {
                    header.link_target = Some(rehome(target_dir, target.as_os_str().as_bytes())?);
                }
            }
            trace!("extracting {:?}", header.path);

            writer.write_header(&header).map_err(ImageError::write)?;

            if header.size > 0 {
                while let Some((offset, block)) =
                    reader.read_data_block().map_err(ImageError::read)?
                {
                    writer
                        .write_data_block(offset, block)
                        .map_err(ImageError::write)?;
                }
            }

            writer.finish_entry().map_err(ImageError::write)?;
        }

        writer.close().map_err(ImageError::write)?;
        debug!("extracted {:?} to {target_dir:?}", self.path);
        Ok(())
    }
}

/// Moves an archive path below `target_dir` by cutting off as many bytes as `rootfs` has.
fn rehome(target_dir: &Path, path: &[u8]) -> Result<PathBuf> {
    match path.get(ROOTFS_FILENAME.len()..) {
        Some(rest) => Ok(join_under(target_dir, rest)),
        None => Err(ImageError::Write(format!(
            "{} is shorter than the rootfs prefix",
            OsStr::from_bytes(path).to_string_lossy()
        ))),
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, collections::VecDeque, io, rc::Rc};

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(b"./manifest"), b"manifest");
        assert_eq!(normalize(b"manifest"), b"manifest");
        assert_eq!(normalize(b"./"), b"./");
        assert_eq!(normalize(b"."), b".");
        assert_eq!(normalize(b"./a"), b"a");
        // only one prefix is stripped
        assert_eq!(normalize(b"././rootfs"), b"./rootfs");
    }

    #[test]
    fn test_strip_rootfs() {
        assert_eq!(strip_rootfs(b"rootfs/a"), Some(&b"/a"[..]));
        assert_eq!(strip_rootfs(b"rootfs/"), Some(&b"/"[..]));
        assert_eq!(strip_rootfs(b"rootfsx"), Some(&b"x"[..]));
        assert_eq!(strip_rootfs(b"rootfs"), None);
        assert_eq!(strip_rootfs(b"root"), None);
        assert_eq!(strip_rootfs(b"etc/rootfs"), None);
    }

    #[test]
    fn test_rehome() {
        let target = Path::new("/srv/img");
        assert_eq!(
            rehome(target, b"rootfs/bin/sh").unwrap(),
            PathBuf::from("/srv/img/bin/sh")
        );
        assert_eq!(rehome(target, b"rootfs").unwrap(), PathBuf::from("/srv/img"));
        // not normalized: "./rootfs/x" loses "./root" instead of "rootfs"
        assert_eq!(
            rehome(target, b"./rootfs/x").unwrap(),
            PathBuf::from("/srv/img/fs/x")
        );
        assert!(matches!(rehome(target, b"./a"), Err(ImageError::Write(_))));
    }

    /// An engine that replays scripted entries and records what gets written.
    #[derive(Clone, Default)]
    struct ScriptedEngine {
        entries: Vec<(EntryHeader, Vec<u8>)>,
        open_error: Option<String>,
        close_error: Option<String>,
        log: Rc<RefCell<Vec<String>>>,
    }

    struct ScriptedReader {
        entries: VecDeque<(EntryHeader, Vec<u8>)>,
        blocks: VecDeque<Vec<u8>>,
        block: Vec<u8>,
        offset: u64,
        log: Rc<RefCell<Vec<String>>>,
    }

    struct ScriptedWriter {
        close_error: Option<String>,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Drop for ScriptedReader {
        fn drop(&mut self) {
            self.log.borrow_mut().push("release reader".into());
        }
    }

    impl EntryReader for ScriptedReader {
        fn next_entry(&mut self) -> io::Result<Option<EntryHeader>> {
            let Some((header, mut data)) = self.entries.pop_front() else {
                return Ok(None);
            };
            // hand the data out in two short blocks
            let tail = data.split_off(data.len() / 2);
            self.blocks = [data, tail].into_iter().filter(|b| !b.is_empty()).collect();
            self.offset = 0;
            Ok(Some(header))
        }

        fn read_data_block(&mut self) -> io::Result<Option<(u64, &[u8])>> {
            let Some(block) = self.blocks.pop_front() else {
                return Ok(None);
            };
            self.block = block;
            let offset = self.offset;
            self.offset += self.block.len() as u64;
            Ok(Some((offset, &self.block[..])))
        }

        fn skip_data(&mut self) -> io::Result<()> {
            self.blocks.clear();
            Ok(())
        }
    }

    impl EntryWriter for ScriptedWriter {
        fn write_header(&mut self, header: &EntryHeader) -> io::Result<()> {
            let link = match &header.link_target {
                Some(target) => format!(" -> {}", target.display()),
                None => String::new(),
            };
            self.log
                .borrow_mut()
                .push(format!("header {}{link}", header.path.display()));
            Ok(())
        }

        fn write_data_block(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
            self.log
                .borrow_mut()
                .push(format!("data {offset} {}", data.len()));
            Ok(())
        }

        fn finish_entry(&mut self) -> io::Result<()> {
            self.log.borrow_mut().push("finish".into());
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.log.borrow_mut().push("close".into());
            match self.close_error.take() {
                Some(msg) => Err(io::Error::other(msg)),
                None => Ok(()),
            }
        }
    }

    impl Drop for ScriptedWriter {
        fn drop(&mut self) {
            self.log.borrow_mut().push("release writer".into());
        }
    }

    impl ArchiveEngine for ScriptedEngine {
        type Reader = ScriptedReader;
        type Writer = ScriptedWriter;

        fn open_read(&self, _path: &Path, block_size: usize) -> io::Result<ScriptedReader> {
            assert_eq!(block_size, READ_BLOCK_SIZE);
            if let Some(msg) = &self.open_error {
                return Err(io::Error::other(msg.clone()));
            }
            Ok(ScriptedReader {
                entries: self.entries.iter().cloned().collect(),
                blocks: VecDeque::new(),
                block: vec![],
                offset: 0,
                log: self.log.clone(),
            })
        }

        fn open_disk_writer(&self, _options: ExtractOptions) -> io::Result<ScriptedWriter> {
            Ok(ScriptedWriter {
                close_error: self.close_error.clone(),
                log: self.log.clone(),
            })
        }
    }

    fn entry(path: &str, entry_type: EntryType) -> EntryHeader {
        EntryHeader {
            path: PathBuf::from(path),
            entry_type,
            mode: 0o644,
            size: 0,
            uid: 0,
            gid: 0,
            mtime: 0,
            link_target: None,
            device: None,
        }
    }

    fn engine(entries: &[(&str, EntryType)]) -> ScriptedEngine {
        ScriptedEngine {
            entries: entries
                .iter()
                .map(|(path, entry_type)| (entry(path, *entry_type), vec![]))
                .collect(),
            ..Default::default()
        }
    }

    fn image(engine: ScriptedEngine) -> Image<ScriptedEngine> {
        Image::with_engine("scripted.aci", engine)
    }

    #[test]
    fn test_validate_mixed_prefixes() {
        let engine = engine(&[
            ("./manifest", EntryType::Regular),
            ("rootfs", EntryType::Directory),
            ("./rootfs/etc", EntryType::Directory),
            ("rootfs/etc/hosts", EntryType::Regular),
        ]);
        assert_eq!(image(engine).validate_structure(), Validity::Valid);
    }

    #[test]
    fn test_validate_short_circuits() {
        let engine = engine(&[
            ("manifest", EntryType::Regular),
            ("outside", EntryType::Regular),
            ("manifest", EntryType::Regular),
        ]);
        assert_eq!(
            image(engine).validate_structure(),
            Validity::Invalid("outside is not under rootfs".into())
        );
    }

    #[test]
    fn test_validate_manifest_type() {
        let engine = engine(&[("manifest", EntryType::Symlink)]);
        assert_eq!(
            image(engine).validate_structure().reason(),
            Some("manifest is not a regular file")
        );
    }

    #[test]
    fn test_validate_open_failure_is_invalid() {
        let engine = ScriptedEngine {
            open_error: Some("no such archive".into()),
            ..Default::default()
        };
        assert_eq!(
            image(engine).validate_structure(),
            Validity::Invalid("no such archive".into())
        );
    }

    #[test]
    fn test_sessions_released() {
        let engine = engine(&[("manifest", EntryType::Directory)]);
        let log = engine.log.clone();
        let image = image(engine);

        assert!(image.read_manifest().is_err());
        assert_eq!(log.borrow().last().unwrap(), "release reader");
        assert!(!image.validate_structure().is_valid());
        assert_eq!(log.borrow().last().unwrap(), "release reader");
        assert!(image.list_rootfs_files().unwrap().is_empty());
        assert_eq!(log.borrow().last().unwrap(), "release reader");
    }

    #[test]
    fn test_extract_skips_manifest_and_closes() {
        let engine = engine(&[
            ("manifest", EntryType::Regular),
            ("rootfs", EntryType::Directory),
            ("rootfs/etc", EntryType::Directory),
        ]);
        let log = engine.log.clone();

        image(engine).extract_rootfs("/target").unwrap();

        assert_eq!(
            *log.borrow(),
            vec![
                "header /target",
                "finish",
                "header /target/etc",
                "finish",
                "close",
                "release reader",
                "release writer",
            ]
        );
    }

    #[test]
    fn test_extract_reports_close_error() {
        let mut engine = engine(&[("rootfs", EntryType::Directory)]);
        engine.close_error = Some("flush failed".into());
        let log = engine.log.clone();

        assert_eq!(
            image(engine).extract_rootfs("/target"),
            Err(ImageError::Write("flush failed".into()))
        );
        assert!(log.borrow().iter().any(|l| l == "release writer"));
    }

    #[test]
    fn test_extract_rehomes_hardlinks() {
        let mut link = entry("rootfs/bin/sh", EntryType::Hardlink);
        link.link_target = Some(PathBuf::from("rootfs/bin/busybox"));
        let engine = ScriptedEngine {
            entries: vec![(link, vec![])],
            ..Default::default()
        };
        let log = engine.log.clone();

        image(engine).extract_rootfs("/t").unwrap();
        assert_eq!(log.borrow()[0], "header /t/bin/sh -> /t/bin/busybox");
    }

    #[test]
    fn test_extract_copies_data_blocks() {
        let mut file = entry("rootfs/etc/motd", EntryType::Regular);
        file.size = 5;
        let engine = ScriptedEngine {
            entries: vec![(file, b"hello".to_vec())],
            ..Default::default()
        };
        let log = engine.log.clone();

        image(engine).extract_rootfs("/t").unwrap();
        assert_eq!(
            log.borrow()[..4].to_vec(),
            vec!["header /t/etc/motd", "data 0 2", "data 2 3", "finish"]
        );
    }

    #[test]
    fn test_read_manifest_concatenates_blocks() {
        let engine = ScriptedEngine {
            entries: vec![
                (entry("rootfs", EntryType::Directory), vec![]),
                (entry("./manifest", EntryType::Regular), b"schema:v1".to_vec()),
                (entry("manifest", EntryType::Regular), b"ignored".to_vec()),
            ],
            ..Default::default()
        };
        assert_eq!(image(engine).read_manifest().unwrap(), b"schema:v1");
    }
}
