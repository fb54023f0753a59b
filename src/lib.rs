//! Inspection and extraction of manifest + rootfs container image archives.
//!
//! An image is an archive holding a single top-level `manifest` file and a `rootfs/` directory
//! tree.  [`image::Image`] offers four operations over such an archive: listing the rootfs
//! contents, validating the layout, reading the manifest bytes and extracting the rootfs to a
//! directory.  Every operation opens its own read session through an [`archive::ArchiveEngine`];
//! the default engine is the tar binding in [`tarball`].

pub mod archive;
pub mod disk;
pub mod error;
pub mod image;
pub mod tarball;
pub mod util;

pub use error::{ImageError, Result};
pub use image::{normalize, FileList, Image, Validity};

/// The reserved path of the manifest entry.
pub const MANIFEST_FILENAME: &str = "manifest";

/// The reserved top-level directory whose descendants are extracted.
pub const ROOTFS_FILENAME: &str = "rootfs";

/// Block size used when opening archives for reading.
pub const READ_BLOCK_SIZE: usize = 10240;
