use std::{
    ffi::OsStr,
    io::{Error, ErrorKind, Read, Result},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

/// Fills `buf` from `reader`, for reading whole 512-byte tar blocks.
///
/// Returns `Ok(false)` if the stream was already at its end, which is how a tar archive without
/// an end-of-archive marker ends.  Running out of data part way through `buf` is an
/// `UnexpectedEof` error.
pub(crate) fn read_exactish(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(Error::from(ErrorKind::UnexpectedEof)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(true)
}

/// Joins `rest` below `base`, treating `rest` as relative even when it starts with '/'.
///
/// Exactly one separator ends up between the two halves.  An empty `rest` (or one consisting only
/// of slashes) yields `base` itself.
pub fn join_under(base: &Path, rest: &[u8]) -> PathBuf {
    let start = rest.iter().position(|c| *c != b'/').unwrap_or(rest.len());
    let rest = &rest[start..];

    if rest.is_empty() {
        base.to_path_buf()
    } else {
        base.join(OsStr::from_bytes(rest))
    }
}
