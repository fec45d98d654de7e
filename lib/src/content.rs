//! The canonical stream form of content objects.
//!
//! A content object is hashed and transported as a single byte stream:
//! a big-endian `u64` length, the serialized attribute header of that
//! length, then the raw payload (regular files only). The ARCHIVE on-disk
//! form is the same header followed by a raw-deflate compressed payload.

use std::io::{Cursor, Read};

use cap_std_ext::cap_std::fs::MetadataExt;
use gvariant::aligned_bytes::TryAsAligned;
use gvariant::{Marker, Structure};

use crate::objgv::gv_filehdr;
use crate::variant_utils;
use crate::{Error, IoContext, Result};

/// Arbitrary limit on the attribute header to avoid RAM exhaustion from a
/// corrupt or malicious stream. Actual headers are far smaller.
const MAX_FILE_HEADER_SIZE: u64 = 10 * 1024 * 1024;

/// File metadata as queried from a source tree; the unit a commit filter
/// inspects and may rewrite.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Full `st_mode`, including the format bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Size in bytes (zero for non-regular files).
    pub size: u64,
    /// Symlink target, for symlinks.
    pub symlink_target: Option<String>,
    /// Device the file resides on, keying the hardlink cache.
    pub dev: u64,
    /// Inode number, keying the hardlink cache.
    pub ino: u64,
}

impl FileMeta {
    /// Build from filesystem metadata queried without following symlinks.
    pub fn from_metadata(
        meta: &cap_std_ext::cap_std::fs::Metadata,
        symlink_target: Option<String>,
    ) -> Self {
        Self {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: if meta.is_file() { meta.len() } else { 0 },
            symlink_target,
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    /// Whether this is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Whether this is a regular file.
    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    /// Whether this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// The attribute header of a content object: ownership, mode, xattrs, and
/// for symlinks the link target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Payload size in bytes (zero for symlinks).
    pub size: u64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Full `st_mode` including format bits.
    pub mode: u32,
    /// Symlink target; `None` for regular files.
    pub symlink_target: Option<String>,
    /// Extended attributes, sorted by name; names carry a trailing NUL.
    pub xattrs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl FileHeader {
    /// Build a header from source file metadata. Fails with
    /// [`Error::UnsupportedFileType`] for anything that is not a regular
    /// file or symlink.
    pub fn from_file_meta(meta: &FileMeta, xattrs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Self> {
        if !(meta.is_regular() || meta.is_symlink()) {
            return Err(Error::UnsupportedFileType(meta.mode & libc::S_IFMT));
        }
        Ok(Self {
            size: if meta.is_regular() { meta.size } else { 0 },
            uid: meta.uid,
            gid: meta.gid,
            mode: meta.mode,
            symlink_target: if meta.is_symlink() {
                Some(meta.symlink_target.clone().unwrap_or_default())
            } else {
                None
            },
            xattrs,
        })
    }

    /// Whether this header describes a symlink.
    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }

    /// The serialized header preceded by its big-endian length.
    pub(crate) fn to_bytes_with_size(&self) -> Vec<u8> {
        let target = self.symlink_target.as_deref().unwrap_or("");
        let v = variant_utils::file_header_variant(
            self.size,
            self.uid,
            self.gid,
            self.mode,
            target,
            &self.xattrs,
        );
        let mut buf = Vec::with_capacity(8 + v.len());
        buf.extend_from_slice(&(v.len() as u64).to_be_bytes());
        buf.extend_from_slice(&v);
        buf
    }
}

/// Assemble the canonical content-object stream for a file: the header with
/// its length prefix, then the payload. Returns the total stream length
/// together with the reader.
pub fn file_content_stream<R: Read>(
    header: &FileHeader,
    payload: R,
) -> (u64, std::io::Chain<Cursor<Vec<u8>>, R>) {
    let prefix = header.to_bytes_with_size();
    let length = prefix.len() as u64 + header.size;
    (length, Cursor::new(prefix).chain(payload))
}

/// Parse the attribute header off the front of a content-object stream,
/// leaving the reader positioned at the payload. Rejects file types other
/// than regular and symlink.
pub(crate) fn parse_file_stream(reader: &mut dyn Read) -> Result<FileHeader> {
    let mut lenbuf = [0u8; 8];
    reader
        .read_exact(&mut lenbuf)
        .io_context("Reading content header size")?;
    let len = u64::from_be_bytes(lenbuf);
    if len > MAX_FILE_HEADER_SIZE {
        return Err(Error::Io {
            context: "Parsing content header".into(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("header of size {len} exceeds {MAX_FILE_HEADER_SIZE} bytes"),
            ),
        });
    }
    // A fresh allocation is sufficiently aligned for the cast below.
    let mut hdrbuf = vec![0u8; len as usize];
    reader
        .read_exact(&mut hdrbuf)
        .io_context("Reading content header")?;
    let aligned = hdrbuf.try_as_aligned().map_err(|_| Error::Io {
        context: "Parsing content header".into(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "misaligned header"),
    })?;
    let hdr = gv_filehdr!().cast(aligned);
    let (size, uid, gid, mode, target, xattrs) = hdr.to_tuple();
    let mode = u32::from_be(*mode);
    let fmt = mode & libc::S_IFMT;
    if !(fmt == libc::S_IFREG || fmt == libc::S_IFLNK) {
        return Err(Error::UnsupportedFileType(fmt));
    }
    let xattrs = xattrs
        .into_iter()
        .map(|x| {
            let (name, value) = x.to_tuple();
            (name.to_vec(), value.to_vec())
        })
        .collect();
    Ok(FileHeader {
        size: u64::from_be(*size),
        uid: u32::from_be(*uid),
        gid: u32::from_be(*gid),
        mode,
        symlink_target: if fmt == libc::S_IFLNK {
            Some(target.to_str().to_string())
        } else {
            None
        },
        xattrs,
    })
}
