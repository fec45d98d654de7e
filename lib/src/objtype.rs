//! Object kinds, storage modes, and loose object paths.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Checksum;

/// The kinds of immutable objects held in a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// A regular file body or symlink target plus owner/mode/xattrs.
    File,
    /// Owner/mode/xattrs for one directory.
    DirMeta,
    /// A directory listing: sorted files and subdirectories with their
    /// child content and metadata checksums.
    DirTree,
    /// Commit metadata binding a tree root to its history.
    Commit,
}

impl ObjectType {
    /// Whether this is a metadata object (everything except `File`).
    pub fn is_meta(self) -> bool {
        !matches!(self, ObjectType::File)
    }

    /// The object file name suffix, which for content objects depends on
    /// the repository storage mode.
    pub(crate) fn suffix(self, mode: StorageMode) -> &'static str {
        match self {
            ObjectType::File => match mode {
                StorageMode::Bare => "file",
                StorageMode::Archive => "filez",
            },
            ObjectType::DirMeta => "dirmeta",
            ObjectType::DirTree => "dirtree",
            ObjectType::Commit => "commit",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectType::File => "file",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::DirTree => "dirtree",
            ObjectType::Commit => "commit",
        };
        f.write_str(s)
    }
}

/// How content objects are stored on disk. Chosen at repository creation
/// and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Content objects are real files/symlinks with uid/gid/mode/xattrs
    /// applied; only root can losslessly read and write such a repository.
    Bare,
    /// Content objects are a serialized attribute header followed by a
    /// raw-deflate compressed body; usable under any uid.
    Archive,
}

/// The path of a loose object relative to `objects/`, e.g.
/// `ab/cdef....dirtree`.
pub(crate) fn loose_path(checksum: &Checksum, objtype: ObjectType, mode: StorageMode) -> String {
    let hex = checksum.to_hex();
    format!("{}/{}.{}", &hex[..2], &hex[2..], objtype.suffix(mode))
}
