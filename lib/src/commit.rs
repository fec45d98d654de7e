//! Ingesting directory trees and assembling commits.

use std::fmt;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use rustix::io::Errno;

use crate::cancellable::check_cancelled;
use crate::content::{file_content_stream, FileHeader, FileMeta};
use crate::mtree::MutableTree;
use crate::repo::Repo;
use crate::variant_utils::{self, Xattr};
use crate::{Cancellable, Checksum, Error, IoContext, ObjectType, Result};

/// Flags controlling commit modifier behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitModifierFlags {
    /// Do not read or record extended attributes.
    pub skip_xattrs: bool,
}

/// The decision a commit filter returns for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFilterResult {
    /// Ingest this entry (with the possibly-modified metadata).
    Allow,
    /// Leave this entry (and, for directories, everything below it) out of
    /// the commit.
    Skip,
}

/// A commit filter callback. It receives the logical absolute path of the
/// entry being considered and a copy of its metadata; mutations to the
/// metadata are honored when the result is [`CommitFilterResult::Allow`].
pub type CommitFilter =
    Box<dyn Fn(&Repo, &Utf8Path, &mut FileMeta) -> CommitFilterResult + Send + Sync>;

/// Modifies or filters a tree as it is ingested. The filter closure owns
/// whatever state it needs.
pub struct CommitModifier {
    flags: CommitModifierFlags,
    filter: Option<CommitFilter>,
}

impl CommitModifier {
    /// Create a modifier from flags and an optional filter callback.
    pub fn new(flags: CommitModifierFlags, filter: Option<CommitFilter>) -> Self {
        Self { flags, filter }
    }

    /// The flags this modifier was created with.
    pub fn flags(&self) -> CommitModifierFlags {
        self.flags
    }
}

impl fmt::Debug for CommitModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitModifier")
            .field("flags", &self.flags)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

fn skip_xattrs(modifier: Option<&CommitModifier>) -> bool {
    modifier.is_some_and(|m| m.flags.skip_xattrs)
}

/// The slash-separated logical path used for filtering; the empty stack is
/// the tree root `/`.
fn filter_path(path: &[String]) -> Utf8PathBuf {
    if path.is_empty() {
        return Utf8PathBuf::from("/");
    }
    let mut buf = String::new();
    for element in path {
        buf.push('/');
        buf.push_str(element);
    }
    buf.into()
}

/// Query the extended attributes of a path, sorted by name; names carry
/// their trailing NUL. Unsupported filesystems yield an empty list.
fn query_xattrs_impl(path: &str, follow: bool) -> Result<Vec<Xattr>> {
    let list = |buf: &mut [u8]| {
        if follow {
            rustix::fs::listxattr(path, buf)
        } else {
            rustix::fs::llistxattr(path, buf)
        }
    };
    let mut names = vec![0u8; 1024];
    loop {
        match list(&mut names) {
            Ok(n) => {
                names.truncate(n);
                break;
            }
            Err(Errno::RANGE) => {
                let larger = names.len() * 2;
                names = vec![0u8; larger];
            }
            Err(Errno::NOTSUP) => return Ok(Vec::new()),
            Err(e) => return Err(e).io_context("Listing xattrs"),
        }
    }
    let mut out = Vec::new();
    for name in names.split(|b| *b == 0).filter(|s| !s.is_empty()) {
        let name_str = std::str::from_utf8(name).map_err(|_| Error::Io {
            context: "Listing xattrs".into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF-8 xattr name"),
        })?;
        let mut value = vec![0u8; 1024];
        loop {
            let get = |buf: &mut [u8]| {
                if follow {
                    rustix::fs::getxattr(path, name_str, buf)
                } else {
                    rustix::fs::lgetxattr(path, name_str, buf)
                }
            };
            match get(&mut value) {
                Ok(n) => {
                    value.truncate(n);
                    break;
                }
                Err(Errno::RANGE) => {
                    let larger = value.len() * 2;
                    value = vec![0u8; larger];
                }
                // Raced with removal; treat as absent.
                Err(Errno::NODATA) => {
                    value.clear();
                    break;
                }
                Err(e) => return Err(e).io_context(format!("Reading xattr {name_str}")),
            }
        }
        let mut key = name.to_vec();
        key.push(0);
        out.push((key, value));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Xattrs of the directory itself, via its directory handle.
fn query_xattrs_dir(dir: &Dir) -> Result<Vec<Xattr>> {
    // The /proc link is followed to reach the real directory.
    let path = format!("/proc/self/fd/{}", dir.as_raw_fd());
    query_xattrs_impl(&path, true)
}

/// Xattrs of one child of `dir`, without following symlinks.
fn query_xattrs_at(dir: &Dir, name: &str) -> Result<Vec<Xattr>> {
    let path = format!("/proc/self/fd/{}/{}", dir.as_raw_fd(), name);
    query_xattrs_impl(&path, false)
}

impl Repo {
    fn apply_commit_filter(
        &self,
        modifier: Option<&CommitModifier>,
        path: &[String],
        info: &FileMeta,
    ) -> (CommitFilterResult, FileMeta) {
        let mut modified = info.clone();
        let Some(filter) = modifier.and_then(|m| m.filter.as_ref()) else {
            return (CommitFilterResult::Allow, modified);
        };
        let path = filter_path(path);
        let result = filter(self, &path, &mut modified);
        (result, modified)
    }

    /// Build and store a DIR_META object for a directory's metadata and
    /// xattrs, returning its checksum.
    pub fn write_directory_meta(
        &self,
        meta: &FileMeta,
        xattrs: &[(Vec<u8>, Vec<u8>)],
        cancellable: Option<&Cancellable>,
    ) -> Result<Checksum> {
        check_cancelled(cancellable)?;
        let v = variant_utils::dirmeta_variant(meta.uid, meta.gid, meta.mode, xattrs);
        self.write_metadata(ObjectType::DirMeta, None, &v, cancellable)
    }

    /// Store objects for `dir` and all its children, overlaying the
    /// resulting hierarchy into `mtree`. Content already present (by
    /// checksum, or by inode via [`Repo::scan_hardlinks`]) is reused
    /// rather than rewritten.
    pub fn write_directory_to_mtree(
        &self,
        dir: &Dir,
        mtree: &mut MutableTree,
        modifier: Option<&CommitModifier>,
        cancellable: Option<&Cancellable>,
    ) -> Result<()> {
        let mut path = Vec::new();
        self.write_directory_to_mtree_internal(dir, mtree, modifier, &mut path, cancellable)
    }

    fn write_directory_to_mtree_internal(
        &self,
        dir: &Dir,
        mtree: &mut MutableTree,
        modifier: Option<&CommitModifier>,
        path: &mut Vec<String>,
        cancellable: Option<&Cancellable>,
    ) -> Result<()> {
        check_cancelled(cancellable)?;
        tracing::debug!("examining {}", filter_path(path));
        let meta = dir.dir_metadata().io_context("Querying directory")?;
        let info = FileMeta::from_metadata(&meta, None);
        let (result, modified) = self.apply_commit_filter(modifier, path, &info);
        if result == CommitFilterResult::Skip {
            return Ok(());
        }
        let xattrs = if skip_xattrs(modifier) {
            Vec::new()
        } else {
            query_xattrs_dir(dir)?
        };
        let csum = self.write_directory_meta(&modified, &xattrs, cancellable)?;
        mtree.set_metadata_checksum(csum);

        for entry in dir.entries().io_context("Reading directory")? {
            let entry = entry.io_context("Reading directory")?;
            let name = entry.file_name();
            let Some(name) = name.to_str().map(ToOwned::to_owned) else {
                return Err(Error::Io {
                    context: "Reading directory".into(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid non-UTF-8 filename {name:?}"),
                    ),
                });
            };
            path.push(name.clone());
            let r = self.ingest_child(dir, &name, mtree, modifier, path, cancellable);
            path.pop();
            r?;
        }
        Ok(())
    }

    fn ingest_child(
        &self,
        dir: &Dir,
        name: &str,
        mtree: &mut MutableTree,
        modifier: Option<&CommitModifier>,
        path: &mut Vec<String>,
        cancellable: Option<&Cancellable>,
    ) -> Result<()> {
        check_cancelled(cancellable)?;
        let meta = dir
            .symlink_metadata(name)
            .io_context(format!("Querying {name}"))?;
        let target = if meta.is_symlink() {
            let target = dir
                .read_link(name)
                .io_context(format!("Reading link {name}"))?;
            let target = target.into_os_string().into_string().map_err(|t| Error::Io {
                context: format!("Reading link {name}"),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid non-UTF-8 symlink target {t:?}"),
                ),
            })?;
            Some(target)
        } else {
            None
        };
        let info = FileMeta::from_metadata(&meta, target);
        let (result, modified) = self.apply_commit_filter(modifier, path, &info);
        if result == CommitFilterResult::Skip {
            tracing::trace!(name, "skipped by commit filter");
            return Ok(());
        }
        if modified.is_dir() {
            let child_dir = dir.open_dir(name).io_context(format!("Opening {name}"))?;
            let child_mtree = mtree.ensure_dir(name)?;
            self.write_directory_to_mtree_internal(
                &child_dir,
                child_mtree,
                modifier,
                path,
                cancellable,
            )?;
        } else if let Some(csum) = self.devino_lookup(modified.dev, modified.ino) {
            tracing::trace!(name, "reusing checksum from devino cache");
            mtree.replace_file(name, csum)?;
        } else {
            tracing::debug!("adding {}", filter_path(path));
            let xattrs = if skip_xattrs(modifier) {
                Vec::new()
            } else {
                query_xattrs_at(dir, name)?
            };
            let header = FileHeader::from_file_meta(&modified, xattrs)?;
            let payload: Box<dyn Read> = if modified.is_regular() {
                Box::new(dir.open(name).io_context(format!("Opening {name}"))?)
            } else {
                Box::new(std::io::empty())
            };
            let (length, stream) = file_content_stream(&header, payload);
            let csum = self.write_content(None, stream, length, cancellable)?;
            mtree.replace_file(name, csum)?;
        }
        Ok(())
    }

    /// Write all DIR_TREE objects for `mtree`, returning the checksum of
    /// the root tree object. Serialized subtrees are cached on the nodes,
    /// so re-serializing an unchanged tree is free.
    pub fn write_mtree(
        &self,
        mtree: &mut MutableTree,
        cancellable: Option<&Cancellable>,
    ) -> Result<Checksum> {
        check_cancelled(cancellable)?;
        if let Some(existing) = mtree.contents_checksum() {
            return Ok(existing.clone());
        }
        let mut dirs = Vec::new();
        for (name, child) in mtree.subdirs_mut() {
            let name = name.to_string();
            let contents = self.write_mtree(child, cancellable)?;
            let meta = child
                .metadata_checksum()
                .cloned()
                .ok_or(Error::Precondition("subdirectory has no metadata checksum"))?;
            dirs.push((name, contents, meta));
        }
        let files: Vec<(String, Checksum)> = mtree
            .files()
            .iter()
            .map(|(name, csum)| (name.clone(), csum.clone()))
            .collect();
        let v = variant_utils::dirtree_variant(&files, &dirs);
        let csum = self.write_metadata(ObjectType::DirTree, None, &v, cancellable)?;
        mtree.set_contents_checksum(csum.clone());
        Ok(csum)
    }

    /// Write a commit object for `branch` stamped with the current time,
    /// referencing the given root tree and root metadata checksums.
    /// Binding the branch to the result is the caller's job via
    /// [`Repo::set_ref`].
    #[allow(clippy::too_many_arguments)]
    pub fn write_commit(
        &self,
        branch: &str,
        parent: Option<&Checksum>,
        subject: &str,
        body: &str,
        root_tree: &Checksum,
        root_meta: &Checksum,
        cancellable: Option<&Cancellable>,
    ) -> Result<Checksum> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.write_commit_with_time(
            branch, parent, subject, body, timestamp, root_tree, root_meta, cancellable,
        )
    }

    /// Like [`Repo::write_commit`] with an explicit UTC epoch timestamp,
    /// for reproducible commits.
    #[allow(clippy::too_many_arguments)]
    pub fn write_commit_with_time(
        &self,
        branch: &str,
        parent: Option<&Checksum>,
        subject: &str,
        body: &str,
        timestamp: u64,
        root_tree: &Checksum,
        root_meta: &Checksum,
        cancellable: Option<&Cancellable>,
    ) -> Result<Checksum> {
        check_cancelled(cancellable)?;
        tracing::debug!(branch, subject, "writing commit");
        let v = variant_utils::commit_variant(parent, subject, body, timestamp, root_tree, root_meta);
        self.write_metadata(ObjectType::Commit, None, &v, cancellable)
    }
}
