//! The object writer: stream an object into a temp file, verify or compute
//! its checksum, apply POSIX attributes in a safe order, and hand off to
//! atomic placement.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;

use flate2::write::DeflateEncoder;
use flate2::Compression;
use rustix::fs::{AtFlags, Mode, XattrFlags};
use rustix::process::{Gid, Uid};

use crate::cancellable::check_cancelled;
use crate::checksum::HashingReader;
use crate::content::{self, FileHeader};
use crate::repo::Repo;
use crate::variant_utils::Xattr;
use crate::{Cancellable, Checksum, Error, IoContext, ObjectType, Result, StorageMode};

/// Unlinks the named temp file on drop unless placement consumed it.
struct TmpGuard<'a> {
    repo: &'a Repo,
    name: Option<String>,
}

impl<'a> TmpGuard<'a> {
    fn new(repo: &'a Repo) -> Self {
        Self { repo, name: None }
    }

    fn set(&mut self, name: String) {
        self.name = Some(name);
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Hand the name to placement; the rename (or the duplicate unlink)
    /// consumes the temp file.
    fn take(&mut self) -> Option<String> {
        self.name.take()
    }
}

impl Drop for TmpGuard<'_> {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            let _ = rustix::fs::unlinkat(self.repo.tmp_dir(), name.as_str(), AtFlags::empty());
        }
    }
}

/// What was materialized under `tmp/` for the object being written.
enum TempObject {
    Regular(std::fs::File),
    Symlink,
}

/// Either a checksum-computing wrapper around the input stream, or the
/// input stream itself when the caller already trusts its checksum.
///
/// Bundling both cases behind one `Read` impl means the input reference is
/// only ever borrowed once (here), instead of separately when falling back
/// to the untrusted-checksum path further down.
enum MaybeHashingReader<'a> {
    Hashing(HashingReader<'a>),
    Plain(&'a mut dyn Read),
}

impl Read for MaybeHashingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            MaybeHashingReader::Hashing(h) => h.read(buf),
            MaybeHashingReader::Plain(p) => p.read(buf),
        }
    }
}

impl Repo {
    /// Store a metadata object from its canonical serialization, returning
    /// its checksum. If `expected` is provided the content is verified
    /// against it.
    pub fn write_metadata(
        &self,
        objtype: ObjectType,
        expected: Option<&Checksum>,
        object: &[u8],
        cancellable: Option<&Cancellable>,
    ) -> Result<Checksum> {
        if !objtype.is_meta() {
            return Err(Error::Precondition("metadata object type required"));
        }
        let mut input = std::io::Cursor::new(object);
        self.write_object(objtype, expected, &mut input, 0, true, cancellable)
    }

    /// Store a metadata object whose checksum the caller already knows and
    /// trusts; the content is not re-hashed.
    pub fn write_metadata_trusted(
        &self,
        objtype: ObjectType,
        checksum: &Checksum,
        object: &[u8],
        cancellable: Option<&Cancellable>,
    ) -> Result<()> {
        if !objtype.is_meta() {
            return Err(Error::Precondition("metadata object type required"));
        }
        let mut input = std::io::Cursor::new(object);
        self.write_object(objtype, Some(checksum), &mut input, 0, false, cancellable)?;
        Ok(())
    }

    /// Store a content object from its canonical stream (see
    /// [`crate::file_content_stream`]) of total length `length`, returning
    /// its checksum. If `expected` is provided the content is verified
    /// against it.
    pub fn write_content(
        &self,
        expected: Option<&Checksum>,
        mut content: impl Read,
        length: u64,
        cancellable: Option<&Cancellable>,
    ) -> Result<Checksum> {
        self.write_object(
            ObjectType::File,
            expected,
            &mut content,
            length,
            true,
            cancellable,
        )
    }

    /// Store a content object under a checksum the caller already knows
    /// and trusts; the stream is not re-hashed. This is the fast path when
    /// importing objects from local disk.
    pub fn write_content_trusted(
        &self,
        checksum: &Checksum,
        mut content: impl Read,
        length: u64,
        cancellable: Option<&Cancellable>,
    ) -> Result<()> {
        self.write_object(
            ObjectType::File,
            Some(checksum),
            &mut content,
            length,
            false,
            cancellable,
        )?;
        Ok(())
    }

    fn write_object(
        &self,
        objtype: ObjectType,
        expected: Option<&Checksum>,
        input: &mut dyn Read,
        length: u64,
        want_checksum: bool,
        cancellable: Option<&Cancellable>,
    ) -> Result<Checksum> {
        self.require_transaction()?;
        check_cancelled(cancellable)?;
        debug_assert!(expected.is_some() || want_checksum);

        // Fast path: a verified object we already have need not be read at
        // all, but still counts toward the totals.
        if let Some(expected) = expected {
            if self.has_loose_object(expected, objtype)? {
                self.add_stats(objtype, length, false);
                return Ok(expected.clone());
            }
        }

        let mut reader = if want_checksum {
            MaybeHashingReader::Hashing(HashingReader::new(input)?)
        } else {
            MaybeHashingReader::Plain(input)
        };

        let mut guard = TmpGuard::new(self);
        let mut header: Option<FileHeader> = None;
        let temp = if objtype == ObjectType::File {
            let parsed = content::parse_file_stream(&mut reader)?;
            let temp = self.materialize_content_temp(&parsed, &mut reader, &mut guard)?;
            header = Some(parsed);
            temp
        } else {
            let (name, mut file) = self.create_tmp_file()?;
            guard.set(name);
            std::io::copy(&mut reader, &mut file).io_context("Writing metadata object")?;
            TempObject::Regular(file)
        };

        let actual = match reader {
            MaybeHashingReader::Hashing(h) => {
                let actual = h.finish()?;
                if let Some(expected) = expected {
                    if actual != *expected {
                        return Err(Error::Corrupt {
                            objtype,
                            expected: expected.to_hex(),
                            actual: actual.to_hex(),
                        });
                    }
                }
                actual
            }
            MaybeHashingReader::Plain(_) => {
                expected.expect("trusted write carries a checksum").clone()
            }
        };

        let loose_path = self.loose_object_path(&actual, objtype);
        let do_commit = !self
            .objects_dir()
            .try_exists(&loose_path)
            .io_context("Querying loose object")?;
        if do_commit {
            if objtype == ObjectType::File && self.mode() == StorageMode::Bare {
                let header = header.as_ref().expect("content write parsed a header");
                let name = guard.name().expect("content write created a temp");
                self.apply_bare_attributes(name, header, &temp)?;
            }
            let name = guard.take().expect("temp file present before placement");
            self.commit_loose_object_trusted(&name, &loose_path)?;
        }
        drop(temp);
        self.add_stats(objtype, length, do_commit);
        Ok(actual)
    }

    /// Materialize the temp form of a content object according to the
    /// storage mode.
    fn materialize_content_temp(
        &self,
        header: &FileHeader,
        payload: &mut dyn Read,
        guard: &mut TmpGuard<'_>,
    ) -> Result<TempObject> {
        match (self.mode(), header.is_symlink()) {
            (StorageMode::Bare, false) => {
                let (name, mut file) = self.create_tmp_file()?;
                guard.set(name);
                std::io::copy(payload, &mut file).io_context("Writing content")?;
                Ok(TempObject::Regular(file))
            }
            (StorageMode::Bare, true) => {
                let target = header.symlink_target.as_deref().unwrap_or("");
                let name = self.create_tmp_symlink(target)?;
                guard.set(name);
                Ok(TempObject::Symlink)
            }
            (StorageMode::Archive, _) => {
                let (name, mut file) = self.create_tmp_file()?;
                guard.set(name);
                file.write_all(&header.to_bytes_with_size())
                    .io_context("Writing content header")?;
                if !header.is_symlink() {
                    let mut encoder = DeflateEncoder::new(&mut file, Compression::new(9));
                    std::io::copy(payload, &mut encoder).io_context("Compressing content")?;
                    encoder.finish().io_context("Compressing content")?;
                }
                Ok(TempObject::Regular(file))
            }
        }
    }

    /// Apply ownership, xattrs, and mode to a BARE temp file, in that
    /// order. Mode bits may include setuid, so they go on only after the
    /// content is complete and verified, and are followed by fsync so the
    /// rename never publishes un-synced content.
    fn apply_bare_attributes(
        &self,
        temp_name: &str,
        header: &FileHeader,
        temp: &TempObject,
    ) -> Result<()> {
        #[allow(unsafe_code)]
        // Safety: `header.uid`/`header.gid` are raw `uid_t`/`gid_t` values
        // parsed from the object's own metadata; any bit pattern is a valid
        // raw ID as far as `Uid`/`Gid` are concerned.
        let (uid, gid) = unsafe { (Uid::from_raw(header.uid), Gid::from_raw(header.gid)) };
        rustix::fs::chownat(
            self.tmp_dir(),
            temp_name,
            Some(uid),
            Some(gid),
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .io_context("Applying ownership")?;
        if !header.xattrs.is_empty() {
            self.apply_tmp_xattrs(temp_name, &header.xattrs, header.is_symlink())?;
        }
        // Symlinks are always 777 and chmod would follow them.
        if let TempObject::Regular(file) = temp {
            loop {
                match rustix::fs::fchmod(file, Mode::from_raw_mode(header.mode & 0o7777)) {
                    Ok(()) => break,
                    Err(rustix::io::Errno::INTR) => continue,
                    Err(e) => return Err(e).io_context("Applying mode"),
                }
            }
            // In case of a power cut, these files must have the data we
            // want before they become visible under their final name.
            rustix::fs::fsync(file).io_context("Syncing content")?;
        }
        Ok(())
    }

    /// Set xattrs on a temp path. There is no fd-relative call for symlink
    /// xattrs, so this goes through /proc. On symlinks the operation is
    /// best-effort: platforms that refuse it are silently skipped.
    fn apply_tmp_xattrs(&self, temp_name: &str, xattrs: &[Xattr], is_symlink: bool) -> Result<()> {
        let path = format!(
            "/proc/self/fd/{}/{}",
            self.tmp_dir().as_raw_fd(),
            temp_name
        );
        for (name, value) in xattrs {
            let name_bytes = name.strip_suffix(b"\0").unwrap_or(name);
            let name_str = std::str::from_utf8(name_bytes).map_err(|_| Error::Io {
                context: "Applying xattrs".into(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "non-UTF-8 xattr name",
                ),
            })?;
            match rustix::fs::lsetxattr(&path, name_str, value, XattrFlags::empty()) {
                Ok(()) => {}
                Err(rustix::io::Errno::NOTSUP | rustix::io::Errno::PERM) if is_symlink => {
                    tracing::trace!(name = name_str, "skipping unsupported symlink xattr");
                }
                Err(e) => return Err(e).io_context(format!("Setting xattr {name_str}")),
            }
        }
        Ok(())
    }

    fn add_stats(&self, objtype: ObjectType, length: u64, written: bool) {
        let mut stats = self.txn_stats.lock().unwrap();
        if objtype.is_meta() {
            stats.metadata_objects_total += 1;
            if written {
                stats.metadata_objects_written += 1;
            }
        } else {
            stats.content_objects_total += 1;
            if written {
                stats.content_objects_written += 1;
                stats.content_bytes_written += length;
            }
        }
    }
}
