//! The repository handle: open/init, the write transaction lifecycle, and
//! atomic loose-object placement.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cap_std_ext::cap_std::fs::Dir;
use gvariant::aligned_bytes::TryAsAligned;
use gvariant::{Marker, Structure};
use rustix::fs::{AtFlags, Mode, OFlags};
use serde::{Deserialize, Serialize};

use crate::cancellable::check_cancelled;
use crate::objgv::{gv_commit, gv_dirmeta, gv_dirtree};
use crate::objtype::loose_path;
use crate::{refs, Cancellable, Checksum, Error, IoContext, ObjectType, Result, StorageMode};

fn invalid_object(checksum: &Checksum) -> Error {
    Error::Io {
        context: format!("Parsing object {checksum}"),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed object"),
    }
}

const CONFIG_NAME: &str = "config.json";
const TRANSACTION_MARKER: &str = "transaction";
pub(crate) const MAX_TMP_NAME_ATTEMPTS: u32 = 128;

#[derive(Debug, Serialize, Deserialize)]
struct RepoConfig {
    version: u32,
    mode: StorageMode,
}

/// Parsed fields of a COMMIT object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Checksum of the parent commit, if any.
    pub parent: Option<Checksum>,
    /// One-line summary.
    pub subject: String,
    /// Free-form description.
    pub body: String,
    /// UTC epoch seconds at which the commit was written.
    pub timestamp: u64,
    /// Checksum of the root DIR_TREE object.
    pub root_tree: Checksum,
    /// Checksum of the root DIR_META object.
    pub root_meta: Checksum,
}

/// Parsed fields of a DIR_META object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirMetaInfo {
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Full `st_mode` including format bits.
    pub mode: u32,
    /// Extended attributes sorted by name; names carry a trailing NUL.
    pub xattrs: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Counters accumulated over one transaction and returned by
/// [`Repo::commit_transaction`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStats {
    /// Metadata objects seen, including ones that already existed.
    pub metadata_objects_total: u64,
    /// Metadata objects actually placed into the store.
    pub metadata_objects_written: u64,
    /// Content objects seen, including ones that already existed.
    pub content_objects_total: u64,
    /// Content objects actually placed into the store.
    pub content_objects_written: u64,
    /// Declared bytes of the content objects actually placed.
    pub content_bytes_written: u64,
}

/// State owned by the single writer of the open transaction.
#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    pub(crate) in_transaction: bool,
    pub(crate) pending_refs: Option<BTreeMap<String, Option<Checksum>>>,
    pub(crate) devino_cache: Option<HashMap<(u64, u64), Checksum>>,
}

/// A handle to a repository, opened on capability-style directory handles.
///
/// All object writes require an open transaction; see
/// [`Repo::prepare_transaction`].
#[derive(Debug)]
pub struct Repo {
    repo_dir: Dir,
    objects_dir: Dir,
    tmp_dir: Dir,
    mode: StorageMode,
    parent: Option<Box<Repo>>,
    pub(crate) txn: Mutex<TransactionState>,
    pub(crate) txn_stats: Mutex<TransactionStats>,
    tmp_name_counter: AtomicU64,
}

impl Repo {
    /// Initialize a new repository inside `dir`, which must be empty of
    /// repository state, then open it.
    pub fn init_at(dir: &Dir, mode: StorageMode) -> Result<Repo> {
        dir.create_dir("objects").io_context("Creating objects/")?;
        dir.create_dir("tmp").io_context("Creating tmp/")?;
        dir.create_dir_all("refs/heads")
            .io_context("Creating refs/heads/")?;
        dir.create_dir_all("refs/remotes")
            .io_context("Creating refs/remotes/")?;
        let config = RepoConfig { version: 1, mode };
        let buf = serde_json::to_vec_pretty(&config)
            .map_err(std::io::Error::other)
            .io_context("Serializing config")?;
        dir.write(CONFIG_NAME, buf).io_context("Writing config")?;
        Self::open_at(dir)
    }

    /// Open an existing repository inside `dir`.
    pub fn open_at(dir: &Dir) -> Result<Repo> {
        let buf = dir.read(CONFIG_NAME).io_context("Reading config")?;
        let config: RepoConfig = serde_json::from_slice(&buf)
            .map_err(std::io::Error::other)
            .io_context("Parsing config")?;
        let objects_dir = dir.open_dir("objects").io_context("Opening objects/")?;
        let tmp_dir = dir.open_dir("tmp").io_context("Opening tmp/")?;
        let repo_dir = dir.try_clone().io_context("Cloning repo dir")?;
        Ok(Repo {
            repo_dir,
            objects_dir,
            tmp_dir,
            mode: config.mode,
            parent: None,
            txn: Mutex::new(TransactionState::default()),
            txn_stats: Mutex::new(TransactionStats::default()),
            tmp_name_counter: AtomicU64::new(0),
        })
    }

    /// The storage mode this repository was created with.
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Install a parent repository; the hardlink scan of
    /// [`Repo::scan_hardlinks`] recurses into parents first.
    pub fn set_parent(&mut self, parent: Repo) {
        self.parent = Some(Box::new(parent));
    }

    pub(crate) fn parent(&self) -> Option<&Repo> {
        self.parent.as_deref()
    }

    pub(crate) fn objects_dir(&self) -> &Dir {
        &self.objects_dir
    }

    pub(crate) fn tmp_dir(&self) -> &Dir {
        &self.tmp_dir
    }

    pub(crate) fn require_transaction(&self) -> Result<()> {
        if !self.txn.lock().unwrap().in_transaction {
            return Err(Error::Precondition("repository is not in a transaction"));
        }
        Ok(())
    }

    /// Start a transaction. Returns `true` when a marker from a previous
    /// (crashed) transaction was found and the transaction is resuming.
    pub fn prepare_transaction(&self, cancellable: Option<&Cancellable>) -> Result<bool> {
        check_cancelled(cancellable)?;
        let mut state = self.txn.lock().unwrap();
        if state.in_transaction {
            return Err(Error::Precondition("transaction already in progress"));
        }
        let resumed = self
            .repo_dir
            .symlink_metadata(TRANSACTION_MARKER)
            .map(|m| m.is_symlink())
            .unwrap_or(false);
        *self.txn_stats.lock().unwrap() = TransactionStats::default();
        if resumed {
            tracing::debug!("resuming transaction from stale marker");
            self.repo_dir
                .remove_file(TRANSACTION_MARKER)
                .io_context("Removing stale transaction marker")?;
        }
        let target = format!("pid={}", std::process::id());
        rustix::fs::symlinkat(target.as_str(), &self.repo_dir, TRANSACTION_MARKER)
            .io_context("Creating transaction marker")?;
        state.in_transaction = true;
        Ok(resumed)
    }

    /// Complete the transaction: clean the temp area, apply staged ref
    /// updates, and return the accumulated statistics. On failure the
    /// repository stays in-transaction and a subsequent
    /// [`Repo::abort_transaction`] is safe.
    pub fn commit_transaction(
        &self,
        cancellable: Option<&Cancellable>,
    ) -> Result<TransactionStats> {
        check_cancelled(cancellable)?;
        let mut state = self.txn.lock().unwrap();
        if !state.in_transaction {
            return Err(Error::Precondition("repository is not in a transaction"));
        }
        self.cleanup_tmpdir()?;
        state.devino_cache = None;
        if let Some(pending) = state.pending_refs.as_ref() {
            refs::apply_refs(&self.repo_dir, pending)?;
        }
        state.pending_refs = None;
        state.in_transaction = false;
        self.repo_dir
            .remove_file(TRANSACTION_MARKER)
            .io_context("Removing transaction marker")?;
        let stats = *self.txn_stats.lock().unwrap();
        tracing::debug!(?stats, "transaction committed");
        Ok(stats)
    }

    /// Abandon the transaction: clean the temp area and discard staged ref
    /// updates. Objects already written remain in the store. Idempotent.
    pub fn abort_transaction(&self, cancellable: Option<&Cancellable>) -> Result<()> {
        check_cancelled(cancellable)?;
        let mut state = self.txn.lock().unwrap();
        if !state.in_transaction {
            return Ok(());
        }
        self.cleanup_tmpdir()?;
        state.devino_cache = None;
        state.pending_refs = None;
        state.in_transaction = false;
        match self.repo_dir.remove_file(TRANSACTION_MARKER) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).io_context("Removing transaction marker"),
        }
        tracing::debug!("transaction aborted");
        Ok(())
    }

    /// Stage a ref update to be applied when the transaction commits.
    /// `checksum = None` stages a deletion.
    pub fn set_ref(
        &self,
        remote: Option<&str>,
        name: &str,
        checksum: Option<&Checksum>,
    ) -> Result<()> {
        let refspec = match remote {
            Some(remote) => format!("{remote}:{name}"),
            None => name.to_string(),
        };
        self.set_refspec(&refspec, checksum)
    }

    /// Like [`Repo::set_ref`], but takes the concatenated
    /// `remote:ref` / `ref` form directly.
    pub fn set_refspec(&self, refspec: &str, checksum: Option<&Checksum>) -> Result<()> {
        let mut state = self.txn.lock().unwrap();
        if !state.in_transaction {
            return Err(Error::Precondition("repository is not in a transaction"));
        }
        state
            .pending_refs
            .get_or_insert_with(Default::default)
            .insert(refspec.to_string(), checksum.cloned());
        Ok(())
    }

    /// Recursively remove everything under `tmp/`.
    fn cleanup_tmpdir(&self) -> Result<()> {
        for entry in self.tmp_dir.entries().io_context("Listing tmp/")? {
            let entry = entry.io_context("Listing tmp/")?;
            let name = entry.file_name();
            let meta = self
                .tmp_dir
                .symlink_metadata(&name)
                .io_context("Querying tmp entry")?;
            if meta.is_dir() {
                self.tmp_dir
                    .remove_dir_all(&name)
                    .io_context("Removing tmp directory")?;
            } else {
                self.tmp_dir
                    .remove_file(&name)
                    .io_context("Removing tmp file")?;
            }
        }
        Ok(())
    }

    /// Whether the loose object for `checksum` exists in this repository.
    pub(crate) fn has_loose_object(
        &self,
        checksum: &Checksum,
        objtype: ObjectType,
    ) -> Result<bool> {
        let path = self.loose_object_path(checksum, objtype);
        self.objects_dir
            .try_exists(&path)
            .io_context("Querying loose object")
    }

    /// The path of the loose object for `checksum`, relative to
    /// `objects/`, e.g. `ab/cdef....dirtree`.
    pub fn loose_object_path(&self, checksum: &Checksum, objtype: ObjectType) -> String {
        loose_path(checksum, objtype, self.mode)
    }

    /// Read back the raw on-disk bytes of a metadata object.
    pub fn load_metadata(&self, objtype: ObjectType, checksum: &Checksum) -> Result<Vec<u8>> {
        if objtype == ObjectType::File {
            return Err(Error::Precondition("metadata object type required"));
        }
        let path = self.loose_object_path(checksum, objtype);
        self.objects_dir
            .read(&path)
            .io_context(format!("Reading {objtype} object {checksum}"))
    }

    /// Load and parse a COMMIT object.
    pub fn read_commit(&self, checksum: &Checksum) -> Result<CommitInfo> {
        let data = self.load_metadata(ObjectType::Commit, checksum)?;
        let aligned = data.try_as_aligned().map_err(|_| invalid_object(checksum))?;
        let parsed = gv_commit!().cast(aligned);
        let (_, parent, _, subject, body, timestamp, root_tree, root_meta) = parsed.to_tuple();
        let parent = if parent.is_empty() {
            None
        } else {
            Some(Checksum::from_bytes(parent)?)
        };
        Ok(CommitInfo {
            parent,
            subject: subject.to_str().to_string(),
            body: body.to_str().to_string(),
            timestamp: u64::from_be(*timestamp),
            root_tree: Checksum::from_bytes(root_tree)?,
            root_meta: Checksum::from_bytes(root_meta)?,
        })
    }

    /// Load and parse a DIR_TREE object into its (files, subdirectories)
    /// lists, each sorted by name as stored.
    #[allow(clippy::type_complexity)]
    pub fn read_dirtree(
        &self,
        checksum: &Checksum,
    ) -> Result<(Vec<(String, Checksum)>, Vec<(String, Checksum, Checksum)>)> {
        let data = self.load_metadata(ObjectType::DirTree, checksum)?;
        let aligned = data.try_as_aligned().map_err(|_| invalid_object(checksum))?;
        let parsed = gv_dirtree!().cast(aligned);
        let (files, dirs) = parsed.to_tuple();
        let files = files
            .into_iter()
            .map(|f| {
                let (name, csum) = f.to_tuple();
                Ok((name.to_str().to_string(), Checksum::from_bytes(csum)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let dirs = dirs
            .into_iter()
            .map(|d| {
                let (name, contents, meta) = d.to_tuple();
                Ok((
                    name.to_str().to_string(),
                    Checksum::from_bytes(contents)?,
                    Checksum::from_bytes(meta)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((files, dirs))
    }

    /// Load and parse a DIR_META object.
    pub fn read_dirmeta(&self, checksum: &Checksum) -> Result<DirMetaInfo> {
        let data = self.load_metadata(ObjectType::DirMeta, checksum)?;
        let aligned = data.try_as_aligned().map_err(|_| invalid_object(checksum))?;
        let parsed = gv_dirmeta!().cast(aligned);
        let (_, uid, gid, mode, xattrs) = parsed.to_tuple();
        let xattrs = xattrs
            .into_iter()
            .map(|x| {
                let (name, value) = x.to_tuple();
                (name.to_vec(), value.to_vec())
            })
            .collect();
        Ok(DirMetaInfo {
            uid: u32::from_be(*uid),
            gid: u32::from_be(*gid),
            mode: u32::from_be(*mode),
            xattrs,
        })
    }

    /// Move a fully-prepared temp file into its final loose object path,
    /// creating the prefix directory as needed. A rename race with another
    /// writer of the same object is treated as success.
    pub(crate) fn commit_loose_object_trusted(
        &self,
        temp_name: &str,
        loose_path: &str,
    ) -> Result<()> {
        let prefix = &loose_path[..2];
        match rustix::fs::mkdirat(&self.objects_dir, prefix, Mode::from_raw_mode(0o777)) {
            Ok(()) => {}
            Err(rustix::io::Errno::EXIST) => {}
            Err(e) => return Err(e).io_context("Creating object prefix directory"),
        }
        match rustix::fs::renameat(&self.tmp_dir, temp_name, &self.objects_dir, loose_path) {
            Ok(()) => {}
            Err(rustix::io::Errno::EXIST) => {
                // Another writer won the race; the object is in the store.
                let _ = rustix::fs::unlinkat(&self.tmp_dir, temp_name, AtFlags::empty());
            }
            Err(e) => return Err(e).io_context(format!("Storing file '{temp_name}'")),
        }
        tracing::trace!(loose_path, "placed loose object");
        Ok(())
    }

    fn allocate_tmp_name(&self) -> String {
        format!(
            "tmpobject-{}-{}",
            std::process::id(),
            self.tmp_name_counter.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Create a uniquely-named regular file with mode 0644 under `tmp/`.
    pub(crate) fn create_tmp_file(&self) -> Result<(String, std::fs::File)> {
        for _ in 0..MAX_TMP_NAME_ATTEMPTS {
            let name = self.allocate_tmp_name();
            match rustix::fs::openat(
                &self.tmp_dir,
                name.as_str(),
                OFlags::CREATE | OFlags::EXCL | OFlags::WRONLY | OFlags::CLOEXEC,
                Mode::from_raw_mode(0o644),
            ) {
                Ok(fd) => return Ok((name, std::fs::File::from(fd))),
                Err(rustix::io::Errno::EXIST) => continue,
                Err(e) => return Err(e).io_context("Creating temporary file"),
            }
        }
        Err(Error::Exhausted("file"))
    }

    /// Create a uniquely-named symlink to `target` under `tmp/`. The link
    /// must exist first and only then receive ownership and xattrs, so the
    /// store never exposes a partially-attributed object.
    pub(crate) fn create_tmp_symlink(&self, target: &str) -> Result<String> {
        for _ in 0..MAX_TMP_NAME_ATTEMPTS {
            let name = self.allocate_tmp_name();
            match rustix::fs::symlinkat(target, &self.tmp_dir, name.as_str()) {
                Ok(()) => return Ok(name),
                Err(rustix::io::Errno::EXIST) => continue,
                Err(e) => return Err(e).io_context("Creating temporary symlink"),
            }
        }
        Err(Error::Exhausted("symlink"))
    }
}
