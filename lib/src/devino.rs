//! The (device, inode) → checksum cache used to short-circuit hashing when
//! a source tree hardlinks into the object store.

use std::collections::HashMap;

use cap_std_ext::cap_std::fs::MetadataExt;

use crate::cancellable::check_cancelled;
use crate::repo::Repo;
use crate::{Cancellable, Checksum, IoContext, ObjectType, Result};

impl Repo {
    /// Build the hardlink cache by scanning every loose content object in
    /// this repository and its parent chain. There is an upfront cost to
    /// the scan, but a commit composed mostly of hardlinks to existing
    /// objects then skips hashing entirely, so call this before
    /// [`Repo::write_directory_to_mtree`].
    pub fn scan_hardlinks(&self, cancellable: Option<&Cancellable>) -> Result<()> {
        self.require_transaction()?;
        let mut cache = HashMap::new();
        self.scan_loose_devino(&mut cache, cancellable)?;
        tracing::debug!(entries = cache.len(), "built devino cache");
        self.txn.lock().unwrap().devino_cache = Some(cache);
        Ok(())
    }

    fn scan_loose_devino(
        &self,
        cache: &mut HashMap<(u64, u64), Checksum>,
        cancellable: Option<&Cancellable>,
    ) -> Result<()> {
        if let Some(parent) = self.parent() {
            parent.scan_loose_devino(cache, cancellable)?;
        }
        let suffix = format!(".{}", ObjectType::File.suffix(self.mode()));
        for entry in self.objects_dir().entries().io_context("Listing objects/")? {
            check_cancelled(cancellable)?;
            let entry = entry.io_context("Listing objects/")?;
            let dirname = entry.file_name();
            let Some(dirname) = dirname.to_str() else {
                continue;
            };
            if dirname.len() != 2 || !entry.metadata().io_context("Querying object dir")?.is_dir()
            {
                continue;
            }
            let objdir = self
                .objects_dir()
                .open_dir(dirname)
                .io_context("Opening object dir")?;
            for child in objdir.entries().io_context("Listing object dir")? {
                let child = child.io_context("Listing object dir")?;
                let meta = child.metadata().io_context("Querying loose object")?;
                if meta.is_dir() {
                    continue;
                }
                let name = child.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                // Only loose content objects in the current storage mode
                // participate; 62 hex chars of stem plus the 2-char prefix
                // reassemble the checksum.
                let Some(stem) = name.strip_suffix(&suffix) else {
                    continue;
                };
                if stem.len() != 62 {
                    continue;
                }
                let Ok(checksum) = Checksum::from_hex(&format!("{dirname}{stem}")) else {
                    continue;
                };
                cache.insert((meta.dev(), meta.ino()), checksum);
            }
        }
        Ok(())
    }

    /// Look up a source file in the hardlink cache. A hit means the file
    /// is the same inode as a stored object and its checksum can be reused
    /// without hashing; a miss is never fatal, only pessimistic.
    pub(crate) fn devino_lookup(&self, dev: u64, ino: u64) -> Option<Checksum> {
        self.txn
            .lock()
            .unwrap()
            .devino_cache
            .as_ref()?
            .get(&(dev, ino))
            .cloned()
    }
}
