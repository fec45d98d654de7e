//! The mutable in-memory tree assembled during ingest.

use std::collections::BTreeMap;

use crate::{Checksum, Error, Result};

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::Precondition("invalid file name"));
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(Error::Precondition("invalid file name"));
    }
    Ok(())
}

/// A mutable directory tree being assembled for commit.
///
/// Nodes record the checksums of already-ingested children; file and
/// subdirectory names are disjoint within a node. Once a node has been
/// serialized its contents checksum is cached; any later mutation clears
/// the cache so [`crate::Repo::write_mtree`] re-serializes it.
#[derive(Debug, Default)]
pub struct MutableTree {
    metadata_checksum: Option<Checksum>,
    contents_checksum: Option<Checksum>,
    files: BTreeMap<String, Checksum>,
    subdirs: BTreeMap<String, MutableTree>,
}

impl MutableTree {
    /// Create an empty tree node.
    pub fn new() -> Self {
        Self::default()
    }

    /// The checksum of this node's DIRMETA object, if recorded.
    pub fn metadata_checksum(&self) -> Option<&Checksum> {
        self.metadata_checksum.as_ref()
    }

    /// Record the checksum of this node's DIRMETA object.
    pub fn set_metadata_checksum(&mut self, checksum: Checksum) {
        self.metadata_checksum = Some(checksum);
    }

    /// The cached checksum of this node's serialized DIRTREE object, if it
    /// has been written and not invalidated since.
    pub fn contents_checksum(&self) -> Option<&Checksum> {
        self.contents_checksum.as_ref()
    }

    pub(crate) fn set_contents_checksum(&mut self, checksum: Checksum) {
        self.contents_checksum = Some(checksum);
    }

    /// Record `checksum` as the content object for file `name`, replacing
    /// any previous entry.
    pub fn replace_file(&mut self, name: &str, checksum: Checksum) -> Result<()> {
        validate_name(name)?;
        if self.subdirs.contains_key(name) {
            return Err(Error::Precondition(
                "can't replace a directory with a file",
            ));
        }
        self.contents_checksum = None;
        self.files.insert(name.to_string(), checksum);
        Ok(())
    }

    /// Return the child node for subdirectory `name`, creating it if
    /// necessary.
    pub fn ensure_dir(&mut self, name: &str) -> Result<&mut MutableTree> {
        validate_name(name)?;
        if self.files.contains_key(name) {
            return Err(Error::Precondition(
                "can't replace a file with a directory",
            ));
        }
        self.contents_checksum = None;
        Ok(self.subdirs.entry(name.to_string()).or_default())
    }

    /// The files recorded in this node, sorted by name.
    pub fn files(&self) -> &BTreeMap<String, Checksum> {
        &self.files
    }

    /// The subdirectories of this node, sorted by name.
    pub fn subdirs(&self) -> impl Iterator<Item = (&str, &MutableTree)> {
        self.subdirs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn subdirs_mut(&mut self) -> impl Iterator<Item = (&str, &mut MutableTree)> {
        self.subdirs.iter_mut().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csum(fill: u8) -> Checksum {
        Checksum::from_bytes(&[fill; 32]).unwrap()
    }

    #[test]
    fn test_disjoint_names() {
        let mut t = MutableTree::new();
        t.replace_file("a", csum(1)).unwrap();
        assert!(t.ensure_dir("a").is_err());
        t.ensure_dir("b").unwrap();
        assert!(t.replace_file("b", csum(2)).is_err());
    }

    #[test]
    fn test_invalid_names() {
        let mut t = MutableTree::new();
        for name in ["", ".", "..", "a/b", "a\0b"] {
            assert!(t.replace_file(name, csum(1)).is_err(), "{name:?}");
            assert!(t.ensure_dir(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn test_mutation_invalidates_contents() {
        let mut t = MutableTree::new();
        t.set_contents_checksum(csum(9));
        assert!(t.contents_checksum().is_some());
        t.replace_file("a", csum(1)).unwrap();
        assert!(t.contents_checksum().is_none());

        t.set_contents_checksum(csum(9));
        t.ensure_dir("d").unwrap();
        assert!(t.contents_checksum().is_none());
    }

    #[test]
    fn test_sorted_iteration() {
        let mut t = MutableTree::new();
        t.replace_file("zz", csum(1)).unwrap();
        t.replace_file("aa", csum(2)).unwrap();
        let names: Vec<_> = t.files().keys().cloned().collect();
        assert_eq!(names, ["aa", "zz"]);
    }
}
