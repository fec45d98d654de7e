//! Applying staged ref updates to the `refs/` namespace.

use std::collections::BTreeMap;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::{Checksum, Error, Result};

/// Map a refspec to its path below the repository root:
/// `ref` → `refs/heads/<ref>`, `remote:ref` → `refs/remotes/<remote>/<ref>`.
fn ref_relpath(refspec: &str) -> std::io::Result<Utf8PathBuf> {
    let path = match refspec.split_once(':') {
        Some((remote, name)) => Utf8Path::new("refs/remotes").join(remote).join(name),
        None => Utf8Path::new("refs/heads").join(refspec),
    };
    // Ref names are caller-supplied; refuse anything that would escape the
    // refs namespace.
    let valid = path
        .components()
        .all(|c| matches!(c, Utf8Component::Normal(_)));
    if !valid || refspec.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid refspec {refspec:?}"),
        ));
    }
    Ok(path)
}

fn apply_one(repo_dir: &Dir, refspec: &str, target: Option<&Checksum>) -> std::io::Result<()> {
    let path = ref_relpath(refspec)?;
    match target {
        Some(checksum) => {
            if let Some(parent) = path.parent() {
                repo_dir.create_dir_all(parent)?;
            }
            repo_dir.atomic_write(&path, format!("{checksum}\n"))
        }
        None => match repo_dir.remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        },
    }
}

/// Apply a pending refs mapping. Refs are written atomically one by one;
/// the first failure is returned and later updates are not attempted.
pub(crate) fn apply_refs(
    repo_dir: &Dir,
    pending: &BTreeMap<String, Option<Checksum>>,
) -> Result<()> {
    for (refspec, target) in pending {
        tracing::debug!(refspec, update = target.is_some(), "applying ref");
        apply_one(repo_dir, refspec, target.as_ref()).map_err(|source| Error::RefUpdate {
            refspec: refspec.clone(),
            source,
        })?;
    }
    Ok(())
}
