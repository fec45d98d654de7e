#![allow(missing_docs)]

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use gvariant::aligned_bytes::TryAsAligned;
use gvariant::{gv, Marker, Structure};

use treerepo::{
    Cancellable, Checksum, CommitFilterResult, CommitModifier, CommitModifierFlags, MutableTree,
    ObjectType, Repo, StorageMode,
};

const TESTREF: &str = "exampleos/x86_64/stable";

fn opendir(path: &Path) -> Result<Dir> {
    Ok(Dir::open_ambient_dir(path, cap_std::ambient_authority())?)
}

/// A small source tree exercising regular files, duplicate content,
/// symlinks, and nesting.
fn populate_source_tree(root: &Path) -> Result<()> {
    std::fs::write(root.join("alpha.conf"), b"alpha contents\n")?;
    std::fs::write(root.join("beta.conf"), b"beta contents\n")?;
    // Same bytes, same mode: must become a single content object.
    std::fs::write(root.join("beta-copy.conf"), b"beta contents\n")?;
    std::os::unix::fs::symlink("alpha.conf", root.join("alpha-link"))?;
    std::fs::create_dir(root.join("subdir"))?;
    std::fs::write(root.join("subdir/gamma"), b"gamma contents\n")?;
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = openssl_hash(data);
    hex::encode(digest)
}

fn openssl_hash(data: &[u8]) -> Vec<u8> {
    openssl::hash::hash(openssl::hash::MessageDigest::sha256(), data)
        .unwrap()
        .to_vec()
}

/// Verify address integrity for a stored metadata object: hashing the
/// on-disk bytes reproduces the object name.
fn assert_address_integrity(repo: &Repo, objtype: ObjectType, checksum: &Checksum) -> Result<()> {
    let data = repo.load_metadata(objtype, checksum)?;
    assert_eq!(sha256_hex(&data), checksum.to_hex());
    Ok(())
}

#[test]
fn test_commit_flow_bare() -> Result<()> {
    let src = tempfile::tempdir()?;
    populate_source_tree(src.path())?;
    let repodir = tempfile::tempdir()?;
    let repo = Repo::init_at(&opendir(repodir.path())?, StorageMode::Bare)?;

    let start = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    assert!(!repo.prepare_transaction(None)?);
    let mut root = MutableTree::new();
    repo.write_directory_to_mtree(&opendir(src.path())?, &mut root, None, None)?;

    assert_eq!(root.files().len(), 4);
    assert_eq!(
        root.files().get("beta.conf"),
        root.files().get("beta-copy.conf")
    );
    let root_meta = root.metadata_checksum().unwrap().clone();
    let root_tree = repo.write_mtree(&mut root, None)?;
    let commit = repo.write_commit(
        TESTREF,
        None,
        "initial import",
        "imported from the source tree",
        &root_tree,
        &root_meta,
        None,
    )?;
    repo.set_ref(None, TESTREF, Some(&commit))?;
    let stats = repo.commit_transaction(None)?;

    // alpha, beta (deduplicated), symlink, gamma
    assert_eq!(stats.content_objects_total, 5);
    assert_eq!(stats.content_objects_written, 4);
    // 2 dirmeta + 2 dirtree + 1 commit; the identical dirmeta for both
    // directories is written once
    assert_eq!(stats.metadata_objects_total, 5);
    assert!(stats.metadata_objects_written >= 3);
    assert!(stats.content_bytes_written > 0);

    // The branch resolves to the commit.
    let reffile = repodir
        .path()
        .join("refs/heads")
        .join(TESTREF);
    let resolved = std::fs::read_to_string(reffile)?;
    assert_eq!(resolved.trim_end(), commit.to_hex());

    // Address integrity of the metadata objects.
    assert_address_integrity(&repo, ObjectType::Commit, &commit)?;
    assert_address_integrity(&repo, ObjectType::DirTree, &root_tree)?;
    assert_address_integrity(&repo, ObjectType::DirMeta, &root_meta)?;

    // Read back the commit object and check every field we wrote.
    let info = repo.read_commit(&commit)?;
    assert!(info.parent.is_none());
    assert_eq!(info.subject, "initial import");
    assert_eq!(info.body, "imported from the source tree");
    assert!(info.timestamp >= start && info.timestamp <= start + 600);
    assert_eq!(info.root_tree, root_tree);
    assert_eq!(info.root_meta, root_meta);

    // And the stored directory metadata parses back to what was scanned.
    let dirmeta = repo.read_dirmeta(&root_meta)?;
    assert_eq!(dirmeta.mode & libc::S_IFMT, libc::S_IFDIR);

    // The stored tree lists the files sorted by name.
    let (files, dirs) = repo.read_dirtree(&root_tree)?;
    let names: Vec<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        ["alpha-link", "alpha.conf", "beta-copy.conf", "beta.conf"]
    );
    assert_eq!(dirs.len(), 1);
    assert_eq!(dirs[0].0, "subdir");

    // A second commit of the same tree is a no-op object-wise.
    assert!(!repo.prepare_transaction(None)?);
    let mut root2 = MutableTree::new();
    repo.write_directory_to_mtree(&opendir(src.path())?, &mut root2, None, None)?;
    let root_tree2 = repo.write_mtree(&mut root2, None)?;
    assert_eq!(root_tree2, root_tree);
    let stats = repo.commit_transaction(None)?;
    assert_eq!(stats.content_objects_written, 0);
    assert_eq!(stats.metadata_objects_written, 0);
    Ok(())
}

#[test]
fn test_commit_flow_archive() -> Result<()> {
    let src = tempfile::tempdir()?;
    populate_source_tree(src.path())?;
    let repodir = tempfile::tempdir()?;
    let repo = Repo::init_at(&opendir(repodir.path())?, StorageMode::Archive)?;

    repo.prepare_transaction(None)?;
    let mut root = MutableTree::new();
    repo.write_directory_to_mtree(&opendir(src.path())?, &mut root, None, None)?;
    let root_tree = repo.write_mtree(&mut root, None)?;

    // Content objects land under the archive suffix, as ordinary files
    // even for symlinks.
    let alpha = root.files().get("alpha.conf").unwrap();
    let link = root.files().get("alpha-link").unwrap();
    for csum in [alpha, link] {
        let path = repo.loose_object_path(csum, ObjectType::File);
        assert!(path.ends_with(".filez"));
        let meta = std::fs::symlink_metadata(repodir.path().join("objects").join(&path))?;
        assert!(meta.is_file());
    }
    assert_ne!(root_tree, Checksum::from_bytes(&[0; 32])?);
    repo.commit_transaction(None)?;
    Ok(())
}

#[test]
fn test_hardlink_checkout_roundtrip() -> Result<()> {
    let src = tempfile::tempdir()?;
    populate_source_tree(src.path())?;
    std::fs::set_permissions(
        src.path().join("subdir"),
        std::os::unix::fs::PermissionsExt::from_mode(0o755),
    )?;
    let repodir = tempfile::tempdir()?;
    let repo = Repo::init_at(&opendir(repodir.path())?, StorageMode::Bare)?;

    repo.prepare_transaction(None)?;
    let mut root = MutableTree::new();
    repo.write_directory_to_mtree(&opendir(src.path())?, &mut root, None, None)?;
    let root_tree = repo.write_mtree(&mut root, None)?;
    repo.commit_transaction(None)?;

    // Materialize a checkout by hardlinking the stored objects into a
    // fresh tree with the committed layout. In bare mode the object files
    // are the content.
    let checkout = tempfile::tempdir()?;
    let objects = repodir.path().join("objects");
    for (name, csum) in root.files() {
        let obj = objects.join(repo.loose_object_path(csum, ObjectType::File));
        if std::fs::symlink_metadata(&obj)?.is_symlink() {
            // Symlinks cannot be hardlinked portably; recreate them.
            let target = std::fs::read_link(&obj)?;
            std::os::unix::fs::symlink(target, checkout.path().join(name))?;
        } else {
            std::fs::hard_link(&obj, checkout.path().join(name))?;
        }
    }
    std::fs::create_dir(checkout.path().join("subdir"))?;
    std::fs::set_permissions(
        checkout.path().join("subdir"),
        std::os::unix::fs::PermissionsExt::from_mode(0o755),
    )?;
    let (name, csum) = root
        .subdirs()
        .next()
        .map(|(name, sub)| (name.to_string(), sub.files().get("gamma").unwrap().clone()))
        .unwrap();
    let obj = objects.join(repo.loose_object_path(&csum, ObjectType::File));
    std::fs::hard_link(&obj, checkout.path().join(&name).join("gamma"))?;
    // Two names for one inode: both resolve to the same stored object.
    std::fs::hard_link(&obj, checkout.path().join("gamma-again"))?;

    repo.prepare_transaction(None)?;
    repo.scan_hardlinks(None)?;
    let mut reroot = MutableTree::new();
    repo.write_directory_to_mtree(&opendir(checkout.path())?, &mut reroot, None, None)?;
    let stats = repo.commit_transaction(None)?;

    // Every regular file was satisfied from the devino cache; only the
    // recreated symlink was streamed, and it deduplicated to the stored
    // object.
    assert_eq!(stats.content_objects_total, 1);
    assert_eq!(stats.content_objects_written, 0);

    assert_eq!(
        reroot.files().get("gamma-again"),
        reroot
            .subdirs()
            .next()
            .and_then(|(_, sub)| sub.files().get("gamma"))
    );

    // Dropping the extra hardlink, the re-ingested tree reproduces the
    // committed root tree checksum.
    let mut reroot2 = MutableTree::new();
    std::fs::remove_file(checkout.path().join("gamma-again"))?;
    repo.prepare_transaction(None)?;
    repo.scan_hardlinks(None)?;
    repo.write_directory_to_mtree(&opendir(checkout.path())?, &mut reroot2, None, None)?;
    let reroot_tree = repo.write_mtree(&mut reroot2, None)?;
    repo.commit_transaction(None)?;
    assert_eq!(reroot_tree, root_tree);
    Ok(())
}

#[test]
fn test_parent_repo_hardlinks() -> Result<()> {
    let parentdir = tempfile::tempdir()?;
    let parent = Repo::init_at(&opendir(parentdir.path())?, StorageMode::Bare)?;
    let src = tempfile::tempdir()?;
    std::fs::write(src.path().join("shared"), b"shared contents\n")?;

    parent.prepare_transaction(None)?;
    let mut root = MutableTree::new();
    parent.write_directory_to_mtree(&opendir(src.path())?, &mut root, None, None)?;
    parent.commit_transaction(None)?;
    let shared = root.files().get("shared").unwrap().clone();
    let obj = parentdir
        .path()
        .join("objects")
        .join(parent.loose_object_path(&shared, ObjectType::File));

    let childdir = tempfile::tempdir()?;
    let mut child = Repo::init_at(&opendir(childdir.path())?, StorageMode::Bare)?;
    child.set_parent(parent);

    // A tree hardlinked against the parent's objects is ingested without
    // re-hashing.
    let checkout = tempfile::tempdir()?;
    std::fs::hard_link(&obj, checkout.path().join("shared"))?;
    child.prepare_transaction(None)?;
    child.scan_hardlinks(None)?;
    let mut reroot = MutableTree::new();
    child.write_directory_to_mtree(&opendir(checkout.path())?, &mut reroot, None, None)?;
    assert_eq!(reroot.files().get("shared"), Some(&shared));
    let stats = child.commit_transaction(None)?;
    assert_eq!(stats.content_objects_total, 0);
    Ok(())
}

#[test]
fn test_archive_decompress_rehash() -> Result<()> {
    let src = tempfile::tempdir()?;
    std::fs::write(src.path().join("data"), vec![0x42u8; 8192])?;
    let repodir = tempfile::tempdir()?;
    let repo = Repo::init_at(&opendir(repodir.path())?, StorageMode::Archive)?;

    repo.prepare_transaction(None)?;
    let mut root = MutableTree::new();
    repo.write_directory_to_mtree(&opendir(src.path())?, &mut root, None, None)?;
    repo.commit_transaction(None)?;
    let csum = root.files().get("data").unwrap();

    // Reassemble the canonical stream from the stored archive form:
    // length-prefixed header, then the inflated payload.
    let objpath = repodir
        .path()
        .join("objects")
        .join(repo.loose_object_path(csum, ObjectType::File));
    let stored = std::fs::read(objpath)?;
    let mut lenbuf = [0u8; 8];
    lenbuf.copy_from_slice(&stored[..8]);
    let header_len = u64::from_be_bytes(lenbuf) as usize;
    let header = &stored[8..8 + header_len];
    let mut payload = Vec::new();
    flate2::read::DeflateDecoder::new(&stored[8 + header_len..]).read_to_end(&mut payload)?;

    let mut canonical = Vec::new();
    canonical.extend_from_slice(&stored[..8 + header_len]);
    canonical.extend_from_slice(&payload);
    assert_eq!(sha256_hex(&canonical), csum.to_hex());
    assert_eq!(payload, vec![0x42u8; 8192]);

    // And the header records the payload size.
    let header = header.to_vec();
    let aligned = header.try_as_aligned()?;
    let parsed = gv!("(tuuusa(ayay))").cast(aligned);
    let (size, _, _, _, target, _) = parsed.to_tuple();
    assert_eq!(u64::from_be(*size), 8192);
    assert_eq!(target.to_str(), "");
    Ok(())
}

#[test]
fn test_skip_xattrs_modifier() -> Result<()> {
    let src = tempfile::tempdir()?;
    std::fs::write(src.path().join("plain"), b"plain\n")?;
    let repodir = tempfile::tempdir()?;
    let repo = Repo::init_at(&opendir(repodir.path())?, StorageMode::Archive)?;

    repo.prepare_transaction(None)?;
    let modifier = CommitModifier::new(CommitModifierFlags { skip_xattrs: true }, None);
    let mut root = MutableTree::new();
    repo.write_directory_to_mtree(&opendir(src.path())?, &mut root, Some(&modifier), None)?;
    repo.commit_transaction(None)?;
    assert!(root.files().contains_key("plain"));
    Ok(())
}

#[test]
fn test_unsupported_file_type() -> Result<()> {
    let src = tempfile::tempdir()?;
    rustix::fs::mknodat(
        rustix::fs::CWD,
        src.path().join("fifo"),
        rustix::fs::FileType::Fifo,
        rustix::fs::Mode::from_raw_mode(0o644),
        0,
    )?;
    let repodir = tempfile::tempdir()?;
    let repo = Repo::init_at(&opendir(repodir.path())?, StorageMode::Bare)?;
    repo.prepare_transaction(None)?;
    let mut root = MutableTree::new();
    let err = repo
        .write_directory_to_mtree(&opendir(src.path())?, &mut root, None, None)
        .unwrap_err();
    assert!(matches!(err, treerepo::Error::UnsupportedFileType(_)));
    // ...but a filter can skip it.
    let modifier = CommitModifier::new(
        CommitModifierFlags::default(),
        Some(Box::new(|_repo, path, _info| {
            if path == camino::Utf8Path::new("/fifo") {
                CommitFilterResult::Skip
            } else {
                CommitFilterResult::Allow
            }
        })),
    );
    let mut root = MutableTree::new();
    repo.write_directory_to_mtree(&opendir(src.path())?, &mut root, Some(&modifier), None)?;
    assert!(root.files().is_empty());
    repo.abort_transaction(None)?;
    Ok(())
}

#[test]
fn test_control_byte_filename() -> Result<()> {
    let src = tempfile::tempdir()?;
    let name = "weird\u{1}\u{7f}name";
    std::fs::write(src.path().join(name), b"contents\n")?;
    let repodir = tempfile::tempdir()?;
    let repo = Repo::init_at(&opendir(repodir.path())?, StorageMode::Archive)?;
    repo.prepare_transaction(None)?;
    let mut root = MutableTree::new();
    repo.write_directory_to_mtree(&opendir(src.path())?, &mut root, None, None)?;
    let root_tree = repo.write_mtree(&mut root, None)?;
    repo.commit_transaction(None)?;

    // The name survives byte-for-byte through the stored tree.
    let (files, _) = repo.read_dirtree(&root_tree)?;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, name);
    Ok(())
}

#[tokio::test]
async fn test_async_content_write() -> Result<()> {
    let repodir = tempfile::tempdir()?;
    let repo = Arc::new(Repo::init_at(&opendir(repodir.path())?, StorageMode::Archive)?);
    repo.prepare_transaction(None)?;

    let header = treerepo::FileHeader {
        size: 6,
        uid: 0,
        gid: 0,
        mode: libc::S_IFREG | 0o644,
        symlink_target: None,
        xattrs: Vec::new(),
    };
    let (length, mut stream) = treerepo::file_content_stream(&header, &b"hello\n"[..]);
    let mut buf = Vec::new();
    std::io::copy(&mut stream, &mut buf)?;
    let expected = Checksum::from_hex(&sha256_hex(&buf))?;

    let csum = repo.write_content_async(None, buf, length).await?;
    assert_eq!(csum, expected);
    repo.abort_transaction(None)?;
    Ok(())
}

#[test]
fn test_cancellation_mid_walk() -> Result<()> {
    let src = tempfile::tempdir()?;
    populate_source_tree(src.path())?;
    let repodir = tempfile::tempdir()?;
    let repo = Repo::init_at(&opendir(repodir.path())?, StorageMode::Bare)?;
    repo.prepare_transaction(None)?;
    let cancellable = Cancellable::new();
    cancellable.cancel();
    let mut root = MutableTree::new();
    let err = repo
        .write_directory_to_mtree(&opendir(src.path())?, &mut root, None, Some(&cancellable))
        .unwrap_err();
    assert!(matches!(err, treerepo::Error::Cancelled));
    // The transaction survives cancellation and aborts cleanly.
    repo.abort_transaction(None)?;
    assert!(!repodir.path().join("transaction").exists());
    Ok(())
}
