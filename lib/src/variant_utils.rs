//! Canonical serialization of repository objects.
//!
//! Objects are hashed and stored in GVariant normal form. The builders here
//! emit that form directly for the fixed set of object signatures (see
//! [`crate::objgv`]); parsing goes through the `gvariant` crate's typed
//! casts. Integer fields are big-endian on the wire, so writers swap values
//! before serialization and readers apply `from_be` after the cast.
//! Container framing (offsets) is standard GVariant little-endian.

use crate::Checksum;

/// An extended attribute pair. The name carries its trailing NUL byte, the
/// convention used throughout the serialized form.
pub(crate) type Xattr = (Vec<u8>, Vec<u8>);

/// The number of bytes used for framing offsets in a container whose body
/// is `body_len` bytes and which stores `n_offsets` offsets.
fn framing_offset_size(body_len: usize, n_offsets: usize) -> usize {
    for width in [1usize, 2, 4] {
        if body_len + width * n_offsets < (1usize << (8 * width)) {
            return width;
        }
    }
    8
}

fn push_offset(buf: &mut Vec<u8>, value: usize, width: usize) {
    buf.extend_from_slice(&value.to_le_bytes()[..width]);
}

/// Serialize an array of variable-width elements with alignment 1
/// (everything we store in arrays: `(say)`, `(ayay)`, `(sayay)`).
fn var_array(elements: &[Vec<u8>]) -> Vec<u8> {
    if elements.is_empty() {
        return Vec::new();
    }
    let mut body = Vec::new();
    let mut ends = Vec::with_capacity(elements.len());
    for element in elements {
        body.extend_from_slice(element);
        ends.push(body.len());
    }
    let width = framing_offset_size(body.len(), ends.len());
    for end in ends {
        push_offset(&mut body, end, width);
    }
    body
}

/// Incremental writer for one tuple value. Members are appended in order;
/// each variable-width member except the last records a framing offset,
/// stored at the end in reverse member order.
struct TupleWriter {
    body: Vec<u8>,
    ends: Vec<usize>,
}

impl TupleWriter {
    fn new() -> Self {
        Self {
            body: Vec::new(),
            ends: Vec::new(),
        }
    }

    fn pad(&mut self, align: usize) {
        while self.body.len() % align != 0 {
            self.body.push(0);
        }
    }

    fn fixed(&mut self, align: usize, bytes: &[u8]) {
        self.pad(align);
        self.body.extend_from_slice(bytes);
    }

    fn variable(&mut self, align: usize, bytes: &[u8]) {
        self.pad(align);
        self.body.extend_from_slice(bytes);
        self.ends.push(self.body.len());
    }

    fn finish(mut self, align: usize, bytes: &[u8]) -> Vec<u8> {
        self.pad(align);
        self.body.extend_from_slice(bytes);
        let width = framing_offset_size(self.body.len(), self.ends.len());
        let ends = std::mem::take(&mut self.ends);
        for end in ends.into_iter().rev() {
            push_offset(&mut self.body, end, width);
        }
        self.body
    }
}

fn gv_string(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(s.len() + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    buf
}

/// `a(ayay)`, used for extended attributes. Callers supply the list
/// already sorted by name.
fn xattrs_array(xattrs: &[Xattr]) -> Vec<u8> {
    let elements: Vec<Vec<u8>> = xattrs
        .iter()
        .map(|(name, value)| {
            let mut t = TupleWriter::new();
            t.variable(1, name);
            t.finish(1, value)
        })
        .collect();
    var_array(&elements)
}

/// Serialize a DIRMETA object: `(a{sv}uuua(ayay))`. The metadata dict is
/// always empty today.
pub(crate) fn dirmeta_variant(uid: u32, gid: u32, mode: u32, xattrs: &[Xattr]) -> Vec<u8> {
    let mut t = TupleWriter::new();
    t.variable(8, &[]); // a{sv}
    t.fixed(4, &uid.to_be_bytes());
    t.fixed(4, &gid.to_be_bytes());
    t.fixed(4, &mode.to_be_bytes());
    t.finish(1, &xattrs_array(xattrs))
}

/// Serialize a DIRTREE object: `(a(say)a(sayay))`. Both lists must already
/// be sorted by name ascending; the serialization is then deterministic.
pub(crate) fn dirtree_variant(
    files: &[(String, Checksum)],
    dirs: &[(String, Checksum, Checksum)],
) -> Vec<u8> {
    let file_elements: Vec<Vec<u8>> = files
        .iter()
        .map(|(name, csum)| {
            let mut t = TupleWriter::new();
            t.variable(1, &gv_string(name));
            t.finish(1, csum.as_bytes())
        })
        .collect();
    let dir_elements: Vec<Vec<u8>> = dirs
        .iter()
        .map(|(name, contents_csum, meta_csum)| {
            let mut t = TupleWriter::new();
            t.variable(1, &gv_string(name));
            t.variable(1, contents_csum.as_bytes());
            t.finish(1, meta_csum.as_bytes())
        })
        .collect();
    let mut t = TupleWriter::new();
    t.variable(1, &var_array(&file_elements));
    t.finish(1, &var_array(&dir_elements))
}

/// Serialize a COMMIT object: `(a{sv}aya(say)sstayay)` with an empty
/// metadata dict and empty signature list.
pub(crate) fn commit_variant(
    parent: Option<&Checksum>,
    subject: &str,
    body: &str,
    timestamp: u64,
    root_tree: &Checksum,
    root_meta: &Checksum,
) -> Vec<u8> {
    let mut t = TupleWriter::new();
    t.variable(8, &[]); // a{sv}
    let parent_bytes = parent.map(|c| c.as_bytes().as_slice()).unwrap_or(&[]);
    t.variable(1, parent_bytes);
    t.variable(1, &[]); // a(say) signatures
    t.variable(1, &gv_string(subject));
    t.variable(1, &gv_string(body));
    t.fixed(8, &timestamp.to_be_bytes());
    t.variable(1, root_tree.as_bytes());
    t.finish(1, root_meta.as_bytes())
}

/// Serialize the attribute header of a content object:
/// `(tuuusa(ayay))` = (size, uid, gid, mode, symlink target, xattrs).
/// `mode` carries the full `st_mode` including the format bits; regular
/// files use an empty target string.
pub(crate) fn file_header_variant(
    size: u64,
    uid: u32,
    gid: u32,
    mode: u32,
    symlink_target: &str,
    xattrs: &[Xattr],
) -> Vec<u8> {
    let mut t = TupleWriter::new();
    t.fixed(8, &size.to_be_bytes());
    t.fixed(4, &uid.to_be_bytes());
    t.fixed(4, &gid.to_be_bytes());
    t.fixed(4, &mode.to_be_bytes());
    t.variable(1, &gv_string(symlink_target));
    t.finish(1, &xattrs_array(xattrs))
}
