//! The SHA-256 checksums which name objects.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use openssl::hash::{Hasher, MessageDigest};

use crate::{Error, IoContext, Result};

/// A SHA-256 checksum over the canonical serialization of an object.
///
/// Stored as the raw 32 bytes; the 64-character lowercase hex form (used in
/// object file names and refs) is available via [`std::fmt::Display`] and
/// [`Checksum::to_hex`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Parse a 64-character lowercase hex checksum.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::Precondition("invalid checksum length"));
        }
        // Reject uppercase; hex::decode would accept it and the repository
        // only ever names objects in lowercase.
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::Precondition("invalid checksum character"));
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(s, &mut buf)
            .map_err(|_| Error::Precondition("invalid checksum"))?;
        Ok(Self(buf))
    }

    /// Construct from raw digest bytes; must be exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let buf: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Precondition("invalid checksum length"))?;
        Ok(Self(buf))
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The 64-character lowercase hex form.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reusable stack buffer to avoid a heap allocation per render.
        let mut hexbuf = [0u8; 64];
        hex::encode_to_slice(self.0, &mut hexbuf).expect("hex buffer size");
        f.write_str(std::str::from_utf8(&hexbuf).expect("hex is ASCII"))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({self})")
    }
}

impl FromStr for Checksum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// SHA-256 of a complete in-memory buffer.
#[cfg(test)]
pub(crate) fn sha256_digest(data: &[u8]) -> Result<Checksum> {
    let digest =
        openssl::hash::hash(MessageDigest::sha256(), data).io_context("Hashing object")?;
    Checksum::from_bytes(&digest)
}

/// A reader adapter feeding everything read into a SHA-256 engine.
pub(crate) struct HashingReader<'a> {
    inner: &'a mut dyn Read,
    hasher: Hasher,
}

impl<'a> HashingReader<'a> {
    pub(crate) fn new(inner: &'a mut dyn Read) -> Result<Self> {
        let hasher = Hasher::new(MessageDigest::sha256()).io_context("Creating SHA-256 hasher")?;
        Ok(Self { inner, hasher })
    }

    /// Consume the reader, returning the digest of all bytes read so far.
    pub(crate) fn finish(mut self) -> Result<Checksum> {
        let digest = self.hasher.finish().io_context("Finishing SHA-256")?;
        Checksum::from_bytes(&digest)
    }
}

impl Read for HashingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher
            .update(&buf[..n])
            .map_err(std::io::Error::other)?;
        Ok(n)
    }
}
