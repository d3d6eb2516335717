use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest as _, Sha256};

/// SHA-256 digest of a file's contents or a symlink's target
///
/// directories and no-entry records carry no digest at all, so equality of
/// `Option<Digest>` is the data comparison used everywhere.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// digest of an in-memory buffer
    pub fn of_bytes(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    /// digest of a regular file's contents
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut fh = File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut fh, &mut hasher)?;
        Ok(Self(hasher.finalize().into()))
    }

    /// digest of a symlink's target string (the link is not followed)
    pub fn of_symlink(path: &Path) -> io::Result<Self> {
        let target = std::fs::read_link(path)?;
        Ok(Self::of_bytes(target.as_os_str().as_encoded_bytes()))
    }

    /// rebuild from a catalog blob; anything but 32 bytes is rejected
    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = blob.try_into().ok()?;
        Some(Self(arr))
    }

    /// raw bytes for catalog storage
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}
