//! Content digests used as blob store keys.

use data_encoding::BASE64;
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Length of a SHA-1 digest in bytes.
pub const KEY_LEN: usize = 20;

/// SHA-1 digest of a blob's plaintext. Equality and hashing are by bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey([u8; KEY_LEN]);

impl BlobKey {
    /// Digest of `data`.
    pub fn for_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    /// Finish an incremental hash.
    pub fn from_hasher(hasher: Sha1) -> Self {
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse 40 hex characters (either case).
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Upper-case hex, as used in blob file names.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// CouchDB attachment digest form: `sha1-<base64>`.
    pub fn digest_string(&self) -> String {
        format!("sha1-{}", BASE64.encode(&self.0))
    }

    /// Parse a `sha1-<base64>` attachment digest.
    pub fn from_digest_string(digest: &str) -> Option<Self> {
        let encoded = digest.strip_prefix("sha1-")?;
        let bytes = BASE64.decode(encoded.as_bytes()).ok()?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({})", self.to_hex())
    }
}

impl FromStr for BlobKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| format!("not a blob key: {s:?}"))
    }
}
