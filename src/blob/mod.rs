// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content-addressable attachment storage.
//!
//! Every blob lives at `<store>/<HEX-SHA1>.blob`, named by the SHA-1 of its
//! plaintext. When the store has an [`EncryptionKey`] the file content is
//! sealed (see [`crypto`]), otherwise it is the raw bytes.
//!
//! # Write Protocol
//!
//! ```text
//! bytes ──▶ tmpXXXX.blobtmp (hash + seal while streaming)
//!                │
//!                ├── <key>.blob absent  ──▶ link into place (atomic)
//!                └── <key>.blob present ──▶ discard temp (dedup)
//! ```
//!
//! No reader can ever observe a partially written `.blob` file. Two writers
//! racing on the same content both succeed; the first link wins and the
//! content is identical by construction.
//!
//! # Failure Semantics
//!
//! Fetch failures (missing file, unreadable file, failed authentication)
//! all surface as [`CoreError::NotFound`]: the caller cannot serve the blob
//! either way. Garbage collection logs and skips individual delete errors.

pub mod crypto;
mod key;

pub use crypto::EncryptionKey;
pub use key::{BlobKey, KEY_LEN};

use crate::error::{CoreError, Result};
use crate::metrics;
use crypto::{ContentReader, ContentWriter};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Suffix of finished blob files.
pub const FILE_EXTENSION: &str = "blob";
const TMP_FILE_PREFIX: &str = "tmp";
const TMP_FILE_EXTENSION: &str = ".blobtmp";
const TEMP_DIR_NAME: &str = "temp_attachments";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A streaming reader over one blob's plaintext.
pub type BlobReader = ContentReader<BufReader<File>>;

/// Directory of content-addressed blobs.
pub struct BlobStore {
    path: PathBuf,
    key: RwLock<Option<EncryptionKey>>,
}

impl BlobStore {
    /// Open (creating if needed) a store rooted at `path`.
    pub fn open(path: impl AsRef<Path>, key: Option<EncryptionKey>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        match fs::metadata(&path) {
            Ok(meta) if !meta.is_dir() => {
                return Err(CoreError::Config(format!(
                    "Blob store path is not a directory: {}",
                    path.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&path).map_err(|e| CoreError::blob_io(&path, e))?;
            }
            Err(e) => return Err(CoreError::blob_io(&path, e)),
        }
        debug!(path = %path.display(), encrypted = key.is_some(), "Opened blob store");
        Ok(Self {
            path,
            key: RwLock::new(key),
        })
    }

    /// Digest of `data`; deterministic and pure.
    pub fn key_for(data: &[u8]) -> BlobKey {
        BlobKey::for_bytes(data)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final location of the blob for `key`.
    pub fn path_for_key(&self, key: &BlobKey) -> PathBuf {
        self.path.join(format!("{}.{}", key.to_hex(), FILE_EXTENSION))
    }

    pub fn is_encrypted(&self) -> bool {
        self.current_key().is_some()
    }

    fn current_key(&self) -> Option<EncryptionKey> {
        match self.key.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_key(&self, key: Option<EncryptionKey>) {
        match self.key.write() {
            Ok(mut guard) => *guard = key,
            Err(poisoned) => *poisoned.into_inner() = key,
        }
    }

    /// Store `data`, returning its key. Existing content is not rewritten.
    pub fn store(&self, data: &[u8]) -> Result<BlobKey> {
        let key = Self::key_for(data);
        if self.path_for_key(&key).exists() {
            metrics::record_blob_write(data.len() as u64, true);
            return Ok(key);
        }
        let mut writer = self.writer()?;
        writer.append(data)?;
        writer.install()
    }

    /// Store everything `reader` yields without holding it all in memory.
    pub fn store_stream<R: Read>(&self, mut reader: R) -> Result<BlobKey> {
        let mut writer = self.writer()?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CoreError::blob_io(writer.temp_path(), e)),
            };
            writer.append(&buf[..n])?;
        }
        writer.install()
    }

    /// Start an incremental write.
    pub fn writer(&self) -> Result<BlobStoreWriter<'_>> {
        BlobStoreWriter::new(self)
    }

    /// Full plaintext of a blob.
    pub fn fetch(&self, key: &BlobKey) -> Result<Vec<u8>> {
        let mut reader = self.fetch_stream(key)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).map_err(|e| {
            warn!(key = %key, error = %e, "Failed to read blob");
            CoreError::NotFound(format!("blob {key}"))
        })?;
        Ok(out)
    }

    /// Streaming access to a blob's plaintext.
    pub fn fetch_stream(&self, key: &BlobKey) -> Result<BlobReader> {
        let path = self.path_for_key(key);
        let file = File::open(&path).map_err(|e| {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to open blob");
            }
            CoreError::NotFound(format!("blob {key}"))
        })?;
        let key_guard = self.current_key();
        ContentReader::new(key_guard.as_ref(), BufReader::new(file)).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to open sealed blob");
            CoreError::NotFound(format!("blob {key}"))
        })
    }

    /// Plaintext size of a blob, if present.
    pub fn size_of_blob(&self, key: &BlobKey) -> Option<u64> {
        let len = fs::metadata(self.path_for_key(key)).ok()?.len();
        if self.is_encrypted() {
            crypto::plaintext_len(len)
        } else {
            Some(len)
        }
    }

    /// Whether the blob's plaintext starts with the gzip magic number.
    pub fn is_gzipped(&self, key: &BlobKey) -> bool {
        let Ok(mut reader) = self.fetch_stream(key) else {
            return false;
        };
        let mut magic = [0u8; 2];
        match reader.read_exact(&mut magic) {
            Ok(()) => magic == GZIP_MAGIC,
            Err(_) => false,
        }
    }

    /// Keys of every finished blob.
    pub fn all_keys(&self) -> Result<Vec<BlobKey>> {
        let entries = fs::read_dir(&self.path).map_err(|e| CoreError::blob_io(&self.path, e))?;
        let mut keys = Vec::new();
        for entry in entries.flatten() {
            if let Some(key) = key_from_file_name(&entry.path()) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn count(&self) -> usize {
        self.all_keys().map(|k| k.len()).unwrap_or(0)
    }

    /// Bytes on disk used by finished blobs.
    pub fn total_data_size(&self) -> u64 {
        let Ok(keys) = self.all_keys() else {
            return 0;
        };
        keys.iter()
            .filter_map(|k| fs::metadata(self.path_for_key(k)).ok())
            .map(|m| m.len())
            .sum()
    }

    /// Delete every blob whose key is not in `keep`. Returns the count deleted.
    pub fn delete_blobs_except(&self, keep: &HashSet<BlobKey>) -> usize {
        let keys = match self.all_keys() {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Cannot list blob store for garbage collection");
                return 0;
            }
        };

        let mut deleted = 0;
        let mut errors = 0;
        for key in keys.iter().filter(|k| !keep.contains(k)) {
            let path = self.path_for_key(key);
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => {
                    errors += 1;
                    error!(path = %path.display(), error = %e, "Cannot delete unused blob");
                }
            }
        }

        metrics::record_blob_gc(deleted, errors);
        info!(deleted, kept = keep.len(), errors, "Blob garbage collection complete");
        deleted
    }

    /// Scratch directory for in-progress attachment work.
    pub fn temp_dir(&self) -> Result<PathBuf> {
        let dir = self.path.join(TEMP_DIR_NAME);
        fs::create_dir_all(&dir).map_err(|e| CoreError::blob_io(&dir, e))?;
        Ok(dir)
    }

    /// Rewrite every blob under `new_key` (`None` decrypts the store).
    ///
    /// Blobs are copied into a sibling directory first; the original is only
    /// replaced once every blob has been rewritten and verified. Any failure
    /// leaves the original store untouched and is returned as fatal.
    pub fn re_encrypt_all(&self, new_key: Option<EncryptionKey>) -> Result<()> {
        let dir_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| CoreError::Config("blob store path has no name".into()))?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let staging = parent.join(format!("dbtmp_{dir_name}"));
        let retired = parent.join(format!("dbold_{dir_name}"));

        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| CoreError::blob_io(&staging, e))?;
        }

        let keys = self.all_keys()?;
        info!(
            blobs = keys.len(),
            encrypt = new_key.is_some(),
            "Re-encrypting blob store"
        );

        let copy_result = (|| -> Result<()> {
            let target = BlobStore::open(&staging, new_key.clone())?;
            for key in &keys {
                let reader = self.fetch_stream(key)?;
                let written = target.store_stream(reader)?;
                if written != *key {
                    return Err(CoreError::Encryption(format!(
                        "blob {key} re-encrypted to a different digest {written}"
                    )));
                }
            }
            Ok(())
        })();

        if let Err(e) = copy_result {
            error!(error = %e, "Re-encryption failed; original store left in place");
            let _ = fs::remove_dir_all(&staging);
            return Err(CoreError::Encryption(format!("re-encryption failed: {e}")));
        }

        fs::rename(&self.path, &retired).map_err(|e| CoreError::blob_io(&self.path, e))?;
        if let Err(e) = fs::rename(&staging, &self.path) {
            // Put the original back before reporting.
            let _ = fs::rename(&retired, &self.path);
            return Err(CoreError::blob_io(&staging, e));
        }
        if let Err(e) = fs::remove_dir_all(&retired) {
            warn!(path = %retired.display(), error = %e, "Could not remove retired blob directory");
        }

        self.set_key(new_key);
        Ok(())
    }
}

fn key_from_file_name(path: &Path) -> Option<BlobKey> {
    if path.extension()? != FILE_EXTENSION {
        return None;
    }
    BlobKey::from_hex(&path.file_stem()?.to_string_lossy())
}

// =============================================================================
// Incremental writer
// =============================================================================

/// Builds one blob incrementally in a temp file inside the store.
///
/// Dropping the writer without calling [`install`](Self::install) removes
/// the temp file.
pub struct BlobStoreWriter<'a> {
    store: &'a BlobStore,
    out: ContentWriter<NamedTempFile>,
    temp_path: PathBuf,
    hasher: Sha1,
    length: u64,
}

impl<'a> BlobStoreWriter<'a> {
    fn new(store: &'a BlobStore) -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix(TMP_FILE_PREFIX)
            .suffix(TMP_FILE_EXTENSION)
            .tempfile_in(&store.path)
            .map_err(|e| CoreError::blob_io(&store.path, e))?;
        let temp_path = temp.path().to_path_buf();
        let key = store.current_key();
        let out =
            ContentWriter::new(key.as_ref(), temp).map_err(|e| CoreError::blob_io(&temp_path, e))?;
        Ok(Self {
            store,
            out,
            temp_path,
            hasher: Sha1::new(),
            length: 0,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Append plaintext.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.length += data.len() as u64;
        self.out
            .write_all(data)
            .map_err(|e| CoreError::blob_io(&self.temp_path, e))
    }

    /// Plaintext bytes appended so far.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Key the content appended so far would get.
    pub fn key(&self) -> BlobKey {
        BlobKey::from_hasher(self.hasher.clone())
    }

    /// Attachment digest (`sha1-<base64>`) of the content so far.
    pub fn digest_string(&self) -> String {
        self.key().digest_string()
    }

    /// Finish the temp file and move it into place (or discard it as a duplicate).
    pub fn install(self) -> Result<BlobKey> {
        let key = BlobKey::from_hasher(self.hasher);
        let temp = self
            .out
            .finish()
            .map_err(|e| CoreError::blob_io(&self.temp_path, e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| CoreError::blob_io(&self.temp_path, e))?;

        let final_path = self.store.path_for_key(&key);
        match temp.persist_noclobber(&final_path) {
            Ok(_) => {
                metrics::record_blob_write(self.length, false);
                debug!(key = %key, bytes = self.length, "Stored blob");
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                // Dropping the returned temp file deletes it.
                drop(e.file);
                metrics::record_blob_write(self.length, true);
                debug!(key = %key, "Blob already stored, discarded duplicate");
            }
            Err(e) => return Err(CoreError::blob_io(&final_path, e.error)),
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_store_and_fetch() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("att"), None).unwrap();

        let key = store.store(b"hello blob").unwrap();
        assert_eq!(key, BlobStore::key_for(b"hello blob"));
        assert_eq!(store.fetch(&key).unwrap(), b"hello blob");
        assert!(store.path_for_key(&key).exists());
        assert_eq!(store.size_of_blob(&key), Some(10));
    }

    #[test]
    fn test_store_twice_is_deduplicated() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();

        let k1 = store.store(b"same").unwrap();
        let k2 = store.store(b"same").unwrap();
        let k3 = store.store_stream(&b"same"[..]).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1, k3);
        assert_eq!(store.count(), 1);
        // No temp files left behind.
        assert_eq!(file_count(dir.path()), 1);
    }

    #[test]
    fn test_fetch_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();
        let err = store.fetch(&BlobKey::for_bytes(b"nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_encrypted_store_hides_plaintext() {
        let dir = tempdir().unwrap();
        let key = EncryptionKey::from_password("letmein");
        let store = BlobStore::open(dir.path(), Some(key)).unwrap();

        let blob_key = store.store(b"top secret attachment").unwrap();
        let raw = fs::read(store.path_for_key(&blob_key)).unwrap();
        assert!(!raw.windows(10).any(|w| w == b"top secret"));
        assert_eq!(store.fetch(&blob_key).unwrap(), b"top secret attachment");
        assert_eq!(store.size_of_blob(&blob_key), Some(21));
    }

    #[test]
    fn test_wrong_password_reads_as_not_found() {
        let dir = tempdir().unwrap();
        let blob_key = {
            let store =
                BlobStore::open(dir.path(), Some(EncryptionKey::from_password("a"))).unwrap();
            store.store(b"data").unwrap()
        };
        let store = BlobStore::open(dir.path(), Some(EncryptionKey::from_password("b"))).unwrap();
        assert!(store.fetch(&blob_key).unwrap_err().is_not_found());
    }

    #[test]
    fn test_fetch_stream_large_blob() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), Some(EncryptionKey::random())).unwrap();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();

        let key = store.store_stream(&data[..]).unwrap();
        let mut reader = store.fetch_stream(&key).unwrap();
        let mut first = [0u8; 1000];
        reader.read_exact(&mut first).unwrap();
        assert_eq!(&first[..], &data[..1000]);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len(), data.len() - 1000);
    }

    #[test]
    fn test_is_gzipped() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), Some(EncryptionKey::random())).unwrap();
        let gz = store.store(&[0x1f, 0x8b, 0x08, 0x00]).unwrap();
        let plain = store.store(b"plain text").unwrap();
        let tiny = store.store(b"x").unwrap();
        assert!(store.is_gzipped(&gz));
        assert!(!store.is_gzipped(&plain));
        assert!(!store.is_gzipped(&tiny));
        assert!(!store.is_gzipped(&BlobKey::for_bytes(b"absent")));
    }

    #[test]
    fn test_delete_blobs_except_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();
        let keep = store.store(b"keep me").unwrap();
        store.store(b"drop me").unwrap();
        store.store(b"drop me too").unwrap();

        let keep_set: HashSet<BlobKey> = [keep].into_iter().collect();
        assert_eq!(store.delete_blobs_except(&keep_set), 2);
        assert_eq!(store.delete_blobs_except(&keep_set), 0);
        assert_eq!(store.all_keys().unwrap(), vec![keep]);
    }

    #[test]
    fn test_all_keys_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();
        let key = store.store(b"one").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("NOTHEX.blob"), b"x").unwrap();
        store.temp_dir().unwrap();
        assert_eq!(store.all_keys().unwrap(), vec![key]);
        assert_eq!(store.total_data_size(), 3);
    }

    #[test]
    fn test_writer_reports_key_and_length() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();
        let mut writer = store.writer().unwrap();
        writer.append(b"part one, ").unwrap();
        writer.append(b"part two").unwrap();
        assert_eq!(writer.length(), 18);
        let expected = writer.key();
        assert_eq!(writer.digest_string(), BlobKey::for_bytes(b"part one, part two").digest_string());
        assert_eq!(writer.install().unwrap(), expected);
        assert_eq!(store.fetch(&expected).unwrap(), b"part one, part two");
    }

    #[test]
    fn test_dropped_writer_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path(), None).unwrap();
        {
            let mut writer = store.writer().unwrap();
            writer.append(b"abandoned").unwrap();
        }
        assert_eq!(file_count(dir.path()), 0);
    }

    #[test]
    fn test_re_encrypt_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("attachments");
        let store = BlobStore::open(&path, None).unwrap();
        let k1 = store.store(b"first").unwrap();
        let k2 = store.store(b"second").unwrap();

        let key = EncryptionKey::from_password("new");
        store.re_encrypt_all(Some(key.clone())).unwrap();
        assert!(store.is_encrypted());
        assert_eq!(store.fetch(&k1).unwrap(), b"first");
        let raw = fs::read(store.path_for_key(&k2)).unwrap();
        assert_ne!(raw, b"second");

        // A fresh handle with the new key reads everything.
        let reopened = BlobStore::open(&path, Some(key)).unwrap();
        assert_eq!(reopened.fetch(&k2).unwrap(), b"second");

        // And back to plaintext.
        store.re_encrypt_all(None).unwrap();
        assert_eq!(fs::read(store.path_for_key(&k2)).unwrap(), b"second");
        assert!(!dir.path().join("dbtmp_attachments").exists());
        assert!(!dir.path().join("dbold_attachments").exists());
    }

    #[test]
    fn test_re_encrypt_failure_leaves_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("attachments");
        let store = BlobStore::open(&path, None).unwrap();
        let good = store.store(b"good").unwrap();
        // A file whose content does not match its name.
        let bogus = BlobKey::for_bytes(b"expected");
        fs::write(store.path_for_key(&bogus), b"actual").unwrap();

        let err = store
            .re_encrypt_all(Some(EncryptionKey::random()))
            .unwrap_err();
        assert!(matches!(err, CoreError::Encryption(_)));
        assert!(!store.is_encrypted());
        assert_eq!(store.fetch(&good).unwrap(), b"good");
        assert!(!dir.path().join("dbtmp_attachments").exists());
    }
}
