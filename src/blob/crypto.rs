//! At-rest encryption for blob files.
//!
//! Encrypted blobs use a chunked secret-box format so that both writing and
//! reading can stream:
//!
//! ```text
//! ┌────────┬──────────────┬───────────────────┬─────┬──────────────────┐
//! │ "CLB1" │ nonce prefix │ frame 0           │ ... │ final frame      │
//! │ 4 B    │ 19 B         │ 64 KiB + 16 B tag │     │ < 64 KiB + 16 B  │
//! └────────┴──────────────┴───────────────────┴─────┴──────────────────┘
//! ```
//!
//! Frame `i` is sealed with XSalsa20-Poly1305 under the nonce
//! `prefix || be32(i) || last_flag`. The final frame always holds fewer than
//! `CHUNK_SIZE` plaintext bytes (possibly zero), so a reader knows it has
//! seen the end, and truncation or reordering fails authentication.
//!
//! A cipher instance is built for every reader and writer and never shared.

use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Write};

/// Plaintext bytes per frame.
pub const CHUNK_SIZE: usize = 64 * 1024;
const TAG_SIZE: usize = 16;
const MAGIC: &[u8; 4] = b"CLB1";
const PREFIX_SIZE: usize = 19;
const HEADER_SIZE: usize = MAGIC.len() + PREFIX_SIZE;
const FRAME_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

/// 256-bit symmetric key for the blob store.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a key from a store password.
    pub fn from_password(password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"couchlite-blob-store\0");
        hasher.update(password.as_bytes());
        Self(hasher.finalize().into())
    }

    /// A fresh random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn cipher(&self) -> io::Result<XSalsa20Poly1305> {
        XSalsa20Poly1305::new_from_slice(&self.0)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad key length"))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

fn frame_nonce(prefix: &[u8; PREFIX_SIZE], counter: u32, last: bool) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..PREFIX_SIZE].copy_from_slice(prefix);
    nonce[PREFIX_SIZE..PREFIX_SIZE + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[23] = u8::from(last);
    nonce
}

/// Plaintext length of a sealed file of `file_len` bytes.
pub fn plaintext_len(file_len: u64) -> Option<u64> {
    let body = file_len.checked_sub(HEADER_SIZE as u64)?;
    let full = body / FRAME_SIZE as u64;
    let rest = body % FRAME_SIZE as u64;
    let last = rest.checked_sub(TAG_SIZE as u64)?;
    Some(full * CHUNK_SIZE as u64 + last)
}

// =============================================================================
// Writing
// =============================================================================

/// Streams plaintext into sealed frames on `inner`.
pub struct SealingWriter<W: Write> {
    inner: W,
    cipher: XSalsa20Poly1305,
    prefix: [u8; PREFIX_SIZE],
    counter: u32,
    buf: Vec<u8>,
}

impl<W: Write> SealingWriter<W> {
    /// Writes the header immediately.
    pub fn new(key: &EncryptionKey, mut inner: W) -> io::Result<Self> {
        let mut prefix = [0u8; PREFIX_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut prefix);
        inner.write_all(MAGIC)?;
        inner.write_all(&prefix)?;
        Ok(Self {
            inner,
            cipher: key.cipher()?,
            prefix,
            counter: 0,
            buf: Vec::with_capacity(CHUNK_SIZE),
        })
    }

    fn seal_frame(&mut self, last: bool) -> io::Result<()> {
        let nonce = frame_nonce(&self.prefix, self.counter, last);
        let sealed = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), self.buf.as_slice())
            .map_err(|_| io::Error::other("blob encryption failed"))?;
        self.inner.write_all(&sealed)?;
        self.buf.clear();
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| io::Error::other("blob too large to encrypt"))?;
        Ok(())
    }

    /// Seal the final frame and hand back the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        if self.buf.len() == CHUNK_SIZE {
            self.seal_frame(false)?;
        }
        self.seal_frame(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for SealingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut offset = 0;
        while offset < data.len() {
            if self.buf.len() == CHUNK_SIZE {
                self.seal_frame(false)?;
            }
            let take = (CHUNK_SIZE - self.buf.len()).min(data.len() - offset);
            self.buf.extend_from_slice(&data[offset..offset + take]);
            offset += take;
        }
        Ok(data.len())
    }

    // Frames are only sealed when full or on finish().
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// =============================================================================
// Reading
// =============================================================================

/// Opens sealed frames from `inner` and yields plaintext.
pub struct OpeningReader<R: Read> {
    inner: R,
    cipher: XSalsa20Poly1305,
    prefix: [u8; PREFIX_SIZE],
    counter: u32,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> OpeningReader<R> {
    /// Reads and checks the header immediately.
    pub fn new(key: &EncryptionKey, mut inner: R) -> io::Result<Self> {
        let mut header = [0u8; HEADER_SIZE];
        inner.read_exact(&mut header)?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not an encrypted blob",
            ));
        }
        let mut prefix = [0u8; PREFIX_SIZE];
        prefix.copy_from_slice(&header[MAGIC.len()..]);
        Ok(Self {
            inner,
            cipher: key.cipher()?,
            prefix,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    fn open_next_frame(&mut self) -> io::Result<()> {
        let mut frame = vec![0u8; FRAME_SIZE];
        let mut filled = 0;
        while filled < FRAME_SIZE {
            let n = self.inner.read(&mut frame[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < TAG_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "encrypted blob is truncated",
            ));
        }
        frame.truncate(filled);
        let last = filled < FRAME_SIZE;
        let nonce = frame_nonce(&self.prefix, self.counter, last);
        self.plain = self
            .cipher
            .decrypt(GenericArray::from_slice(&nonce), frame.as_slice())
            .map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "blob authentication failed")
            })?;
        self.pos = 0;
        self.counter = self.counter.wrapping_add(1);
        self.done = last;
        Ok(())
    }
}

impl<R: Read> Read for OpeningReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.open_next_frame()?;
        }
        let n = (self.plain.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// =============================================================================
// Plain-or-sealed wrappers
// =============================================================================

/// Writer used by the blob store: sealed when a key is configured.
pub enum ContentWriter<W: Write> {
    Plain(W),
    Sealed(SealingWriter<W>),
}

impl<W: Write> ContentWriter<W> {
    pub fn new(key: Option<&EncryptionKey>, inner: W) -> io::Result<Self> {
        match key {
            Some(key) => Ok(Self::Sealed(SealingWriter::new(key, inner)?)),
            None => Ok(Self::Plain(inner)),
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Self::Sealed(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for ContentWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(data),
            Self::Sealed(w) => w.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Sealed(w) => w.flush(),
        }
    }
}

/// Reader used by the blob store: opens sealed content when a key is configured.
pub enum ContentReader<R: Read> {
    Plain(R),
    Sealed(OpeningReader<R>),
}

impl<R: Read> ContentReader<R> {
    pub fn new(key: Option<&EncryptionKey>, inner: R) -> io::Result<Self> {
        match key {
            Some(key) => Ok(Self::Sealed(OpeningReader::new(key, inner)?)),
            None => Ok(Self::Plain(inner)),
        }
    }
}

impl<R: Read> Read for ContentReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(out),
            Self::Sealed(r) => r.read(out),
        }
    }
}

/// Seal a whole buffer.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> io::Result<Vec<u8>> {
    let mut writer = SealingWriter::new(key, Vec::new())?;
    writer.write_all(plaintext)?;
    writer.finish()
}

/// Open a whole sealed buffer.
pub fn open(key: &EncryptionKey, sealed: &[u8]) -> io::Result<Vec<u8>> {
    let mut reader = OpeningReader::new(key, sealed)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}
