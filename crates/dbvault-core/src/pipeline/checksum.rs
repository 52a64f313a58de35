use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::cancel::CancelToken;
use crate::error::{Result, VaultError};

type Blake2b256 = Blake2b<U32>;

pub const CHECKSUM_PREFIX: &str = "blake2b256:";

fn render(hasher: Blake2b256) -> String {
    format!("{CHECKSUM_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Pass-through writer that hashes and counts every byte written.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Blake2b256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Blake2b256::new(),
            written: 0,
        }
    }

    /// Returns the inner writer, the digest and the byte count.
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, render(self.hasher), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    render(hasher)
}

pub fn checksum_file(path: &Path, cancel: &CancelToken) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Blake2b256::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        cancel.check()?;
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(render(hasher))
}

/// Recompute the digest of a downloaded artifact. A mismatch is final: the
/// same bytes are never checked twice.
pub fn verify_file(path: &Path, key: &str, expected: &str, cancel: &CancelToken) -> Result<()> {
    let actual = checksum_file(path, cancel)?;
    if actual != expected {
        return Err(VaultError::IntegrityViolation {
            key: key.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
