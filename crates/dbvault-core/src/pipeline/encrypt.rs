//! Framed AES-256-GCM stream.
//!
//! Layout: `"DBVE"`, version byte, key-id length byte, key id, 12-byte base
//! nonce, then frames `[u32 LE length][ciphertext + 16-byte tag]`. Each frame
//! holds at most [`FRAME_SIZE`] plaintext bytes. The nonce of frame `n` is the
//! base nonce with its last eight bytes XORed with `n`; the AAD is
//! `key_id || n (u64 BE) || final flag`, so dropping, reordering or
//! truncating frames fails authentication. A stream always ends with exactly
//! one final frame, which may be empty.

use std::io::{self, Read, Write};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use super::keyring::KeyRing;
use crate::error::{Result, VaultError};

pub const MAGIC: &[u8; 4] = b"DBVE";
pub const VERSION: u8 = 1;
pub const FRAME_SIZE: usize = 1024 * 1024;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

fn frame_nonce(base: &[u8; NONCE_LEN], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    for (b, c) in nonce[NONCE_LEN - 8..].iter_mut().zip(counter.to_be_bytes()) {
        *b ^= c;
    }
    nonce
}

fn frame_aad(key_id: &[u8], counter: u64, is_final: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(key_id.len() + 9);
    aad.extend_from_slice(key_id);
    aad.extend_from_slice(&counter.to_be_bytes());
    aad.push(u8::from(is_final));
    aad
}

pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    key_id: Vec<u8>,
    base_nonce: [u8; NONCE_LEN],
    buf: Vec<u8>,
    counter: u64,
}

impl<W: Write> EncryptWriter<W> {
    /// Start a stream under the key ring's current key.
    pub fn new(keyring: &KeyRing, mut inner: W) -> Result<Self> {
        let key_id = keyring.current_id().as_bytes().to_vec();
        let key_id_len = u8::try_from(key_id.len())
            .map_err(|_| VaultError::Config("encryption key id longer than 255 bytes".into()))?;
        let cipher = Aes256Gcm::new_from_slice(keyring.current_key())
            .map_err(|e| VaultError::Other(format!("AES-GCM init: {e}")))?;

        let mut base_nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut base_nonce);

        inner.write_all(MAGIC)?;
        inner.write_all(&[VERSION, key_id_len])?;
        inner.write_all(&key_id)?;
        inner.write_all(&base_nonce)?;

        Ok(Self {
            inner,
            cipher,
            key_id,
            base_nonce,
            buf: Vec::with_capacity(FRAME_SIZE),
            counter: 0,
        })
    }

    fn emit_frame(&mut self, len: usize, is_final: bool) -> io::Result<()> {
        let nonce = frame_nonce(&self.base_nonce, self.counter);
        let aad = frame_aad(&self.key_id, self.counter, is_final);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &self.buf[..len],
                    aad: &aad,
                },
            )
            .map_err(|e| VaultError::Other(format!("AES-GCM encrypt: {e}")).into_io())?;
        // Bounded by FRAME_SIZE + TAG_LEN.
        let frame_len = ciphertext.len() as u32;
        self.inner.write_all(&frame_len.to_le_bytes())?;
        self.inner.write_all(&ciphertext)?;
        self.buf.drain(..len);
        self.counter += 1;
        Ok(())
    }

    /// Write the final frame and return the inner writer.
    pub fn finish(mut self) -> Result<W> {
        let len = self.buf.len();
        self.emit_frame(len, true).map_err(VaultError::from_io)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        // Keep at least one byte buffered so the last full frame is not
        // emitted before we know whether it is final.
        while self.buf.len() > FRAME_SIZE {
            self.emit_frame(FRAME_SIZE, false)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    key_id: Vec<u8>,
    base_nonce: [u8; NONCE_LEN],
    counter: u64,
    next_len: Option<u32>,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on clean EOF before the first byte.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(VaultError::DecryptionFailed.into_io()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl<R: Read> DecryptReader<R> {
    pub fn new(keyring: &KeyRing, mut inner: R) -> Result<Self> {
        let mut head = [0u8; 6];
        if !read_exact_or_eof(&mut inner, &mut head).map_err(VaultError::from_io)? {
            return Err(VaultError::DecryptionFailed);
        }
        if &head[..4] != MAGIC {
            return Err(VaultError::InvalidFormat(
                "artifact is not an encrypted dbvault stream".into(),
            ));
        }
        if head[4] != VERSION {
            return Err(VaultError::InvalidFormat(format!(
                "unsupported encryption stream version {}",
                head[4]
            )));
        }
        let mut key_id = vec![0u8; head[5] as usize];
        inner
            .read_exact(&mut key_id)
            .map_err(|_| VaultError::DecryptionFailed)?;
        let mut base_nonce = [0u8; NONCE_LEN];
        inner
            .read_exact(&mut base_nonce)
            .map_err(|_| VaultError::DecryptionFailed)?;

        let id = String::from_utf8(key_id.clone())
            .map_err(|_| VaultError::InvalidFormat("key id is not UTF-8".into()))?;
        let cipher = Aes256Gcm::new_from_slice(keyring.key(&id)?)
            .map_err(|e| VaultError::Other(format!("AES-GCM init: {e}")))?;

        let mut reader = Self {
            inner,
            cipher,
            key_id,
            base_nonce,
            counter: 0,
            next_len: None,
            plain: Vec::new(),
            pos: 0,
            done: false,
        };
        reader.next_len = reader.read_len().map_err(VaultError::from_io)?;
        if reader.next_len.is_none() {
            // A stream always carries a final frame.
            return Err(VaultError::DecryptionFailed);
        }
        Ok(reader)
    }

    /// Key id the stream was written under.
    pub fn key_id(&self) -> String {
        String::from_utf8_lossy(&self.key_id).into_owned()
    }

    fn read_len(&mut self) -> io::Result<Option<u32>> {
        let mut len = [0u8; 4];
        if read_exact_or_eof(&mut self.inner, &mut len)? {
            Ok(Some(u32::from_le_bytes(len)))
        } else {
            Ok(None)
        }
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let Some(len) = self.next_len.take() else {
            self.done = true;
            return Ok(());
        };
        let len = len as usize;
        if !(TAG_LEN..=FRAME_SIZE + TAG_LEN).contains(&len) {
            return Err(VaultError::DecryptionFailed.into_io());
        }
        let mut ciphertext = vec![0u8; len];
        if !read_exact_or_eof(&mut self.inner, &mut ciphertext)? {
            return Err(VaultError::DecryptionFailed.into_io());
        }

        // Lookahead decides whether this frame claims to be the last one.
        self.next_len = self.read_len()?;
        let is_final = self.next_len.is_none();

        let nonce = frame_nonce(&self.base_nonce, self.counter);
        let aad = frame_aad(&self.key_id, self.counter, is_final);
        self.plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| VaultError::DecryptionFailed.into_io())?;
        self.pos = 0;
        self.counter += 1;
        if is_final {
            self.done = true;
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.plain.len() {
                let n = (self.plain.len() - self.pos).min(out.len());
                out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            self.next_frame()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(current: &str) -> KeyRing {
        KeyRing::new(
            current,
            vec![("old".into(), [1u8; 32]), ("new".into(), [2u8; 32])],
        )
        .unwrap()
    }

    fn encrypt(keyring: &KeyRing, data: &[u8]) -> Vec<u8> {
        let mut w = EncryptWriter::new(keyring, Vec::new()).unwrap();
        // Uneven writes exercise frame boundaries.
        for chunk in data.chunks(7919) {
            w.write_all(chunk).unwrap();
        }
        w.finish().unwrap()
    }

    fn decrypt(keyring: &KeyRing, data: &[u8]) -> Result<Vec<u8>> {
        let mut r = DecryptReader::new(keyring, data)?;
        let mut out = Vec::new();
        r.read_to_end(&mut out).map_err(VaultError::from_io)?;
        Ok(out)
    }

    #[test]
    fn round_trip_across_frames() {
        let keyring = ring("new");
        for size in [0, 1, FRAME_SIZE - 1, FRAME_SIZE, FRAME_SIZE + 1, 3 * FRAME_SIZE + 17] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let sealed = encrypt(&keyring, &data);
            assert_eq!(decrypt(&keyring, &sealed).unwrap(), data, "size {size}");
        }
    }

    #[test]
    fn legacy_key_still_decrypts_after_rotation() {
        let before = ring("old");
        let sealed = encrypt(&before, b"written before rotation");
        let after = ring("new");
        assert_eq!(
            decrypt(&after, &sealed).unwrap(),
            b"written before rotation"
        );
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = encrypt(&ring("new"), b"secret");
        let other = KeyRing::new("new", vec![("new".into(), [9u8; 32])]).unwrap();
        assert!(matches!(
            decrypt(&other, &sealed),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn unknown_key_id_is_reported() {
        let sealed = encrypt(&ring("old"), b"secret");
        let only_new = KeyRing::new("new", vec![("new".into(), [2u8; 32])]).unwrap();
        assert!(matches!(
            decrypt(&only_new, &sealed),
            Err(VaultError::UnknownKey(id)) if id == "old"
        ));
    }

    #[test]
    fn truncation_at_frame_boundary_fails() {
        let keyring = ring("new");
        let data = vec![7u8; 2 * FRAME_SIZE + 10];
        let sealed = encrypt(&keyring, &data);
        let header = 4 + 2 + 3 + NONCE_LEN;
        let first_frame = 4 + FRAME_SIZE + TAG_LEN;
        let truncated = &sealed[..header + first_frame];
        assert!(matches!(
            decrypt(&keyring, truncated),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn truncation_mid_frame_fails() {
        let keyring = ring("new");
        let sealed = encrypt(&keyring, b"some bytes");
        let truncated = &sealed[..sealed.len() - 3];
        assert!(decrypt(&keyring, truncated).is_err());
    }

    #[test]
    fn flipped_byte_fails() {
        let keyring = ring("new");
        let mut sealed = encrypt(&keyring, b"integrity matters");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            decrypt(&keyring, &sealed),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn fresh_nonce_per_stream() {
        let keyring = ring("new");
        let a = encrypt(&keyring, b"same");
        let b = encrypt(&keyring, b"same");
        assert_ne!(a, b);
    }
}
