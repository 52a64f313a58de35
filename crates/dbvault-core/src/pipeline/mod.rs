//! Artifact transform stages: compress, encrypt, checksum.
//!
//! `seal` runs the stages in that fixed order in a single streaming pass;
//! `unseal` reverses them. Checksum verification of downloaded bytes happens
//! before `unseal` is ever called (see `commands::restore`).

pub mod checksum;
pub mod compress;
pub mod encrypt;
pub mod keyring;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use self::checksum::HashingWriter;
use self::compress::{CompressionSettings, Decoder, Encoder};
use self::encrypt::{DecryptReader, EncryptWriter};
use self::keyring::KeyRing;
use crate::cancel::CancelToken;
use crate::error::{Result, VaultError};

const COPY_BUF_SIZE: usize = 256 * 1024;

/// Which optional stages to apply. The checksum stage always runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SealOptions {
    pub compression: Option<CompressionSettings>,
    pub encrypt: bool,
}

#[derive(Debug, Clone)]
pub struct SealedArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
    pub compression: Option<&'static str>,
    pub encryption_key_id: Option<String>,
}

/// Copy `reader` into `writer`, checking for cancellation between chunks.
pub fn copy_with_cancel<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(VaultError::from_io(e)),
        };
        writer.write_all(&buf[..n]).map_err(VaultError::from_io)?;
        total += n as u64;
    }
    Ok(total)
}

fn compress_into<W: Write>(
    input: &mut dyn Read,
    compression: Option<CompressionSettings>,
    mut out: W,
    cancel: &CancelToken,
) -> Result<W> {
    match compression {
        Some(settings) => {
            let mut enc = Encoder::new(settings, out)?;
            copy_with_cancel(input, &mut enc, cancel)?;
            enc.finish()
        }
        None => {
            copy_with_cancel(input, &mut out, cancel)?;
            Ok(out)
        }
    }
}

/// Transform a raw dump into its stored form.
pub fn seal(
    input: &Path,
    output: &Path,
    opts: &SealOptions,
    keyring: Option<&KeyRing>,
    cancel: &CancelToken,
) -> Result<SealedArtifact> {
    let mut reader = BufReader::new(File::open(input)?);
    let hashing = HashingWriter::new(BufWriter::new(File::create(output)?));

    let (hashing, encryption_key_id) = if opts.encrypt {
        let keyring = keyring.ok_or_else(|| {
            VaultError::Config("encryption requested but no keys are configured".into())
        })?;
        let enc = EncryptWriter::new(keyring, hashing)?;
        let enc = compress_into(&mut reader, opts.compression, enc, cancel)?;
        (enc.finish()?, Some(keyring.current_id().to_string()))
    } else {
        (
            compress_into(&mut reader, opts.compression, hashing, cancel)?,
            None,
        )
    };

    let (writer, checksum, size_bytes) = hashing.finish();
    let file = writer
        .into_inner()
        .map_err(|e| VaultError::Io(e.into_error()))?;
    file.sync_all()?;

    debug!(
        size_bytes,
        checksum = %checksum,
        compressed = opts.compression.is_some(),
        encrypted = opts.encrypt,
        "sealed artifact"
    );

    Ok(SealedArtifact {
        path: output.to_path_buf(),
        size_bytes,
        checksum,
        compression: opts.compression.map(|c| c.codec.name()),
        encryption_key_id,
    })
}

/// Reverse `seal`: decrypt, then decompress into `output`.
pub fn unseal(
    artifact: &Path,
    output: &Path,
    compressed: bool,
    encrypted: bool,
    keyring: Option<&KeyRing>,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut reader: Box<dyn Read> = Box::new(BufReader::new(File::open(artifact)?));
    if encrypted {
        let keyring = keyring.ok_or_else(|| {
            VaultError::Config("artifact is encrypted but no keys are configured".into())
        })?;
        reader = Box::new(DecryptReader::new(keyring, reader)?);
    }
    if compressed {
        reader = Box::new(Decoder::new(reader)?);
    }

    let mut writer = BufWriter::new(File::create(output)?);
    let written = copy_with_cancel(&mut reader, &mut writer, cancel)?;
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::checksum::checksum_file;
    use crate::pipeline::compress::Compression;

    fn keyring() -> KeyRing {
        KeyRing::new("k1", vec![("k1".into(), [3u8; 32])]).unwrap()
    }

    #[test]
    fn seal_unseal_round_trip_every_stage_combination() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.dump");
        let data = b"CREATE TABLE t (id int);\nINSERT INTO t VALUES (1);\n".repeat(10_000);
        std::fs::write(&raw, &data).unwrap();
        let ring = keyring();
        let cancel = CancelToken::new();

        let zstd = Some(CompressionSettings {
            codec: Compression::Zstd,
            zstd_level: 3,
        });
        for (compression, encrypt) in [(None, false), (zstd, false), (None, true), (zstd, true)] {
            let opts = SealOptions {
                compression,
                encrypt,
            };
            let sealed_path = dir.path().join("sealed");
            let sealed = seal(&raw, &sealed_path, &opts, Some(&ring), &cancel).unwrap();

            assert_eq!(
                sealed.size_bytes,
                std::fs::metadata(&sealed_path).unwrap().len()
            );
            assert_eq!(sealed.checksum, checksum_file(&sealed_path, &cancel).unwrap());
            assert_eq!(sealed.encryption_key_id.is_some(), encrypt);

            let restored = dir.path().join("restored");
            unseal(
                &sealed_path,
                &restored,
                compression.is_some(),
                encrypt,
                Some(&ring),
                &cancel,
            )
            .unwrap();
            assert_eq!(std::fs::read(&restored).unwrap(), data);
        }
    }

    #[test]
    fn encryption_without_keyring_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::write(&raw, b"x").unwrap();
        let opts = SealOptions {
            compression: None,
            encrypt: true,
        };
        let err = seal(
            &raw,
            &dir.path().join("out"),
            &opts,
            None,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn cancelled_seal_stops() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::write(&raw, vec![0u8; 1024]).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = seal(
            &raw,
            &dir.path().join("out"),
            &SealOptions::default(),
            None,
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Cancelled));
    }
}
