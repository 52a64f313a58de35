use std::io::{self, BufReader, Read, Write};

use crate::config::{CompressionAlgorithm, CompressionConfig};
use crate::error::{Result, VaultError};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    Lz4,
    #[default]
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    pub codec: Compression,
    pub zstd_level: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            codec: Compression::Zstd,
            zstd_level: 3,
        }
    }
}

impl CompressionSettings {
    pub fn from_config(cfg: &CompressionConfig) -> Self {
        let codec = match cfg.algorithm {
            CompressionAlgorithm::None => Compression::None,
            CompressionAlgorithm::Lz4 => Compression::Lz4,
            CompressionAlgorithm::Zstd => Compression::Zstd,
        };
        Self {
            codec,
            zstd_level: cfg.zstd_level,
        }
    }
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Streaming compressor. The first byte written is the codec tag.
pub enum Encoder<W: Write> {
    None(W),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(settings: CompressionSettings, mut out: W) -> Result<Self> {
        match settings.codec {
            Compression::None => {
                out.write_all(&[TAG_NONE])?;
                Ok(Encoder::None(out))
            }
            Compression::Lz4 => {
                out.write_all(&[TAG_LZ4])?;
                Ok(Encoder::Lz4(lz4_flex::frame::FrameEncoder::new(out)))
            }
            Compression::Zstd => {
                out.write_all(&[TAG_ZSTD])?;
                let enc = zstd::stream::write::Encoder::new(out, settings.zstd_level)
                    .map_err(|e| VaultError::Other(format!("zstd init: {e}")))?;
                Ok(Encoder::Zstd(enc))
            }
        }
    }

    /// Flush the codec trailer and hand back the inner writer.
    pub fn finish(self) -> Result<W> {
        match self {
            Encoder::None(w) => Ok(w),
            Encoder::Lz4(enc) => enc
                .finish()
                .map_err(|e| VaultError::Other(format!("lz4 finish: {e}"))),
            Encoder::Zstd(enc) => enc
                .finish()
                .map_err(|e| VaultError::Other(format!("zstd finish: {e}"))),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::None(w) => w.write(buf),
            Encoder::Lz4(enc) => enc.write(buf),
            Encoder::Zstd(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::None(w) => w.flush(),
            Encoder::Lz4(enc) => enc.flush(),
            Encoder::Zstd(enc) => enc.flush(),
        }
    }
}

/// Streaming decompressor dispatching on the leading codec tag.
pub enum Decoder<R: Read> {
    None(R),
    Lz4(lz4_flex::frame::FrameDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> Decoder<R> {
    pub fn new(mut input: R) -> Result<Self> {
        let mut tag = [0u8; 1];
        if let Err(e) = input.read_exact(&mut tag) {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    VaultError::Decompression("empty stream: missing codec tag".into())
                }
                _ => VaultError::from_io(e),
            });
        }
        match tag[0] {
            TAG_NONE => Ok(Decoder::None(input)),
            TAG_LZ4 => Ok(Decoder::Lz4(lz4_flex::frame::FrameDecoder::new(input))),
            TAG_ZSTD => zstd::stream::read::Decoder::new(input)
                .map(Decoder::Zstd)
                .map_err(|e| VaultError::Decompression(format!("zstd init: {e}"))),
            other => Err(VaultError::UnknownCompressionTag(other)),
        }
    }
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::None(r) => r.read(buf),
            Decoder::Lz4(dec) => dec.read(buf),
            Decoder::Zstd(dec) => dec.read(buf),
        }
    }
}
