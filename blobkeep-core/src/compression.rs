/*!
Compression codecs for stored objects.

A [`Compressor`] is a pure stream transform: it wraps a raw read stream into
a decompressing one, and encodes a buffer for the write path. Which codec is
used is decided once, at service construction, through [`new_compressor`];
the set of algorithms is closed ([`CompressAlgorithm`]) and each variant maps
to a constructor through [`CompressAlgorithm::factory`].
*/

use std::fmt;
use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::ops::RangeInclusive;

use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use tracing::{debug, info};

use crate::config::CompressAlgorithm;
use crate::{BackupError, Result};

/// Byte stream handed to callers; dropping it releases the underlying source.
pub type BoxReader = Box<dyn Read + Send>;

/// Constructor registered for one [`CompressAlgorithm`].
pub type CompressorFactory = fn(Option<i32>) -> Result<Box<dyn Compressor>>;

/// Stream transform for one compression algorithm
///
/// Implementations hold only their configured level, so a single instance
/// can serve any number of concurrent readers.
pub trait Compressor: Send + Sync + fmt::Debug {
    /// Wrap `src` so that reading from the result yields decompressed bytes.
    ///
    /// The returned reader owns `src`; dropping it drops `src`.
    fn reader(&self, src: BoxReader) -> Result<BoxReader>;

    /// Encode a whole buffer.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decode a whole buffer.
    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>> {
        let mut reader = self.reader(Box::new(Cursor::new(compressed.to_vec())))?;
        let mut decompressed = Vec::new();
        reader.read_to_end(&mut decompressed).map_err(|e| {
            BackupError::compression(format!(
                "Failed to decompress {} data: {}",
                self.algorithm_name(),
                e
            ))
        })?;
        Ok(decompressed)
    }

    fn algorithm(&self) -> CompressAlgorithm;

    fn algorithm_name(&self) -> &'static str {
        self.algorithm().as_str()
    }
}

impl CompressAlgorithm {
    /// Constructor for this algorithm's compressor.
    pub fn factory(self) -> CompressorFactory {
        match self {
            CompressAlgorithm::Gob => GobCompressor::boxed,
            CompressAlgorithm::Gzip => GzipCompressor::boxed,
            CompressAlgorithm::Lz4 => Lz4Compressor::boxed,
            CompressAlgorithm::Zstd => ZstdCompressor::boxed,
        }
    }
}

/// Select and build a compressor.
///
/// An empty `algorithm` means "no compression" and yields `Ok(None)`.
/// An unknown identifier fails with [`BackupError::CompressorNotFound`];
/// a level the codec rejects fails with
/// [`BackupError::InvalidCompressionLevel`].
pub fn new_compressor(algorithm: &str, level: Option<i32>) -> Result<Option<Box<dyn Compressor>>> {
    if algorithm.trim().is_empty() {
        debug!("No compression algorithm configured, objects are read as-is");
        return Ok(None);
    }

    let algorithm: CompressAlgorithm = algorithm.parse()?;
    let compressor = (algorithm.factory())(level)?;
    info!(algorithm = %algorithm, level = ?level, "Initialized compressor");
    Ok(Some(compressor))
}

fn check_level(
    algorithm: CompressAlgorithm,
    level: i32,
    range: RangeInclusive<i32>,
) -> Result<()> {
    if range.contains(&level) {
        Ok(())
    } else {
        Err(BackupError::InvalidCompressionLevel {
            algorithm: algorithm.as_str(),
            level,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

/// Levels accepted by gzip; -1 selects the library default (6).
pub const GZIP_LEVELS: RangeInclusive<i32> = -1..=9;

/// Gzip compressor
///
/// Reading accepts concatenated gzip members, as produced by appending
/// writers.
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level
    ///
    /// # Arguments
    /// * `level` - Compression level (0-9, where 0 is no compression and 9 is
    ///   maximum), or -1 for the default
    pub fn with_level(level: i32) -> Result<Self> {
        check_level(CompressAlgorithm::Gzip, level, GZIP_LEVELS)?;
        let compression_level = if level < 0 {
            Compression::default()
        } else {
            Compression::new(level as u32)
        };
        Ok(Self { compression_level })
    }

    fn boxed(level: Option<i32>) -> Result<Box<dyn Compressor>> {
        let compressor = match level {
            Some(level) => Self::with_level(level)?,
            None => Self::new(),
        };
        Ok(Box::new(compressor))
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for GzipCompressor {
    fn reader(&self, src: BoxReader) -> Result<BoxReader> {
        Ok(Box::new(MultiGzDecoder::new(src)))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            BackupError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| BackupError::compression(format!("Failed to finish compression: {e}")))
    }

    fn algorithm(&self) -> CompressAlgorithm {
        CompressAlgorithm::Gzip
    }
}

/// Zstandard compressor
///
/// Level 0 selects the library default; any other level must fall inside
/// `zstd::compression_level_range()`.
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new() -> Self {
        Self {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub fn with_level(level: i32) -> Result<Self> {
        if level != 0 {
            check_level(CompressAlgorithm::Zstd, level, zstd::compression_level_range())?;
        }
        Ok(Self { level })
    }

    fn boxed(level: Option<i32>) -> Result<Box<dyn Compressor>> {
        let compressor = match level {
            Some(level) => Self::with_level(level)?,
            None => Self::new(),
        };
        Ok(Box::new(compressor))
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for ZstdCompressor {
    fn reader(&self, src: BoxReader) -> Result<BoxReader> {
        let decoder = zstd::stream::read::Decoder::new(src).map_err(|e| {
            BackupError::compression(format!("Failed to open zstd stream: {e}"))
        })?;
        Ok(Box::new(decoder))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(data, self.level)
            .map_err(|e| BackupError::compression(format!("Failed to compress data: {e}")))
    }

    fn algorithm(&self) -> CompressAlgorithm {
        CompressAlgorithm::Zstd
    }
}

/// Levels accepted for LZ4 (the range of the reference HC encoder).
pub const LZ4_LEVELS: RangeInclusive<i32> = 0..=12;

/// LZ4 frame-format compressor
///
/// The level is validated against [`LZ4_LEVELS`] for configuration
/// compatibility; the pure-Rust encoder has a single speed mode.
#[derive(Debug, Clone, Default)]
pub struct Lz4Compressor {
    level: u32,
}

impl Lz4Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(level: i32) -> Result<Self> {
        check_level(CompressAlgorithm::Lz4, level, LZ4_LEVELS)?;
        Ok(Self {
            level: level as u32,
        })
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    fn boxed(level: Option<i32>) -> Result<Box<dyn Compressor>> {
        let compressor = match level {
            Some(level) => Self::with_level(level)?,
            None => Self::new(),
        };
        Ok(Box::new(compressor))
    }
}

impl Compressor for Lz4Compressor {
    fn reader(&self, src: BoxReader) -> Result<BoxReader> {
        Ok(Box::new(lz4_flex::frame::FrameDecoder::new(src)))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder.write_all(data).map_err(|e| {
            BackupError::compression(format!("Failed to write data for compression: {e}"))
        })?;
        encoder
            .finish()
            .map_err(|e| BackupError::compression(format!("Failed to finish compression: {e}")))
    }

    fn algorithm(&self) -> CompressAlgorithm {
        CompressAlgorithm::Lz4
    }
}

/// Largest chunk written into a single gob frame.
pub const GOB_FRAME_SIZE: usize = 32 * 1024;

/// Framed serialization codec
///
/// The payload is split into chunks and each chunk is written as a bincode
/// byte sequence (little-endian `u64` length followed by the bytes). No
/// entropy coding happens, so the level is accepted and ignored.
#[derive(Debug, Clone, Default)]
pub struct GobCompressor;

impl GobCompressor {
    pub fn new() -> Self {
        Self
    }

    fn boxed(_level: Option<i32>) -> Result<Box<dyn Compressor>> {
        Ok(Box::new(Self::new()))
    }
}

impl Compressor for GobCompressor {
    fn reader(&self, src: BoxReader) -> Result<BoxReader> {
        Ok(Box::new(GobReader::new(src)))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoded = Vec::with_capacity(data.len() + 8 * (data.len() / GOB_FRAME_SIZE + 1));
        for chunk in data.chunks(GOB_FRAME_SIZE) {
            bincode::serialize_into(&mut encoded, chunk)
                .map_err(|e| BackupError::compression(format!("Failed to encode frame: {e}")))?;
        }
        Ok(encoded)
    }

    fn algorithm(&self) -> CompressAlgorithm {
        CompressAlgorithm::Gob
    }
}

/// Decodes a stream of gob frames back into the original bytes.
struct GobReader {
    src: BufReader<BoxReader>,
    frame: Vec<u8>,
    pos: usize,
}

impl GobReader {
    fn new(src: BoxReader) -> Self {
        Self {
            src: BufReader::new(src),
            frame: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for GobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.frame.len() {
                let n = buf.len().min(self.frame.len() - self.pos);
                buf[..n].copy_from_slice(&self.frame[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            // Clean end of stream only on a frame boundary.
            if self.src.fill_buf()?.is_empty() {
                return Ok(0);
            }
            self.frame = bincode::deserialize_from(&mut self.src)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.pos = 0;
        }
    }
}
