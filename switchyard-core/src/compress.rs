//! Pluggable payload compression.
//!
//! Compressors are looked up by a signed one-byte code in a 256-slot table,
//! mirroring the serializer registry.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use parking_lot::RwLock;

/// Code of the built-in deflate compressor.
pub const COMPRESSOR_DEFLATE: i8 = 1;

const SLOTS: usize = 256;

/// Errors raised while compressing or decompressing a payload.
#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    /// No compressor is registered under the code.
    #[error("no compressor registered for code {code}")]
    UnknownCompressor {
        /// The code that was looked up.
        code: i8,
    },

    /// The codec failed.
    #[error("compression I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-level compression codec selected by a one-byte code.
pub trait Compressor: Send + Sync {
    /// Code carried on the wire.
    fn code(&self) -> i8;

    /// Human-readable name, for logs.
    fn name(&self) -> &'static str;

    /// Compress a payload.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError>;

    /// Decompress a payload produced by [`Compressor::compress`].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError>;
}

/// zlib-wrapped deflate.
#[derive(Debug, Clone, Copy)]
pub struct DeflateCompressor {
    level: u32,
}

impl DeflateCompressor {
    /// Create a deflate compressor with the given level (0-9).
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self::new(Compression::default().level())
    }
}

impl Compressor for DeflateCompressor {
    fn code(&self) -> i8 {
        COMPRESSOR_DEFLATE
    }

    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Table of compressors keyed by their signed one-byte code.
pub struct CompressorRegistry {
    slots: RwLock<Vec<Option<Arc<dyn Compressor>>>>,
}

fn slot(code: i8) -> usize {
    (code as i16 + 128) as usize
}

impl CompressorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; SLOTS]),
        }
    }

    /// Create a registry holding the built-in [`DeflateCompressor`].
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(DeflateCompressor::default()));
        registry
    }

    /// Register a compressor under its own code. First registration wins.
    pub fn register(&self, compressor: Arc<dyn Compressor>) -> bool {
        let mut slots = self.slots.write();
        let entry = &mut slots[slot(compressor.code())];
        if entry.is_some() {
            return false;
        }
        *entry = Some(compressor);
        true
    }

    /// Look up a compressor by code.
    pub fn get(&self, code: i8) -> Option<Arc<dyn Compressor>> {
        self.slots.read()[slot(code)].clone()
    }

    /// Compress with the compressor registered under `code`.
    pub fn compress(&self, code: i8, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        self.get(code)
            .ok_or(CompressError::UnknownCompressor { code })?
            .compress(data)
    }

    /// Decompress with the compressor registered under `code`.
    pub fn decompress(&self, code: i8, data: &[u8]) -> Result<Vec<u8>, CompressError> {
        self.get(code)
            .ok_or(CompressError::UnknownCompressor { code })?
            .decompress(data)
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for CompressorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codes: Vec<i8> = self
            .slots
            .read()
            .iter()
            .flatten()
            .map(|c| c.code())
            .collect();
        f.debug_struct("CompressorRegistry")
            .field("codes", &codes)
            .finish()
    }
}
