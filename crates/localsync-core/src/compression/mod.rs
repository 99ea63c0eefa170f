//! Per-frame compression for file transfers.
//!
//! Each 64 KiB block of the streaming engine is compressed independently
//! before optional encryption, so the receiver can invert the pipeline one
//! frame at a time without knowing the total transformed size.
//!
//! The method travels on the wire as a small integer inside the transfer
//! metadata. The enum is closed: an unknown value is a protocol error, never
//! a fallback to "no compression".

use std::io::{Cursor, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compression method identifier for the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// zlib (DEFLATE with zlib header)
    #[default]
    Zlib = 1,
    /// gzip
    Gzip = 2,
    /// Zstandard
    Zstd = 3,
}

impl CompressionMethod {
    /// Create from a wire byte value.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Zlib),
            2 => Some(Self::Gzip),
            3 => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Convert to the wire byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CompressionMethod {
    type Error = String;

    fn try_from(byte: u8) -> std::result::Result<Self, String> {
        Self::from_byte(byte).ok_or_else(|| format!("unknown compression method: {byte}"))
    }
}

impl From<CompressionMethod> for u8 {
    fn from(method: CompressionMethod) -> Self {
        method.as_byte()
    }
}

/// Compress a block of data with the given method.
///
/// `CompressionMethod::None` returns the input unchanged.
///
/// # Errors
///
/// Returns an error if the underlying codec fails.
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|()| encoder.finish())
                .map_err(|e| Error::Compression(format!("zlib compress failed: {e}")))
        }
        CompressionMethod::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|()| encoder.finish())
                .map_err(|e| Error::Compression(format!("gzip compress failed: {e}")))
        }
        CompressionMethod::Zstd => {
            let cursor = Cursor::new(data);
            zstd::stream::encode_all(cursor, 0)
                .map_err(|e| Error::Compression(format!("zstd compress failed: {e}")))
        }
    }
}

/// Decompress a block of data with the given method.
///
/// # Errors
///
/// Returns an error if the data is not valid for the method.
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Zlib => {
            let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
            decoder
                .write_all(data)
                .and_then(|()| decoder.finish())
                .map_err(|e| Error::Compression(format!("zlib decompress failed: {e}")))
        }
        CompressionMethod::Gzip => {
            let mut decoder = flate2::write::GzDecoder::new(Vec::new());
            decoder
                .write_all(data)
                .and_then(|()| decoder.finish())
                .map_err(|e| Error::Compression(format!("gzip decompress failed: {e}")))
        }
        CompressionMethod::Zstd => {
            let cursor = Cursor::new(data);
            zstd::stream::decode_all(cursor)
                .map_err(|e| Error::Compression(format!("zstd decompress failed: {e}")))
        }
    }
}
