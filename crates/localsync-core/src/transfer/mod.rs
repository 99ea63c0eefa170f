//! Streaming transfer engine.
//!
//! Moves a file's bytes over an established connection in bounded-size
//! frames. Each 64 KiB source block is compressed, optionally encrypted,
//! framed, and written; the receiver inverts the pipeline per frame, stages
//! the output in a `.part` file, and verifies the accumulated checksum
//! before promoting it to the final name. Peak memory is a handful of
//! blocks regardless of file size.

pub mod archive;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::compression::{self, CompressionMethod};
use crate::crypto::{self, StreamingChecksum};
use crate::error::{Error, Result};
use crate::protocol::{self, FileMetadata, MessageReader};
use crate::STREAM_BLOCK_SIZE;

/// Callback invoked as a transfer progresses: `(bytes_done, bytes_total,
/// stage)`. Stage is a short label such as `"Sending"` or `"Receiving"`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Per-frame transforms applied by the sending side.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Compression method for each block
    pub compression: CompressionMethod,
    /// Password for the optional encryption layer
    pub password: Option<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::Zlib,
            password: None,
        }
    }
}

/// Terminal outcome of one transfer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Data was delivered and verified
    Success,
    /// The receiver declined (explicitly or by timeout); not a failure
    Declined,
    /// The transfer failed
    Failed,
}

/// The `(success, message)` resolution of a transfer at the connection
/// manager boundary. Nothing propagates past this as an error.
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// How the transfer ended
    pub outcome: TransferOutcome,
    /// Human-readable description of the outcome
    pub message: String,
}

impl TransferReport {
    /// Whether the transfer delivered its payload.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, TransferOutcome::Success)
    }

    pub(crate) fn success(message: impl Into<String>) -> Self {
        Self {
            outcome: TransferOutcome::Success,
            message: message.into(),
        }
    }

    pub(crate) fn from_error(error: &Error) -> Self {
        if error.is_decline() {
            Self {
                outcome: TransferOutcome::Declined,
                message: error.to_string(),
            }
        } else {
            Self {
                outcome: TransferOutcome::Failed,
                message: error.to_string(),
            }
        }
    }
}

/// Stream a file through the pipeline onto a connection.
///
/// Reads the source in fixed blocks, applies compression then optional
/// encryption per block, frames each result, and terminates with the
/// zero-length end marker. The progress callback receives the count of
/// *original* bytes consumed, so progress is meaningful regardless of how
/// well the data compresses.
///
/// A zero-byte file produces no data frames, just the end marker.
///
/// # Errors
///
/// Returns an error if reading, the pipeline, or the connection fails.
pub async fn stream_send<S>(
    stream: &mut S,
    file_path: &Path,
    total_size: u64,
    options: &PipelineOptions,
    progress: Option<&ProgressCallback>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(file_path).await?;
    let mut buf = vec![0u8; STREAM_BLOCK_SIZE];
    let mut consumed: u64 = 0;

    // One key derivation per transfer, not per block
    let cipher = options.password.as_deref().map(crypto::FrameCipher::new);

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        let mut block = compression::compress(&buf[..n], options.compression)?;
        if let Some(cipher) = &cipher {
            block = cipher.encrypt(&block)?;
        }

        protocol::write_frame(stream, &block).await?;

        consumed += n as u64;
        if let Some(callback) = progress {
            callback(consumed, total_size, "Sending");
        }
    }

    protocol::write_stream_end(stream).await?;
    Ok(())
}

/// Receive a framed stream into `dest_path`, inverting the pipeline.
///
/// Data is staged in a sibling `.part` file and the checksum of the restored
/// bytes is accumulated as frames arrive. Only when the stream ends and the
/// checksum matches the declared one is the file renamed into place; on any
/// failure the partial file is deleted. Corrupt data never reaches the final
/// name.
///
/// # Errors
///
/// Returns [`Error::ChecksumMismatch`] on a digest mismatch, an encryption
/// error if the stream is encrypted and no password is available, or the
/// underlying pipeline/I/O error.
pub async fn stream_receive<R>(
    reader: &mut MessageReader<R>,
    dest_path: &Path,
    metadata: &FileMetadata,
    password: Option<&str>,
    progress: Option<&ProgressCallback>,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let part_path = part_path_for(dest_path);

    match receive_to_part(reader, &part_path, metadata, password, progress).await {
        Ok(()) => {
            tokio::fs::rename(&part_path, dest_path).await?;
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part_path).await;
            Err(e)
        }
    }
}

async fn receive_to_part<R>(
    reader: &mut MessageReader<R>,
    part_path: &Path,
    metadata: &FileMetadata,
    password: Option<&str>,
    progress: Option<&ProgressCallback>,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut decipher = if metadata.encrypted {
        let password = password.ok_or_else(|| {
            Error::Encryption("stream is encrypted but no password is configured".to_string())
        })?;
        Some(crypto::FrameDecipher::new(password))
    } else {
        None
    };

    let mut file = tokio::fs::File::create(part_path).await?;
    let mut checksum = StreamingChecksum::new();
    let mut restored: u64 = 0;

    while let Some(frame) = reader.read_frame().await? {
        let block = match &mut decipher {
            Some(decipher) => decipher.decrypt(&frame)?,
            None => frame,
        };
        let block = compression::decompress(&block, metadata.compression_method)?;

        file.write_all(&block).await?;
        checksum.update(&block);

        restored += block.len() as u64;
        if let Some(callback) = progress {
            callback(restored, metadata.file_size, "Receiving");
        }
    }

    file.flush().await?;
    drop(file);

    let digest = checksum.finalize_hex();
    if digest != metadata.checksum {
        tracing::warn!(
            "Checksum mismatch for '{}': expected {}, got {}",
            metadata.file_name,
            metadata.checksum,
            digest
        );
        return Err(Error::ChecksumMismatch {
            file: metadata.file_name.clone(),
        });
    }

    Ok(())
}

/// Sibling `.part` path used to stage an in-flight file.
fn part_path_for(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map_or_else(|| std::ffi::OsString::from("download"), ToOwned::to_owned);
    name.push(".part");
    dest.with_file_name(name)
}

/// Format a byte count for humans.
#[must_use]
pub fn format_size(size_bytes: u64) -> String {
    let mut size = size_bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}
