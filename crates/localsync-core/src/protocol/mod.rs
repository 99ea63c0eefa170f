//! Wire protocol for LocalSync transfers.
//!
//! A transfer connection is half-duplex and proceeds in strict phases:
//!
//! 1. Request: JSON body terminated by the literal `<REQUEST_END>`
//! 2. Control response: bare bytes `ACCEPTED` or `DECLINED`
//! 3. Metadata (if accepted): JSON body terminated by `<METADATA_END>`
//! 4. Data frames: `u32` big-endian length prefix + payload, repeated;
//!    a zero-length frame terminates the stream
//! 5. Final control response: bare bytes `SUCCESS` or `ERROR: <reason>`
//!
//! Control messages are bounded at 64 KiB before their delimiter; anything
//! larger is a protocol violation and aborts the connection. Data frames are
//! bounded by [`MAX_FRAME_SIZE`]. Both bounds protect the receiver's memory
//! against malformed or hostile peers.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::compression::CompressionMethod;
use crate::error::{Error, Result};
use crate::MAX_CONTROL_MESSAGE_SIZE;

/// Delimiter closing the transfer request message.
pub const REQUEST_END: &[u8] = b"<REQUEST_END>";

/// Delimiter closing the file metadata message.
pub const METADATA_END: &[u8] = b"<METADATA_END>";

/// Maximum accepted size of one data frame.
///
/// Frames carry one 64 KiB source block after compression and encryption;
/// incompressible data plus pipeline overhead stays well under this.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Wire tag identifying a transfer request message.
const REQUEST_KIND: &str = "transfer_request";

/// Item counts carried in a folder transfer request, for display on the
/// receiving side's acceptance prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCount {
    /// Number of files in the tree
    pub files: u64,
    /// Number of directories in the tree
    pub folders: u64,
}

/// The request message opening a transfer, sent before any payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Message tag, always `transfer_request`
    #[serde(rename = "type")]
    pub kind: String,
    /// Name of the file (or archive) being offered
    pub file_name: String,
    /// Size in bytes of the original data
    pub file_size: u64,
    /// Username of the sending peer
    pub sender: String,
    /// Unix timestamp (float seconds) when the request was created
    pub timestamp: f64,
    /// Unique id for this request
    pub request_id: Uuid,
    /// Whether the payload is a packed folder
    pub is_folder: bool,
    /// Folder contents summary, present only for folders
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub item_count: Option<ItemCount>,
}

impl TransferRequest {
    /// Create a new transfer request.
    #[must_use]
    pub fn new(
        file_name: &str,
        file_size: u64,
        sender: &str,
        is_folder: bool,
        item_count: Option<ItemCount>,
    ) -> Self {
        Self {
            kind: REQUEST_KIND.to_string(),
            file_name: file_name.to_string(),
            file_size,
            sender: sender.to_string(),
            timestamp: crate::unix_time_secs(),
            request_id: Uuid::new_v4(),
            is_folder,
            item_count,
        }
    }

    /// Check that the message tag is the one this struct models.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for any other tag.
    pub fn validate(&self) -> Result<()> {
        if self.kind == REQUEST_KIND {
            Ok(())
        } else {
            Err(Error::ProtocolError(format!(
                "unknown request type: {}",
                self.kind
            )))
        }
    }
}

/// Metadata describing the stream that follows an accepted request.
///
/// The checksum is always computed over the original, uncompressed,
/// unencrypted bytes, so verification is independent of the pipeline the
/// sender chose. `compressed_size` is `0` for streamed transfers: the frame
/// protocol exists precisely so the receiver never needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Name of the file (or archive)
    pub file_name: String,
    /// Size in bytes of the original data
    pub file_size: u64,
    /// Transformed size if known in advance, otherwise 0
    pub compressed_size: u64,
    /// Compression method applied per frame
    pub compression_method: CompressionMethod,
    /// Whether frames are additionally password-encrypted
    pub encrypted: bool,
    /// Hex checksum of the original bytes
    pub checksum: String,
    /// Unix timestamp (float seconds) when the metadata was created
    pub timestamp: f64,
    /// Whether the payload is a packed folder
    pub is_folder: bool,
    /// Top-level folder name to restore, equals `file_name` for plain files
    pub original_folder_name: String,
}

/// A bare control token exchanged between the JSON phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// The receiver accepted the request
    Accepted,
    /// The receiver declined the request
    Declined,
    /// The transfer completed and verified
    Success,
    /// The transfer failed with a reason
    Error(String),
}

impl ControlResponse {
    /// Encode the token as wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Accepted => b"ACCEPTED".to_vec(),
            Self::Declined => b"DECLINED".to_vec(),
            Self::Success => b"SUCCESS".to_vec(),
            Self::Error(reason) => format!("ERROR: {reason}").into_bytes(),
        }
    }

    /// Parse a token from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for anything that is not a known token.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes {
            b"ACCEPTED" => Ok(Self::Accepted),
            b"DECLINED" => Ok(Self::Declined),
            b"SUCCESS" => Ok(Self::Success),
            _ => {
                if let Some(reason) = bytes.strip_prefix(b"ERROR: ") {
                    Ok(Self::Error(String::from_utf8_lossy(reason).to_string()))
                } else {
                    Err(Error::ProtocolError(format!(
                        "unknown control token: {:?}",
                        String::from_utf8_lossy(bytes)
                    )))
                }
            }
        }
    }
}

/// Buffered reader for the receiving side of a connection.
///
/// The sender writes the metadata message and the first data frames back to
/// back, so a read that scans for a delimiter can pull frame bytes into its
/// buffer. `MessageReader` retains those bytes and serves every subsequent
/// read from the buffer first, keeping the phase boundaries exact.
#[derive(Debug)]
pub struct MessageReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read a delimited control message, returning the bytes before the
    /// delimiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OversizedMessage`] if more than
    /// [`MAX_CONTROL_MESSAGE_SIZE`] bytes accumulate without a delimiter,
    /// and [`Error::ConnectionClosed`] if the stream ends first.
    pub async fn read_message(&mut self, delimiter: &[u8]) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = find_subsequence(&self.buf, delimiter) {
                let message = self.buf[..pos].to_vec();
                self.buf.drain(..pos + delimiter.len());
                return Ok(message);
            }

            if self.buf.len() > MAX_CONTROL_MESSAGE_SIZE {
                return Err(Error::OversizedMessage {
                    limit: MAX_CONTROL_MESSAGE_SIZE,
                });
            }

            let mut chunk = [0u8; 1024];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read one data frame. Returns `None` for the zero-length end marker.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for frames above [`MAX_FRAME_SIZE`], and
    /// [`Error::ConnectionClosed`] on a truncated stream.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        self.read_exact_buffered(&mut len_buf).await?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_FRAME_SIZE {
            return Err(Error::ProtocolError(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}"
            )));
        }

        let mut frame = vec![0u8; len];
        self.read_exact_buffered(&mut frame).await?;
        Ok(Some(frame))
    }

    /// Access the underlying stream, e.g. to drain it on an abort path.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Fill `out` exactly, draining the internal buffer before the stream.
    async fn read_exact_buffered(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;

        let from_buf = self.buf.len().min(out.len());
        if from_buf > 0 {
            out[..from_buf].copy_from_slice(&self.buf[..from_buf]);
            self.buf.drain(..from_buf);
            filled = from_buf;
        }

        while filled < out.len() {
            let n = self.reader.read(&mut out[filled..]).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            filled += n;
        }

        Ok(())
    }
}

/// Write a JSON message followed by its delimiter.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn write_message<W, T>(writer: &mut W, message: &T, delimiter: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).map_err(|e| Error::Serialization(e.to_string()))?;
    writer.write_all(&body).await?;
    writer.write_all(delimiter).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode a JSON message body.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Write a bare control token.
///
/// # Errors
///
/// Returns an error if the write fails.
pub async fn write_control<W>(writer: &mut W, response: &ControlResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and parse one control token.
///
/// Tokens are short and the protocol is half-duplex, so a single read
/// captures the whole token.
///
/// # Errors
///
/// Returns [`Error::ConnectionClosed`] if the peer hung up, or a protocol
/// error for an unrecognized token.
pub async fn read_control<R>(reader: &mut R) -> Result<ControlResponse>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1024];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Err(Error::ConnectionClosed);
    }
    ControlResponse::parse(&buf[..n])
}

/// Write one data frame: length prefix plus payload.
///
/// # Errors
///
/// Returns an error if the write fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Write the zero-length frame that terminates a stream.
///
/// # Errors
///
/// Returns an error if the write fails.
pub async fn write_stream_end<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&0u32.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
