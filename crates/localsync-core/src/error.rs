//! Error types for LocalSync.
//!
//! This module provides a unified error type for all LocalSync operations,
//! with specific variants for different failure modes. A declined transfer
//! is represented as an error variant internally but is a normal outcome,
//! not a failure; see [`Error::is_decline`].

use std::io;

use thiserror::Error;

/// A specialized `Result` type for LocalSync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for LocalSync.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation timed out
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Peer closed the connection mid-exchange
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Certificate generation or loading failed
    #[error("certificate error: {0}")]
    CertificateError(String),

    /// Invalid or malformed protocol message
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Received a control token other than the expected one
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// Expected control token
        expected: String,
        /// Actual token received
        actual: String,
    },

    /// A control message exceeded the framing bound before its delimiter
    #[error("message exceeded {limit} bytes before delimiter")]
    OversizedMessage {
        /// The enforced byte limit
        limit: usize,
    },

    /// Checksum of the received data did not match the declared checksum
    #[error("checksum mismatch for '{file}'")]
    ChecksumMismatch {
        /// The file being transferred
        file: String,
    },

    /// The receiver declined the transfer (explicitly or by timeout)
    #[error("transfer declined by receiver")]
    TransferDeclined,

    /// The remote side reported an error token
    #[error("remote error: {0}")]
    RemoteError(String),

    /// No port from the configured list could be bound
    #[error("no available port (tried {0:?})")]
    NoAvailablePort(Vec<u16>),

    /// Compression or decompression failed
    #[error("compression error: {0}")]
    Compression(String),

    /// Encryption or decryption failed
    #[error("encryption error: {0}")]
    Encryption(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Invalid path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns whether this error represents a policy decline rather than a
    /// genuine failure.
    ///
    /// Declines (explicit, or implied by an acceptance timeout) are normal
    /// outcomes and are reported as "declined" instead of "failed".
    #[must_use]
    pub const fn is_decline(&self) -> bool {
        matches!(self, Self::TransferDeclined)
    }
}
