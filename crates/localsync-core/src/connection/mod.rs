//! Connection management for transfers.
//!
//! This module owns the sockets and TLS contexts on both ends of a transfer
//! and drives the protocol state machine: request, acceptance, metadata,
//! streaming, final status. The sending side lives here; the receiving side
//! (accept loop, per-connection workers, certificate lifecycle) is in
//! [`receiver`].
//!
//! Every public entry point resolves to a [`TransferReport`]; errors do not
//! propagate past this boundary.

mod receiver;

pub use receiver::{AcceptRequest, FileReceiver, ReceiverSettings};

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::compression::CompressionMethod;
use crate::crypto::{self, TlsConfig};
use crate::error::{Error, Result};
use crate::protocol::{
    self, ControlResponse, FileMetadata, ItemCount, TransferRequest, METADATA_END, REQUEST_END,
};
use crate::transfer::{
    self, archive, PipelineOptions, ProgressCallback, TransferReport,
};
use crate::DEFAULT_TRANSFER_PORT;

/// Seconds to wait for the outbound TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Seconds to wait for the acceptance decision.
///
/// The receiver bounds its own prompt with `request_timeout` and always
/// answers; this slightly larger bound covers a receiver that died silently.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(180);

/// Seconds to wait for the final status after streaming completes.
const FINAL_STATUS_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for an outbound transfer.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Compression method applied per block
    pub compression: CompressionMethod,
    /// Password for the optional encryption layer
    pub password: Option<String>,
    /// Transfer port the peer's receiver listens on
    pub port: u16,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::default(),
            password: None,
            port: DEFAULT_TRANSFER_PORT,
        }
    }
}

/// Extra request fields carried for folder transfers.
struct FolderInfo {
    folder_name: String,
    item_count: ItemCount,
}

/// Sending side of the connection manager.
///
/// Opens a TLS connection to a peer (typically at the address from a
/// [`crate::discovery::PeerRecord`]) and drives the transfer protocol.
pub struct FileSender {
    username: String,
    tls: TlsConfig,
}

impl std::fmt::Debug for FileSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSender")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl FileSender {
    /// Create a sender identified by the given username.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS client configuration cannot be built.
    pub fn new(username: &str) -> Result<Self> {
        Ok(Self {
            username: username.to_string(),
            tls: TlsConfig::client()?,
        })
    }

    /// Send a single file to a peer.
    ///
    /// Resolves every failure into the returned report; a decline by the
    /// receiver is reported as [`crate::transfer::TransferOutcome::Declined`],
    /// not as a failure.
    pub async fn send_file(
        &self,
        file_path: &Path,
        peer: IpAddr,
        options: &SendOptions,
        progress: Option<ProgressCallback>,
    ) -> TransferReport {
        match self
            .try_send(file_path, peer, options, progress.as_ref(), None)
            .await
        {
            Ok(()) => TransferReport::success("file sent successfully"),
            Err(e) => {
                if !e.is_decline() {
                    tracing::warn!("Sending {} failed: {e}", file_path.display());
                }
                TransferReport::from_error(&e)
            }
        }
    }

    /// Send a folder (recursively) to a peer.
    ///
    /// The tree is packed into a temporary tar archive which then travels
    /// like a single file; the receiver unpacks it after verification. The
    /// archive is deleted locally once the transfer ends, either way.
    pub async fn send_folder(
        &self,
        folder_path: &Path,
        peer: IpAddr,
        options: &SendOptions,
        progress: Option<ProgressCallback>,
    ) -> TransferReport {
        match self
            .try_send_folder(folder_path, peer, options, progress.as_ref())
            .await
        {
            Ok(()) => TransferReport::success("folder sent successfully"),
            Err(e) => {
                if !e.is_decline() {
                    tracing::warn!("Sending {} failed: {e}", folder_path.display());
                }
                TransferReport::from_error(&e)
            }
        }
    }

    async fn try_send_folder(
        &self,
        folder_path: &Path,
        peer: IpAddr,
        options: &SendOptions,
        progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        let item_count = archive::count_items(folder_path)?;
        let (archive_path, folder_name) = archive::pack_directory(folder_path).await?;

        let result = self
            .try_send(
                &archive_path,
                peer,
                options,
                progress,
                Some(FolderInfo {
                    folder_name,
                    item_count,
                }),
            )
            .await;

        // TempPath removes the archive on drop; make the order explicit
        drop(archive_path);
        result
    }

    async fn try_send(
        &self,
        file_path: &Path,
        peer: IpAddr,
        options: &SendOptions,
        progress: Option<&ProgressCallback>,
        folder: Option<FolderInfo>,
    ) -> Result<()> {
        let file_size = match tokio::fs::metadata(file_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(Error::InvalidPath(file_path.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(file_path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let file_name = folder.as_ref().map_or_else(
            || {
                file_path
                    .file_name()
                    .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().to_string())
            },
            |info| format!("{}.tar", info.folder_name),
        );

        // Checksum of the original bytes goes into the metadata, so it must
        // be computed before streaming starts
        let checksum = crypto::checksum_file(file_path).await?;

        let mut stream = self.connect(peer, options.port).await?;

        let request = TransferRequest::new(
            &file_name,
            file_size,
            &self.username,
            folder.is_some(),
            folder.as_ref().map(|info| info.item_count),
        );
        protocol::write_message(&mut stream, &request, REQUEST_END).await?;

        let decision = timeout(ACCEPT_TIMEOUT, protocol::read_control(&mut stream))
            .await
            .map_err(|_| Error::Timeout(ACCEPT_TIMEOUT.as_secs()))??;
        match decision {
            ControlResponse::Accepted => {}
            ControlResponse::Declined => return Err(Error::TransferDeclined),
            other => {
                return Err(Error::UnexpectedResponse {
                    expected: "ACCEPTED or DECLINED".to_string(),
                    actual: format!("{other:?}"),
                })
            }
        }

        let metadata = FileMetadata {
            file_name: file_name.clone(),
            file_size,
            compressed_size: 0,
            compression_method: options.compression,
            encrypted: options.password.is_some(),
            checksum,
            timestamp: crate::unix_time_secs(),
            is_folder: folder.is_some(),
            original_folder_name: folder
                .as_ref()
                .map_or_else(|| file_name.clone(), |info| info.folder_name.clone()),
        };
        protocol::write_message(&mut stream, &metadata, METADATA_END).await?;

        let pipeline = PipelineOptions {
            compression: options.compression,
            password: options.password.clone(),
        };
        transfer::stream_send(&mut stream, file_path, file_size, &pipeline, progress).await?;

        let status = timeout(FINAL_STATUS_TIMEOUT, protocol::read_control(&mut stream))
            .await
            .map_err(|_| Error::Timeout(FINAL_STATUS_TIMEOUT.as_secs()))??;
        match status {
            ControlResponse::Success => Ok(()),
            ControlResponse::Error(reason) => Err(Error::RemoteError(reason)),
            other => Err(Error::UnexpectedResponse {
                expected: "SUCCESS".to_string(),
                actual: format!("{other:?}"),
            }),
        }
    }

    async fn connect(
        &self,
        peer: IpAddr,
        port: u16,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let addr = SocketAddr::new(peer, port);

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(CONNECT_TIMEOUT.as_secs()))??;

        let config = self
            .tls
            .client_config()
            .ok_or_else(|| Error::Internal("no client TLS config".to_string()))?;
        let connector = TlsConnector::from(config);

        let server_name = rustls::pki_types::ServerName::from(peer);
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::TlsError(format!("TLS handshake failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_send_options_default() {
        let options = SendOptions::default();
        assert_eq!(options.compression, CompressionMethod::Zlib);
        assert!(options.password.is_none());
        assert_eq!(options.port, DEFAULT_TRANSFER_PORT);
    }

    #[tokio::test]
    async fn test_send_missing_file_reports_failure() {
        let sender = FileSender::new("alice").unwrap();
        let report = sender
            .send_file(
                Path::new("/definitely/not/here.txt"),
                IpAddr::from(Ipv4Addr::LOCALHOST),
                &SendOptions::default(),
                None,
            )
            .await;

        assert!(!report.is_success());
        assert!(report.message.contains("file not found"));
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        tokio::fs::write(&file, b"payload").await.unwrap();

        // An unbound localhost port refuses immediately
        let options = SendOptions {
            port: 1,
            ..Default::default()
        };
        let sender = FileSender::new("alice").unwrap();
        let report = sender
            .send_file(&file, IpAddr::from(Ipv4Addr::LOCALHOST), &options, None)
            .await;

        assert!(!report.is_success());
        assert_eq!(
            report.outcome,
            crate::transfer::TransferOutcome::Failed
        );
    }
}
