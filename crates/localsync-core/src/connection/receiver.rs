//! Receiving side of the connection manager.
//!
//! The receiver owns the TLS server context (backed by the persistent
//! self-signed certificate), binds the transfer port with bounded fallback,
//! and runs an accept loop that hands each connection to its own worker
//! task. Workers are fully isolated from each other: one misbehaving peer
//! cannot block the others.
//!
//! The acceptance decision consults the auto-accept policy first and only
//! then the external prompt, bounded by the configured request timeout. No
//! decision in time means decline.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsAcceptor;

use crate::config::ConfigSnapshot;
use crate::crypto::TlsConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    self, ControlResponse, FileMetadata, MessageReader, TransferRequest, METADATA_END, REQUEST_END,
};
use crate::transfer::{self, archive, format_size, ProgressCallback};
use crate::{DEFAULT_TRANSFER_PORT, FALLBACK_TRANSFER_PORTS};

/// Seconds granted to the TLS handshake of an accepted connection.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on joining live workers during shutdown.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a receiver instance.
#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    /// Preferred transfer port
    pub port: u16,
    /// Ports tried in order when the preferred one cannot be bound
    pub fallback_ports: Vec<u16>,
    /// Directory holding the certificate/key pair
    pub cert_dir: PathBuf,
    /// Directory received files are written into
    pub download_dir: PathBuf,
    /// Policy snapshot consulted for the acceptance decision
    pub config: ConfigSnapshot,
    /// Password for decrypting password-protected transfers
    pub password: Option<String>,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        let config = ConfigSnapshot::default();
        Self {
            port: DEFAULT_TRANSFER_PORT,
            fallback_ports: FALLBACK_TRANSFER_PORTS.to_vec(),
            cert_dir: default_cert_dir(),
            download_dir: config.default_download_dir.clone(),
            config,
            password: None,
        }
    }
}

/// An acceptance decision delegated to the external UI.
///
/// The worker sends this over the prompt channel and waits on `reply` for
/// at most `request_timeout` seconds; a dropped or late reply is a decline.
#[derive(Debug)]
pub struct AcceptRequest {
    /// The incoming transfer request
    pub request: TransferRequest,
    /// Address of the requesting peer
    pub peer: SocketAddr,
    /// Channel for the yes/no decision
    pub reply: oneshot::Sender<bool>,
}

/// Receiving side of the connection manager.
pub struct FileReceiver {
    local_port: u16,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for FileReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReceiver")
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl FileReceiver {
    /// Start a receiver: certificate lifecycle, port binding with fallback,
    /// and the accept loop. Returns immediately after spawning the loop.
    ///
    /// `prompt` is the channel acceptance decisions are delegated to when
    /// the auto-accept policy does not apply; without one, every such
    /// request is declined.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate pair cannot be prepared or no
    /// port from the configured list can be bound.
    pub async fn start(
        settings: ReceiverSettings,
        prompt: Option<mpsc::Sender<AcceptRequest>>,
        progress: Option<ProgressCallback>,
    ) -> Result<Self> {
        let tls = TlsConfig::server(&settings.cert_dir)?;
        let acceptor = TlsAcceptor::from(
            tls.server_config()
                .ok_or_else(|| Error::Internal("no server TLS config".to_string()))?,
        );

        let (listener, local_port) = bind_with_fallback(settings.port, &settings.fallback_ports)?;
        tracing::info!("Receiver listening on port {local_port}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            Arc::new(settings),
            prompt,
            progress,
            shutdown_rx,
        ));

        Ok(Self {
            local_port,
            shutdown_tx,
            accept_task: Some(accept_task),
        })
    }

    /// The port actually bound (differs from the preferred port after
    /// fallback).
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stop the receiver: unblock the accept loop, then join it and its
    /// workers with a bounded timeout. Stragglers are logged, not panicked
    /// over.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.accept_task.take() {
            match timeout(WORKER_SHUTDOWN_TIMEOUT * 2, task).await {
                Ok(Ok(())) => tracing::debug!("Receiver stopped"),
                Ok(Err(e)) => tracing::warn!("Accept loop ended abnormally: {e}"),
                Err(_) => tracing::warn!("Accept loop did not stop in time"),
            }
        }
    }
}

fn default_cert_dir() -> PathBuf {
    directories::UserDirs::new()
        .map_or_else(|| PathBuf::from("."), |dirs| dirs.home_dir().to_path_buf())
        .join(".localsync")
        .join("certs")
}

/// Bind the preferred port, then each fallback in order.
fn bind_with_fallback(port: u16, fallback_ports: &[u16]) -> Result<(TcpListener, u16)> {
    let mut attempted = Vec::new();

    for candidate in std::iter::once(port).chain(fallback_ports.iter().copied()) {
        attempted.push(candidate);
        match bind_listener(candidate) {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                if candidate != port {
                    tracing::info!("Port {port} unavailable, fell back to {bound}");
                }
                return Ok((listener, bound));
            }
            Err(e) => {
                tracing::debug!("Could not bind port {candidate}: {e}");
            }
        }
    }

    Err(Error::NoAvailablePort(attempted))
}

fn bind_listener(port: u16) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    socket.listen(16)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

#[allow(clippy::needless_pass_by_value)]
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    settings: Arc<ReceiverSettings>,
    prompt: Option<mpsc::Sender<AcceptRequest>>,
    progress: Option<ProgressCallback>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    tracing::debug!("Connection from {peer}");
                    let acceptor = acceptor.clone();
                    let settings = Arc::clone(&settings);
                    let prompt = prompt.clone();
                    let progress = progress.clone();

                    workers.spawn(async move {
                        match handle_connection(stream, peer, acceptor, &settings, prompt, progress).await {
                            Ok(()) => {}
                            Err(e) if e.is_decline() => {
                                tracing::info!("Declined transfer from {peer}");
                            }
                            Err(e) => {
                                tracing::warn!("Connection from {peer} failed: {e}");
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(result) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = result {
                    tracing::warn!("Transfer worker panicked: {e}");
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::debug!("Accept loop received shutdown signal");
                break;
            }
        }
    }

    // Release the port before joining workers; no new connections arrive
    // past this point. Live workers get a bounded grace period.
    drop(listener);

    let deadline = Instant::now() + WORKER_SHUTDOWN_TIMEOUT;
    while !workers.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::warn!(
                "{} transfer worker(s) did not finish in time, aborting",
                workers.len()
            );
            workers.abort_all();
            break;
        }
        match timeout(remaining, workers.join_next()).await {
            Ok(Some(Err(e))) => tracing::warn!("Transfer worker panicked: {e}"),
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(
                    "{} transfer worker(s) did not finish in time, aborting",
                    workers.len()
                );
                workers.abort_all();
                break;
            }
        }
    }
}

/// Run one connection through the full handshake-to-verification sequence.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    settings: &ReceiverSettings,
    prompt: Option<mpsc::Sender<AcceptRequest>>,
    progress: Option<ProgressCallback>,
) -> Result<()> {
    let tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| Error::Timeout(TLS_HANDSHAKE_TIMEOUT.as_secs()))?
        .map_err(|e| Error::TlsError(format!("TLS handshake failed: {e}")))?;

    let (read_half, mut write_half) = tokio::io::split(tls_stream);
    let mut reader = MessageReader::new(read_half);

    let request = read_request(&mut reader, &mut write_half).await?;

    let kind = if request.is_folder { "folder" } else { "file" };
    tracing::info!(
        "Incoming {kind} transfer request from {} ({}, {})",
        request.sender,
        request.file_name,
        format_size(request.file_size)
    );

    let accepted = decide(&settings.config, &request, peer, prompt).await;
    if !accepted {
        protocol::write_control(&mut write_half, &ControlResponse::Declined).await?;
        return Err(Error::TransferDeclined);
    }
    protocol::write_control(&mut write_half, &ControlResponse::Accepted).await?;

    let metadata = read_metadata(&mut reader, &mut write_half).await?;

    let result = receive_payload(&mut reader, settings, &metadata, progress).await;
    match result {
        Ok(name) => {
            protocol::write_control(&mut write_half, &ControlResponse::Success).await?;
            tracing::info!("{kind} received: {name}");
            Ok(())
        }
        Err(e) => {
            let response = ControlResponse::Error(e.to_string());
            let _ = protocol::write_control(&mut write_half, &response).await;
            drain_inbound(reader.get_mut()).await;
            Err(e)
        }
    }
}

async fn read_request<S>(
    reader: &mut MessageReader<ReadHalf<S>>,
    write_half: &mut WriteHalf<S>,
) -> Result<TransferRequest>
where
    S: AsyncRead + AsyncWrite,
{
    let body = match reader.read_message(REQUEST_END).await {
        Ok(body) => body,
        Err(e @ Error::OversizedMessage { .. }) => {
            let response = ControlResponse::Error("Request too large".to_string());
            let _ = protocol::write_control(write_half, &response).await;
            drain_inbound(reader.get_mut()).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    match protocol::decode_message::<TransferRequest>(&body)
        .map_err(|e| Error::ProtocolError(format!("invalid request: {e}")))
        .and_then(|request| request.validate().map(|()| request))
    {
        Ok(request) => Ok(request),
        Err(e) => {
            let response = ControlResponse::Error("Invalid request".to_string());
            let _ = protocol::write_control(write_half, &response).await;
            Err(e)
        }
    }
}

async fn read_metadata<S>(
    reader: &mut MessageReader<ReadHalf<S>>,
    write_half: &mut WriteHalf<S>,
) -> Result<FileMetadata>
where
    S: AsyncRead + AsyncWrite,
{
    let body = match reader.read_message(METADATA_END).await {
        Ok(body) => body,
        Err(e @ Error::OversizedMessage { .. }) => {
            let response = ControlResponse::Error("Metadata too large".to_string());
            let _ = protocol::write_control(write_half, &response).await;
            drain_inbound(reader.get_mut()).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    match protocol::decode_message::<FileMetadata>(&body)
        .map_err(|e| Error::ProtocolError(format!("invalid metadata: {e}")))
    {
        Ok(metadata) => Ok(metadata),
        Err(e) => {
            let response = ControlResponse::Error("Invalid metadata".to_string());
            let _ = protocol::write_control(write_half, &response).await;
            Err(e)
        }
    }
}

/// Apply the acceptance policy: auto-accept first, then the external
/// prompt, bounded by the request timeout. Everything else declines.
async fn decide(
    config: &ConfigSnapshot,
    request: &TransferRequest,
    peer: SocketAddr,
    prompt: Option<mpsc::Sender<AcceptRequest>>,
) -> bool {
    if config.should_auto_accept(request) {
        tracing::info!("Auto-accepted transfer from {}", request.sender);
        return true;
    }

    let Some(prompt) = prompt else {
        return false;
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let accept_request = AcceptRequest {
        request: request.clone(),
        peer,
        reply: reply_tx,
    };
    if prompt.send(accept_request).await.is_err() {
        tracing::debug!("Acceptance prompt is gone, declining");
        return false;
    }

    match timeout(Duration::from_secs(config.request_timeout), reply_rx).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(_)) => false,
        Err(_) => {
            tracing::info!("Acceptance prompt timed out, declining");
            false
        }
    }
}

/// Receive the payload into the download directory. Returns the display
/// name of what landed.
async fn receive_payload<R>(
    reader: &mut MessageReader<R>,
    settings: &ReceiverSettings,
    metadata: &FileMetadata,
    progress: Option<ProgressCallback>,
) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    tokio::fs::create_dir_all(&settings.download_dir).await?;

    if metadata.is_folder {
        let folder_name = sanitize_name(&metadata.original_folder_name);
        let archive_path = settings.download_dir.join(format!("{folder_name}.tar"));

        transfer::stream_receive(
            reader,
            &archive_path,
            metadata,
            settings.password.as_deref(),
            progress.as_ref(),
        )
        .await?;

        let unpack_result = archive::unpack_archive(&archive_path, &settings.download_dir).await;
        let _ = tokio::fs::remove_file(&archive_path).await;
        unpack_result?;

        Ok(folder_name)
    } else {
        let file_name = sanitize_name(&metadata.file_name);
        let dest_path = settings.download_dir.join(&file_name);

        transfer::stream_receive(
            reader,
            &dest_path,
            metadata,
            settings.password.as_deref(),
            progress.as_ref(),
        )
        .await?;

        Ok(file_name)
    }
}

/// Briefly drain whatever the peer already sent.
///
/// Closing a socket with unread inbound data resets the connection, which
/// can destroy an error response still in flight to the peer. A short,
/// bounded drain before the close lets the token arrive.
async fn drain_inbound<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut scratch = [0u8; 4096];
    let _ = timeout(Duration::from_millis(500), async {
        loop {
            match reader.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
}

/// Reduce a peer-supplied name to a bare file name. Anything path-like in
/// it ("../", absolute prefixes) is stripped.
fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map_or_else(|| "download".to_string(), |n| n.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("file.txt"), "file.txt");
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("/absolute/path.bin"), "path.bin");
        assert_eq!(sanitize_name(".."), "download");
        assert_eq!(sanitize_name(""), "download");
    }

    #[tokio::test]
    async fn test_bind_with_fallback_skips_taken_port() {
        let first = bind_listener(0).expect("bind ephemeral");
        let taken = first.local_addr().unwrap().port();

        // Preferred port is taken, the fallback (ephemeral) succeeds
        let (listener, port) = bind_with_fallback(taken, &[0]).expect("fallback");
        assert_ne!(port, taken);
        drop(listener);
        drop(first);
    }

    #[tokio::test]
    async fn test_bind_with_fallback_exhausted() {
        let first = bind_listener(0).expect("bind ephemeral");
        let taken = first.local_addr().unwrap().port();

        let result = bind_with_fallback(taken, &[taken, taken]);
        assert!(matches!(result, Err(Error::NoAvailablePort(_))));
        drop(first);
    }

    #[tokio::test]
    async fn test_decide_auto_accept() {
        let mut config = ConfigSnapshot {
            auto_accept: true,
            ..Default::default()
        };
        config.auto_accept_senders.insert("alice".to_string());
        let request = TransferRequest::new("f.txt", 10, "alice", false, None);

        let peer = SocketAddr::from(([127, 0, 0, 1], 9000));
        assert!(decide(&config, &request, peer, None).await);
    }

    #[tokio::test]
    async fn test_decide_no_prompt_declines() {
        let config = ConfigSnapshot::default();
        let request = TransferRequest::new("f.txt", 10, "alice", false, None);

        let peer = SocketAddr::from(([127, 0, 0, 1], 9000));
        assert!(!decide(&config, &request, peer, None).await);
    }

    #[tokio::test]
    async fn test_decide_prompt_answers() {
        let config = ConfigSnapshot::default();
        let request = TransferRequest::new("f.txt", 10, "alice", false, None);
        let peer = SocketAddr::from(([127, 0, 0, 1], 9000));

        let (tx, mut rx) = mpsc::channel::<AcceptRequest>(1);
        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.expect("prompt delivered");
            assert_eq!(pending.request.sender, "alice");
            pending.reply.send(true).unwrap();
        });

        assert!(decide(&config, &request, peer, Some(tx)).await);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_decide_timeout_declines() {
        let config = ConfigSnapshot {
            request_timeout: 0,
            ..Default::default()
        };
        let request = TransferRequest::new("f.txt", 10, "alice", false, None);
        let peer = SocketAddr::from(([127, 0, 0, 1], 9000));

        // Prompt receiver never answers
        let (tx, _rx) = mpsc::channel::<AcceptRequest>(1);
        assert!(!decide(&config, &request, peer, Some(tx)).await);
    }

    #[tokio::test]
    async fn test_decide_dropped_reply_declines() {
        let config = ConfigSnapshot::default();
        let request = TransferRequest::new("f.txt", 10, "alice", false, None);
        let peer = SocketAddr::from(([127, 0, 0, 1], 9000));

        let (tx, mut rx) = mpsc::channel::<AcceptRequest>(1);
        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.expect("prompt delivered");
            drop(pending.reply);
        });

        assert!(!decide(&config, &request, peer, Some(tx)).await);
        responder.await.unwrap();
    }
}
