//! Integration tests for LocalSync file transfers.
//!
//! These tests run the full sender/receiver stack over loopback TCP + TLS:
//! handshake, acceptance policy, streaming pipeline, verification, and
//! shutdown. Discovery is exercised by its own unit tests; nothing here
//! depends on UDP broadcast, so the suite is CI-safe.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use localsync_core::compression::CompressionMethod;
use localsync_core::config::ConfigSnapshot;
use localsync_core::connection::{
    AcceptRequest, FileReceiver, FileSender, ReceiverSettings, SendOptions,
};
use localsync_core::crypto::{self, TlsConfig};
use localsync_core::protocol::{
    self, ControlResponse, FileMetadata, TransferRequest, METADATA_END, REQUEST_END,
};
use localsync_core::transfer::{ProgressCallback, TransferOutcome};

use common::{assert_files_equal, create_temp_dir, create_test_file, random_bytes};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn auto_accept_config(sender: &str) -> ConfigSnapshot {
    let mut config = ConfigSnapshot {
        auto_accept: true,
        ..Default::default()
    };
    config.auto_accept_senders.insert(sender.to_string());
    config
}

fn receiver_settings(base: &Path, config: ConfigSnapshot) -> ReceiverSettings {
    let download_dir = base.join("downloads");
    ReceiverSettings {
        port: 0, // ephemeral; tests must not collide on fixed ports
        fallback_ports: vec![],
        cert_dir: base.join("certs"),
        download_dir,
        config,
        password: None,
    }
}

async fn start_receiver(
    settings: ReceiverSettings,
    prompt: Option<mpsc::Sender<AcceptRequest>>,
) -> FileReceiver {
    FileReceiver::start(settings, prompt, None)
        .await
        .expect("failed to start receiver")
}

fn send_options(port: u16) -> SendOptions {
    SendOptions {
        port,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_single_file_transfer_auto_accept() {
    let temp_dir = create_temp_dir();
    let content = random_bytes(256 * 1024);
    let source = create_test_file(temp_dir.path(), "test.bin", &content);

    let settings = receiver_settings(temp_dir.path(), auto_accept_config("alice"));
    let download_dir = settings.download_dir.clone();
    let mut receiver = start_receiver(settings, None).await;

    let sender = FileSender::new("alice").expect("create sender");
    let report = sender
        .send_file(&source, LOCALHOST, &send_options(receiver.local_port()), None)
        .await;

    assert!(report.is_success(), "transfer failed: {}", report.message);
    assert_files_equal(&source, &download_dir.join("test.bin"));

    receiver.stop().await;
}

#[tokio::test]
async fn test_transfer_with_compression_and_encryption() {
    let temp_dir = create_temp_dir();
    // Mix of compressible and random content, several blocks long
    let mut content = b"compressible stretch of data ".repeat(20_000);
    content.extend(random_bytes(128 * 1024));
    let source = create_test_file(temp_dir.path(), "mixed.bin", &content);

    let mut settings = receiver_settings(temp_dir.path(), auto_accept_config("alice"));
    settings.password = Some("shared secret".to_string());
    let download_dir = settings.download_dir.clone();
    let mut receiver = start_receiver(settings, None).await;

    let options = SendOptions {
        compression: CompressionMethod::Zstd,
        password: Some("shared secret".to_string()),
        port: receiver.local_port(),
    };
    let sender = FileSender::new("alice").expect("create sender");
    let report = sender.send_file(&source, LOCALHOST, &options, None).await;

    assert!(report.is_success(), "transfer failed: {}", report.message);
    assert_files_equal(&source, &download_dir.join("mixed.bin"));

    receiver.stop().await;
}

#[tokio::test]
async fn test_zero_byte_file_transfer() {
    let temp_dir = create_temp_dir();
    let source = create_test_file(temp_dir.path(), "empty.txt", b"");

    let settings = receiver_settings(temp_dir.path(), auto_accept_config("alice"));
    let download_dir = settings.download_dir.clone();
    let mut receiver = start_receiver(settings, None).await;

    let sender = FileSender::new("alice").expect("create sender");
    let report = sender
        .send_file(&source, LOCALHOST, &send_options(receiver.local_port()), None)
        .await;

    assert!(report.is_success(), "transfer failed: {}", report.message);
    let received = download_dir.join("empty.txt");
    assert!(received.exists());
    assert_eq!(std::fs::read(&received).unwrap().len(), 0);

    receiver.stop().await;
}

#[tokio::test]
async fn test_decline_leaves_no_bytes_on_disk() {
    let temp_dir = create_temp_dir();
    let source = create_test_file(temp_dir.path(), "unwanted.bin", &random_bytes(4096));

    // Auto-accept off; the prompt says no
    let settings = receiver_settings(temp_dir.path(), ConfigSnapshot::default());
    let download_dir = settings.download_dir.clone();

    let (prompt_tx, mut prompt_rx) = mpsc::channel::<AcceptRequest>(1);
    let responder = tokio::spawn(async move {
        let pending = prompt_rx.recv().await.expect("prompt delivered");
        assert_eq!(pending.request.sender, "mallory");
        assert_eq!(pending.request.file_name, "unwanted.bin");
        pending.reply.send(false).unwrap();
    });

    let mut receiver = start_receiver(settings, Some(prompt_tx)).await;

    let sender = FileSender::new("mallory").expect("create sender");
    let report = sender
        .send_file(&source, LOCALHOST, &send_options(receiver.local_port()), None)
        .await;

    assert_eq!(report.outcome, TransferOutcome::Declined);
    assert!(report.message.contains("declined"));

    responder.await.unwrap();

    let entries: Vec<_> = std::fs::read_dir(&download_dir)
        .map(|dir| dir.collect())
        .unwrap_or_default();
    assert!(entries.is_empty(), "no bytes may land after a decline");

    receiver.stop().await;
}

/// The full scenario from the design notes: a 10 MB file with compression
/// on and encryption off, auto-accept disabled, prompt answering yes within
/// the timeout. The received file must be byte-identical and the progress
/// callback monotonically non-decreasing, ending at the total.
#[tokio::test]
async fn test_large_transfer_with_prompt_and_progress() {
    let temp_dir = create_temp_dir();
    let content = random_bytes(10 * 1024 * 1024);
    let source = create_test_file(temp_dir.path(), "large.bin", &content);

    let settings = receiver_settings(temp_dir.path(), ConfigSnapshot::default());
    let download_dir = settings.download_dir.clone();

    let (prompt_tx, mut prompt_rx) = mpsc::channel::<AcceptRequest>(1);
    let responder = tokio::spawn(async move {
        let pending = prompt_rx.recv().await.expect("prompt delivered");
        pending.reply.send(true).unwrap();
    });

    let mut receiver = start_receiver(settings, Some(prompt_tx)).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = Arc::clone(&seen);
    let progress: ProgressCallback = Arc::new(move |done, total, _stage| {
        seen_cb.lock().unwrap().push((done, total));
    });

    let options = SendOptions {
        compression: CompressionMethod::Zlib,
        password: None,
        port: receiver.local_port(),
    };
    let sender = FileSender::new("alice").expect("create sender");
    let report = sender
        .send_file(&source, LOCALHOST, &options, Some(progress))
        .await;

    assert!(report.is_success(), "transfer failed: {}", report.message);
    responder.await.unwrap();

    assert_files_equal(&source, &download_dir.join("large.bin"));

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(
        seen.windows(2).all(|w| w[0].0 <= w[1].0),
        "progress must be monotonically non-decreasing"
    );
    assert_eq!(seen.last().unwrap().0, content.len() as u64);
    assert!(seen.iter().all(|&(_, total)| total == content.len() as u64));

    receiver.stop().await;
}

#[tokio::test]
async fn test_folder_transfer() {
    let temp_dir = create_temp_dir();
    let tree = temp_dir.path().join("photos");
    std::fs::create_dir_all(tree.join("album")).unwrap();
    create_test_file(&tree, "a.txt", b"top level file");
    create_test_file(&tree.join("album"), "b.bin", &random_bytes(128 * 1024));

    let settings = receiver_settings(temp_dir.path(), auto_accept_config("alice"));
    let download_dir = settings.download_dir.clone();

    let mut receiver = start_receiver(settings, None).await;

    let sender = FileSender::new("alice").expect("create sender");
    let report = sender
        .send_folder(&tree, LOCALHOST, &send_options(receiver.local_port()), None)
        .await;

    assert!(report.is_success(), "transfer failed: {}", report.message);

    let restored = download_dir.join("photos");
    assert_files_equal(&tree.join("a.txt"), &restored.join("a.txt"));
    assert_files_equal(&tree.join("album/b.bin"), &restored.join("album/b.bin"));

    // The intermediate archive must not survive in the download dir
    assert!(!download_dir.join("photos.tar").exists());
    assert!(!download_dir.join("photos.tar.part").exists());

    receiver.stop().await;
}

#[tokio::test]
async fn test_folder_request_carries_item_count() {
    let temp_dir = create_temp_dir();
    let tree = temp_dir.path().join("tree");
    std::fs::create_dir_all(tree.join("sub")).unwrap();
    create_test_file(&tree, "one.txt", b"1");
    create_test_file(&tree.join("sub"), "two.txt", b"2");

    let settings = receiver_settings(temp_dir.path(), ConfigSnapshot::default());

    let (prompt_tx, mut prompt_rx) = mpsc::channel::<AcceptRequest>(1);
    let responder = tokio::spawn(async move {
        let pending = prompt_rx.recv().await.expect("prompt delivered");
        assert!(pending.request.is_folder);
        let count = pending.request.item_count.expect("folders carry counts");
        assert_eq!(count.files, 2);
        assert_eq!(count.folders, 1);
        pending.reply.send(true).unwrap();
    });

    let mut receiver = start_receiver(settings, Some(prompt_tx)).await;

    let sender = FileSender::new("alice").expect("create sender");
    let report = sender
        .send_folder(&tree, LOCALHOST, &send_options(receiver.local_port()), None)
        .await;

    assert!(report.is_success(), "transfer failed: {}", report.message);
    responder.await.unwrap();

    receiver.stop().await;
}

#[tokio::test]
async fn test_port_fallback() {
    let temp_dir = create_temp_dir();

    let settings_a = receiver_settings(temp_dir.path(), ConfigSnapshot::default());
    let mut receiver_a = start_receiver(settings_a, None).await;
    let taken_port = receiver_a.local_port();

    // Second receiver prefers the taken port but has a fallback
    let mut settings_b = receiver_settings(temp_dir.path(), ConfigSnapshot::default());
    settings_b.port = taken_port;
    settings_b.fallback_ports = vec![0];
    let mut receiver_b = start_receiver(settings_b, None).await;

    assert_ne!(receiver_b.local_port(), taken_port);
    assert_ne!(receiver_b.local_port(), 0);

    receiver_a.stop().await;
    receiver_b.stop().await;
}

#[tokio::test]
async fn test_no_port_available_is_fatal() {
    let temp_dir = create_temp_dir();

    let settings_a = receiver_settings(temp_dir.path(), ConfigSnapshot::default());
    let mut receiver_a = start_receiver(settings_a, None).await;
    let taken_port = receiver_a.local_port();

    let mut settings_b = receiver_settings(temp_dir.path(), ConfigSnapshot::default());
    settings_b.port = taken_port;
    settings_b.fallback_ports = vec![taken_port];
    let result = FileReceiver::start(settings_b, None, None).await;
    assert!(result.is_err());

    receiver_a.stop().await;
}

/// Drive the wire protocol by hand and declare a checksum that cannot
/// match: the receiver must discard the partial file and answer with an
/// error token.
#[tokio::test]
async fn test_corrupt_stream_is_rejected_and_discarded() {
    let temp_dir = create_temp_dir();
    let settings = receiver_settings(temp_dir.path(), auto_accept_config("alice"));
    let download_dir = settings.download_dir.clone();
    let mut receiver = start_receiver(settings, None).await;

    let mut stream = connect_raw(receiver.local_port()).await;

    let payload = b"bytes that will not match the declared checksum".to_vec();
    let request = TransferRequest::new("poisoned.bin", payload.len() as u64, "alice", false, None);
    protocol::write_message(&mut stream, &request, REQUEST_END)
        .await
        .unwrap();
    assert_eq!(
        protocol::read_control(&mut stream).await.unwrap(),
        ControlResponse::Accepted
    );

    let metadata = FileMetadata {
        file_name: "poisoned.bin".to_string(),
        file_size: payload.len() as u64,
        compressed_size: 0,
        compression_method: CompressionMethod::None,
        encrypted: false,
        checksum: "0".repeat(64),
        timestamp: 0.0,
        is_folder: false,
        original_folder_name: "poisoned.bin".to_string(),
    };
    protocol::write_message(&mut stream, &metadata, METADATA_END)
        .await
        .unwrap();

    protocol::write_frame(&mut stream, &payload).await.unwrap();
    protocol::write_stream_end(&mut stream).await.unwrap();

    let status = protocol::read_control(&mut stream).await.unwrap();
    assert!(
        matches!(status, ControlResponse::Error(_)),
        "expected error token, got {status:?}"
    );

    assert!(!download_dir.join("poisoned.bin").exists());
    assert!(!download_dir.join("poisoned.bin.part").exists());

    receiver.stop().await;
}

/// A request that never produces its delimiter must be cut off at the
/// 64 KiB bound with an explicit error, not buffered indefinitely.
#[tokio::test]
async fn test_oversized_request_is_rejected() {
    let temp_dir = create_temp_dir();
    let settings = receiver_settings(temp_dir.path(), auto_accept_config("alice"));
    let mut receiver = start_receiver(settings, None).await;

    let mut stream = connect_raw(receiver.local_port()).await;

    let junk = vec![b'x'; 80 * 1024];
    stream.write_all(&junk).await.unwrap();
    stream.flush().await.unwrap();

    let status = protocol::read_control(&mut stream).await.unwrap();
    match status {
        ControlResponse::Error(reason) => assert!(reason.contains("too large")),
        other => panic!("expected error token, got {other:?}"),
    }

    receiver.stop().await;
}

#[tokio::test]
async fn test_encrypted_transfer_without_receiver_password_fails() {
    let temp_dir = create_temp_dir();
    let source = create_test_file(temp_dir.path(), "secret.bin", &random_bytes(8192));

    // Receiver has no password configured
    let settings = receiver_settings(temp_dir.path(), auto_accept_config("alice"));
    let download_dir = settings.download_dir.clone();
    let mut receiver = start_receiver(settings, None).await;

    let options = SendOptions {
        password: Some("only the sender knows".to_string()),
        port: receiver.local_port(),
        ..Default::default()
    };
    let sender = FileSender::new("alice").expect("create sender");
    let report = sender.send_file(&source, LOCALHOST, &options, None).await;

    assert_eq!(report.outcome, TransferOutcome::Failed);
    assert!(!download_dir.join("secret.bin").exists());

    receiver.stop().await;
}

#[tokio::test]
async fn test_stopped_receiver_refuses_connections() {
    let temp_dir = create_temp_dir();
    let settings = receiver_settings(temp_dir.path(), ConfigSnapshot::default());
    let mut receiver = start_receiver(settings, None).await;
    let port = receiver.local_port();

    receiver.stop().await;

    let result = tokio::net::TcpStream::connect((LOCALHOST, port)).await;
    assert!(result.is_err(), "stopped receiver must release its port");
}

/// Open a TLS connection to the local receiver without going through
/// `FileSender`, for tests that speak the protocol by hand.
async fn connect_raw(port: u16) -> tokio_rustls::client::TlsStream<tokio::net::TcpStream> {
    let tcp = tokio::net::TcpStream::connect((LOCALHOST, port))
        .await
        .expect("tcp connect");

    let tls = TlsConfig::client().expect("client tls config");
    let connector = tokio_rustls::TlsConnector::from(tls.client_config().expect("client config"));
    connector
        .connect(rustls::pki_types::ServerName::from(LOCALHOST), tcp)
        .await
        .expect("tls connect")
}

#[tokio::test]
async fn test_checksum_helpers_are_consistent() {
    // Guards the sender-side invariant: the checksum in the metadata is the
    // digest of the file exactly as stored on disk
    let temp_dir = create_temp_dir();
    let content = random_bytes(200_000);
    let path = create_test_file(temp_dir.path(), "c.bin", &content);

    let from_file = crypto::checksum_file(&path).await.unwrap();
    let from_memory = crypto::checksum_hex(&content);
    assert_eq!(from_file, from_memory);
}
