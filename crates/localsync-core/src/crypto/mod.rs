//! Cryptographic primitives for LocalSync.
//!
//! This module provides:
//! - TLS configuration for transfer connections
//! - Self-signed certificate generation and persistence
//! - Password-based frame encryption (PBKDF2 + ChaCha20-Poly1305)
//! - SHA-256 checksums for end-to-end integrity
//!
//! ## Security Model
//!
//! - All transfers are encrypted with TLS
//! - Certificates are self-signed and unpinned: peers are trusted on first
//!   use, which is the appropriate model for a LAN-only tool
//! - The optional password layer protects payloads from the transport
//!   endpoints themselves; both sides must know the password out of band

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Certificate file name inside the certificate directory.
pub const CERT_FILE: &str = "server.crt";

/// Private key file name inside the certificate directory.
pub const KEY_FILE: &str = "server.key";

/// Lock file guarding first-run certificate generation.
const CERT_LOCK_FILE: &str = ".certgen.lock";

/// PBKDF2 iteration count for password key derivation.
const PBKDF2_ROUNDS: u32 = 100_000;

/// Salt length prepended to each encrypted frame.
const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305.
const NONCE_LEN: usize = 12;

/// TLS configuration for LocalSync connections.
///
/// Holds either a server or a client configuration. Use
/// [`TlsConfig::server`] on the receiving side (backed by the persistent
/// self-signed certificate) and [`TlsConfig::client`] on the sending side.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    server: Option<Arc<rustls::ServerConfig>>,
    client: Option<Arc<rustls::ClientConfig>>,
}

impl TlsConfig {
    /// Create a server TLS configuration backed by the certificate pair
    /// under `cert_dir`, generating the pair on first run.
    ///
    /// # Errors
    ///
    /// Returns an error if certificate generation, loading, or the rustls
    /// configuration fails.
    pub fn server(cert_dir: &Path) -> Result<Self> {
        let (certs, key) = ensure_certificates(cert_dir)?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::TlsError(format!("failed to build server config: {e}")))?;

        Ok(Self {
            server: Some(Arc::new(config)),
            client: None,
        })
    }

    /// Create a client TLS configuration.
    ///
    /// The client accepts self-signed certificates, which is necessary for
    /// the peer-to-peer model: there is no CA, so trust is placed in the
    /// request/accept handshake instead of the certificate chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be created.
    pub fn client() -> Result<Self> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertVerifier))
            .with_no_client_auth();

        Ok(Self {
            server: None,
            client: Some(Arc::new(config)),
        })
    }

    /// Get the server configuration, if this is a server config.
    #[must_use]
    pub fn server_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.server.clone()
    }

    /// Get the client configuration, if this is a client config.
    #[must_use]
    pub fn client_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        self.client.clone()
    }
}

/// Certificate verifier that accepts any certificate.
///
/// Trust in LocalSync comes from the explicit accept/decline handshake,
/// not from certificate chains.
#[derive(Debug)]
struct AcceptAnyCertVerifier;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Load the certificate pair under `cert_dir`, generating it on first run.
///
/// Generation is idempotent and guarded by a lock file so that multiple
/// receivers starting concurrently on a fresh install do not race: exactly
/// one process generates, the others wait for the files to appear.
///
/// # Errors
///
/// Returns an error if generation or loading fails, or if another process
/// holds the lock but never produces the files.
pub fn ensure_certificates(
    cert_dir: &Path,
) -> Result<(
    Vec<rustls::pki_types::CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
)> {
    fs::create_dir_all(cert_dir)?;

    let cert_path = cert_dir.join(CERT_FILE);
    let key_path = cert_dir.join(KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        return load_certificates(&cert_path, &key_path);
    }

    let lock_path = cert_dir.join(CERT_LOCK_FILE);
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(_) => {
            // Re-check under the lock: the pair may have appeared between
            // our existence check and lock acquisition.
            let result = if cert_path.exists() && key_path.exists() {
                Ok(())
            } else {
                generate_certificates(&cert_path, &key_path)
            };
            let _ = fs::remove_file(&lock_path);
            result?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            wait_for_certificates(&cert_path, &key_path)?;
        }
        Err(e) => return Err(e.into()),
    }

    load_certificates(&cert_path, &key_path)
}

fn generate_certificates(cert_path: &Path, key_path: &Path) -> Result<()> {
    let mut subject_alt_names = vec!["localhost".to_string()];
    if let Ok(host) = hostname::get() {
        subject_alt_names.push(host.to_string_lossy().to_string());
    }

    let cert_params = rcgen::CertificateParams::new(subject_alt_names)
        .map_err(|e| Error::CertificateError(format!("failed to create cert params: {e}")))?;

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| Error::CertificateError(format!("failed to generate key pair: {e}")))?;

    let cert = cert_params
        .self_signed(&key_pair)
        .map_err(|e| Error::CertificateError(format!("failed to self-sign cert: {e}")))?;

    fs::write(cert_path, cert.pem())?;
    fs::write(key_path, key_pair.serialize_pem())?;

    tracing::info!("Generated self-signed certificate at {}", cert_path.display());
    Ok(())
}

fn wait_for_certificates(cert_path: &Path, key_path: &Path) -> Result<()> {
    for _ in 0..50 {
        if cert_path.exists() && key_path.exists() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(Error::CertificateError(
        "timed out waiting for concurrent certificate generation".to_string(),
    ))
}

fn load_certificates(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(
    Vec<rustls::pki_types::CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
)> {
    let mut cert_reader = BufReader::new(fs::File::open(cert_path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::CertificateError(format!("failed to parse certificate: {e}")))?;

    if certs.is_empty() {
        return Err(Error::CertificateError(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::CertificateError(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| {
            Error::CertificateError(format!("no private key in {}", key_path.display()))
        })?;

    Ok((certs, key))
}

/// Derive a 32-byte encryption key from a password and salt.
fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), salt, PBKDF2_ROUNDS)
}

/// Encrypting side of the frame cipher.
///
/// The key is derived from the password once per transfer; every frame then
/// carries `salt (16) || nonce (12) || ciphertext` with a fresh nonce, so
/// each frame stays independently decryptable while the expensive key
/// derivation is not repeated per block.
pub struct FrameCipher {
    salt: [u8; SALT_LEN],
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher").finish_non_exhaustive()
    }
}

impl FrameCipher {
    /// Derive a fresh per-transfer key from the password.
    #[must_use]
    pub fn new(password: &str) -> Self {
        let salt = random_bytes::<SALT_LEN>();
        let key = derive_key(password, &salt);
        Self {
            salt,
            cipher: ChaCha20Poly1305::new((&key).into()),
        }
    }

    /// Encrypt one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = random_bytes::<NONCE_LEN>();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), data)
            .map_err(|_| Error::Encryption("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

/// Decrypting side of the frame cipher.
///
/// Each frame names its own salt, so frames are self-contained; the derived
/// key is cached and only re-derived when the salt changes.
pub struct FrameDecipher {
    password: String,
    cached: Option<([u8; SALT_LEN], ChaCha20Poly1305)>,
}

impl std::fmt::Debug for FrameDecipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecipher").finish_non_exhaustive()
    }
}

impl FrameDecipher {
    /// Create a decipher for the given password.
    #[must_use]
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            cached: None,
        }
    }

    /// Decrypt one frame produced by [`FrameCipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed, the password is wrong, or
    /// the ciphertext was tampered with (the AEAD tag fails).
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < SALT_LEN + NONCE_LEN {
            return Err(Error::Encryption("encrypted frame too short".to_string()));
        }

        let (salt, rest) = data.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let mut salt_arr = [0u8; SALT_LEN];
        salt_arr.copy_from_slice(salt);

        if !matches!(&self.cached, Some((cached_salt, _)) if *cached_salt == salt_arr) {
            let key = derive_key(&self.password, salt);
            self.cached = Some((salt_arr, ChaCha20Poly1305::new((&key).into())));
        }
        let Some((_, cipher)) = &self.cached else {
            return Err(Error::Internal("frame cipher cache empty".to_string()));
        };

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                Error::Encryption("decryption failed (wrong password or corrupt data)".to_string())
            })
    }
}

/// One-shot convenience around [`FrameCipher`].
///
/// # Errors
///
/// Returns an error if encryption fails.
pub fn encrypt(data: &[u8], password: &str) -> Result<Vec<u8>> {
    FrameCipher::new(password).encrypt(data)
}

/// One-shot convenience around [`FrameDecipher`].
///
/// # Errors
///
/// Returns an error if the block is malformed, the password is wrong, or
/// the ciphertext was tampered with.
pub fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>> {
    FrameDecipher::new(password).decrypt(data)
}

/// Generate cryptographically secure random bytes.
fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;

    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Incremental SHA-256 checksum over a byte stream.
///
/// Used by the streaming engine to accumulate the integrity tag while data
/// is produced, so arbitrarily large files never need to be buffered.
#[derive(Debug, Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
}

impl StreamingChecksum {
    /// Create a new, empty checksum.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Consume the checksum and return the hex-encoded digest.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex_encode(&self.hasher.finalize())
    }
}

/// Compute the hex-encoded checksum of an in-memory buffer.
#[must_use]
pub fn checksum_hex(data: &[u8]) -> String {
    let mut checksum = StreamingChecksum::new();
    checksum.update(data);
    checksum.finalize_hex()
}

/// Compute the hex-encoded checksum of a file, reading it in blocks.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn checksum_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut checksum = StreamingChecksum::new();
    let mut buf = vec![0u8; crate::STREAM_BLOCK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        checksum.update(&buf[..n]);
    }

    Ok(checksum.finalize_hex())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
