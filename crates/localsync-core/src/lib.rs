//! # LocalSync Core Library
//!
//! `localsync-core` provides the core functionality for LocalSync, a
//! peer-to-peer file sharing tool for local networks.
//!
//! ## Features
//!
//! - **Presence discovery**: UDP broadcast announcements with a live peer set
//! - **Secure transfers**: TLS-encrypted transfers with an explicit
//!   request/accept handshake
//! - **Streaming pipeline**: chunked compression and optional encryption with
//!   constant memory use and checksum verification
//! - **Folder support**: directory trees travel as a single tar stream
//!
//! ## Modules
//!
//! - [`config`] - Read-only configuration snapshot (auto-accept policy)
//! - [`compression`] - Per-frame compression codecs
//! - [`connection`] - Sender and receiver connection managers
//! - [`crypto`] - TLS contexts, certificates, frame encryption, checksums
//! - [`discovery`] - Peer presence discovery over UDP
//! - [`protocol`] - Wire protocol: handshake messages and data framing
//! - [`transfer`] - Streaming transfer engine and folder archiver
//!
//! ## Example
//!
//! ```rust,ignore
//! use localsync_core::connection::{FileSender, SendOptions};
//! use localsync_core::discovery::DiscoveryService;
//!
//! let discovery = DiscoveryService::new(Default::default());
//! discovery.start("alice", "alice-laptop").await?;
//!
//! let peer = discovery.snapshot().await.into_iter().next().unwrap();
//! let sender = FileSender::new("alice")?;
//! let report = sender
//!     .send_file("notes.txt".as_ref(), peer.ip_address, &SendOptions::default())
//!     .await;
//! println!("{}", report.message);
//! ```
//!
//! ## Security model
//!
//! Transfers run over TLS with self-signed certificates and no pinning: this
//! is a trust-on-first-use LAN tool. Presence announcements are likewise
//! unauthenticated - any device can claim any `(username, device_name)` pair.
//! That limitation is part of the wire protocol and is deliberately kept.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod compression;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default discovery port (UDP)
pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;

/// Default transfer port (TCP + TLS)
pub const DEFAULT_TRANSFER_PORT: u16 = 8889;

/// Fallback transfer ports, tried in order when the default is taken
pub const FALLBACK_TRANSFER_PORTS: [u16; 4] = [8890, 8891, 8892, 8893];

/// Multicast group used when subnet broadcast is filtered
pub const MULTICAST_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(224, 1, 1, 1);

/// Presence broadcast interval in seconds
pub const BROADCAST_INTERVAL_SECS: u64 = 5;

/// Seconds after which an unrefreshed peer is dropped
pub const PEER_EXPIRY_SECS: f64 = 30.0;

/// Block size for the streaming transfer engine (64 KiB)
pub const STREAM_BLOCK_SIZE: usize = 64 * 1024;

/// Upper bound for an undelimited control message (64 KiB)
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

/// Default seconds to wait for an acceptance decision
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Current Unix time as float seconds, the timestamp unit used on the wire.
pub(crate) fn unix_time_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
