//! Peer presence discovery for LocalSync.
//!
//! Every running instance announces itself with a small JSON datagram on UDP
//! port 8888 and listens for the announcements of others, maintaining a live
//! set of visible peers.
//!
//! ## Protocol
//!
//! ```json
//! {"username": "alice", "device_name": "alice-laptop", "timestamp": 1699900000.0}
//! ```
//!
//! - Broadcast to the subnet broadcast address every 5 seconds
//! - Multicast group `224.1.1.1` as fallback transport where broadcast is
//!   filtered
//! - A peer unseen for 30 seconds is dropped
//! - The source address of the datagram is what peers connect to; an address
//!   claimed inside the payload is never trusted
//!
//! Announcements are unauthenticated: any device can claim any
//! `(username, device_name)` pair. This is a known protocol limitation and
//! is kept as-is for wire compatibility.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::{unix_time_secs, BROADCAST_INTERVAL_SECS, DEFAULT_DISCOVERY_PORT, MULTICAST_GROUP, PEER_EXPIRY_SECS};

/// Settings for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port announcements are sent to and received on
    pub port: u16,
    /// Subnet broadcast address for announcements
    pub broadcast_addr: Ipv4Addr,
    /// How often to announce presence
    pub broadcast_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            broadcast_interval: Duration::from_secs(BROADCAST_INTERVAL_SECS),
        }
    }
}

/// Presence announcement broadcast by every running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePacket {
    /// Username of the announcing peer
    pub username: String,
    /// Device name of the announcing peer
    pub device_name: String,
    /// Unix timestamp (float seconds) when the packet was sent
    pub timestamp: f64,
}

impl PresencePacket {
    /// Create a packet stamped with the current time.
    #[must_use]
    pub fn new(username: &str, device_name: &str) -> Self {
        Self {
            username: username.to_string(),
            device_name: device_name.to_string(),
            timestamp: unix_time_secs(),
        }
    }
}

/// A peer currently visible on the network.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    /// Username the peer announced
    pub username: String,
    /// Device name the peer announced
    pub device_name: String,
    /// Address the announcement arrived from
    pub ip_address: IpAddr,
    /// Timestamp of the most recent announcement
    pub last_seen: f64,
}

impl PeerRecord {
    /// Map key identifying this peer: `username@device_name`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}@{}", self.username, self.device_name)
    }
}

/// Maintains the live peer set via a broadcaster and a listener loop.
///
/// `start` spawns both loops and returns immediately; `stop` shuts them down
/// and releases the socket. Consumers only ever see snapshots of the peer
/// map, never a live reference.
#[derive(Debug)]
pub struct DiscoveryService {
    config: DiscoveryConfig,
    peers: Arc<Mutex<HashMap<String, PeerRecord>>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Create a discovery service. No sockets are opened until `start`.
    #[must_use]
    pub fn new(config: DiscoveryConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the broadcaster and listener loops.
    ///
    /// Returns immediately after spawning. Failing to bind the discovery
    /// port is fatal and surfaced to the caller; everything after that is
    /// logged and survived.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener socket cannot be bound.
    pub async fn start(&self, username: &str, device_name: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        let listen_socket = bind_listener(self.config.port)?;

        let listener = spawn_listener(
            listen_socket,
            username.to_string(),
            device_name.to_string(),
            Arc::clone(&self.peers),
            self.shutdown_tx.subscribe(),
        );
        let broadcaster = spawn_broadcaster(
            self.config.clone(),
            username.to_string(),
            device_name.to_string(),
            self.shutdown_tx.subscribe(),
        );

        tasks.push(listener);
        tasks.push(broadcaster);

        tracing::info!("Discovery started for {username} on {device_name}");
        Ok(())
    }

    /// Stop both loops and wait for them to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Discovery task did not shut down cleanly: {e}");
            }
        }
        tracing::debug!("Discovery service stopped");
    }

    /// Get a copy of the current peer set, with expired records swept.
    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers = self.peers.lock().await;
        sweep_expired(&mut peers, unix_time_secs());
        peers.values().cloned().collect()
    }
}

/// Best-effort device name for presence announcements.
#[must_use]
pub fn default_device_name() -> String {
    hostname::get().map_or_else(
        |_| "unknown-device".to_string(),
        |h| h.to_string_lossy().to_string(),
    )
}

fn bind_listener(port: u16) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;

    #[cfg(target_os = "macos")]
    socket.set_reuse_port(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;

    // Fallback transport; not fatal on networks without multicast support
    if let Err(e) = socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED) {
        tracing::debug!("Could not join multicast group: {e}");
    }

    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

fn spawn_listener(
    socket: UdpSocket,
    username: String,
    device_name: String,
    peers: Arc<Mutex<HashMap<String, PeerRecord>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, source)) => {
                            let mut peers = peers.lock().await;
                            handle_datagram(
                                &mut peers,
                                &username,
                                &device_name,
                                &buf[..len],
                                source,
                                unix_time_secs(),
                            );
                        }
                        Err(e) => {
                            tracing::warn!("Discovery receive error: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Discovery listener received shutdown signal");
                    break;
                }
            }
        }
    })
}

fn spawn_broadcaster(
    config: DiscoveryConfig,
    username: String,
    device_name: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = match send_presence(&config, &username, &device_name).await {
                Ok(()) => config.broadcast_interval,
                Err(e) => {
                    tracing::warn!("Broadcast error: {e}");
                    Duration::from_secs(1)
                }
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Discovery broadcaster received shutdown signal");
                    break;
                }
            }
        }
    })
}

/// Send one presence announcement on a fresh ephemeral socket.
///
/// A new socket per cycle avoids carrying stale socket state across network
/// changes. If the subnet broadcast is filtered, the multicast group is
/// tried before giving up on the cycle.
async fn send_presence(config: &DiscoveryConfig, username: &str, device_name: &str) -> Result<()> {
    let packet = PresencePacket::new(username, device_name);
    let json = serde_json::to_vec(&packet)
        .map_err(|e| crate::Error::Serialization(e.to_string()))?;

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket)?;

    let broadcast_addr = SocketAddrV4::new(config.broadcast_addr, config.port);
    if let Err(e) = socket.send_to(&json, broadcast_addr).await {
        tracing::debug!("Broadcast send failed ({e}), falling back to multicast");
        let multicast_addr = SocketAddrV4::new(MULTICAST_GROUP, config.port);
        socket.send_to(&json, multicast_addr).await?;
    }

    Ok(())
}

/// Apply one received datagram to the peer map.
fn handle_datagram(
    peers: &mut HashMap<String, PeerRecord>,
    own_username: &str,
    own_device_name: &str,
    data: &[u8],
    source: SocketAddr,
    now: f64,
) {
    let packet: PresencePacket = match serde_json::from_slice(data) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!("Ignoring malformed discovery datagram from {source}: {e}");
            return;
        }
    };

    // Our own broadcasts also arrive on the shared port
    if packet.username == own_username && packet.device_name == own_device_name {
        return;
    }

    if packet.timestamp > now - PEER_EXPIRY_SECS {
        let record = PeerRecord {
            username: packet.username,
            device_name: packet.device_name,
            // The UDP source is authoritative; payload addresses are never trusted
            ip_address: source.ip(),
            last_seen: packet.timestamp,
        };
        peers.insert(record.key(), record);
    }

    sweep_expired(peers, now);
}

/// Drop records not refreshed within the expiry window.
fn sweep_expired(peers: &mut HashMap<String, PeerRecord>, now: f64) {
    peers.retain(|_, record| record.last_seen >= now - PEER_EXPIRY_SECS);
}
