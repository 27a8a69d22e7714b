//! Peer directory
//!
//! The orchestrator only needs a continuously updated view of reachable
//! peers. [`LanDirectory`] builds that view from UDP multicast beacons;
//! [`StaticDirectory`] serves a fixed or manually edited set.

use crate::types::Peer;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Service type carried in every beacon
pub const DEFAULT_SERVICE_TYPE: &str = "_lanvoice._tcp";

/// Multicast group beacons are sent to
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);

/// Default UDP port for beacons
pub const DEFAULT_MULTICAST_PORT: u16 = 45890;

const MAX_BEACON_SIZE: usize = 2048;

/// Directory errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Socket setup or I/O failure
    #[error("Socket error: {0}")]
    SocketError(String),

    /// Beacon could not be encoded
    #[error("Encode error: {0}")]
    EncodeError(String),
}

impl From<std::io::Error> for DirectoryError {
    fn from(err: std::io::Error) -> Self {
        DirectoryError::SocketError(err.to_string())
    }
}

/// Source of reachable peers
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Current peer set; updated whenever membership changes
    fn peers(&self) -> watch::Receiver<Vec<Peer>>;

    /// Announce this device with its signaling port
    async fn advertise_self(&self, port: u16) -> Result<(), DirectoryError>;

    /// Begin discovering other devices
    async fn start_discovery(&self) -> Result<(), DirectoryError>;

    /// Stop advertising and discovery
    async fn stop(&self) -> Result<(), DirectoryError>;
}

/// Directory over a fixed, manually managed peer set
///
/// Useful when multicast is unavailable and in tests.
pub struct StaticDirectory {
    peers: watch::Sender<Vec<Peer>>,
}

impl StaticDirectory {
    /// Create a directory holding `peers`
    #[must_use]
    pub fn new(peers: Vec<Peer>) -> Self {
        let (tx, _) = watch::channel(sorted(peers));
        Self { peers: tx }
    }

    /// Replace the peer set
    pub fn set_peers(&self, peers: Vec<Peer>) {
        self.peers.send_replace(sorted(peers));
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    fn peers(&self) -> watch::Receiver<Vec<Peer>> {
        self.peers.subscribe()
    }

    async fn advertise_self(&self, _port: u16) -> Result<(), DirectoryError> {
        Ok(())
    }

    async fn start_discovery(&self) -> Result<(), DirectoryError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), DirectoryError> {
        Ok(())
    }
}

fn sorted(mut peers: Vec<Peer>) -> Vec<Peer> {
    peers.sort_by(|a, b| a.name.cmp(&b.name));
    peers
}

/// LAN directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Name advertised for this device; must be unique on the LAN
    pub service_name: String,
    /// Service type; beacons for other types are ignored
    pub service_type: String,
    /// UDP port for multicast beacons
    pub multicast_port: u16,
    /// Interval between beacons in milliseconds
    pub beacon_interval_ms: u64,
    /// Peers unseen for this long are dropped, in milliseconds
    pub peer_timeout_ms: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            service_name: "lanvoice".to_string(),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            multicast_port: DEFAULT_MULTICAST_PORT,
            beacon_interval_ms: 2000,
            peer_timeout_ms: 8000,
        }
    }
}

/// Beacon datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    service: String,
    name: String,
    #[serde(default)]
    port: u16,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    bye: bool,
}

struct Sighting {
    peer: Peer,
    last_seen: Instant,
}

/// Peers keyed by name
#[derive(Default)]
struct PeerTable {
    entries: HashMap<String, Sighting>,
}

impl PeerTable {
    /// Apply one beacon; returns true if the published set changes
    fn apply(&mut self, beacon: Beacon, from: IpAddr, now: Instant) -> bool {
        if beacon.bye {
            return self.entries.remove(&beacon.name).is_some();
        }

        let peer = Peer::new(beacon.name, from, beacon.port);
        match self.entries.get_mut(&peer.name) {
            Some(sighting) if sighting.peer == peer => {
                sighting.last_seen = now;
                false
            }
            _ => {
                self.entries.insert(
                    peer.name.clone(),
                    Sighting {
                        peer,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Drop peers unseen for `timeout`; returns true if any were dropped
    fn expire(&mut self, now: Instant, timeout: Duration) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|_, s| now.saturating_duration_since(s.last_seen) < timeout);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<Peer> {
        sorted(self.entries.values().map(|s| s.peer.clone()).collect())
    }
}

/// Decode a beacon datagram, filtering out our own and foreign ones
fn accept_beacon(bytes: &[u8], config: &DirectoryConfig) -> Option<Beacon> {
    let beacon: Beacon = serde_json::from_slice(bytes).ok()?;
    if beacon.service != config.service_type || beacon.name == config.service_name {
        return None;
    }
    if !beacon.bye && beacon.port == 0 {
        return None;
    }
    Some(beacon)
}

/// Peer directory over UDP multicast beacons
pub struct LanDirectory {
    config: DirectoryConfig,
    peers: watch::Sender<Vec<Peer>>,
    table: Arc<parking_lot::Mutex<PeerTable>>,
    socket: tokio::sync::Mutex<Option<Arc<UdpSocket>>>,
    advertised_port: parking_lot::Mutex<Option<u16>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl LanDirectory {
    /// Create a directory; nothing is bound until advertising or discovery starts
    #[must_use]
    pub fn new(config: DirectoryConfig) -> Self {
        let (peers, _) = watch::channel(Vec::new());
        Self {
            config,
            peers,
            table: Arc::new(parking_lot::Mutex::new(PeerTable::default())),
            socket: tokio::sync::Mutex::new(None),
            advertised_port: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Directory configuration
    #[must_use]
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), self.config.multicast_port)
    }

    async fn socket(&self) -> Result<Arc<UdpSocket>, DirectoryError> {
        let mut guard = self.socket.lock().await;
        if let Some(socket) = guard.as_ref() {
            return Ok(Arc::clone(socket));
        }
        let socket = Arc::new(make_multicast_socket(self.config.multicast_port)?);
        *guard = Some(Arc::clone(&socket));
        Ok(socket)
    }

    fn encode_beacon(&self, port: u16, bye: bool) -> Result<Vec<u8>, DirectoryError> {
        let beacon = Beacon {
            service: self.config.service_type.clone(),
            name: self.config.service_name.clone(),
            port,
            bye,
        };
        serde_json::to_vec(&beacon).map_err(|e| DirectoryError::EncodeError(e.to_string()))
    }
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

#[async_trait]
impl PeerDirectory for LanDirectory {
    fn peers(&self) -> watch::Receiver<Vec<Peer>> {
        self.peers.subscribe()
    }

    #[tracing::instrument(skip(self), fields(name = %self.config.service_name))]
    async fn advertise_self(&self, port: u16) -> Result<(), DirectoryError> {
        if self.advertised_port.lock().replace(port).is_some() {
            return Ok(());
        }

        let socket = self.socket().await?;
        let frame = self.encode_beacon(port, false)?;
        let dest = self.group_addr();
        let interval = Duration::from_millis(self.config.beacon_interval_ms);
        let max_jitter_ms = self.config.beacon_interval_ms / 4;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                // Jitter keeps co-started devices out of lockstep
                let jitter = rand::thread_rng().gen_range(0..=max_jitter_ms);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                if let Err(e) = socket.send_to(&frame, dest).await {
                    tracing::debug!(error = %e, "Failed to send discovery beacon");
                }
            }
        });
        self.tasks.lock().push(handle);

        tracing::info!(port, "Advertising on LAN");
        Ok(())
    }

    async fn start_discovery(&self) -> Result<(), DirectoryError> {
        let socket = self.socket().await?;

        let recv_handle = {
            let config = self.config.clone();
            let table = Arc::clone(&self.table);
            let peers = self.peers.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_BEACON_SIZE];
                loop {
                    let (n, from) = match socket.recv_from(&mut buf).await {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::warn!(error = %e, "Discovery socket receive failed");
                            break;
                        }
                    };
                    let Some(beacon) = accept_beacon(&buf[..n], &config) else {
                        continue;
                    };
                    let snapshot = {
                        let mut table = table.lock();
                        let (name, bye) = (beacon.name.clone(), beacon.bye);
                        if !table.apply(beacon, from.ip(), Instant::now()) {
                            continue;
                        }
                        if bye {
                            tracing::info!(peer = %name, "Peer left");
                        } else {
                            tracing::info!(peer = %name, addr = %from.ip(), "Peer discovered");
                        }
                        table.snapshot()
                    };
                    peers.send_replace(snapshot);
                }
            })
        };

        let expiry_handle = {
            let table = Arc::clone(&self.table);
            let peers = self.peers.clone();
            let timeout = Duration::from_millis(self.config.peer_timeout_ms);
            let period = Duration::from_millis(self.config.beacon_interval_ms);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let snapshot = {
                        let mut table = table.lock();
                        if !table.expire(Instant::now(), timeout) {
                            continue;
                        }
                        table.snapshot()
                    };
                    tracing::debug!(peers = snapshot.len(), "Expired stale peers");
                    peers.send_replace(snapshot);
                }
            })
        };

        self.tasks.lock().extend([recv_handle, expiry_handle]);
        tracing::info!(group = %self.group_addr(), "Discovery started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DirectoryError> {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }

        let advertised = self.advertised_port.lock().take();
        let socket = self.socket.lock().await.take();
        if let (Some(port), Some(socket)) = (advertised, socket) {
            let frame = self.encode_beacon(port, true)?;
            if let Err(e) = socket.send_to(&frame, self.group_addr()).await {
                tracing::debug!(error = %e, "Failed to send departure beacon");
            }
        }

        *self.table.lock() = PeerTable::default();
        self.peers.send_replace(Vec::new());
        tracing::info!("Discovery stopped");
        Ok(())
    }
}

impl Drop for LanDirectory {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> DirectoryConfig {
        DirectoryConfig {
            service_name: "office".to_string(),
            ..Default::default()
        }
    }

    fn beacon(name: &str, port: u16) -> Beacon {
        Beacon {
            service: DEFAULT_SERVICE_TYPE.to_string(),
            name: name.to_string(),
            port,
            bye: false,
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_beacon_wire_format() {
        let bytes = serde_json::to_string(&beacon("den", 5000)).unwrap();
        assert_eq!(
            bytes,
            r#"{"service":"_lanvoice._tcp","name":"den","port":5000}"#
        );

        let bye = Beacon {
            bye: true,
            ..beacon("den", 5000)
        };
        assert!(serde_json::to_string(&bye).unwrap().ends_with(r#","bye":true}"#));
    }

    #[test]
    fn test_accept_beacon_filters() {
        let config = config();
        let ok = br#"{"service":"_lanvoice._tcp","name":"den","port":5000}"#;
        assert_eq!(accept_beacon(ok, &config), Some(beacon("den", 5000)));

        let own = br#"{"service":"_lanvoice._tcp","name":"office","port":5000}"#;
        assert_eq!(accept_beacon(own, &config), None);

        let foreign = br#"{"service":"_printer._tcp","name":"den","port":5000}"#;
        assert_eq!(accept_beacon(foreign, &config), None);

        let no_port = br#"{"service":"_lanvoice._tcp","name":"den"}"#;
        assert_eq!(accept_beacon(no_port, &config), None);

        assert_eq!(accept_beacon(b"garbage", &config), None);
    }

    #[test]
    fn test_table_tracks_peers_sorted() {
        let mut table = PeerTable::default();
        let now = Instant::now();

        assert!(table.apply(beacon("kitchen", 4001), ip(3), now));
        assert!(table.apply(beacon("den", 4002), ip(2), now));
        // Repeated beacon only refreshes
        assert!(!table.apply(beacon("den", 4002), ip(2), now));
        // Moved to another port
        assert!(table.apply(beacon("den", 4003), ip(2), now));

        assert_eq!(
            table.snapshot(),
            vec![
                Peer::new("den", ip(2), 4003),
                Peer::new("kitchen", ip(3), 4001)
            ]
        );
    }

    #[test]
    fn test_table_bye_removes_peer() {
        let mut table = PeerTable::default();
        let now = Instant::now();
        table.apply(beacon("den", 4002), ip(2), now);

        let bye = Beacon {
            bye: true,
            ..beacon("den", 0)
        };
        assert!(table.apply(bye.clone(), ip(2), now));
        assert!(!table.apply(bye, ip(2), now));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn test_table_expires_stale_peers() {
        let mut table = PeerTable::default();
        let start = Instant::now();
        let timeout = Duration::from_secs(8);

        table.apply(beacon("den", 4002), ip(2), start);
        table.apply(beacon("kitchen", 4001), ip(3), start + Duration::from_secs(5));

        assert!(!table.expire(start + Duration::from_secs(7), timeout));
        assert!(table.expire(start + Duration::from_secs(9), timeout));
        assert_eq!(table.snapshot(), vec![Peer::new("kitchen", ip(3), 4001)]);
    }

    #[tokio::test]
    async fn test_static_directory() {
        let directory = StaticDirectory::new(vec![
            Peer::new("b", ip(2), 1),
            Peer::new("a", ip(1), 1),
        ]);
        let mut rx = directory.peers();
        assert_eq!(rx.borrow_and_update()[0].name, "a");

        directory.set_peers(vec![Peer::new("c", ip(3), 1)]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), vec![Peer::new("c", ip(3), 1)]);

        assert!(directory.advertise_self(1).await.is_ok());
        assert!(directory.start_discovery().await.is_ok());
        assert!(directory.stop().await.is_ok());
    }
}
