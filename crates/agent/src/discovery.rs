//! LAN peer discovery over UDP multicast.
//!
//! Peers announce themselves as JSON datagrams on a shared multicast group
//! (`224.0.0.167:53318` by default). The service runs in two modes:
//!
//! - **Continuous**: [`DiscoveryService::run`] listens until cancelled,
//!   re-announcing whenever the group goes quiet, and streams every newly
//!   seen peer to a channel.
//! - **Bounded scan**: [`DiscoveryService::scan_once`] sends a short burst
//!   of announcements, collects responses for a fixed window and returns
//!   the deduplicated peer list.
//!
//! Identity is keyed by fingerprint: our own datagrams echoed back by the
//! group are excluded, and each peer is reported once per session no matter
//! how many times it announces.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tether_protocol::{DiscoveredPeer, PeerAnnouncement};

use crate::config::NetworkConfig;
use crate::pairing::LocalIdentity;

/// Maximum announcement datagram size we accept.
const MAX_DATAGRAM: usize = 2048;

/// Tuning knobs for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast group announcements are exchanged on.
    pub group: Ipv4Addr,
    /// UDP port of the multicast group.
    pub port: u16,
    /// Quiet period in continuous mode before re-announcing.
    pub read_timeout: Duration,
    /// Number of announcements sent at the start of a bounded scan.
    pub burst_count: u32,
    /// Spacing between burst announcements.
    pub burst_spacing: Duration,
    /// Whether continuous mode answers peer probes with a unicast response.
    pub respond_to_probes: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(224, 0, 0, 167),
            port: 53318,
            read_timeout: Duration::from_secs(1),
            burst_count: 3,
            burst_spacing: Duration::from_millis(300),
            respond_to_probes: false,
        }
    }
}

impl DiscoveryConfig {
    /// Builds discovery tuning from the agent network configuration.
    pub fn from_network(network: &NetworkConfig) -> Self {
        Self {
            group: network.discovery_group,
            port: network.discovery_port,
            ..Self::default()
        }
    }
}

/// LAN discovery service for one local identity.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    alias: String,
    fingerprint: String,
    device_model: Option<String>,
    device_kind: String,
    /// Channel port advertised to peers.
    channel_port: u16,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig, identity: &LocalIdentity, channel_port: u16) -> Self {
        Self {
            config,
            alias: identity.device_name.clone(),
            fingerprint: identity.device_id.clone(),
            device_model: identity.device_model.clone(),
            device_kind: identity.device_kind.clone(),
            channel_port,
        }
    }

    /// The datagram body this service broadcasts.
    ///
    /// `announce` is `true` for periodic broadcasts and `false` for direct
    /// responses to a peer probe.
    pub fn announcement(&self, announce: bool) -> PeerAnnouncement {
        PeerAnnouncement {
            alias: self.alias.clone(),
            version: tether_protocol::ANNOUNCE_VERSION.to_string(),
            device_model: self.device_model.clone(),
            device_type: self.device_kind.clone(),
            fingerprint: self.fingerprint.clone(),
            port: self.channel_port,
            protocol: "ws".to_string(),
            announce,
        }
    }

    /// Runs continuous discovery until the token is cancelled.
    ///
    /// Newly seen peers are sent to `found`; the loop also ends if that
    /// receiver is dropped. Whenever the group stays quiet for the read
    /// timeout, the service re-announces itself.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        found: mpsc::Sender<DiscoveredPeer>,
    ) -> Result<()> {
        let (socket, interface) = self.bind().await?;
        let mut seen = HashSet::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        info!(
            "Discovery listening on {}:{} as {}",
            self.config.group, self.config.port, self.alias
        );
        self.send_announcement(&socket, true).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = timeout(self.config.read_timeout, socket.recv_from(&mut buf)) => {
                    match received {
                        Ok(Ok((len, src))) => {
                            if let Some(peer) = self.handle_datagram(&socket, &mut seen, &buf[..len], src).await {
                                if found.send(peer).await.is_err() {
                                    debug!("Discovery receiver dropped, stopping");
                                    break;
                                }
                            }
                        }
                        Ok(Err(e)) => warn!("Discovery receive failed: {}", e),
                        // Quiet group: remind peers we exist
                        Err(_) => self.send_announcement(&socket, true).await,
                    }
                }
            }
        }

        self.leave(&socket, interface);
        info!("Discovery stopped");
        Ok(())
    }

    /// Performs one bounded scan and returns the peers seen in the window.
    ///
    /// Announcements are sent as a short burst at the start of the window
    /// so peers that just missed one still hear a retry.
    pub async fn scan_once(&self, window: Duration) -> Result<Vec<DiscoveredPeer>> {
        let (socket, interface) = self.bind().await?;
        let deadline = Instant::now() + window;
        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        let mut bursts_sent = 0u32;
        let mut next_burst = Instant::now();

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            if bursts_sent < self.config.burst_count && now >= next_burst {
                self.send_announcement(&socket, true).await;
                bursts_sent += 1;
                next_burst = now + self.config.burst_spacing;
            }

            // Wake up for the next burst or the end of the window,
            // whichever comes first.
            let wake_at = if bursts_sent < self.config.burst_count {
                deadline.min(next_burst)
            } else {
                deadline
            };

            match timeout_at(wake_at, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, src))) => {
                    if let Some(peer) =
                        register_peer(&mut seen, &self.fingerprint, &buf[..len], src)
                    {
                        info!("Discovered {}", peer);
                        peers.push(peer);
                    }
                }
                Ok(Err(e)) => warn!("Discovery receive failed: {}", e),
                Err(_) => {}
            }
        }

        self.leave(&socket, interface);
        Ok(peers)
    }

    /// Answers a specific peer with a unicast response datagram.
    pub async fn send_response(&self, target: IpAddr) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("Failed to bind response socket")?;
        let bytes = self.announcement(false).encode()?;
        socket
            .send_to(&bytes, (target, self.config.port))
            .await
            .with_context(|| format!("Failed to send discovery response to {target}"))?;
        debug!("Sent discovery response to {}", target);
        Ok(())
    }

    async fn handle_datagram(
        &self,
        socket: &UdpSocket,
        seen: &mut HashSet<String>,
        datagram: &[u8],
        src: SocketAddr,
    ) -> Option<DiscoveredPeer> {
        if self.config.respond_to_probes {
            if let Ok(announcement) = PeerAnnouncement::decode(datagram) {
                if announcement.announce && announcement.fingerprint != self.fingerprint {
                    let response = self.announcement(false);
                    if let Ok(bytes) = response.encode() {
                        if let Err(e) = socket.send_to(&bytes, (src.ip(), self.config.port)).await {
                            warn!("Failed to answer probe from {}: {}", src, e);
                        }
                    }
                }
            }
        }

        register_peer(seen, &self.fingerprint, datagram, src)
    }

    /// Binds the shared multicast socket.
    ///
    /// `SO_REUSEADDR` is set so several agents on one host can share the
    /// group, and multicast loopback stays enabled so they hear each other.
    /// Joining is tried on the primary interface first, then falls back to
    /// the interface-agnostic join.
    async fn bind(&self) -> Result<(UdpSocket, Ipv4Addr)> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create discovery socket")?;
        socket
            .set_reuse_address(true)
            .context("Failed to set SO_REUSEADDR")?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.port).into())
            .with_context(|| format!("Failed to bind UDP port {}", self.config.port))?;
        socket
            .set_nonblocking(true)
            .context("Failed to set non-blocking mode")?;

        let socket = UdpSocket::from_std(socket.into())
            .context("Failed to register discovery socket with the runtime")?;

        let joined_on = match primary_interface_addr() {
            Some(interface) => match socket.join_multicast_v4(self.config.group, interface) {
                Ok(()) => {
                    debug!("Joined {} on interface {}", self.config.group, interface);
                    Some(interface)
                }
                Err(e) => {
                    debug!(
                        "Join on interface {} failed ({}), retrying interface-agnostic",
                        interface, e
                    );
                    None
                }
            },
            None => None,
        };
        let interface = match joined_on {
            Some(interface) => interface,
            None => {
                socket
                    .join_multicast_v4(self.config.group, Ipv4Addr::UNSPECIFIED)
                    .with_context(|| {
                        format!("Failed to join multicast group {}", self.config.group)
                    })?;
                Ipv4Addr::UNSPECIFIED
            }
        };

        socket
            .set_multicast_loop_v4(true)
            .context("Failed to enable multicast loopback")?;

        Ok((socket, interface))
    }

    async fn send_announcement(&self, socket: &UdpSocket, announce: bool) {
        let bytes = match self.announcement(announce).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode announcement: {}", e);
                return;
            }
        };
        if let Err(e) = socket
            .send_to(&bytes, (self.config.group, self.config.port))
            .await
        {
            warn!("Failed to send announcement: {}", e);
        }
    }

    /// Leaves the group on the same interface it was joined on.
    fn leave(&self, socket: &UdpSocket, interface: Ipv4Addr) {
        if let Err(e) = socket.leave_multicast_v4(self.config.group, interface) {
            debug!("Failed to leave multicast group: {}", e);
        }
    }
}

/// Decodes one datagram and applies the self-exclusion and dedupe rules.
///
/// Returns the peer only the first time its fingerprint is seen.
fn register_peer(
    seen: &mut HashSet<String>,
    self_fingerprint: &str,
    datagram: &[u8],
    src: SocketAddr,
) -> Option<DiscoveredPeer> {
    let announcement = match PeerAnnouncement::decode(datagram) {
        Ok(announcement) => announcement,
        Err(e) => {
            debug!("Ignoring undecodable datagram from {}: {}", src, e);
            return None;
        }
    };

    if announcement.fingerprint == self_fingerprint {
        trace!("Ignoring our own announcement");
        return None;
    }

    if !seen.insert(announcement.fingerprint.clone()) {
        trace!("Ignoring already-seen peer {}", announcement.fingerprint);
        return None;
    }

    Some(DiscoveredPeer::new(announcement, src.ip().to_string()))
}

/// Best-effort guess at the primary outbound IPv4 interface.
///
/// Connecting a UDP socket performs route selection without sending any
/// packets; the resulting local address identifies the interface.
fn primary_interface_addr() -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.connect(("8.8.8.8", 80)).ok()?;
    match probe.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_loopback() => Some(*addr.ip()),
        _ => None,
    }
}
