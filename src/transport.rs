//! One UDP endpoint, bound in exactly one of three modes, with a receive
//! task that demultiplexes inbound datagrams to the dispatcher and a
//! fire-and-forget send path.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DiscoverError, Result};
use crate::options::TransportMode;

/// Maximum receive buffer. Oversized inbound datagrams are truncated by the
/// kernel before we see them; we simply read up to this many bytes.
const MAX_DATAGRAM: usize = 16 * 1024;

/// Inactivity timeout for each `recv_from` wait; a timeout with no data
/// simply re-enters the wait, it has no other effect.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct InboundDatagram {
    pub source: SocketAddr,
    pub bytes: Vec<u8>,
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    mode: TransportMode,
    port: u16,
}

impl UdpTransport {
    pub fn bind(bind_address: &str, port: u16, reuse_addr: bool, mode: TransportMode) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(DiscoverError::Socket)?;

        if reuse_addr {
            socket.set_reuse_address(true).map_err(|source| DiscoverError::SocketOption {
                name: "SO_REUSEADDR",
                source,
            })?;
        }

        if matches!(mode, TransportMode::Broadcast { .. }) {
            socket.set_broadcast(true).map_err(|source| DiscoverError::SocketOption {
                name: "SO_BROADCAST",
                source,
            })?;
        }

        let local_addr: IpAddr = bind_address
            .parse()
            .map_err(|_| DiscoverError::InvalidOption("address"))?;
        let bind_sockaddr: SocketAddr = SocketAddr::new(local_addr, port);
        socket.bind(&bind_sockaddr.into()).map_err(|source| DiscoverError::Bind {
            addr: bind_sockaddr.to_string(),
            source,
        })?;

        if let TransportMode::Multicast { group, ttl } = &mode {
            let group_addr: std::net::Ipv4Addr = group
                .parse()
                .map_err(|_| DiscoverError::InvalidOption("multicast"))?;
            socket
                .join_multicast_v4(&group_addr, &std::net::Ipv4Addr::UNSPECIFIED)
                .map_err(|source| DiscoverError::SocketOption {
                    name: "IP_ADD_MEMBERSHIP",
                    source,
                })?;
            socket
                .set_multicast_ttl_v4(*ttl as u32)
                .map_err(|source| DiscoverError::SocketOption {
                    name: "IP_MULTICAST_TTL",
                    source,
                })?;
        }

        socket.set_nonblocking(true).map_err(DiscoverError::Socket)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(DiscoverError::Socket)?;

        Ok(UdpTransport {
            socket: Arc::new(socket),
            mode,
            port,
        })
    }

    /// Spawn the receive task. Decoding happens downstream, in the
    /// dispatcher — this task only demultiplexes raw bytes off the wire, so
    /// a slow user callback can never stall the socket read itself.
    pub fn spawn_receiver(&self, tx: mpsc::Sender<InboundDatagram>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)) => {
                        match result {
                            Ok(Ok((len, source))) => {
                                let datagram = InboundDatagram {
                                    source,
                                    bytes: buf[..len].to_vec(),
                                };
                                if tx.send(datagram).await.is_err() {
                                    // Receiver side dropped — the instance is shutting down.
                                    break;
                                }
                            }
                            Ok(Err(err)) => {
                                warn!(error = %err, "UDP recv error");
                            }
                            Err(_) => {
                                // Timeout with no data: loop again.
                            }
                        }
                    }
                }
            }
        })
    }

    /// Send `buffer` to every destination implied by the current mode. Each
    /// destination's send runs in its own short-lived task, so a slow or
    /// blocked socket write to one peer can never hold up the caller or the
    /// other destinations.
    pub async fn send(&self, buffer: &[u8]) {
        let buffer: Arc<[u8]> = Arc::from(buffer);
        match &self.mode {
            TransportMode::Unicast { targets } => {
                for target in targets {
                    let Ok(ip) = target.parse::<IpAddr>() else {
                        warn!(target, "invalid unicast target address, skipping");
                        continue;
                    };
                    self.spawn_send(Arc::clone(&buffer), SocketAddr::new(ip, self.port));
                }
            }
            TransportMode::Multicast { group, .. } => {
                if let Ok(ip) = group.parse::<IpAddr>() {
                    self.spawn_send(buffer, SocketAddr::new(ip, self.port));
                }
            }
            TransportMode::Broadcast { address } => {
                if let Ok(ip) = address.parse::<IpAddr>() {
                    self.spawn_send(buffer, SocketAddr::new(ip, self.port));
                }
            }
        }
    }

    /// Hand one outbound buffer to a fresh task. Best-effort: failures per
    /// destination are logged, never surfaced.
    fn spawn_send(&self, buffer: Arc<[u8]>, addr: SocketAddr) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(&buffer, addr).await {
                debug!(%addr, error = %err, "send to destination failed");
            }
        });
    }
}
