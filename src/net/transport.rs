//! UDP transport: port-probing listener, dedicated sender task, and
//! subnet-aware broadcast.
//!
//! Exactly one task owns the outbound socket; everything else enqueues
//! [`Outbound`] frames on a channel. Broadcast never targets
//! 255.255.255.255 — the destination is the subnet broadcast address of
//! the interface carrying the default route, with `x.y.z.255` as the
//! fallback when the interface table gives nothing better.

use super::protocol::NetError;
use super::types::{DEFAULT_PORT, PORT_PROBE_RANGE};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where one outbound frame goes.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    Unicast(SocketAddr),
    /// Subnet broadcast, always to port [`DEFAULT_PORT`].
    Broadcast,
}

#[derive(Debug)]
pub struct Outbound {
    pub target: Target,
    pub payload: Vec<u8>,
}

/// Handle to the sender task plus the local addressing facts every other
/// component needs (own ip, bound port, resolved broadcast address).
pub struct Transport {
    local_ip: Ipv4Addr,
    port: u16,
    broadcast_addr: Ipv4Addr,
    tx: mpsc::Sender<Outbound>,
}

impl Transport {
    /// Bind the listener (probing `base_port..base_port+100`), resolve the
    /// local ip and subnet broadcast address, and spawn the sender task.
    /// Returns the transport handle and the listener socket for the
    /// dispatcher's receive loop.
    pub async fn bind(base_port: u16) -> Result<(Transport, UdpSocket), NetError> {
        let local_ip = detect_local_ip();
        let (listener, port) = bind_listener(base_port)?;
        let broadcast_addr = subnet_broadcast(local_ip);
        info!("listening on 0.0.0.0:{port}, local ip {local_ip}, broadcast {broadcast_addr}");

        // The sender binds to the chosen local ip so the OS routes
        // broadcasts out of that interface.
        let send_socket = new_udp_socket(SocketAddrV4::new(local_ip, 0), true)
            .or_else(|e| {
                warn!("bind sender to {local_ip}: {e}, falling back to 0.0.0.0");
                new_udp_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), true)
            })
            .map_err(NetError::Io)?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(sender_task(send_socket, rx, broadcast_addr));

        Ok((Transport { local_ip, port, broadcast_addr, tx }, listener))
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        self.broadcast_addr
    }

    /// Enqueue a frame. Success means queued, not delivered.
    pub async fn send(&self, target: Target, payload: Vec<u8>) -> bool {
        self.tx.send(Outbound { target, payload }).await.is_ok()
    }
}

async fn sender_task(
    socket: UdpSocket,
    mut rx: mpsc::Receiver<Outbound>,
    broadcast_addr: Ipv4Addr,
) {
    while let Some(out) = rx.recv().await {
        let dest = match out.target {
            Target::Unicast(addr) => addr,
            Target::Broadcast => {
                SocketAddr::V4(SocketAddrV4::new(broadcast_addr, DEFAULT_PORT))
            }
        };
        if let Err(e) = socket.send_to(&out.payload, dest).await {
            debug!("send to {dest} failed: {e}");
        }
    }
}

/// One non-blocking UDP socket with SO_BROADCAST set. SO_REUSEADDR is only
/// applied to ephemeral sender sockets: on the listener it would let two
/// nodes silently share the same port, and port probing depends on the
/// bind conflict being visible.
fn new_udp_socket(bind: SocketAddrV4, reuse: bool) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(bind).into())?;
    UdpSocket::from_std(socket.into())
}

/// Probe upward from `base_port` until a bind succeeds.
fn bind_listener(base_port: u16) -> Result<(UdpSocket, u16), NetError> {
    for offset in 0..PORT_PROBE_RANGE {
        let port = base_port + offset;
        match new_udp_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port), false) {
            Ok(socket) => {
                if offset > 0 {
                    debug!("port {base_port} busy, listening on {port} instead");
                }
                return Ok((socket, port));
            }
            Err(_) => continue,
        }
    }
    Err(NetError::NoPort { base: base_port, range: PORT_PROBE_RANGE })
}

/// The local ip of the interface carrying the default route, found by
/// opening a connected UDP socket (no packet is sent). Falls back to
/// loopback when the host has no route at all.
pub fn detect_local_ip() -> Ipv4Addr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(IpAddr::V4(ip)) => ip,
        _ => Ipv4Addr::LOCALHOST,
    }
}

/// The broadcast address of the subnet holding `local_ip`. Prefers what
/// the interface table reports, then derives from the netmask, then falls
/// back to `x.y.z.255`.
pub fn subnet_broadcast(local_ip: Ipv4Addr) -> Ipv4Addr {
    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            if let get_if_addrs::IfAddr::V4(v4) = &iface.addr {
                if v4.ip != local_ip {
                    continue;
                }
                if let Some(bcast) = v4.broadcast {
                    return bcast;
                }
                return broadcast_from_mask(v4.ip, v4.netmask);
            }
        }
    }
    fallback_broadcast(local_ip)
}

fn broadcast_from_mask(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

fn fallback_broadcast(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}
