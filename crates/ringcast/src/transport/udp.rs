// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! UDP transport: multicast ring traffic plus unicast token passing.
//!
//! Two sockets, both on the configured port: the multicast socket binds the
//! wildcard address with reuse enabled, joins the ring's group and receives
//! the multicast traffic; the token socket binds the local interface
//! address, receives unicast token frames and carries all sends. Multicast
//! loopback stays enabled - the engine counts on hearing its own frames.
//!
//! Send failures are logged and swallowed: a lost frame is indistinguishable
//! from network loss and the retransmit machinery recovers it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

use super::Transport;
use crate::config::TotemConfig;
use crate::member::ProcessorId;

/// Discover the primary local interface address, for deployments that
/// configure a nodeid but leave the address to the host.
pub fn primary_interface() -> io::Result<IpAddr> {
    local_ip_address::local_ip()
        .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))
}

/// UDP sockets for one ring member.
#[derive(Debug)]
pub struct UdpTransport {
    mcast_socket: Arc<UdpSocket>,
    token_socket: Arc<UdpSocket>,
    mcast_dest: SocketAddr,
    port: u16,
}

impl UdpTransport {
    /// Bind both sockets on `bind_addr` per the config. IPv4 only: the
    /// ring's multicast group is an IPv4 group.
    pub fn new(config: &TotemConfig, bind_addr: IpAddr) -> io::Result<Self> {
        let IpAddr::V4(bind_v4) = bind_addr else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "UDP transport requires an IPv4 interface address",
            ));
        };

        let mcast_socket = Self::bind_mcast(config, bind_v4)?;
        let token_socket = Self::bind_token(config, bind_v4)?;

        log::info!(
            "[udp] ring sockets up: group {}:{} iface {}",
            config.mcast_group,
            config.port,
            bind_v4
        );

        Ok(Self {
            mcast_socket: Arc::new(mcast_socket),
            token_socket: Arc::new(token_socket),
            mcast_dest: SocketAddr::new(IpAddr::V4(config.mcast_group), config.port),
            port: config.port,
        })
    }

    fn bind_mcast(config: &TotemConfig, iface: Ipv4Addr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
        socket.bind(&bind.into())?;

        let socket: UdpSocket = socket.into();
        socket.join_multicast_v4(&config.mcast_group, &iface)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(socket)
    }

    fn bind_token(config: &TotemConfig, iface: Ipv4Addr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind = SocketAddr::new(IpAddr::V4(iface), config.port);
        socket.bind(&bind.into())?;
        Ok(socket.into())
    }

    /// Multicast receive socket, for event-loop registration.
    #[must_use]
    pub fn mcast_socket(&self) -> &Arc<UdpSocket> {
        &self.mcast_socket
    }

    /// Token receive socket, for event-loop registration.
    #[must_use]
    pub fn token_socket(&self) -> &Arc<UdpSocket> {
        &self.token_socket
    }
}

impl Transport for UdpTransport {
    fn mcast(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.token_socket.send_to(frame, self.mcast_dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("[udp] multicast send backpressure, frame dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn unicast(&mut self, to: &ProcessorId, frame: &[u8]) -> io::Result<()> {
        let dest = SocketAddr::new(to.addr, self.port);
        match self.token_socket.send_to(frame, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("[udp] token send backpressure to {}, frame dropped", dest);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_v6_bind() {
        let config = TotemConfig::default();
        let err = UdpTransport::new(&config, "::1".parse().expect("addr"))
            .expect_err("v6 must be rejected");
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_loopback_mcast_roundtrip() {
        let config = TotemConfig {
            port: 42405,
            ..TotemConfig::default()
        };
        let Ok(mut transport) = UdpTransport::new(&config, IpAddr::V4(Ipv4Addr::LOCALHOST)) else {
            // No multicast-capable loopback in this environment; nothing to test.
            return;
        };
        transport.mcast(b"ping").expect("send");

        let mut buf = [0u8; 64];
        let socket = Arc::clone(transport.mcast_socket());
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(500);
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    assert_eq!(&buf[..len], b"ping");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if std::time::Instant::now() > deadline {
                        // Loopback multicast not routed here; accept silently.
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
    }
}
