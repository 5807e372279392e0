//! Packet transport, decoupled from the protocol engine.
//!
//! The session pulls datagrams from a [PacketSource] and the sender pushes
//! them into a [PacketSink]; the UDP multicast implementations live here, and
//! tests swap in plain `Vec`s.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::wire::WIRE_PKT_SIZE;

pub trait PacketSource {
    /// Receive the next datagram, or None when the source is exhausted (UDP
    /// sources never are).
    fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

pub trait PacketSink {
    fn send(&mut self, pkt: &[u8]) -> Result<()>;
}

/// A UDP socket joined to a multicast group.
pub struct UdpSource {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpSource {
    /// Bind to `group:port` on the interface with address `iface`, and join
    /// the group there.
    pub fn open(group: Ipv4Addr, port: u16, iface: Ipv4Addr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&SocketAddrV4::new(group, port).into())
            .with_context(|| format!("binding to {group}:{port}"))?;
        socket
            .join_multicast_v4(&group, &iface)
            .with_context(|| format!("joining {group} on {iface}"))?;
        // Datagram bursts outrun the flash; buffer as much as the kernel allows.
        let _ = socket.set_recv_buffer_size(8 * 1024 * 1024);

        info!("listening on {}:{} via {}", group, port, iface);
        Ok(Self {
            socket: socket.into(),
            // Oversized so runts and giants are visible to the caller.
            buf: vec![0; WIRE_PKT_SIZE * 2],
        })
    }
}

impl PacketSource for UdpSource {
    fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.socket.recv(&mut self.buf)?;
        Ok(Some(self.buf[..len].to_vec()))
    }
}

/// A UDP socket sending to a multicast group.
pub struct UdpSink {
    socket: UdpSocket,
    dest: SocketAddrV4,
}

impl UdpSink {
    pub fn open(group: Ipv4Addr, port: u16, iface: Ipv4Addr, ttl: u32) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        socket.set_multicast_if_v4(&iface)?;
        socket.set_multicast_ttl_v4(ttl)?;

        info!("sending to {}:{} via {}", group, port, iface);
        Ok(Self {
            socket: socket.into(),
            dest: SocketAddrV4::new(group, port),
        })
    }
}

impl PacketSink for UdpSink {
    fn send(&mut self, pkt: &[u8]) -> Result<()> {
        self.socket.send_to(pkt, self.dest)?;
        Ok(())
    }
}

/// Canned packet streams (tests, captures).
impl PacketSource for std::vec::IntoIter<Vec<u8>> {
    fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.next())
    }
}

/// Packet collection (tests).
impl PacketSink for Vec<Vec<u8>> {
    fn send(&mut self, pkt: &[u8]) -> Result<()> {
        self.push(pkt.to_vec());
        Ok(())
    }
}
