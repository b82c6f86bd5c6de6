//! UDP socket creation with the IP TOS bits set for low delay
//!
//! Jam traffic wants to win the queue on home routers, so the socket is
//! built through socket2 where the TOS byte is reachable.
use socket2::{Domain, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use crate::common::box_error::BoxError;

pub fn new(port: u16) -> Result<UdpSocket, BoxError> {
    let raw_sock = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    raw_sock.set_tos(0x10)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    raw_sock.bind(&SockAddr::from(addr))?;
    Ok(UdpSocket::from(raw_sock))
}
