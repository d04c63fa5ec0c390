use crate::wire::Packet;
use keel::UDP_DATA_MAX_LEN;
use mio::net::UdpSocket;
use net2::unix::UnixUdpBuilderExt;
use net2::UdpBuilder;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};

/// The node's receive side: a non-blocking UDP socket bound with address and
/// port reuse so that every worker of the node binds the same port and the
/// kernel balances ingress across them.
pub struct Afferent {
    sock: UdpSocket,
    listen: SocketAddrV4,
}

impl Afferent {
    pub fn bind(listen: SocketAddrV4) -> io::Result<Afferent> {
        let sock = UdpBuilder::new_v4()?
            .reuse_address(true)?
            .reuse_port(true)?
            .bind(listen)?;
        sock.set_nonblocking(true)?;

        Ok(Afferent {
            sock: UdpSocket::from_socket(sock)?,
            listen,
        })
    }

    #[inline]
    pub fn listen_addr(&self) -> SocketAddrV4 {
        self.listen
    }

    #[inline]
    pub fn register(&self, poll: &mio::Poll, token: mio::Token) -> io::Result<()> {
        poll.register(&self.sock, token, mio::Ready::readable(), mio::PollOpt::level())
    }

    #[inline]
    pub fn deregister(&self, poll: &mio::Poll) -> io::Result<()> {
        poll.deregister(&self.sock)
    }

    /// Receives one datagram as an inbound packet carrying the raw bytes and
    /// the previous hop.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Packet> {
        let (count, from) = self.sock.recv_from(buf)?;

        let previous_hop = match from {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "ipv6 peer on a v4 socket"))
            }
        };

        Ok(Packet::inbound(buf[..count].to_vec(), previous_hop))
    }
}

/// The node's transmit side. Efferents may share the receive socket; a
/// standalone one binds an ephemeral port of its own (the repeater process
/// does this, it has no afferent).
pub struct Efferent {
    sock: UdpSocket,
}

impl Efferent {
    pub fn open() -> io::Result<Efferent> {
        let sock = UdpBuilder::new_v4()?
            .reuse_address(true)?
            .bind("0.0.0.0:0")?;
        sock.set_nonblocking(true)?;

        Ok(Efferent {
            sock: UdpSocket::from_socket(sock)?,
        })
    }

    /// Sends the packet's wire bytes to its next hop.
    pub fn transmit(&self, pkt: &Packet) -> io::Result<usize> {
        let next_hop = pkt
            .next_hop
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "packet has no next hop"))?;

        self.sock.send_to(&pkt.data, &SocketAddr::V4(next_hop))
    }
}
