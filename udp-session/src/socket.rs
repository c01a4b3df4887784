//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that moves
//! sealed datagrams.  All protocol logic lives elsewhere; this module owns
//! only byte I/O.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

/// Largest datagram the receive path accepts.
pub const MAX_DATAGRAM: usize = 2_048;

#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    pub async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.inner.send_to(datagram, dest).await?;
        Ok(())
    }

    /// Receive the next datagram into `buf`.
    ///
    /// Returns the filled prefix of `buf` and the sender's address.
    pub async fn recv_from<'a>(&self, buf: &'a mut [u8]) -> io::Result<(&'a [u8], SocketAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        Ok((&buf[..n], addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_datagram() {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        let a = Socket::bind(any).await.unwrap();
        let b = Socket::bind(any).await.unwrap();

        a.send_to(b"ping", b.local_addr).await.unwrap();
        let mut buf = [0u8; MAX_DATAGRAM];
        let (bytes, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(bytes, b"ping");
        assert_eq!(from, a.local_addr);
    }
}
