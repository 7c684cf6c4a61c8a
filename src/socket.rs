//! Non-blocking datagram socket abstraction.
//!
//! The connection engine is poll-driven: it must be able to ask "is there a
//! datagram?" without ever suspending.  [`DatagramPort`] captures that
//! contract, and [`UdpPort`] implements it over a `std::net::UdpSocket` put
//! into non-blocking mode at bind time.
//!
//! The trait seam also lets [`crate::simulator::Simulator`] interpose a lossy
//! or reordering network between two endpoints in tests.  All protocol logic
//! lives elsewhere; this module owns only byte I/O.

use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Best-effort, non-blocking datagram transport between two endpoints.
///
/// Implementations must never block: `recv_from` reports an empty queue as
/// `Ok(None)` rather than waiting for a datagram to arrive.
pub trait DatagramPort {
    /// Send one datagram to `dst`.  Returns the number of bytes sent.
    fn send_to(&mut self, buf: &[u8], dst: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, if any is queued.
    ///
    /// Returns `Ok(Some((len, src)))` when a datagram was copied into `buf`,
    /// `Ok(None)` when nothing is available right now, and `Err` for real
    /// I/O failures.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// The local address this port is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A [`DatagramPort`] backed by a real UDP socket in non-blocking mode.
#[derive(Debug)]
pub struct UdpPort {
    inner: UdpSocket,
}

impl UdpPort {
    /// Bind a new non-blocking socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port; use
    /// [`DatagramPort::local_addr`] to discover it.
    pub fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr)?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }
}

impl DatagramPort for UdpPort {
    fn send_to(&mut self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, dst)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.inner.recv_from(buf) {
            Ok((len, src)) => Ok(Some((len, src))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> UdpPort {
        UdpPort::bind("127.0.0.1:0".parse().unwrap()).expect("bind")
    }

    #[test]
    fn empty_queue_returns_none_instead_of_blocking() {
        let mut port = ephemeral();
        let mut buf = [0u8; 64];
        assert!(matches!(port.recv_from(&mut buf), Ok(None)));
    }

    #[test]
    fn loopback_roundtrip() {
        let mut a = ephemeral();
        let mut b = ephemeral();
        let b_addr = b.local_addr().unwrap();

        let sent = a.send_to(b"ping", b_addr).unwrap();
        assert_eq!(sent, 4);

        // Loopback delivery is fast but not instantaneous under load.
        let mut buf = [0u8; 64];
        for _ in 0..100 {
            if let Some((n, src)) = b.recv_from(&mut buf).unwrap() {
                assert_eq!(&buf[..n], b"ping");
                assert_eq!(src, a.local_addr().unwrap());
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        panic!("datagram never arrived");
    }
}
