//! Abstract datagram transport under the KCP endpoint.
//!
//! The [`Transport`] trait lets an endpoint run over any async datagram
//! transport, not just UDP. Enable the `tokio` feature (on by default) for
//! the built-in [`UdpTransport`] backed by `tokio::net::UdpSocket` and the
//! in-process [`MemoryTransport`] pair.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::io;

/// Marker trait for address types used by [`Transport`] implementations.
///
/// Any type satisfying the required bounds automatically implements `Addr`
/// via the blanket impl. This keeps bound lists short elsewhere.
pub trait Addr: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static> Addr for T {}

/// Async datagram transport used by [`KcpEndpoint`](crate::endpoint::KcpEndpoint).
///
/// Delivery may lose, duplicate, or reorder datagrams; the protocol above
/// recovers from all three.
pub trait Transport: Send + Sync + 'static {
    /// The address type used to identify endpoints.
    type Addr: Addr;

    /// Send `buf` to `target`, returning the number of bytes written.
    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        target: &'a Self::Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// Receive a datagram into `buf`, returning `(bytes_read, source_address)`.
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Self::Addr)>> + Send + 'a;

    /// Return the local address this transport is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

// ---------------------------------------------------------------------------
// UdpTransport: default implementation backed by tokio::net::UdpSocket
// ---------------------------------------------------------------------------

#[cfg(feature = "tokio")]
mod udp {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    /// Default [`Transport`] implementation wrapping a `tokio::net::UdpSocket`.
    pub struct UdpTransport {
        socket: UdpSocket,
    }

    impl UdpTransport {
        /// Bind a new UDP socket to `addr`.
        pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Self> {
            let socket = UdpSocket::bind(addr).await?;
            Ok(Self { socket })
        }

        /// Wrap an existing `UdpSocket`.
        pub fn new(socket: UdpSocket) -> Self {
            Self { socket }
        }
    }

    impl Transport for UdpTransport {
        type Addr = SocketAddr;

        async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<usize> {
            self.socket.send_to(buf, target).await
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.socket.recv_from(buf).await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.socket.local_addr()
        }
    }
}

#[cfg(feature = "tokio")]
pub use udp::UdpTransport;

// ---------------------------------------------------------------------------
// MemoryTransport: two connected in-process endpoints
// ---------------------------------------------------------------------------

#[cfg(feature = "tokio")]
mod memory {
    use super::*;
    use bytes::Bytes;
    use std::fmt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::{mpsc, Mutex};

    /// Address of one side of a [`MemoryTransport`] pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryAddr(pub u16);

    impl fmt::Display for MemoryAddr {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "mem:{}", self.0)
        }
    }

    type Datagram = (Bytes, MemoryAddr);

    /// In-process transport. Datagrams are delivered in order and never lost,
    /// except that every `drop_every`-th datagram is discarded when set.
    pub struct MemoryTransport {
        addr: MemoryAddr,
        peer: MemoryAddr,
        peer_tx: mpsc::UnboundedSender<Datagram>,
        rx: Mutex<mpsc::UnboundedReceiver<Datagram>>,
        drop_every: Option<u64>,
        sent: AtomicU64,
    }

    impl MemoryTransport {
        /// Two transports wired to each other.
        pub fn pair() -> (Self, Self) {
            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            let (a, b) = (MemoryAddr(1), MemoryAddr(2));
            (
                Self::new(a, b, b_tx, a_rx),
                Self::new(b, a, a_tx, b_rx),
            )
        }

        fn new(
            addr: MemoryAddr,
            peer: MemoryAddr,
            peer_tx: mpsc::UnboundedSender<Datagram>,
            rx: mpsc::UnboundedReceiver<Datagram>,
        ) -> Self {
            Self {
                addr,
                peer,
                peer_tx,
                rx: Mutex::new(rx),
                drop_every: None,
                sent: AtomicU64::new(0),
            }
        }

        /// Discard every `n`-th outgoing datagram (0 disables).
        pub fn drop_every(mut self, n: u64) -> Self {
            self.drop_every = (n > 0).then_some(n);
            self
        }

        pub fn peer_addr(&self) -> MemoryAddr {
            self.peer
        }
    }

    impl Transport for MemoryTransport {
        type Addr = MemoryAddr;

        async fn send_to(&self, buf: &[u8], target: &MemoryAddr) -> io::Result<usize> {
            if *target != self.peer {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{target} is not reachable from {}", self.addr),
                ));
            }

            let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
            if self.drop_every.is_some_and(|every| n % every == 0) {
                return Ok(buf.len());
            }

            self.peer_tx
                .send((Bytes::copy_from_slice(buf), self.addr))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(buf.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, MemoryAddr)> {
            let mut rx = self.rx.lock().await;
            let (datagram, from) = rx
                .recv()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionAborted))?;
            let n = datagram.len().min(buf.len());
            buf[..n].copy_from_slice(&datagram[..n]);
            Ok((n, from))
        }

        fn local_addr(&self) -> io::Result<MemoryAddr> {
            Ok(self.addr)
        }
    }

}

#[cfg(feature = "tokio")]
pub use memory::{MemoryAddr, MemoryTransport};
