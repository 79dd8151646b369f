//! Datagram socket abstraction.
//!
//! Connections only need three non-blocking operations from the network, so
//! they talk to a [`DatagramSocket`] trait object. Enable the `tokio` feature
//! (on by default) for [`UdpDatagramSocket`], backed by
//! `tokio::net::UdpSocket`. [`MemorySocket`] connects two endpoints in-process
//! for tests and simulations.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::crypto::StaticKeypair;

use super::error::{TransportError, TransportResult};

/// Non-blocking datagram socket.
///
/// The trait is object-safe so it can be shared as `Arc<dyn DatagramSocket>`.
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send `data` to `target`, returning the number of bytes written.
    ///
    /// Never blocks; a full send buffer surfaces as `WouldBlock`.
    fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one pending datagram into `buf`.
    ///
    /// `Ok(None)` means nothing is pending; `Err` is a socket failure.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Return the local address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// How much the network an accepting socket faces is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustZone {
    /// Closed network; plaintext peers may be accepted.
    Trusted,
    /// Open network; accepting peers requires credentials.
    #[default]
    Untrusted,
}

/// Options for opening a socket.
#[derive(Clone)]
pub struct SocketOptions {
    /// Local address to bind; port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Whether unknown peers may open connections.
    pub accept_incoming: bool,
    /// Trust level of the network.
    pub trust_zone: TrustZone,
    /// Static keypair for the encryption handshake; see
    /// `ServiceConfig::from_socket_options`.
    pub credentials: Option<StaticKeypair>,
}

impl std::fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketOptions")
            .field("bind_addr", &self.bind_addr)
            .field("accept_incoming", &self.accept_incoming)
            .field("trust_zone", &self.trust_zone)
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}

impl SocketOptions {
    /// Outbound-only socket on `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            accept_incoming: false,
            trust_zone: TrustZone::default(),
            credentials: None,
        }
    }

    /// Accept incoming connections.
    pub fn accept_incoming(mut self, accept: bool) -> Self {
        self.accept_incoming = accept;
        self
    }

    /// Set the trust zone.
    pub fn trust_zone(mut self, zone: TrustZone) -> Self {
        self.trust_zone = zone;
        self
    }

    /// Set the static keypair.
    pub fn credentials(mut self, keypair: StaticKeypair) -> Self {
        self.credentials = Some(keypair);
        self
    }

    /// Check the options are consistent before binding.
    pub fn validate(&self) -> TransportResult<()> {
        if self.accept_incoming
            && self.trust_zone == TrustZone::Untrusted
            && self.credentials.is_none()
        {
            return Err(TransportError::MissingCredentials);
        }
        Ok(())
    }
}

#[cfg(feature = "tokio")]
mod udp {
    use super::*;
    use tokio::net::UdpSocket;

    /// [`DatagramSocket`] backed by a `tokio::net::UdpSocket`.
    #[derive(Debug)]
    pub struct UdpDatagramSocket {
        socket: UdpSocket,
    }

    impl UdpDatagramSocket {
        /// Validate `options` and bind.
        pub async fn open(options: &SocketOptions) -> TransportResult<Self> {
            options.validate()?;
            let socket = UdpSocket::bind(options.bind_addr)
                .await
                .map_err(|source| TransportError::PortUnavailable {
                    port: options.bind_addr.port(),
                    source,
                })?;
            Ok(Self { socket })
        }

        /// Wrap an existing `UdpSocket`.
        pub fn new(socket: UdpSocket) -> Self {
            Self { socket }
        }

        /// Wait until a datagram may be pending.
        pub async fn readable(&self) -> io::Result<()> {
            self.socket.readable().await
        }
    }

    impl DatagramSocket for UdpDatagramSocket {
        fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.socket.try_send_to(data, target)
        }

        fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
            match self.socket.try_recv_from(buf) {
                Ok((len, addr)) => Ok(Some((len, addr))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.socket.local_addr()
        }
    }
}

#[cfg(feature = "tokio")]
pub use udp::UdpDatagramSocket;

type DropFilter = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct MemoryInbox {
    queue: Mutex<VecDeque<(Bytes, SocketAddr)>>,
}

/// In-process datagram socket; see [`MemorySocket::pair`].
pub struct MemorySocket {
    local: SocketAddr,
    inbox: Arc<MemoryInbox>,
    peer: Arc<MemoryInbox>,
    drop_filter: Mutex<Option<DropFilter>>,
    sent: Mutex<u64>,
}

impl MemorySocket {
    /// Two sockets wired to each other.
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Arc<Self>, Arc<Self>) {
        let inbox_a = Arc::new(MemoryInbox {
            queue: Mutex::new(VecDeque::new()),
        });
        let inbox_b = Arc::new(MemoryInbox {
            queue: Mutex::new(VecDeque::new()),
        });
        let socket_a = Self {
            local: a,
            inbox: Arc::clone(&inbox_a),
            peer: Arc::clone(&inbox_b),
            drop_filter: Mutex::new(None),
            sent: Mutex::new(0),
        };
        let socket_b = Self {
            local: b,
            inbox: inbox_b,
            peer: inbox_a,
            drop_filter: Mutex::new(None),
            sent: Mutex::new(0),
        };
        (Arc::new(socket_a), Arc::new(socket_b))
    }

    /// Silently discard outgoing datagrams for which `filter` returns `true`.
    pub fn set_drop_filter(&self, filter: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        *self.drop_filter.lock() = Some(Box::new(filter));
    }

    /// Stop discarding outgoing datagrams.
    pub fn clear_drop_filter(&self) {
        *self.drop_filter.lock() = None;
    }

    /// Datagrams handed to `send_to`, dropped ones included.
    pub fn sent_count(&self) -> u64 {
        *self.sent.lock()
    }

    /// Datagrams waiting to be received.
    pub fn pending(&self) -> usize {
        self.inbox.queue.lock().len()
    }

    /// Put a raw datagram into this socket's inbox as if `from` sent it.
    pub fn inject(&self, data: &[u8], from: SocketAddr) {
        self.inbox
            .queue
            .lock()
            .push_back((Bytes::copy_from_slice(data), from));
    }
}

impl DatagramSocket for MemorySocket {
    fn send_to(&self, data: &[u8], _target: SocketAddr) -> io::Result<usize> {
        *self.sent.lock() += 1;
        let dropped = self
            .drop_filter
            .lock()
            .as_ref()
            .is_some_and(|filter| filter(data));
        if !dropped {
            self.peer
                .queue
                .lock()
                .push_back((Bytes::copy_from_slice(data), self.local));
        }
        Ok(data.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((datagram, from)) = self.inbox.queue.lock().pop_front() else {
            return Ok(None);
        };
        if datagram.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram larger than receive buffer",
            ));
        }
        buf[..datagram.len()].copy_from_slice(&datagram);
        Ok(Some((datagram.len(), from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_untrusted_accept_needs_credentials() {
        let options = SocketOptions::new(addr(0)).accept_incoming(true);
        assert!(matches!(
            options.validate(),
            Err(TransportError::MissingCredentials)
        ));

        let options = options.credentials(StaticKeypair::generate());
        assert!(options.validate().is_ok());

        let trusted = SocketOptions::new(addr(0))
            .accept_incoming(true)
            .trust_zone(TrustZone::Trusted);
        assert!(trusted.validate().is_ok());
    }

    #[test]
    fn test_memory_pair() {
        let (a, b) = MemorySocket::pair(addr(1), addr(2));
        a.send_to(b"hello", addr(2)).unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = b.try_recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, addr(1));
        assert!(b.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_memory_drop_filter() {
        let (a, b) = MemorySocket::pair(addr(1), addr(2));
        a.set_drop_filter(|data| data.starts_with(b"x"));
        a.send_to(b"xdrop", addr(2)).unwrap();
        a.send_to(b"keep", addr(2)).unwrap();

        assert_eq!(a.sent_count(), 2);
        assert_eq!(b.pending(), 1);
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn test_udp_send_recv() {
        let server = UdpDatagramSocket::open(&SocketOptions::new(addr(0)))
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpDatagramSocket::open(&SocketOptions::new(addr(0)))
            .await
            .unwrap();

        client.send_to(b"hello", server_addr).unwrap();

        let mut buf = [0u8; 64];
        let received = loop {
            server.readable().await.unwrap();
            if let Some(received) = server.try_recv_from(&mut buf).unwrap() {
                break received;
            }
        };
        assert_eq!(&buf[..received.0], b"hello");
        assert_eq!(received.1, client.local_addr().unwrap());
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn test_udp_port_unavailable() {
        let first = UdpDatagramSocket::open(&SocketOptions::new(addr(0)))
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();

        let result = UdpDatagramSocket::open(&SocketOptions::new(taken)).await;
        assert!(matches!(result, Err(TransportError::PortUnavailable { .. })));
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn test_udp_nothing_pending() {
        let socket = UdpDatagramSocket::open(&SocketOptions::new(addr(0)))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(socket.try_recv_from(&mut buf).unwrap().is_none());
    }
}
