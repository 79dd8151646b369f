//! # rudp-link
//!
//! Reliable, optionally encrypted per-peer connections over UDP.
//!
//! A [`Connection`](transport::Connection) gives each remote address:
//!
//! - **Reliability**: acks piggybacked on every packet, retransmission with a
//!   configurable retry ceiling, and in-order delivery of reliable messages
//! - **Fragmentation**: payloads larger than the MTU are split and reassembled
//! - **Security**: an optional Noise (IK or XX) handshake followed by
//!   XChaCha20-Poly1305 record protection with replay rejection
//! - **Liveness**: keepalives, dead-peer detection and an orderly close
//!
//! Connections never block and never read the clock themselves: the owner
//! feeds datagrams in, passes `Instant`s to the heartbeat and drains
//! [`ConnectionEvent`](transport::ConnectionEvent)s. [`service::LinkService`]
//! does that for every peer on one socket.
//!
//! ## Feature Flags
//!
//! - `tokio` (default): UDP socket adapter and the async service driver
//!
//! ## Modules
//!
//! - [`core`]: identifiers, constants, configuration and error types
//! - [`crypto`]: keys, handshake and record protection
//! - [`transport`]: packet format, acks, reliability, fragments, connections
//! - [`service`]: many connections over one socket
//!
//! ## Example Usage
//!
//! ```rust
//! use std::net::SocketAddr;
//! use std::time::Instant;
//!
//! use bytes::Bytes;
//! use rudp_link::prelude::*;
//!
//! let a: SocketAddr = "127.0.0.1:4000".parse().unwrap();
//! let b: SocketAddr = "127.0.0.1:4001".parse().unwrap();
//! let (sa, sb) = MemorySocket::pair(a, b);
//! let now = Instant::now();
//!
//! let config = ConnectionConfig::default();
//! let mut client =
//!     Connection::new(ConnectionId(1), ConnectionRole::Connector, b, sa, config.clone(), now)
//!         .unwrap();
//! let mut server =
//!     Connection::new(ConnectionId(2), ConnectionRole::Acceptor, a, sb.clone(), config, now)
//!         .unwrap();
//! client.connect(now).unwrap();
//! server.accept(now).unwrap();
//!
//! client.send_reliable_packet(Bytes::from_static(b"hello"), now).unwrap();
//!
//! let mut buf = [0u8; 2048];
//! while let Some((len, _)) = sb.try_recv_from(&mut buf).unwrap() {
//!     server.process_datagram(&buf[..len], now);
//! }
//! assert!(server.drain_events().contains(&ConnectionEvent::Packet {
//!     payload: Bytes::from_static(b"hello"),
//!     reliable: true,
//! }));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod core;
pub mod crypto;
pub mod service;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::crypto::{EncryptionEndpoint, StaticKeypair};

    pub use crate::service::{LinkService, ServiceConfig};

    #[cfg(feature = "tokio")]
    pub use crate::transport::UdpDatagramSocket;
    pub use crate::transport::{
        Connection, ConnectionEvent, ConnectionStats, DatagramSocket, MemorySocket,
        SharedConnection, SocketOptions, TransportError, TransportResult, TrustZone,
    };
}

pub use crate::core::{ConnectionConfig, ConnectionHandler, ConnectionId, DisconnectReason};
pub use service::LinkService;
pub use transport::{Connection, ConnectionEvent, DatagramSocket, TransportError};
