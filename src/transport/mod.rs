//! Transport layer
//!
//! Everything between the application payload and the datagram socket for a
//! single peer:
//!
//! - **Packet headers**: [`PacketHeader`] and its optional sections
//! - **Acks**: [`PacketTracker`] assigns packet ids and folds acks
//! - **Reliability**: [`ReliableQueue`] retransmits, [`OrderingBuffer`] restores order
//! - **Fragmentation**: [`FragmentQueue`] splits and reassembles payloads
//! - **RTT estimation**: [`RttEstimator`] implementing RFC 6298
//! - **Connections**: [`Connection`] ties the above to one remote address
//! - **Sockets**: [`DatagramSocket`] and its tokio UDP adapter
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Application / LinkService       │
//! ├─────────────────────────────────────────┤
//! │         Connection                      │  ← This module
//! │   acks, retransmit, fragments, order    │
//! ├─────────────────────────────────────────┤
//! │         Encryption endpoint             │
//! ├─────────────────────────────────────────┤
//! │         DatagramSocket (UDP)            │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod error;
mod fragment;
mod ordering;
mod packet;
mod reliable;
mod socket;
mod timing;
mod tracker;

pub use connection::*;
pub use error::*;
pub use fragment::{Fragment, FragmentQueue};
pub use ordering::OrderingBuffer;
pub use packet::*;
pub use reliable::*;
pub use socket::*;
pub use timing::RttEstimator;
pub use tracker::{PacketTracker, ReceiveStatus};
