//! Multiplexes connections over a single socket.
//!
//! Provides `LinkService<H, S>`, which routes inbound datagrams to the
//! connection for their source address, creates acceptor connections for new
//! peers, runs every connection's heartbeat and forwards connection events to
//! a [`ConnectionHandler`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::core::{
    ConnectionConfig, ConnectionHandler, ConnectionId, ConnectionRole, ConnectionState,
    DisconnectReason, EncryptionConfig, PacketId, SequenceId, MAX_DATAGRAM_SIZE,
};
use crate::transport::{
    Connection, ConnectionEvent, DatagramSocket, PacketHeader, SharedConnection, SocketOptions,
    TransportError, TransportResult,
};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Configuration for every connection.
    pub connection: ConnectionConfig,
    /// Whether unknown peers may open connections.
    pub accept_incoming: bool,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
}

impl ServiceConfig {
    /// Derive a service configuration from the options a socket was opened
    /// with.
    ///
    /// `accept_incoming` is taken from `options`. When `options` carries
    /// credentials and `connection` has no encryption set, every connection
    /// encrypts with that keypair.
    pub fn from_socket_options(
        options: &SocketOptions,
        mut connection: ConnectionConfig,
    ) -> TransportResult<Self> {
        options.validate()?;
        if connection.encryption.is_none() {
            connection.encryption = options.credentials.clone().map(|keypair| EncryptionConfig {
                local_keypair: keypair,
                remote_public_key: None,
            });
        }
        Ok(Self {
            connection,
            accept_incoming: options.accept_incoming,
            ..Self::default()
        })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            accept_incoming: false,
            max_connections: 1024,
        }
    }
}

/// All connections sharing one socket.
///
/// # Example
///
/// ```ignore
/// use rudp_link::prelude::*;
///
/// let options = SocketOptions::new(addr).credentials(StaticKeypair::generate());
/// let socket = Arc::new(UdpDatagramSocket::open(&options).await?);
/// let config = ServiceConfig::from_socket_options(&options, ConnectionConfig::default())?;
/// let mut service = LinkService::new(socket, config, handler);
/// let id = service.connect(peer, Instant::now())?;
/// service.run(Duration::from_millis(10)).await?;
/// ```
pub struct LinkService<H: ConnectionHandler, S: DatagramSocket> {
    socket: Arc<S>,
    config: ServiceConfig,
    handler: H,
    connections: HashMap<SocketAddr, SharedConnection>,
    addresses: HashMap<ConnectionId, SocketAddr>,
    next_id: u64,
    recv_buf: Vec<u8>,
    recv_errors: u64,
}

impl<H: ConnectionHandler, S: DatagramSocket> LinkService<H, S> {
    /// Create a service on `socket`.
    pub fn new(socket: Arc<S>, config: ServiceConfig, handler: H) -> Self {
        Self {
            socket,
            config,
            handler,
            connections: HashMap::new(),
            addresses: HashMap::new(),
            next_id: 1,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            recv_errors: 0,
        }
    }

    /// Local socket address.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Event handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable event handler.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Shared handle to a connection, for sending from elsewhere.
    pub fn connection(&self, id: ConnectionId) -> Option<SharedConnection> {
        let addr = self.addresses.get(&id)?;
        self.connections.get(addr).cloned()
    }

    /// Open a connection to `remote`.
    pub fn connect(&mut self, remote: SocketAddr, now: Instant) -> TransportResult<ConnectionId> {
        if let Some(existing) = self.connections.get(&remote) {
            return Ok(existing.lock().id());
        }

        let connection = self.create(ConnectionRole::Connector, remote, now)?;
        let id = {
            let mut conn = connection.lock();
            conn.connect(now)?;
            conn.id()
        };
        self.insert(remote, connection);
        self.dispatch(id, remote);
        Ok(id)
    }

    /// Send `payload` reliably on connection `id`.
    pub fn send_reliable(
        &mut self,
        id: ConnectionId,
        payload: Bytes,
        now: Instant,
    ) -> TransportResult<SequenceId> {
        let connection = self.connection(id).ok_or(TransportError::UnknownConnection)?;
        connection.lock().send_reliable_packet(payload, now)
    }

    /// Send `payload` unreliably on connection `id`.
    pub fn send_unreliable(
        &mut self,
        id: ConnectionId,
        payload: Bytes,
        now: Instant,
    ) -> TransportResult<PacketId> {
        let connection = self.connection(id).ok_or(TransportError::UnknownConnection)?;
        connection.lock().send_unreliable_packet(payload, now)
    }

    /// Start closing connection `id`.
    pub fn disconnect(&mut self, id: ConnectionId, now: Instant) -> TransportResult<bool> {
        let connection = self.connection(id).ok_or(TransportError::UnknownConnection)?;
        let started = connection
            .lock()
            .disconnect(DisconnectReason::Requested, now);
        Ok(started)
    }

    /// Start closing every connection.
    pub fn shutdown(&mut self, now: Instant) {
        for connection in self.connections.values() {
            connection
                .lock()
                .disconnect(DisconnectReason::Requested, now);
        }
    }

    /// Drain the socket, routing every pending datagram.
    ///
    /// Returns how many datagrams were read. A transient socket error
    /// (see [`TransportError::is_transient_io`]) is counted and ends the
    /// drain; the next poll resumes. Any other socket error is returned.
    pub fn poll_receive(&mut self, now: Instant) -> TransportResult<usize> {
        let mut processed = 0;
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(err) => {
                    let err = TransportError::from(err);
                    if !err.is_transient_io() {
                        return Err(err);
                    }
                    self.recv_errors += 1;
                    warn!(error = %err, "socket receive failed");
                    break;
                }
            };
            processed += 1;
            let datagram = self.recv_buf[..len].to_vec();
            self.route(&datagram, from, now);
        }
        Ok(processed)
    }

    /// Transient receive errors absorbed so far.
    pub fn receive_errors(&self) -> u64 {
        self.recv_errors
    }

    /// Run every connection's timers and drop closed connections.
    pub fn update_heartbeat(&mut self, now: Instant) {
        let targets: Vec<(ConnectionId, SocketAddr)> =
            self.addresses.iter().map(|(id, addr)| (*id, *addr)).collect();
        for (id, addr) in targets {
            if let Some(connection) = self.connections.get(&addr) {
                connection.lock().update_heartbeat(now);
            }
            self.dispatch(id, addr);
        }
    }

    fn route(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        let connection = match self.connections.get(&from) {
            Some(connection) => Arc::clone(connection),
            None => match self.accept(datagram, from, now) {
                Some(connection) => connection,
                None => return,
            },
        };

        let id = {
            let mut conn = connection.lock();
            conn.process_datagram(datagram, now);
            conn.id()
        };
        self.dispatch(id, from);
    }

    /// Create an acceptor for a datagram from an unknown peer, if allowed.
    fn accept(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Option<SharedConnection> {
        if !self.config.accept_incoming {
            trace!(%from, "datagram from unknown peer");
            return None;
        }
        if self.connections.len() >= self.config.max_connections {
            debug!(%from, "connection limit reached");
            return None;
        }
        let opener = match PacketHeader::decode(datagram) {
            Ok((header, _)) => header,
            Err(err) => {
                trace!(%from, error = %err, "unparseable datagram from unknown peer");
                return None;
            }
        };
        if self.config.connection.is_encrypted() != opener.is_handshake() {
            trace!(%from, "unknown peer did not open with a handshake");
            return None;
        }

        let connection = match self.create(ConnectionRole::Acceptor, from, now) {
            Ok(connection) => connection,
            Err(err) => {
                debug!(%from, error = %err, "could not create connection");
                return None;
            }
        };
        if let Err(err) = connection.lock().accept(now) {
            debug!(%from, error = %err, "could not accept connection");
            return None;
        }
        debug!(%from, "accepted new peer");
        self.insert(from, Arc::clone(&connection));
        Some(connection)
    }

    fn create(
        &mut self,
        role: ConnectionRole,
        remote: SocketAddr,
        now: Instant,
    ) -> TransportResult<SharedConnection> {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let socket: Arc<dyn DatagramSocket> = self.socket.clone();
        let connection = Connection::new(
            id,
            role,
            remote,
            socket,
            self.config.connection.clone(),
            now,
        )?;
        Ok(connection.into_shared())
    }

    fn insert(&mut self, remote: SocketAddr, connection: SharedConnection) {
        let id = connection.lock().id();
        self.addresses.insert(id, remote);
        self.connections.insert(remote, connection);
    }

    /// Forward queued events to the handler; forget the connection once closed.
    fn dispatch(&mut self, id: ConnectionId, addr: SocketAddr) {
        let Some(connection) = self.connections.get(&addr) else {
            return;
        };
        let (events, state) = {
            let mut conn = connection.lock();
            (conn.drain_events(), conn.state())
        };

        for event in events {
            match event {
                ConnectionEvent::Connected => self.handler.on_connected(id),
                ConnectionEvent::Disconnected(reason) => self.handler.on_disconnected(id, reason),
                ConnectionEvent::PacketLost(sequence) => self.handler.on_packet_lost(id, sequence),
                ConnectionEvent::Packet { payload, reliable } => {
                    self.handler.on_packet(id, payload, reliable)
                }
            }
        }

        if state == ConnectionState::Disconnected {
            debug!(conn = %id, %addr, "connection removed");
            self.connections.remove(&addr);
            self.addresses.remove(&id);
        }
    }
}

#[cfg(feature = "tokio")]
impl<H: ConnectionHandler> LinkService<H, crate::transport::UdpDatagramSocket> {
    /// Drive the service: drain the socket whenever it is readable and run
    /// heartbeats every `interval`.
    ///
    /// Returns only on a socket error that leaves the socket unusable.
    pub async fn run(mut self, interval: std::time::Duration) -> TransportResult<()> {
        let socket = Arc::clone(&self.socket);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                ready = socket.readable() => {
                    ready?;
                    self.poll_receive(Instant::now())?;
                }
                _ = ticker.tick() => {
                    self.update_heartbeat(Instant::now());
                }
            }
        }
    }
}
