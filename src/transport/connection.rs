//! Per-peer connection state machine.
//!
//! A [`Connection`] owns everything needed to talk to one remote address:
//! packet-id tracking and acks, the reliable send queue, fragment
//! reassembly, in-order delivery and, when configured, the encryption
//! endpoint. It is driven from outside by three entry points: sends from the
//! application, [`Connection::process_datagram`] for inbound datagrams and
//! [`Connection::update_heartbeat`] for timers.
//!
//! Everything the owner must react to is queued as a [`ConnectionEvent`].
//!
//! ```text
//!   Disconnected --connect/accept--> Connecting --handshake--> Connected
//!        ^                               |                        |
//!        |                               +----failure/timeout-----+--> Disconnecting
//!        +--------------------------linger-------------------------------+
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::core::{
    ConnectionConfig, ConnectionId, ConnectionRole, ConnectionState, CryptoError,
    DisconnectReason, HandshakeState, LossPolicy, PacketError, PacketId, PacketTimeoutResult,
    SequenceId, TimeoutId, BASE_HEADER_SIZE, FLAG_DISCONNECT, FLAG_ENCRYPTED,
    FRAGMENT_HEADER_SIZE, HANDSHAKE_BACKOFF, MAX_MTU, MIN_MTU, PUBLIC_KEY_SIZE,
    RECORD_OVERHEAD, RELIABLE_HEADER_SIZE,
};
use crate::crypto::EncryptionEndpoint;

use super::error::{TransportError, TransportResult};
use super::fragment::{Fragment, FragmentQueue};
use super::ordering::OrderingBuffer;
use super::packet::{FragmentHeader, PacketHeader, ReliableHeader};
use super::reliable::{ReliableQueue, ResendFragment};
use super::socket::DatagramSocket;
use super::tracker::{PacketTracker, ReceiveStatus};

/// Something the connection's owner must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection became usable.
    Connected,
    /// The connection finished closing.
    Disconnected(DisconnectReason),
    /// A reliable message exhausted its retransmit budget.
    PacketLost(SequenceId),
    /// An application payload arrived.
    Packet {
        /// Payload bytes, reassembled if it was fragmented.
        payload: Bytes,
        /// Whether it was sent reliably.
        reliable: bool,
    },
}

/// Counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Datagrams handed to the socket.
    pub packets_sent: u64,
    /// Datagrams accepted from the peer.
    pub packets_received: u64,
    /// Bytes handed to the socket.
    pub bytes_sent: u64,
    /// Bytes accepted from the peer.
    pub bytes_received: u64,
    /// Reliable fragments put back on the wire.
    pub retransmissions: u64,
    /// Reliable messages reported lost.
    pub messages_lost: u64,
    /// Packets dropped as already seen.
    pub duplicates: u64,
    /// Packets dropped as unparseable or out of place.
    pub malformed: u64,
    /// Records that failed authentication.
    pub decrypt_failures: u64,
    /// Sends the socket refused.
    pub send_errors: u64,
    /// Handshake messages resent.
    pub handshake_retries: u32,
    /// Smoothed round-trip time, once measured.
    pub srtt: Option<Duration>,
    /// Current retransmission timeout.
    pub rto: Duration,
}

/// A connection behind the lock shared by the owner and the send path.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Reliable, optionally encrypted channel to one peer.
pub struct Connection {
    id: ConnectionId,
    role: ConnectionRole,
    remote: SocketAddr,
    socket: Arc<dyn DatagramSocket>,
    config: ConnectionConfig,
    mtu: usize,

    state: ConnectionState,
    disconnect_reason: Option<DisconnectReason>,
    timeout_id: Option<TimeoutId>,

    tracker: PacketTracker,
    reliable: ReliableQueue,
    fragments: FragmentQueue,
    ordering: OrderingBuffer,
    endpoint: Option<EncryptionEndpoint>,

    last_received: Instant,
    last_sent: Instant,
    ack_owed_since: Option<Instant>,
    handshake_deadline: Option<Instant>,
    handshake_timeout: Duration,
    handshake_retries: u32,
    linger_until: Option<Instant>,
    malformed: u32,

    events: VecDeque<ConnectionEvent>,
    stats: ConnectionStats,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("handshake", &self.handshake_state())
            .field("reliable_queue", &self.reliable.len())
            .finish()
    }
}

impl Connection {
    /// Create an idle connection to `remote`.
    pub fn new(
        id: ConnectionId,
        role: ConnectionRole,
        remote: SocketAddr,
        socket: Arc<dyn DatagramSocket>,
        config: ConnectionConfig,
        now: Instant,
    ) -> TransportResult<Self> {
        config.validate()?;
        let endpoint = config
            .encryption
            .as_ref()
            .map(|enc| EncryptionEndpoint::new(role, enc, config.decrypt_failure_limit));

        Ok(Self {
            id,
            role,
            remote,
            socket,
            mtu: config.mtu,
            state: ConnectionState::Disconnected,
            disconnect_reason: None,
            timeout_id: None,
            tracker: PacketTracker::new(),
            reliable: ReliableQueue::new(config.retransmit.clone()),
            fragments: FragmentQueue::new(config.max_fragment_count),
            ordering: OrderingBuffer::new(),
            endpoint,
            last_received: now,
            last_sent: now,
            ack_owed_since: None,
            handshake_deadline: None,
            handshake_timeout: config.handshake_timeout,
            handshake_retries: 0,
            linger_until: None,
            malformed: 0,
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
            config,
        })
    }

    /// Wrap the connection for sharing.
    pub fn into_shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self))
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Which side opened the connection.
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handshake progress; plaintext connections report `Complete`.
    pub fn handshake_state(&self) -> HandshakeState {
        self.endpoint
            .as_ref()
            .map_or(HandshakeState::Complete, EncryptionEndpoint::state)
    }

    /// Why the connection is closing, once it is.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    /// The peer's authenticated static key.
    pub fn remote_static_key(&self) -> Option<&[u8; PUBLIC_KEY_SIZE]> {
        self.endpoint.as_ref().and_then(EncryptionEndpoint::remote_static)
    }

    /// Current MTU.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Change the MTU, clamped to the supported range; returns the value applied.
    ///
    /// Only later sends are affected.
    pub fn set_connection_mtu(&mut self, mtu: usize) -> usize {
        self.mtu = mtu.clamp(MIN_MTU, MAX_MTU);
        debug!(conn = %self.id, mtu = self.mtu, "mtu updated");
        self.mtu
    }

    /// Reliable messages awaiting acknowledgment.
    pub fn reliable_queue_size(&self) -> usize {
        self.reliable.len()
    }

    /// Whether the peer acknowledged `packet_id`.
    pub fn was_packet_acked(&self, packet_id: PacketId) -> bool {
        self.tracker.was_packet_acked(packet_id)
    }

    /// Owner's heartbeat scheduler handle.
    pub fn timeout_id(&self) -> Option<TimeoutId> {
        self.timeout_id
    }

    /// Set the owner's heartbeat scheduler handle.
    pub fn set_timeout_id(&mut self, timeout_id: Option<TimeoutId>) {
        self.timeout_id = timeout_id;
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            srtt: self.reliable.srtt(),
            rto: self.reliable.rto(),
            ..self.stats.clone()
        }
    }

    /// Take the oldest pending event.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Take every pending event.
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain(..).collect()
    }

    /// Open the connection as connector.
    ///
    /// Plaintext connections are connected at once; encrypted ones send the
    /// first handshake message and wait.
    pub fn connect(&mut self, now: Instant) -> TransportResult<()> {
        self.start(ConnectionRole::Connector, now)?;

        let first = match self.endpoint.as_mut().map(EncryptionEndpoint::connect) {
            Some(Ok(first)) => first,
            Some(Err(err)) => {
                warn!(conn = %self.id, error = %err, "handshake could not start");
                self.begin_disconnect(DisconnectReason::HandshakeFailed, now);
                return Err(err.into());
            }
            None => {
                self.on_established();
                return Ok(());
            }
        };
        self.send_handshake(&first, now);
        Ok(())
    }

    /// Open the connection as acceptor.
    ///
    /// Encrypted connections wait for the connector's handshake.
    pub fn accept(&mut self, now: Instant) -> TransportResult<()> {
        self.start(ConnectionRole::Acceptor, now)?;
        if self.endpoint.is_none() {
            self.on_established();
        }
        Ok(())
    }

    fn start(&mut self, role: ConnectionRole, now: Instant) -> TransportResult<()> {
        if self.role != role || self.state != ConnectionState::Disconnected {
            return Err(TransportError::NotConnected(self.state));
        }
        if self.disconnect_reason.is_some() {
            return Err(TransportError::ConnectionClosed);
        }
        debug!(conn = %self.id, remote = %self.remote, ?role, "opening connection");
        self.state = ConnectionState::Connecting;
        self.last_received = now;
        self.last_sent = now;
        self.handshake_deadline = Some(now + self.handshake_timeout);
        Ok(())
    }

    /// Start closing; returns `false` if already closing or closed.
    ///
    /// Queued reliable messages are abandoned. A connected peer gets a
    /// best-effort close notice; the connection reports
    /// [`ConnectionEvent::Disconnected`] once the linger period ends.
    pub fn disconnect(&mut self, reason: DisconnectReason, now: Instant) -> bool {
        match self.state {
            ConnectionState::Disconnecting => false,
            ConnectionState::Disconnected => false,
            ConnectionState::Connected => {
                if let Err(err) = self.send_disconnect_notice(now) {
                    debug!(conn = %self.id, error = %err, "close notice not sent");
                }
                self.begin_disconnect(reason, now);
                true
            }
            ConnectionState::Connecting => {
                self.begin_disconnect(reason, now);
                true
            }
        }
    }

    fn begin_disconnect(&mut self, reason: DisconnectReason, now: Instant) {
        let abandoned = self.reliable.clear();
        self.fragments.clear();
        self.ordering.clear();
        self.ack_owed_since = None;
        self.handshake_deadline = None;

        debug!(conn = %self.id, ?reason, abandoned, "disconnecting");
        self.state = ConnectionState::Disconnecting;
        self.disconnect_reason = Some(reason);
        self.linger_until = Some(now + self.config.disconnect_linger);
    }

    fn finish_disconnect(&mut self) {
        let reason = self
            .disconnect_reason
            .unwrap_or(DisconnectReason::Requested);
        debug!(conn = %self.id, ?reason, "disconnected");
        self.state = ConnectionState::Disconnected;
        self.linger_until = None;
        self.events.push_back(ConnectionEvent::Disconnected(reason));
    }

    fn on_established(&mut self) {
        debug!(conn = %self.id, remote = %self.remote, "connected");
        self.state = ConnectionState::Connected;
        self.handshake_deadline = None;
        self.events.push_back(ConnectionEvent::Connected);
    }

    /// Send `payload` reliably and in order; returns its sequence id.
    ///
    /// Payloads larger than one packet are fragmented.
    pub fn send_reliable_packet(
        &mut self,
        payload: Bytes,
        now: Instant,
    ) -> TransportResult<SequenceId> {
        self.check_sendable(&payload)?;
        let pieces = self.split(&payload, true)?;
        let sequence = self.reliable.enqueue(pieces.clone(), now);

        for piece in pieces {
            let piece = ResendFragment {
                index: piece.index,
                count: piece.count,
                group: self.reliable.group(sequence),
                payload: piece.payload,
            };
            if let Err(err) = self.send_data(&piece, Some(sequence), now) {
                // The caller sees the failure, so the message must never
                // surface later through a retransmission
                self.reliable.cancel(sequence);
                return Err(err);
            }
        }
        trace!(conn = %self.id, %sequence, len = payload.len(), "reliable message sent");
        Ok(sequence)
    }

    /// Send `payload` once with no delivery guarantee; returns the packet id
    /// of its first fragment.
    pub fn send_unreliable_packet(
        &mut self,
        payload: Bytes,
        now: Instant,
    ) -> TransportResult<PacketId> {
        self.check_sendable(&payload)?;
        let pieces = self.split(&payload, false)?;

        let mut group = None;
        for piece in pieces {
            let piece = ResendFragment {
                index: piece.index,
                count: piece.count,
                group,
                payload: piece.payload,
            };
            let packet_id = self.send_data(&piece, None, now)?;
            group.get_or_insert(packet_id);
        }
        group.ok_or(TransportError::EmptyPayload)
    }

    fn check_sendable(&self, payload: &Bytes) -> TransportResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected(self.state));
        }
        if payload.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        Ok(())
    }

    fn split(&self, payload: &Bytes, reliable: bool) -> TransportResult<Vec<Fragment>> {
        if payload.len() <= self.payload_capacity(reliable, false) {
            return Ok(vec![Fragment {
                index: 0,
                count: 1,
                payload: payload.clone(),
            }]);
        }
        self.fragments
            .split(payload, self.payload_capacity(reliable, true))
    }

    fn payload_capacity(&self, reliable: bool, fragmented: bool) -> usize {
        let mut overhead = BASE_HEADER_SIZE;
        if reliable {
            overhead += RELIABLE_HEADER_SIZE;
        }
        if fragmented {
            overhead += FRAGMENT_HEADER_SIZE;
        }
        if self.endpoint.is_some() {
            overhead += RECORD_OVERHEAD;
        }
        self.mtu.saturating_sub(overhead)
    }

    /// Put one (possibly fragmented) data packet on the wire.
    fn send_data(
        &mut self,
        piece: &ResendFragment,
        sequence: Option<SequenceId>,
        now: Instant,
    ) -> TransportResult<PacketId> {
        let packet_id = self.tracker.next_packet_id(now);
        let mut header = PacketHeader::new(packet_id);

        if let Some(sequence) = sequence {
            // A final attempt for a message already dropped from the queue
            // must not carry a floor past itself
            let floor = self.reliable.floor();
            let floor = if floor.is_newer_than(sequence) {
                sequence
            } else {
                floor
            };
            header.reliable = Some(ReliableHeader { sequence, floor });
        }
        if piece.count > 1 {
            header.fragment = Some(FragmentHeader {
                group: piece.group.unwrap_or(packet_id),
                index: piece.index,
                count: piece.count,
            });
        }

        self.send_packet(header, &piece.payload, now)?;
        if let Some(sequence) = sequence {
            self.reliable
                .register_transmission(sequence, piece.index, packet_id);
        }
        Ok(packet_id)
    }

    /// Send an empty packet carrying only acks.
    fn send_ack_only(&mut self, now: Instant) -> TransportResult<()> {
        let packet_id = self.tracker.next_packet_id(now);
        self.send_packet(PacketHeader::new(packet_id), &[], now)
    }

    fn send_disconnect_notice(&mut self, now: Instant) -> TransportResult<()> {
        let packet_id = self.tracker.next_packet_id(now);
        let mut header = PacketHeader::new(packet_id);
        header.flags = header.flags.with(FLAG_DISCONNECT);
        self.send_packet(header, &[], now)
    }

    /// Attach acks, protect the body if encrypted, and send.
    fn send_packet(
        &mut self,
        mut header: PacketHeader,
        body: &[u8],
        now: Instant,
    ) -> TransportResult<()> {
        header.ack = self.tracker.ack_field();
        if self.endpoint.is_some() {
            header.flags = header.flags.with(FLAG_ENCRYPTED);
        }

        let mut datagram =
            BytesMut::with_capacity(header.encoded_len() + body.len() + RECORD_OVERHEAD);
        header.encode(&mut datagram);
        match self.endpoint.as_mut() {
            Some(endpoint) => {
                let record = endpoint.protect(&datagram, body)?;
                datagram.extend_from_slice(&record);
            }
            None => datagram.extend_from_slice(body),
        }

        self.ack_owed_since = None;
        self.transmit(&datagram, now);
        Ok(())
    }

    fn send_handshake(&mut self, payload: &[u8], now: Instant) {
        let header = PacketHeader::handshake();
        let mut datagram = BytesMut::with_capacity(header.encoded_len() + payload.len());
        header.encode(&mut datagram);
        datagram.extend_from_slice(payload);
        self.transmit(&datagram, now);
    }

    /// Hand a datagram to the socket; failures are counted, never fatal.
    fn transmit(&mut self, datagram: &[u8], now: Instant) {
        match self.socket.send_to(datagram, self.remote) {
            Ok(len) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += len as u64;
                self.last_sent = now;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                self.stats.send_errors += 1;
                trace!(conn = %self.id, "socket send buffer full");
            }
            Err(err) => {
                self.stats.send_errors += 1;
                warn!(conn = %self.id, error = %err, "socket send failed");
            }
        }
    }

    /// Feed one inbound datagram from the peer.
    pub fn process_datagram(&mut self, datagram: &[u8], now: Instant) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return;
        }

        let (header, header_len) = match PacketHeader::decode(datagram) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.on_malformed(err, now);
                return;
            }
        };

        if header.is_handshake() {
            self.process_handshake_data(&datagram[header_len..], now);
            return;
        }

        let body = match self.open_body(&header, datagram, header_len, now) {
            Some(body) => body,
            None => return,
        };
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Some(reliable) = header.reliable {
            if !self.ordering.accepts(reliable.sequence) {
                trace!(conn = %self.id, sequence = %reliable.sequence, "beyond ordering window");
                return;
            }
        }

        match self.tracker.process_received(header.packet_id) {
            ReceiveStatus::Accepted => {}
            ReceiveStatus::Duplicate => {
                self.stats.duplicates += 1;
                trace!(conn = %self.id, packet = %header.packet_id, "duplicate packet");
                return;
            }
            ReceiveStatus::OutOfWindow => {
                trace!(conn = %self.id, packet = %header.packet_id, "outside receive window");
                return;
            }
        }
        self.last_received = now;
        self.stats.packets_received += 1;
        self.stats.bytes_received += datagram.len() as u64;

        if let Some(ack) = header.ack {
            for packet_id in self.tracker.process_ack_field(ack) {
                if self.reliable.on_ack(packet_id, now) == Some(PacketTimeoutResult::Acked) {
                    trace!(conn = %self.id, packet = %packet_id, "message delivered");
                }
            }
        }

        if header.is_disconnect() {
            debug!(conn = %self.id, "peer closed the connection");
            self.begin_disconnect(DisconnectReason::RemoteClosed, now);
            return;
        }
        if body.is_empty() {
            // Ack-only or keepalive
            return;
        }
        self.ack_owed_since.get_or_insert(now);

        if let Some(reliable) = header.reliable {
            for payload in self.ordering.advance_floor(reliable.floor) {
                self.deliver(payload, true);
            }
        }

        let payload = match header.fragment {
            Some(fragment) => match self.fragments.on_fragment_received(fragment, body, now) {
                Some(payload) => payload,
                None => return,
            },
            None => body,
        };

        match header.reliable {
            Some(reliable) => {
                for payload in self.ordering.insert(reliable.sequence, payload) {
                    self.deliver(payload, true);
                }
            }
            None => self.deliver(payload, false),
        }
    }

    /// Authenticate and decrypt the body as needed.
    fn open_body(
        &mut self,
        header: &PacketHeader,
        datagram: &[u8],
        header_len: usize,
        now: Instant,
    ) -> Option<Bytes> {
        let (aad, body) = datagram.split_at(header_len);

        let unexpected = PacketError::InvalidFlagCombination(header.wire_flags().as_byte());
        let Some(endpoint) = self.endpoint.as_mut() else {
            if header.is_encrypted() {
                self.on_malformed(unexpected, now);
                return None;
            }
            return Some(Bytes::copy_from_slice(body));
        };

        if !header.is_encrypted() {
            self.on_malformed(unexpected, now);
            return None;
        }
        if !endpoint.is_established() {
            trace!(conn = %self.id, "record before session established");
            return None;
        }

        match endpoint.unprotect(aad, body) {
            Ok(plaintext) => Some(Bytes::from(plaintext)),
            Err(CryptoError::ReplayDetected) => {
                self.stats.duplicates += 1;
                trace!(conn = %self.id, "replayed record");
                None
            }
            Err(err) => {
                self.stats.decrypt_failures += 1;
                if endpoint.failure_limit_reached() {
                    warn!(conn = %self.id, error = %err, "too many bad records");
                    self.begin_disconnect(DisconnectReason::SecurityViolation, now);
                }
                None
            }
        }
    }

    /// Feed a handshake payload (the bytes after the packet header).
    pub fn process_handshake_data(&mut self, data: &[u8], now: Instant) -> HandshakeState {
        let Some(endpoint) = self.endpoint.as_mut() else {
            let flags = PacketHeader::handshake().wire_flags().as_byte();
            self.on_malformed(PacketError::InvalidFlagCombination(flags), now);
            return HandshakeState::Complete;
        };
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return endpoint.state();
        }

        match endpoint.process_handshake(data) {
            Ok(step) => {
                self.last_received = now;
                if let Some(reply) = step.reply {
                    self.send_handshake(&reply, now);
                }
                if step.state == HandshakeState::Complete
                    && self.state == ConnectionState::Connecting
                {
                    self.on_established();
                }
                step.state
            }
            Err(err) => {
                let state = endpoint.state();
                if state == HandshakeState::Failed {
                    warn!(conn = %self.id, error = %err, "handshake failed");
                    self.begin_disconnect(DisconnectReason::HandshakeFailed, now);
                } else {
                    debug!(conn = %self.id, error = %err, "handshake message ignored");
                }
                state
            }
        }
    }

    fn deliver(&mut self, payload: Bytes, reliable: bool) {
        self.events
            .push_back(ConnectionEvent::Packet { payload, reliable });
    }

    fn on_malformed(&mut self, err: PacketError, now: Instant) {
        self.malformed += 1;
        self.stats.malformed += 1;
        trace!(conn = %self.id, error = %err, "malformed packet dropped");
        if self.malformed >= self.config.malformed_limit
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            warn!(conn = %self.id, count = self.malformed, "too many malformed packets");
            self.begin_disconnect(DisconnectReason::ProtocolAbuse, now);
        }
    }

    /// Run timers: handshake retries, reliable retransmission, ack flushing,
    /// keepalives, dead-peer detection and the disconnect linger.
    pub fn update_heartbeat(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => self.handshake_heartbeat(now),
            ConnectionState::Connected => self.connected_heartbeat(now),
            ConnectionState::Disconnecting => {
                if self.linger_until.is_none_or(|until| now >= until) {
                    self.finish_disconnect();
                }
            }
        }
    }

    fn handshake_heartbeat(&mut self, now: Instant) {
        let Some(deadline) = self.handshake_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        if self.handshake_retries >= self.config.handshake_max_retries {
            warn!(conn = %self.id, retries = self.handshake_retries, "handshake timed out");
            self.begin_disconnect(DisconnectReason::HandshakeTimeout, now);
            return;
        }

        self.handshake_retries += 1;
        self.stats.handshake_retries = self.handshake_retries;
        self.handshake_timeout = self.handshake_timeout.saturating_mul(HANDSHAKE_BACKOFF);
        self.handshake_deadline = Some(now + self.handshake_timeout);

        let resend = self
            .endpoint
            .as_ref()
            .and_then(EncryptionEndpoint::retransmit_payload);
        if let Some(payload) = resend {
            debug!(conn = %self.id, retry = self.handshake_retries, "resending handshake");
            self.send_handshake(&payload, now);
        }
    }

    fn connected_heartbeat(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_received) >= self.config.dead_interval {
            warn!(conn = %self.id, "peer silent, closing");
            self.begin_disconnect(DisconnectReason::Timeout, now);
            return;
        }

        let mut lost_any = false;
        for report in self.reliable.scan_for_timeouts(now) {
            for piece in &report.resend {
                self.stats.retransmissions += 1;
                if let Err(err) = self.send_data(piece, Some(report.sequence), now) {
                    warn!(conn = %self.id, error = %err, "retransmission failed");
                }
            }
            if report.result == PacketTimeoutResult::Lost {
                debug!(conn = %self.id, sequence = %report.sequence, "reliable message lost");
                self.stats.messages_lost += 1;
                self.events
                    .push_back(ConnectionEvent::PacketLost(report.sequence));
                lost_any = true;
            }
        }
        if lost_any && self.config.loss_policy == LossPolicy::Disconnect {
            self.disconnect(DisconnectReason::MessageLost, now);
            return;
        }

        let pruned = self.fragments.prune(now, self.config.fragment_timeout);
        if pruned > 0 {
            trace!(conn = %self.id, pruned, "stale fragment assemblies dropped");
        }
        self.tracker.prune(now, self.config.dead_interval);

        let ack_due = self
            .ack_owed_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.config.ack_delay);
        let idle = now.saturating_duration_since(self.last_sent) >= self.config.keepalive_interval;
        if ack_due || idle {
            if let Err(err) = self.send_ack_only(now) {
                warn!(conn = %self.id, error = %err, "ack flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        EncryptionConfig, RetransmitPolicy, HANDSHAKE_MAX_RETRIES, MAX_DATAGRAM_SIZE,
    };
    use crate::crypto::StaticKeypair;
    use crate::transport::socket::MemorySocket;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct Pair {
        a: Connection,
        b: Connection,
        sa: Arc<MemorySocket>,
        sb: Arc<MemorySocket>,
    }

    impl Pair {
        fn new(config_a: ConnectionConfig, config_b: ConnectionConfig, now: Instant) -> Self {
            let (sa, sb) = MemorySocket::pair(addr(1000), addr(2000));
            let a = Connection::new(
                ConnectionId(1),
                ConnectionRole::Connector,
                addr(2000),
                sa.clone(),
                config_a,
                now,
            )
            .unwrap();
            let b = Connection::new(
                ConnectionId(2),
                ConnectionRole::Acceptor,
                addr(1000),
                sb.clone(),
                config_b,
                now,
            )
            .unwrap();
            Self { a, b, sa, sb }
        }

        fn plaintext(now: Instant) -> Self {
            Self::new(ConnectionConfig::default(), ConnectionConfig::default(), now)
        }

        fn open(&mut self, now: Instant) {
            self.a.connect(now).unwrap();
            self.b.accept(now).unwrap();
            self.pump(now);
        }

        /// Deliver everything in flight, both ways, until quiet.
        fn pump(&mut self, now: Instant) {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let mut moved = false;
                while let Some((len, _)) = self.sb.try_recv_from(&mut buf).unwrap() {
                    self.b.process_datagram(&buf[..len], now);
                    moved = true;
                }
                while let Some((len, _)) = self.sa.try_recv_from(&mut buf).unwrap() {
                    self.a.process_datagram(&buf[..len], now);
                    moved = true;
                }
                if !moved {
                    return;
                }
            }
        }
    }

    fn payloads(events: Vec<ConnectionEvent>) -> Vec<Bytes> {
        events
            .into_iter()
            .filter_map(|event| match event {
                ConnectionEvent::Packet { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    fn encrypted_configs(connector_knows_key: bool) -> (ConnectionConfig, ConnectionConfig) {
        let a_keys = StaticKeypair::generate();
        let b_keys = StaticKeypair::generate();
        let remote = connector_knows_key.then(|| *b_keys.public_key());
        let a = ConnectionConfig {
            encryption: Some(EncryptionConfig {
                local_keypair: a_keys,
                remote_public_key: remote,
            }),
            ..ConnectionConfig::default()
        };
        let b = ConnectionConfig {
            encryption: Some(EncryptionConfig {
                local_keypair: b_keys,
                remote_public_key: None,
            }),
            ..ConnectionConfig::default()
        };
        (a, b)
    }

    #[test]
    fn test_plaintext_connects_immediately() {
        let now = Instant::now();
        let mut pair = Pair::plaintext(now);
        pair.open(now);

        assert_eq!(pair.a.state(), ConnectionState::Connected);
        assert_eq!(pair.b.state(), ConnectionState::Connected);
        assert_eq!(pair.a.drain_events(), vec![ConnectionEvent::Connected]);
        assert_eq!(pair.b.poll_event(), Some(ConnectionEvent::Connected));
        assert_eq!(pair.a.handshake_state(), HandshakeState::Complete);
    }

    #[test]
    fn test_send_before_connect_fails() {
        let now = Instant::now();
        let mut pair = Pair::plaintext(now);
        let err = pair
            .a
            .send_reliable_packet(Bytes::from_static(b"x"), now)
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::NotConnected(ConnectionState::Disconnected)
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let now = Instant::now();
        let mut pair = Pair::plaintext(now);
        pair.open(now);
        assert!(matches!(
            pair.a.send_unreliable_packet(Bytes::new(), now),
            Err(TransportError::EmptyPayload)
        ));
    }

    #[test]
    fn test_large_reliable_fragments_and_acks() {
        let now = Instant::now();
        let mut pair = Pair::plaintext(now);
        pair.open(now);
        pair.a.drain_events();
        pair.b.drain_events();

        let payload = Bytes::from((0..5000).map(|i| i as u8).collect::<Vec<_>>());
        let before = pair.sa.sent_count();
        pair.a.send_reliable_packet(payload.clone(), now).unwrap();
        assert_eq!(pair.sa.sent_count() - before, 5);
        assert_eq!(pair.a.reliable_queue_size(), 1);

        pair.pump(now);
        assert_eq!(payloads(pair.b.drain_events()), vec![payload]);

        // Receiver flushes its owed acks after the ack delay
        let later = now + ConnectionConfig::default().ack_delay;
        pair.b.update_heartbeat(later);
        pair.pump(later);
        assert_eq!(pair.a.reliable_queue_size(), 0);
    }

    #[test]
    fn test_unreliable_delivery() {
        let now = Instant::now();
        let mut pair = Pair::plaintext(now);
        pair.open(now);
        pair.b.drain_events();

        let id = pair
            .a
            .send_unreliable_packet(Bytes::from_static(b"ping"), now)
            .unwrap();
        pair.pump(now);

        assert_eq!(
            pair.b.drain_events(),
            vec![ConnectionEvent::Packet {
                payload: Bytes::from_static(b"ping"),
                reliable: false,
            }]
        );
        assert!(!pair.a.was_packet_acked(id));

        pair.b
            .send_unreliable_packet(Bytes::from_static(b"pong"), now)
            .unwrap();
        pair.pump(now);
        assert!(pair.a.was_packet_acked(id));
    }

    #[test]
    fn test_retry_ceiling_reports_lost() {
        let start = Instant::now();
        let config = ConnectionConfig {
            retransmit: RetransmitPolicy::fixed(Duration::from_millis(100), 3),
            ..ConnectionConfig::default()
        };
        let mut pair = Pair::new(config, ConnectionConfig::default(), start);
        pair.open(start);
        pair.a.drain_events();

        pair.sa.set_drop_filter(|_| true);
        let sequence = pair
            .a
            .send_reliable_packet(Bytes::from_static(b"doomed"), start)
            .unwrap();

        for ms in [50u64, 100, 150, 200, 250] {
            pair.a.update_heartbeat(start + Duration::from_millis(ms));
            assert!(pair.a.drain_events().is_empty(), "no loss at {ms} ms");
        }
        pair.a.update_heartbeat(start + Duration::from_millis(300));

        assert_eq!(
            pair.a.drain_events(),
            vec![ConnectionEvent::PacketLost(sequence)]
        );
        assert_eq!(pair.a.stats().retransmissions, 3);
        assert_eq!(pair.a.stats().messages_lost, 1);
        assert_eq!(pair.a.reliable_queue_size(), 0);
        assert_eq!(pair.a.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_loss_policy_disconnects() {
        let start = Instant::now();
        let config = ConnectionConfig {
            retransmit: RetransmitPolicy::fixed(Duration::from_millis(100), 1),
            loss_policy: LossPolicy::Disconnect,
            ..ConnectionConfig::default()
        };
        let mut pair = Pair::new(config, ConnectionConfig::default(), start);
        pair.open(start);
        pair.sa.set_drop_filter(|_| true);

        pair.a
            .send_reliable_packet(Bytes::from_static(b"x"), start)
            .unwrap();
        pair.a.update_heartbeat(start + Duration::from_millis(100));

        assert_eq!(pair.a.state(), ConnectionState::Disconnecting);
        assert_eq!(
            pair.a.disconnect_reason(),
            Some(DisconnectReason::MessageLost)
        );
    }

    #[test]
    fn test_retransmission_recovers_dropped_packet() {
        let start = Instant::now();
        let config = ConnectionConfig {
            retransmit: RetransmitPolicy::fixed(Duration::from_millis(100), 5),
            ..ConnectionConfig::default()
        };
        let mut pair = Pair::new(config, ConnectionConfig::default(), start);
        pair.open(start);
        pair.b.drain_events();

        pair.sa.set_drop_filter(|_| true);
        pair.a
            .send_reliable_packet(Bytes::from_static(b"first"), start)
            .unwrap();
        pair.sa.clear_drop_filter();
        pair.a
            .send_reliable_packet(Bytes::from_static(b"second"), start)
            .unwrap();
        pair.pump(start);
        // Held back until the first message arrives
        assert!(payloads(pair.b.drain_events()).is_empty());

        let retry = start + Duration::from_millis(100);
        pair.a.update_heartbeat(retry);
        pair.pump(retry);
        assert_eq!(
            payloads(pair.b.drain_events()),
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[test]
    fn test_disconnect_flow() {
        let now = Instant::now();
        let mut pair = Pair::plaintext(now);
        pair.open(now);
        pair.a.drain_events();
        pair.b.drain_events();

        assert!(pair.a.disconnect(DisconnectReason::Requested, now));
        assert!(!pair.a.disconnect(DisconnectReason::Requested, now));
        assert!(matches!(
            pair.a.send_reliable_packet(Bytes::from_static(b"x"), now),
            Err(TransportError::NotConnected(ConnectionState::Disconnecting))
        ));

        pair.pump(now);
        assert_eq!(pair.b.state(), ConnectionState::Disconnecting);

        let later = now + Duration::from_secs(1);
        pair.a.update_heartbeat(later);
        pair.b.update_heartbeat(later);
        assert_eq!(
            pair.a.drain_events(),
            vec![ConnectionEvent::Disconnected(DisconnectReason::Requested)]
        );
        assert_eq!(
            pair.b.drain_events(),
            vec![ConnectionEvent::Disconnected(DisconnectReason::RemoteClosed)]
        );
        assert!(pair.a.connect(later).is_err());
    }

    #[test]
    fn test_dead_peer_times_out() {
        let start = Instant::now();
        let mut pair = Pair::plaintext(start);
        pair.open(start);

        pair.a.update_heartbeat(start + Duration::from_secs(31));
        assert_eq!(pair.a.disconnect_reason(), Some(DisconnectReason::Timeout));
    }

    #[test]
    fn test_keepalive_keeps_peer_alive() {
        let start = Instant::now();
        let mut pair = Pair::plaintext(start);
        pair.open(start);

        let mut now = start;
        for _ in 0..10 {
            now += Duration::from_secs(5);
            pair.a.update_heartbeat(now);
            pair.b.update_heartbeat(now);
            pair.pump(now);
        }
        assert_eq!(pair.a.state(), ConnectionState::Connected);
        assert_eq!(pair.b.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_malformed_limit() {
        let now = Instant::now();
        let config = ConnectionConfig {
            malformed_limit: 3,
            ..ConnectionConfig::default()
        };
        let mut pair = Pair::new(ConnectionConfig::default(), config, now);
        pair.open(now);

        for _ in 0..3 {
            pair.b.process_datagram(&[0xFF, 0, 0], now);
        }
        assert_eq!(pair.b.stats().malformed, 3);
        assert_eq!(
            pair.b.disconnect_reason(),
            Some(DisconnectReason::ProtocolAbuse)
        );
    }

    #[test]
    fn test_mtu_clamped() {
        let now = Instant::now();
        let mut pair = Pair::plaintext(now);
        assert_eq!(pair.a.set_connection_mtu(10), MIN_MTU);
        assert_eq!(pair.a.set_connection_mtu(1_000_000), MAX_MTU);
        assert_eq!(pair.a.set_connection_mtu(1400), 1400);
    }

    #[test]
    fn test_encrypted_ik_exchange() {
        let now = Instant::now();
        let (config_a, config_b) = encrypted_configs(true);
        let mut pair = Pair::new(config_a, config_b, now);

        pair.a.connect(now).unwrap();
        assert_eq!(pair.a.state(), ConnectionState::Connecting);
        pair.b.accept(now).unwrap();
        pair.pump(now);

        assert_eq!(pair.a.state(), ConnectionState::Connected);
        assert_eq!(pair.b.state(), ConnectionState::Connected);
        let a_public = *pair.a.endpoint.as_ref().unwrap().local_public_key();
        assert_eq!(pair.b.remote_static_key(), Some(&a_public));

        pair.a.drain_events();
        pair.b.drain_events();
        let payload = Bytes::from(vec![0xAB; 3000]);
        pair.a.send_reliable_packet(payload.clone(), now).unwrap();
        pair.pump(now);
        assert_eq!(payloads(pair.b.drain_events()), vec![payload]);
    }

    #[test]
    fn test_encrypted_xx_exchange() {
        let now = Instant::now();
        let (config_a, config_b) = encrypted_configs(false);
        let mut pair = Pair::new(config_a, config_b, now);
        pair.open(now);

        assert_eq!(pair.a.handshake_state(), HandshakeState::Complete);
        assert_eq!(pair.b.handshake_state(), HandshakeState::Complete);

        pair.b.drain_events();
        pair.a
            .send_unreliable_packet(Bytes::from_static(b"secret"), now)
            .unwrap();
        pair.pump(now);
        assert_eq!(
            payloads(pair.b.drain_events()),
            vec![Bytes::from_static(b"secret")]
        );
    }

    #[test]
    fn test_lost_handshake_reply_is_resent() {
        let start = Instant::now();
        let (config_a, config_b) = encrypted_configs(true);
        let mut pair = Pair::new(config_a, config_b, start);

        pair.a.connect(start).unwrap();
        pair.b.accept(start).unwrap();
        pair.sb.set_drop_filter(|_| true);
        pair.pump(start);
        assert_eq!(pair.a.state(), ConnectionState::Connecting);

        pair.sb.clear_drop_filter();
        let retry = start + Duration::from_secs(1);
        pair.a.update_heartbeat(retry);
        pair.pump(retry);
        assert_eq!(pair.a.state(), ConnectionState::Connected);
        assert_eq!(pair.a.stats().handshake_retries, 1);
    }

    #[test]
    fn test_injected_handshake_failure_never_connects() {
        let now = Instant::now();
        let (config_a, _) = encrypted_configs(true);
        let mut pair = Pair::new(config_a, ConnectionConfig::default(), now);

        pair.a.connect(now).unwrap();
        let mut forged = BytesMut::new();
        PacketHeader::handshake().encode(&mut forged);
        forged.extend_from_slice(&[0x01; 64]);
        pair.a.process_datagram(&forged, now);

        assert_eq!(pair.a.handshake_state(), HandshakeState::Failed);
        assert_eq!(pair.a.state(), ConnectionState::Disconnecting);
        assert_eq!(
            pair.a.disconnect_reason(),
            Some(DisconnectReason::HandshakeFailed)
        );
        pair.a.update_heartbeat(now + Duration::from_secs(1));
        assert!(!pair.a.drain_events().contains(&ConnectionEvent::Connected));
    }

    #[test]
    fn test_handshake_timeout() {
        let start = Instant::now();
        let (config_a, _) = encrypted_configs(true);
        let mut pair = Pair::new(config_a, ConnectionConfig::default(), start);
        pair.a.connect(start).unwrap();

        // Retries at 1, 3, 7, 15 and 31 seconds; gives up at 63
        let mut now = start;
        for _ in 0..64 {
            now += Duration::from_secs(1);
            pair.a.update_heartbeat(now);
        }
        assert_eq!(pair.a.stats().handshake_retries, HANDSHAKE_MAX_RETRIES);
        assert_eq!(
            pair.a.disconnect_reason(),
            Some(DisconnectReason::HandshakeTimeout)
        );
    }

    #[test]
    fn test_tampered_record_dropped() {
        let now = Instant::now();
        let (config_a, config_b) = encrypted_configs(true);
        let mut pair = Pair::new(config_a, config_b, now);
        pair.open(now);
        pair.b.drain_events();

        pair.a
            .send_unreliable_packet(Bytes::from_static(b"hello"), now)
            .unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = pair.sb.try_recv_from(&mut buf).unwrap().unwrap();
        let mut datagram = buf[..len].to_vec();
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;

        pair.b.process_datagram(&datagram, now);
        assert!(pair.b.drain_events().is_empty());
        assert_eq!(pair.b.stats().decrypt_failures, 1);
        assert_eq!(pair.b.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_repeated_bad_records_disconnect() {
        let now = Instant::now();
        let (config_a, mut config_b) = encrypted_configs(true);
        config_b.decrypt_failure_limit = 3;
        let mut pair = Pair::new(config_a, config_b, now);
        pair.open(now);
        pair.b.drain_events();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        // Replays are dropped but never count as failures
        pair.a
            .send_unreliable_packet(Bytes::from_static(b"once"), now)
            .unwrap();
        let (len, _) = pair.sb.try_recv_from(&mut buf).unwrap().unwrap();
        let genuine = buf[..len].to_vec();
        for _ in 0..10 {
            pair.b.process_datagram(&genuine, now);
        }
        assert_eq!(
            payloads(pair.b.drain_events()),
            vec![Bytes::from_static(b"once")]
        );
        assert_eq!(pair.b.stats().duplicates, 9);
        assert_eq!(pair.b.stats().decrypt_failures, 0);
        assert_eq!(pair.b.state(), ConnectionState::Connected);

        for round in 1..=3u64 {
            pair.a
                .send_unreliable_packet(Bytes::from_static(b"bad"), now)
                .unwrap();
            let (len, _) = pair.sb.try_recv_from(&mut buf).unwrap().unwrap();
            let mut datagram = buf[..len].to_vec();
            let last = datagram.len() - 1;
            datagram[last] ^= 0x80;
            pair.b.process_datagram(&datagram, now);
            assert_eq!(pair.b.stats().decrypt_failures, round);
            if round < 3 {
                assert_eq!(pair.b.state(), ConnectionState::Connected);
            }
        }

        assert_eq!(pair.b.state(), ConnectionState::Disconnecting);
        assert_eq!(
            pair.b.disconnect_reason(),
            Some(DisconnectReason::SecurityViolation)
        );
        assert!(payloads(pair.b.drain_events()).is_empty());
    }

    #[test]
    fn test_failed_reliable_send_is_not_queued() {
        let now = Instant::now();
        let (config_a, config_b) = encrypted_configs(true);
        let mut pair = Pair::new(config_a, config_b, now);
        pair.open(now);
        pair.b.drain_events();

        // Room for exactly one more record: the second fragment fails
        pair.a.endpoint.as_mut().unwrap().exhaust_after(1);
        let payload = Bytes::from(vec![0x5A; 3000]);
        let result = pair.a.send_reliable_packet(payload, now);
        assert!(matches!(
            result,
            Err(TransportError::Crypto(CryptoError::CounterExhaustion))
        ));
        assert_eq!(pair.a.reliable_queue_size(), 0);

        // Nothing is retransmitted and nothing is delivered later
        let later = now + Duration::from_secs(2);
        pair.pump(now);
        pair.a.update_heartbeat(later);
        pair.pump(later);
        assert_eq!(pair.a.stats().retransmissions, 0);
        assert!(payloads(pair.b.drain_events()).is_empty());
    }

    #[test]
    fn test_plaintext_rejected_on_encrypted_connection() {
        let now = Instant::now();
        let (config_a, config_b) = encrypted_configs(true);
        let mut pair = Pair::new(config_a, config_b, now);
        pair.open(now);
        pair.b.drain_events();

        let mut forged = BytesMut::new();
        PacketHeader::new(PacketId(500)).encode(&mut forged);
        forged.extend_from_slice(b"injected");
        pair.b.process_datagram(&forged, now);

        assert!(pair.b.drain_events().is_empty());
        assert_eq!(pair.b.stats().malformed, 1);
    }

    #[test]
    fn test_shared_connection() {
        let now = Instant::now();
        let pair = Pair::plaintext(now);
        let shared = pair.a.into_shared();
        shared.lock().connect(now).unwrap();
        assert_eq!(shared.lock().state(), ConnectionState::Connected);
    }
}
