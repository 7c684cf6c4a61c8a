//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one logical peer-to-peer
//! session.  Its responsibilities are:
//! - Driving the finite-state machine (see [`crate::state`]): three-way
//!   handshake, data transfer, four-way teardown.
//! - Coordinating [`crate::sender::SendWindow`] and
//!   [`crate::receiver::Receiver`].
//! - Dispatching inbound [`crate::packet::Packet`]s to the right handler for
//!   the current state.
//! - Running retransmission timeouts and the TIME_WAIT expiry from
//!   [`Connection::update`].
//!
//! # Concurrency model
//!
//! The engine is single-owner and poll-driven.  `send`, `receive`, `close`,
//! and `update` never suspend or block; `update` is the sole re-entry point
//! and must be called repeatedly by the owner.  A caller that wants to wait
//! (for window space, for the handshake, for teardown) loops over the API
//! with a yield of its own choosing.  Nothing here is thread-safe by design;
//! run one connection per task or wrap it yourself.
//!
//! # What gets retransmitted
//!
//! Only data segments: on RTO expiry and on the third duplicate ACK.
//! Control segments (SYN, SYN+ACK, FIN) are sent once; recovering a lost
//! handshake or teardown is the caller's policy (retry with a deadline).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::packet::{flags, Packet, MAX_PACKET_SIZE, MAX_PAYLOAD};
use crate::receiver::{Ingest, Receiver};
use crate::sender::{AckOutcome, SendWindow};
use crate::socket::{DatagramPort, UdpPort};
use crate::state::ConnectionState;

/// How long a closing endpoint lingers in TIME_WAIT before reaching CLOSED.
///
/// Stands in for 2·MSL; long enough to re-acknowledge a retransmitted FIN on
/// loopback-scale links.  The transition happens on a later `update` tick,
/// never by sleeping.
pub const TIME_WAIT_TIMEOUT: Duration = Duration::from_millis(400);

/// Errors surfaced by the connection API.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The effective send window cannot take the payload right now; drive
    /// `update` and retry.
    #[error("send window full")]
    WindowFull,
    /// A single segment cannot carry this many bytes; split the write.
    #[error("payload of {0} bytes exceeds the maximum segment payload")]
    PayloadTooLarge(usize),
    /// The operation is not valid in the connection's current state.
    #[error("operation invalid in state {0}")]
    BadState(ConnectionState),
    /// The peer closed its side and every in-order byte has been consumed.
    #[error("peer closed the connection")]
    Eof,
    /// Socket-level failure while setting the connection up.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// A reliable byte-stream connection over an unreliable datagram port.
///
/// Constructed either passively with [`Connection::listen`] (server) or
/// actively with [`Connection::connect`] (client).  Generic over the port so
/// tests can splice in [`crate::simulator::Simulator`].
pub struct Connection<P: DatagramPort = UdpPort> {
    /// Current FSM state.
    pub state: ConnectionState,
    /// Outbound window and retransmit queue.
    pub sender: SendWindow,
    /// Inbound reassembly buffer.
    pub receiver: Receiver,
    port: P,
    peer: Option<SocketAddr>,
    /// Deadline for the TIME_WAIT → CLOSED transition.
    time_wait_until: Option<Instant>,
}

impl Connection<UdpPort> {
    /// Bind `addr` and wait passively for a peer (server side).
    pub fn listen(addr: SocketAddr) -> Result<Self, ConnError> {
        Ok(Self::listen_with(UdpPort::bind(addr)?))
    }

    /// Bind an ephemeral local port and start an active open toward `peer`.
    pub fn connect(peer: SocketAddr) -> Result<Self, ConnError> {
        let local = SocketAddr::from(([0, 0, 0, 0], 0));
        Self::connect_with(UdpPort::bind(local)?, peer)
    }
}

impl<P: DatagramPort> Connection<P> {
    /// Passive open over an already-bound port.
    pub fn listen_with(port: P) -> Self {
        log::info!("[conn] listening");
        Self {
            state: ConnectionState::Listen,
            sender: SendWindow::new(rand::random()),
            receiver: Receiver::new(),
            port,
            peer: None,
            time_wait_until: None,
        }
    }

    /// Active open over an already-bound port: sends the SYN and returns
    /// immediately in `SynSent`.  The open completes once `update` drives the
    /// state to `Established`.
    pub fn connect_with(port: P, peer: SocketAddr) -> Result<Self, ConnError> {
        let mut conn = Self {
            state: ConnectionState::Closed,
            sender: SendWindow::new(rand::random()),
            receiver: Receiver::new(),
            port,
            peer: Some(peer),
            time_wait_until: None,
        };

        let seq = conn.sender.take_control_seq();
        conn.transmit(flags::SYN, seq, &[])?;
        conn.state = ConnectionState::SynSent;
        log::info!("[conn] → SYN seq={seq} to {peer}");
        Ok(conn)
    }

    /// Remote endpoint, once known (after `connect` or the first accepted
    /// SYN).
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Local address of the underlying port.
    pub fn local_addr(&self) -> Result<SocketAddr, ConnError> {
        Ok(self.port.local_addr()?)
    }

    /// Direct access to the port, mainly for configuring a test simulator.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// `true` when every submitted byte has been cumulatively acknowledged.
    pub fn is_send_complete(&self) -> bool {
        self.sender.is_empty()
    }

    // -----------------------------------------------------------------------
    // Application API
    // -----------------------------------------------------------------------

    /// Queue `data` as one segment and transmit it.
    ///
    /// The payload is admitted whole or not at all: `Err(WindowFull)` means
    /// the effective window (peer's advertised space capped by `cwnd`, minus
    /// bytes in flight) cannot take it yet.  The data is copied, so `data`
    /// may be reused as soon as this returns.
    pub fn send(&mut self, data: &[u8]) -> Result<(), ConnError> {
        match self.state {
            ConnectionState::Established | ConnectionState::CloseWait => {}
            s => return Err(ConnError::BadState(s)),
        }
        if data.len() > MAX_PAYLOAD {
            return Err(ConnError::PayloadTooLarge(data.len()));
        }

        let Some(seq) = self.sender.push(data, Instant::now()) else {
            return Err(ConnError::WindowFull);
        };
        log::trace!(
            "[conn] → DATA seq={seq} len={} in_flight={}",
            data.len(),
            self.sender.in_flight()
        );
        self.transmit(flags::ACK, seq, data)?;
        Ok(())
    }

    /// Copy up to `buf.len()` in-order bytes into `buf`.
    ///
    /// `Ok(0)` means no data is ready; `Err(Eof)` means the peer's FIN has
    /// been consumed and the stream is fully drained.  Reading may emit a
    /// window-update ACK: when the advertised window reopens from zero, or
    /// grows by at least one full segment, the peer is told promptly rather
    /// than waiting for the next data exchange.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize, ConnError> {
        if self.receiver.is_empty() {
            if self.receiver.fin_received() {
                return Err(ConnError::Eof);
            }
            return Ok(0);
        }

        let before = self.receiver.window();
        let n = self.receiver.read(buf);
        let after = self.receiver.window();

        if self.peer.is_some() && (before == 0 && after > 0 || after - before >= MAX_PACKET_SIZE as u32)
        {
            log::debug!("[conn] → window update ({before} → {after})");
            self.send_ack();
        }
        Ok(n)
    }

    /// Initiate a graceful shutdown of our sending side.
    ///
    /// From `Established` this is the active close (FIN_WAIT_1); from
    /// `CloseWait` it completes the passive close (LAST_ACK).  Any data still
    /// in the retransmit queue keeps being retransmitted until acknowledged.
    pub fn close(&mut self) -> Result<(), ConnError> {
        let next = match self.state {
            ConnectionState::Established => ConnectionState::FinWait1,
            ConnectionState::CloseWait => ConnectionState::LastAck,
            s => return Err(ConnError::BadState(s)),
        };

        let seq = self.sender.take_control_seq();
        self.transmit(flags::FIN | flags::ACK, seq, &[])?;
        log::info!("[conn] → FIN seq={seq}, {} → {next}", self.state);
        self.state = next;
        Ok(())
    }

    /// Return a finished or aborted server connection to `Listen` so the
    /// endpoint can serve the next peer.  All buffers, queues, and sequence
    /// state are discarded; a fresh ISS is drawn.
    pub fn reset(&mut self) {
        log::info!("[conn] reset, {} → Listen", self.state);
        self.sender.reset(rand::random());
        self.receiver.reset();
        self.peer = None;
        self.time_wait_until = None;
        self.state = ConnectionState::Listen;
    }

    // -----------------------------------------------------------------------
    // Engine tick
    // -----------------------------------------------------------------------

    /// Drive the engine: drain every queued datagram through the state
    /// machine, then run timeout retransmissions and the TIME_WAIT expiry.
    ///
    /// This is the sole place inbound traffic is processed.  Call it often.
    pub fn update(&mut self) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            match self.port.recv_from(&mut buf) {
                Ok(Some((len, src))) => match Packet::decode(&buf[..len]) {
                    Ok(pkt) => self.process(pkt, src),
                    Err(e) => log::trace!("[conn] dropping bad datagram from {src}: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    // Transient by policy; try again next tick.
                    log::warn!("[conn] recv error: {e}");
                    break;
                }
            }
        }

        self.check_timeouts();
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();

        if self.state == ConnectionState::TimeWait {
            if let Some(deadline) = self.time_wait_until {
                if now >= deadline {
                    self.time_wait_until = None;
                    self.state = ConnectionState::Closed;
                    log::info!("[conn] TimeWait expired → Closed");
                }
            }
        }

        for (seq, payload) in self.sender.expired(now) {
            log::debug!("[conn] RTO retransmit seq={seq} len={}", payload.len());
            let _ = self.transmit(flags::ACK, seq, &payload);
        }
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    fn process(&mut self, pkt: Packet, src: SocketAddr) {
        let h = pkt.header;

        // No RST generation and no RST handling in this protocol: drop.
        if h.flags & flags::RST != 0 {
            log::debug!("[conn] dropping RST from {src}");
            return;
        }
        // Once a peer is latched, traffic from anyone else is ignored.
        if let Some(peer) = self.peer {
            if src != peer {
                log::trace!("[conn] ignoring datagram from non-peer {src}");
                return;
            }
        }

        log::trace!(
            "[conn] ← flags={:#04x} seq={} ack={} len={} wnd={} state={}",
            h.flags,
            h.seq,
            h.ack,
            h.length,
            h.window,
            self.state
        );

        match self.state {
            ConnectionState::Closed => {}

            ConnectionState::Listen => {
                if h.flags & flags::SYN != 0 {
                    self.peer = Some(src);
                    self.receiver.synchronize(h.seq);
                    self.sender.set_peer_window(h.window);
                    let seq = self.sender.take_control_seq();
                    let _ = self.transmit(flags::SYN | flags::ACK, seq, &[]);
                    self.state = ConnectionState::SynRcvd;
                    log::info!("[conn] ← SYN from {src}; → SYN+ACK seq={seq}");
                }
            }

            ConnectionState::SynSent => {
                // Require both bits: a bare SYN would be a simultaneous open,
                // which this protocol does not support.
                const SYNACK: u8 = flags::SYN | flags::ACK;
                if h.flags & SYNACK == SYNACK {
                    self.receiver.synchronize(h.seq);
                    self.sender.set_peer_window(h.window);
                    self.sender.on_ack(h.ack, false);
                    self.send_ack();
                    self.state = ConnectionState::Established;
                    log::info!("[conn] ← SYN+ACK; established");
                }
            }

            ConnectionState::SynRcvd => {
                if h.flags & flags::ACK != 0 && h.flags & flags::SYN == 0 {
                    self.sender.set_peer_window(h.window);
                    self.sender.on_ack(h.ack, !pkt.payload.is_empty());
                    self.state = ConnectionState::Established;
                    log::info!("[conn] ← ACK; established");
                }
            }

            ConnectionState::Established => {
                self.handle_ack_and_data(&pkt);

                if h.flags & flags::FIN != 0
                    && pkt.payload.is_empty()
                    && h.seq == self.receiver.rcv_nxt
                {
                    self.receiver.on_fin();
                    self.send_ack();
                    self.state = ConnectionState::CloseWait;
                    log::info!("[conn] ← FIN; Established → CloseWait");
                }
            }

            ConnectionState::CloseWait => {
                // The peer may still be waiting on ACKs for data we hold, and
                // may retransmit data whose ACK was lost.
                self.handle_ack_and_data(&pkt);
            }

            ConnectionState::FinWait1 => {
                self.handle_ack_and_data(&pkt);
                let fin = self.in_order_fin(&pkt);
                let acks_fin = h.flags & flags::ACK != 0 && h.ack == self.sender.snd_nxt;

                if fin {
                    self.receiver.on_fin();
                    self.send_ack();
                }
                match (fin, acks_fin) {
                    (true, true) => {
                        self.enter_time_wait("FinWait1");
                    }
                    (true, false) => {
                        self.state = ConnectionState::Closing;
                        log::info!("[conn] ← FIN; FinWait1 → Closing");
                    }
                    (false, true) => {
                        self.state = ConnectionState::FinWait2;
                        log::info!("[conn] FIN acknowledged; FinWait1 → FinWait2");
                    }
                    (false, false) => {}
                }
            }

            ConnectionState::FinWait2 => {
                self.handle_ack_and_data(&pkt);
                if self.in_order_fin(&pkt) {
                    self.receiver.on_fin();
                    self.send_ack();
                    self.enter_time_wait("FinWait2");
                }
            }

            ConnectionState::Closing => {
                self.sender.set_peer_window(h.window);
                if h.flags & flags::ACK != 0 && h.ack == self.sender.snd_nxt {
                    self.enter_time_wait("Closing");
                }
            }

            ConnectionState::LastAck => {
                if h.flags & flags::ACK != 0 && h.ack == self.sender.snd_nxt {
                    self.state = ConnectionState::Closed;
                    log::info!("[conn] FIN acknowledged; LastAck → Closed");
                }
            }

            ConnectionState::TimeWait => {
                // Our final ACK may have been lost; re-acknowledge the FIN.
                if h.flags & flags::FIN != 0 {
                    self.send_ack();
                }
            }
        }
    }

    /// ACK-field and payload processing shared by the synchronised states.
    fn handle_ack_and_data(&mut self, pkt: &Packet) {
        let h = pkt.header;

        // Window updates apply even when the ACK number itself is a no-op.
        self.sender.set_peer_window(h.window);

        if h.flags & flags::ACK != 0 {
            match self.sender.on_ack(h.ack, !pkt.payload.is_empty()) {
                AckOutcome::FastRetransmit { seq, payload } => {
                    log::debug!("[conn] fast retransmit seq={seq} len={}", payload.len());
                    let _ = self.transmit(flags::ACK, seq, &payload);
                }
                AckOutcome::Advanced(bytes) => {
                    log::trace!("[conn] ← ACK {} (+{bytes})", h.ack);
                }
                AckOutcome::Duplicate(n) => {
                    log::trace!("[conn] ← dup ACK {} (#{n})", h.ack);
                }
                AckOutcome::Ignored => {}
            }
        }

        if !pkt.payload.is_empty() {
            let outcome = self.receiver.on_segment(h.seq, &pkt.payload);
            match outcome {
                Ingest::InOrder => log::trace!(
                    "[conn] ← DATA seq={} len={} delivered",
                    h.seq,
                    pkt.payload.len()
                ),
                Ingest::OutOfOrder => log::debug!(
                    "[conn] ← DATA seq={} ahead of {} buffered",
                    h.seq,
                    self.receiver.rcv_nxt
                ),
                Ingest::Duplicate => log::trace!("[conn] ← DATA seq={} duplicate", h.seq),
                Ingest::WindowFull => log::debug!(
                    "[conn] ← DATA seq={} dropped, window {}",
                    h.seq,
                    self.receiver.window()
                ),
            }
            // Always acknowledge: either the new rcv_nxt, or a repeat of the
            // old one that feeds the peer's duplicate-ACK counter.
            self.send_ack();
        }
    }

    /// Does this packet carry the peer's FIN, in order and without data?
    fn in_order_fin(&self, pkt: &Packet) -> bool {
        pkt.header.flags & flags::FIN != 0
            && pkt.payload.is_empty()
            && pkt.header.seq == self.receiver.rcv_nxt
    }

    fn enter_time_wait(&mut self, from: &str) {
        self.time_wait_until = Some(Instant::now() + TIME_WAIT_TIMEOUT);
        self.state = ConnectionState::TimeWait;
        log::info!("[conn] {from} → TimeWait");
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    /// Emit a pure acknowledgement carrying the current `rcv_nxt` and window.
    fn send_ack(&mut self) {
        let seq = self.sender.snd_nxt;
        let _ = self.transmit(flags::ACK, seq, &[]);
    }

    /// Build and send one segment.  Every outgoing segment, data or control,
    /// carries the current cumulative ACK and advertised window.
    fn transmit(&mut self, flag_bits: u8, seq: u32, payload: &[u8]) -> Result<(), ConnError> {
        let Some(peer) = self.peer else {
            return Err(ConnError::BadState(self.state));
        };
        let pkt = Packet::new(
            seq,
            self.receiver.rcv_nxt,
            flag_bits,
            self.receiver.window(),
            payload.to_vec(),
        );
        if let Err(e) = self.port.send_to(&pkt.encode(), peer) {
            // Transient by policy: data segments will retransmit on RTO.
            log::warn!("[conn] send error: {e}");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests (API guards; protocol behaviour is covered in tests/)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> Connection {
        Connection::listen("127.0.0.1:0".parse().unwrap()).expect("bind")
    }

    #[test]
    fn send_outside_established_is_rejected() {
        let mut conn = listener();
        assert!(matches!(
            conn.send(b"too early"),
            Err(ConnError::BadState(ConnectionState::Listen))
        ));
    }

    #[test]
    fn close_outside_open_states_is_rejected() {
        let mut conn = listener();
        assert!(matches!(
            conn.close(),
            Err(ConnError::BadState(ConnectionState::Listen))
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_not_fragmented() {
        let mut conn = listener();
        conn.state = ConnectionState::Established;
        conn.peer = Some("127.0.0.1:9".parse().unwrap());
        let big = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            conn.send(&big),
            Err(ConnError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn connect_is_non_blocking() {
        // Nobody is listening on the target; connect must still return
        // immediately with the SYN sent.
        let target = listener().local_addr().unwrap();
        let conn = Connection::connect(target).expect("connect");
        assert_eq!(conn.state, ConnectionState::SynSent);
        assert_eq!(conn.peer(), Some(target));
    }

    #[test]
    fn reset_returns_to_listen_with_clean_state() {
        let mut conn = listener();
        conn.peer = Some("127.0.0.1:9".parse().unwrap());
        conn.state = ConnectionState::CloseWait;
        conn.reset();

        assert_eq!(conn.state, ConnectionState::Listen);
        assert_eq!(conn.peer(), None);
        assert!(conn.is_send_complete());
        assert_eq!(conn.receiver.buffered(), 0);
    }
}
