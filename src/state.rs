//! Connection finite-state machine (FSM) types.
//!
//! This module defines every possible state a [`crate::connection::Connection`]
//! can occupy, mirroring the TCP state diagram (RFC 793 §3.2) adapted for our
//! protocol.  State transitions are *not* implemented here — they live in
//! [`crate::connection`] — but every legal transition is documented on its
//! source state below.
//!
//! Keeping state types in their own module makes it easy to add guard logic,
//! entry/exit actions, or tracing without touching connection plumbing.

/// All possible states of the connection FSM.
///
/// ```text
//  CLOSED ──SYN sent──▶ SYN_SENT ──SYN+ACK──▶ ESTABLISHED ◀──ACK── SYN_RCVD
//    │                                             │                  ▲
//    └──bind──▶ LISTEN ────────SYN rcvd────────────│──────────────────┘
//                                                  │
//                          FIN sent │              │ FIN rcvd
//                                   ▼              ▼
//      TIME_WAIT ◀──FIN rcvd── FIN_WAIT_2     CLOSE_WAIT ──close──▶ LAST_ACK
//          ▲                        ▲              │                   │
//          │                   ACK  │              ▼                  ACK
//          └──ACK── CLOSING ◀──FIN── FIN_WAIT_1    └────────▶ CLOSED ◀─┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection exists; initial and terminal state.
    Closed,
    /// Passively waiting for a peer's SYN (server side).
    ///
    /// Moves to `SynRcvd` on SYN; ignores everything else.
    Listen,
    /// SYN has been sent; waiting for SYN+ACK (client side).
    ///
    /// Moves to `Established` on SYN+ACK.  A bare SYN is ignored (no
    /// simultaneous-open in this protocol).
    SynSent,
    /// SYN received; SYN+ACK sent; waiting for the final handshake ACK.
    ///
    /// Moves to `Established` on ACK.
    SynRcvd,
    /// Three-way handshake complete; data transfer in progress.
    ///
    /// Moves to `FinWait1` on local close, `CloseWait` on peer FIN.
    Established,
    /// Local side sent FIN; waiting for the peer to acknowledge it.
    ///
    /// Moves to `FinWait2` on ACK of the FIN, `Closing` on a FIN that does
    /// not acknowledge ours, or `TimeWait` when both arrive together.
    FinWait1,
    /// Our FIN is acknowledged; waiting for the peer's FIN.
    ///
    /// Moves to `TimeWait` on FIN.
    FinWait2,
    /// Peer's FIN received while our data path was open; local close pending.
    ///
    /// Moves to `LastAck` once the application calls close.
    CloseWait,
    /// Both sides sent FIN at the same time.
    ///
    /// Moves to `TimeWait` on ACK of our FIN.
    Closing,
    /// Waiting for the final ACK of our FIN after a passive close.
    ///
    /// Moves to `Closed` on ACK.
    LastAck,
    /// Lingering so a retransmitted peer FIN can still be acknowledged.
    ///
    /// Moves to `Closed` once the linger timer expires; the timer is checked
    /// from the update tick, never by sleeping.
    TimeWait,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
