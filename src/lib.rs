//! `rudp` — a TCP-like reliable byte stream implemented over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────────────────┐  upload / download   ┌─────────────────────┐
//!  │     ftp (client)    │◀────────────────────▶│     ftp (server)    │
//!  └─────────┬───────────┘   framed messages    └──────────┬──────────┘
//!            │ send() / receive() / update()               │
//!  ┌─────────▼───────────────────────────────────────────────────────┐
//!  │                         Connection                              │
//!  │   state machine  ·  SendWindow (retransmit)  ·  Receiver (ooo)  │
//!  └─────────┬───────────────────────────────────────────────────────┘
//!            │ encoded segments (packet)
//!  ┌─────────▼──────────┐
//!  │    DatagramPort    │   UdpPort, or Simulator for fault injection
//!  └────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]     — wire format (serialise / deserialise, checksum)
//! - [`state`]      — finite-state-machine types
//! - [`sender`]     — send window, cumulative ACKs, retransmit queue
//! - [`receiver`]   — in-order delivery and out-of-order reassembly
//! - [`connection`] — per-connection lifecycle, handshake, teardown, tick
//! - [`socket`]     — non-blocking UDP port abstraction
//! - [`simulator`]  — lossy/reordering network layer for testing
//! - [`ftp`]        — file-transfer application layer on the byte stream
//!
//! The engine is single-threaded and poll-driven: nothing below [`ftp`]
//! suspends, sleeps, or spawns.  The owner calls [`Connection::update`]
//! repeatedly; async convenience loops live in the application layer only.

pub mod connection;
pub mod ftp;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;

pub use connection::{ConnError, Connection};
pub use packet::{Header, Packet};
pub use receiver::Receiver;
pub use sender::SendWindow;
pub use simulator::{Simulator, SimulatorConfig};
pub use socket::{DatagramPort, UdpPort};
pub use state::ConnectionState;
