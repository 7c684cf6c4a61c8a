//! Teardown tests: the four-way close, TIME_WAIT expiry, simultaneous
//! close, and recycling a server connection back to listening.
//!
//! Endpoints are driven in lockstep so every intermediate FSM state can be
//! observed deterministically.

use std::thread;
use std::time::{Duration, Instant};

use rudp::connection::TIME_WAIT_TIMEOUT;
use rudp::{ConnError, Connection, ConnectionState};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn step(a: &mut Connection, b: &mut Connection) {
    a.update();
    b.update();
    thread::sleep(Duration::from_micros(500));
}

fn drive_until(a: &mut Connection, b: &mut Connection, mut pred: impl FnMut(&Connection, &Connection) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred(a, b) {
        assert!(Instant::now() < deadline, "condition never reached");
        step(a, b);
    }
}

fn establish() -> (Connection, Connection) {
    let mut server = Connection::listen("127.0.0.1:0".parse().unwrap()).expect("bind");
    let server_addr = server.local_addr().expect("addr");
    let mut client = Connection::connect(server_addr).expect("connect");

    drive_until(&mut client, &mut server, |c, s| {
        c.state == ConnectionState::Established && s.state == ConnectionState::Established
    });
    (client, server)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// S6: the full graceful-close walk.  The active closer passes through
/// FIN_WAIT_1 → FIN_WAIT_2 → TIME_WAIT → CLOSED; the passive side through
/// CLOSE_WAIT → LAST_ACK → CLOSED, with EOF surfacing to its reader.
#[test]
fn graceful_close_walks_the_full_state_machine() {
    let (mut client, mut server) = establish();

    // Some data first, so teardown happens on a used connection.
    client.send(b"goodbye").expect("send");
    drive_until(&mut client, &mut server, |c, _| c.is_send_complete());
    let mut buf = [0u8; 16];
    assert_eq!(server.receive(&mut buf).expect("receive"), 7);

    client.close().expect("close");
    assert_eq!(client.state, ConnectionState::FinWait1);

    // The FIN reaches the server: passive side enters CloseWait, active side
    // collects the ACK and waits for the server's FIN in FinWait2.
    drive_until(&mut client, &mut server, |c, s| {
        c.state == ConnectionState::FinWait2 && s.state == ConnectionState::CloseWait
    });

    // The reader learns about the close only after draining everything.
    assert!(matches!(server.receive(&mut buf), Err(ConnError::Eof)));

    server.close().expect("server close");
    assert_eq!(server.state, ConnectionState::LastAck);

    drive_until(&mut client, &mut server, |c, s| {
        c.state == ConnectionState::TimeWait && s.state == ConnectionState::Closed
    });

    // TIME_WAIT expires via the tick clock, not a sleep inside the engine.
    client.update();
    assert_eq!(client.state, ConnectionState::TimeWait);
    thread::sleep(TIME_WAIT_TIMEOUT + Duration::from_millis(50));
    client.update();
    assert_eq!(client.state, ConnectionState::Closed);
}

/// Both sides closing at once cross their FINs: each goes FIN_WAIT_1 →
/// CLOSING → TIME_WAIT → CLOSED.
#[test]
fn simultaneous_close_converges_through_closing() {
    let (mut client, mut server) = establish();

    client.close().expect("client close");
    server.close().expect("server close");
    assert_eq!(client.state, ConnectionState::FinWait1);
    assert_eq!(server.state, ConnectionState::FinWait1);

    drive_until(&mut client, &mut server, |c, s| {
        c.state == ConnectionState::TimeWait && s.state == ConnectionState::TimeWait
    });

    thread::sleep(TIME_WAIT_TIMEOUT + Duration::from_millis(50));
    step(&mut client, &mut server);
    assert_eq!(client.state, ConnectionState::Closed);
    assert_eq!(server.state, ConnectionState::Closed);
}

/// A connection still delivers data the peer sent before closing: bytes
/// arrive, then EOF, in that order.
#[test]
fn data_then_fin_delivers_bytes_before_eof() {
    let (mut client, mut server) = establish();

    client.send(b"last words").expect("send");
    client.close().expect("close");
    drive_until(&mut client, &mut server, |_, s| {
        s.state == ConnectionState::CloseWait
    });

    let mut buf = [0u8; 32];
    let n = server.receive(&mut buf).expect("data before EOF");
    assert_eq!(&buf[..n], b"last words");
    assert!(matches!(server.receive(&mut buf), Err(ConnError::Eof)));
}

/// After a full close, `reset` returns the server to LISTEN and a brand-new
/// client can complete a handshake and transfer on the same endpoint.
#[test]
fn reset_allows_server_reuse() {
    let (mut client, mut server) = establish();
    let server_addr = server.local_addr().expect("addr");

    client.close().expect("close");
    drive_until(&mut client, &mut server, |_, s| {
        s.state == ConnectionState::CloseWait
    });
    server.close().expect("server close");
    drive_until(&mut client, &mut server, |_, s| {
        s.state == ConnectionState::Closed
    });

    server.reset();
    assert_eq!(server.state, ConnectionState::Listen);
    assert_eq!(server.peer(), None);

    // A second client connects to the recycled endpoint.
    let mut second = Connection::connect(server_addr).expect("reconnect");
    drive_until(&mut second, &mut server, |c, s| {
        c.state == ConnectionState::Established && s.state == ConnectionState::Established
    });

    second.send(b"round two").expect("send");
    drive_until(&mut second, &mut server, |c, _| c.is_send_complete());
    let mut buf = [0u8; 16];
    assert_eq!(server.receive(&mut buf).expect("receive"), 9);
    assert_eq!(&buf[..9], b"round two");
}
