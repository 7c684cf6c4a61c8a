//! End-to-end file transfer over real loopback sockets.
//!
//! The server runs [`rudp::ftp::serve`] in a background task; the client
//! drives uploads and downloads against it, then the files on disk are
//! compared byte for byte.

use std::path::PathBuf;
use std::time::Duration;

use rudp::{ftp, Connection};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fresh scratch directory for one test.
fn scratch(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rudp-test-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Spawn a serving endpoint; returns its address and the task handle.
fn spawn_server(dir: PathBuf) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let mut server = Connection::listen("127.0.0.1:0".parse().unwrap()).expect("bind server");
    let addr = server.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        let _ = ftp::serve(&mut server, &dir).await;
    });
    (addr, handle)
}

async fn connect(addr: std::net::SocketAddr) -> Connection {
    let mut client = Connection::connect(addr).expect("connect");
    assert!(
        ftp::wait_established(&mut client, Duration::from_secs(5)).await,
        "handshake did not complete"
    );
    client
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn upload_round_trip() {
    let dir = scratch("upload");
    let content = patterned(48 * 1024);
    let src = dir.join("payload.bin");
    std::fs::write(&src, &content).expect("write source");

    let server_dir = dir.join("server");
    std::fs::create_dir_all(&server_dir).unwrap();
    let (addr, server_task) = spawn_server(server_dir.clone());

    let mut client = connect(addr).await;
    let sent = ftp::upload(&mut client, &src).await.expect("upload");
    assert_eq!(sent, content.len() as u64);

    // The server confirmed only after flushing, so the file is complete.
    let received = std::fs::read(server_dir.join("received_payload.bin")).expect("read received");
    assert_eq!(received, content, "uploaded file differs from the source");

    ftp::close_and_drain(&mut client, Duration::from_secs(2)).await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn download_round_trip() {
    let dir = scratch("download");
    let server_dir = dir.join("server");
    std::fs::create_dir_all(&server_dir).unwrap();

    let content = patterned(32 * 1024);
    std::fs::write(server_dir.join("asset.bin"), &content).expect("write asset");

    let (addr, server_task) = spawn_server(server_dir);

    let client_dir = dir.join("client");
    std::fs::create_dir_all(&client_dir).unwrap();

    let mut client = connect(addr).await;
    let dest = ftp::download(&mut client, "asset.bin", &client_dir)
        .await
        .expect("download");
    assert_eq!(dest, client_dir.join("downloaded_asset.bin"));

    let fetched = std::fs::read(&dest).expect("read download");
    assert_eq!(fetched, content, "downloaded file differs from the source");

    ftp::close_and_drain(&mut client, Duration::from_secs(2)).await;
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn download_of_missing_file_reports_server_error() {
    let dir = scratch("missing");
    let server_dir = dir.join("server");
    std::fs::create_dir_all(&server_dir).unwrap();
    let (addr, server_task) = spawn_server(server_dir);

    let mut client = connect(addr).await;
    let err = ftp::download(&mut client, "no-such-file.bin", &dir)
        .await
        .expect_err("download should fail");
    assert!(
        err.to_string().contains("file not found"),
        "unexpected error: {err}"
    );

    ftp::close_and_drain(&mut client, Duration::from_secs(2)).await;
    server_task.abort();
}

/// One endpoint serves two clients in a row: the ftp loop recycles the
/// connection back to listening after the first peer disconnects.
#[tokio::test(flavor = "multi_thread")]
async fn server_serves_two_clients_in_sequence() {
    let dir = scratch("reuse");
    let server_dir = dir.join("server");
    std::fs::create_dir_all(&server_dir).unwrap();
    let (addr, server_task) = spawn_server(server_dir.clone());

    for (i, size) in [(1, 8 * 1024), (2, 12 * 1024)] {
        let content = patterned(size);
        let src = dir.join(format!("file{i}.bin"));
        std::fs::write(&src, &content).unwrap();

        let mut client = connect(addr).await;
        let sent = ftp::upload(&mut client, &src).await.expect("upload");
        assert_eq!(sent, size as u64);
        ftp::close_and_drain(&mut client, Duration::from_secs(2)).await;

        let received =
            std::fs::read(server_dir.join(format!("received_file{i}.bin"))).expect("read");
        assert_eq!(received, content, "client {i} upload corrupted");
    }

    server_task.abort();
}
