//! Application-layer file transfer over the reliable byte stream.
//!
//! The byte stream has no message boundaries, so this layer frames each
//! application message as `[opcode: u8][length: u32 BE][payload]` and
//! reassembles frames that the stream split or coalesced.
//!
//! # Protocol
//!
//! ```text
//!  upload:    client ── UPLOAD_REQ "name|size" ─▶ server
//!             client ── DATA × n ──────────────▶ server  (writes received_<name>)
//!             client ── END ───────────────────▶ server
//!             client ◀─ END "<bytes written>" ── server
//!
//!  download:  client ── DOWNLOAD_REQ "name" ───▶ server
//!             client ◀─ FILE_INFO "<size>" ───── server   (or ERROR "...")
//!             client ◀─ DATA × n ─────────────── server
//!             client ◀─ END ──────────────────── server
//! ```
//!
//! All driving is cooperative: the helpers loop over the connection's
//! `send`/`update` and yield between ticks; the engine itself never blocks.
//! The server loop lives in [`serve`] and recycles its connection back to
//! listening after each peer disconnects.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::connection::{ConnError, Connection};
use crate::packet::MAX_PACKET_SIZE;
use crate::socket::DatagramPort;
use crate::state::ConnectionState;

/// Size of the frame header: opcode byte plus big-endian payload length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Bytes of file content carried per DATA frame.
const CHUNK_SIZE: usize = 1024;

/// How long the uploader waits for the server's END confirmation.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// Wall-clock cap on a single transfer.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(180);

/// Application message operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Plain text message.
    Msg = 0,
    /// Upload request; payload is `"filename|filesize"`.
    UploadReq = 1,
    /// One chunk of file content.
    Data = 2,
    /// End of transfer.  From the server it confirms an upload and carries
    /// the byte count written.
    End = 3,
    /// Application-level acknowledgement.
    Ack = 4,
    /// Download request; payload is the file name.
    DownloadReq = 5,
    /// Failure report; payload is a human-readable reason.
    Error = 6,
    /// File size announcement ahead of download data.
    FileInfo = 7,
}

impl OpCode {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Msg,
            1 => Self::UploadReq,
            2 => Self::Data,
            3 => Self::End,
            4 => Self::Ack,
            5 => Self::DownloadReq,
            6 => Self::Error,
            7 => Self::FileInfo,
            _ => return None,
        })
    }
}

/// One complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op: OpCode,
    pub payload: Vec<u8>,
}

/// Encode one message ready for `Connection::send`.
pub fn encode_message(op: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(op as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reassembles application frames from the byte stream.
///
/// The stream may deliver half a frame or several frames at once; bytes are
/// accumulated here and complete messages peeled off the front.  A frame
/// with an unknown opcode is logged and skipped rather than killing the
/// session.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    /// Append freshly received stream bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Remove and return every complete message currently buffered.
    pub fn drain_messages(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        let mut consumed = 0;

        while self.buf.len() - consumed >= FRAME_HEADER_LEN {
            let head = &self.buf[consumed..];
            let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
            let total = FRAME_HEADER_LEN + len;
            if head.len() < total {
                break; // half a frame; wait for more bytes
            }

            match OpCode::from_u8(head[0]) {
                Some(op) => out.push(Message {
                    op,
                    payload: head[FRAME_HEADER_LEN..total].to_vec(),
                }),
                None => log::warn!("[ftp] skipping frame with unknown opcode {}", head[0]),
            }
            consumed += total;
        }

        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Cooperative driving helpers
// ---------------------------------------------------------------------------

/// Drive the connection until the handshake completes or `timeout` elapses.
pub async fn wait_established<P: DatagramPort>(
    conn: &mut Connection<P>,
    timeout: Duration,
) -> bool {
    let start = Instant::now();
    while conn.state != ConnectionState::Established {
        if start.elapsed() >= timeout {
            return false;
        }
        conn.update();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    true
}

/// Send one framed message, retrying while the transport window is full.
pub async fn send_message<P: DatagramPort>(
    conn: &mut Connection<P>,
    op: OpCode,
    payload: &[u8],
) -> Result<(), ConnError> {
    let frame = encode_message(op, payload);
    loop {
        match conn.send(&frame) {
            Ok(()) => return Ok(()),
            Err(ConnError::WindowFull) => {
                conn.update();
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One pump step: tick the engine, pull stream bytes, frame them.
///
/// Returns the complete messages that became available (possibly none).
/// `Err(Eof)` reports that the peer closed and the stream is drained.
pub fn poll_messages<P: DatagramPort>(
    conn: &mut Connection<P>,
    inbox: &mut MessageBuffer,
) -> Result<Vec<Message>, ConnError> {
    conn.update();
    let mut buf = [0u8; MAX_PACKET_SIZE * 2];
    match conn.receive(&mut buf) {
        Ok(0) => Ok(Vec::new()),
        Ok(n) => {
            inbox.push(&buf[..n]);
            Ok(inbox.drain_messages())
        }
        Err(e) => Err(e),
    }
}

/// Gracefully close the connection and drive the teardown until the state
/// machine reaches `Closed` or `timeout` elapses.
pub async fn close_and_drain<P: DatagramPort>(conn: &mut Connection<P>, timeout: Duration) {
    // Let queued data flush before the FIN claims its sequence number.
    let start = Instant::now();
    while !conn.is_send_complete() && start.elapsed() < timeout {
        conn.update();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    if conn.close().is_err() {
        return;
    }
    while conn.state != ConnectionState::Closed && start.elapsed() < timeout {
        conn.update();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// ---------------------------------------------------------------------------
// Client operations
// ---------------------------------------------------------------------------

/// Upload `path` to the peer.  Returns the number of content bytes sent
/// after the server confirms how many it wrote.
pub async fn upload<P: DatagramPort>(
    conn: &mut Connection<P>,
    path: &Path,
) -> anyhow::Result<u64> {
    let name = file_name(path)?;
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let size = file.metadata().await?.len();

    log::info!("[ftp] uploading {} ({size} bytes)", path.display());
    send_message(conn, OpCode::UploadReq, format!("{name}|{size}").as_bytes()).await?;

    let start = Instant::now();
    let mut sent: u64 = 0;
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        if start.elapsed() >= TRANSFER_TIMEOUT {
            bail!("upload timed out after {TRANSFER_TIMEOUT:?}");
        }
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        send_message(conn, OpCode::Data, &chunk[..n]).await?;
        conn.update();
        sent += n as u64;
        if sent % (64 * 1024) == 0 {
            print_progress(sent, size);
        }
    }
    print_progress(sent, size);
    println!();
    send_message(conn, OpCode::End, b"").await?;

    // Everything must be on the wire and acknowledged before we trust the
    // server's count.
    while !conn.is_send_complete() {
        conn.update();
        tokio::task::yield_now().await;
    }

    let confirmed = wait_for_confirmation(conn).await?;
    let elapsed = start.elapsed().as_secs_f64();
    log::info!(
        "[ftp] upload finished: {:.1} KiB in {elapsed:.2}s ({:.0} KiB/s)",
        sent as f64 / 1024.0,
        sent as f64 / 1024.0 / elapsed.max(1e-6),
    );
    if confirmed != sent {
        bail!("server wrote {confirmed} bytes, expected {sent}");
    }
    Ok(sent)
}

/// Wait for the server's END confirmation and parse the byte count.
async fn wait_for_confirmation<P: DatagramPort>(conn: &mut Connection<P>) -> anyhow::Result<u64> {
    let mut inbox = MessageBuffer::default();
    let start = Instant::now();
    loop {
        if start.elapsed() >= CONFIRM_TIMEOUT {
            bail!("no confirmation from server within {CONFIRM_TIMEOUT:?}");
        }
        let msgs = match poll_messages(conn, &mut inbox) {
            Ok(msgs) => msgs,
            Err(ConnError::Eof) => bail!("peer closed before confirming the upload"),
            Err(e) => return Err(e.into()),
        };
        for m in msgs {
            match m.op {
                OpCode::End => {
                    let count = String::from_utf8_lossy(&m.payload).parse().unwrap_or(0);
                    return Ok(count);
                }
                OpCode::Error => {
                    bail!("server error: {}", String::from_utf8_lossy(&m.payload))
                }
                _ => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Download `name` from the peer into `dest_dir`.  Returns the path written.
pub async fn download<P: DatagramPort>(
    conn: &mut Connection<P>,
    name: &str,
    dest_dir: &Path,
) -> anyhow::Result<PathBuf> {
    log::info!("[ftp] requesting download of {name}");
    send_message(conn, OpCode::DownloadReq, name.as_bytes()).await?;

    let dest = dest_dir.join(format!("downloaded_{}", base_name(name)));
    let mut inbox = MessageBuffer::default();
    let mut file: Option<tokio::fs::File> = None;
    let mut expected: u64 = 0;
    let mut received: u64 = 0;
    let start = Instant::now();

    loop {
        if start.elapsed() >= TRANSFER_TIMEOUT {
            bail!("download timed out after {TRANSFER_TIMEOUT:?}");
        }
        let msgs = match poll_messages(conn, &mut inbox) {
            Ok(msgs) => msgs,
            Err(ConnError::Eof) => bail!("peer closed mid-download"),
            Err(e) => return Err(e.into()),
        };
        for m in msgs {
            match m.op {
                OpCode::FileInfo => {
                    expected = String::from_utf8_lossy(&m.payload).parse().unwrap_or(0);
                    log::info!("[ftp] file size: {expected} bytes");
                    file = Some(tokio::fs::File::create(&dest).await?);
                }
                OpCode::Data => {
                    // Tolerate a legacy peer that skips FILE_INFO.
                    if file.is_none() {
                        file = Some(tokio::fs::File::create(&dest).await?);
                    }
                    file.as_mut().unwrap().write_all(&m.payload).await?;
                    received += m.payload.len() as u64;
                    if received % (64 * 1024) == 0 {
                        print_progress(received, expected);
                    }
                }
                OpCode::End => {
                    if let Some(mut f) = file.take() {
                        f.flush().await?;
                    }
                    print_progress(received, expected.max(received));
                    println!();
                    log::info!("[ftp] download complete: {}", dest.display());
                    return Ok(dest);
                }
                OpCode::Error => {
                    bail!("server error: {}", String::from_utf8_lossy(&m.payload))
                }
                _ => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// State of an upload the server is currently writing to disk.
struct IncomingFile {
    file: tokio::fs::File,
    name: PathBuf,
    expected: u64,
    received: u64,
}

/// Run the server side forever: accept one peer at a time, service uploads
/// and downloads under `dir`, and recycle the connection back to listening
/// when the peer disconnects.
pub async fn serve<P: DatagramPort>(conn: &mut Connection<P>, dir: &Path) -> anyhow::Result<()> {
    let mut inbox = MessageBuffer::default();
    let mut incoming: Option<IncomingFile> = None;

    loop {
        if conn.state == ConnectionState::Listen {
            conn.update();
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        }

        match poll_messages(conn, &mut inbox) {
            Ok(msgs) => {
                for m in msgs {
                    handle_message(conn, dir, &mut incoming, m).await?;
                }
            }
            Err(ConnError::Eof) => {
                log::info!("[ftp] peer disconnected, recycling connection");
                if let Some(mut partial) = incoming.take() {
                    partial.file.flush().await?;
                    log::warn!(
                        "[ftp] upload of {} interrupted at {} bytes",
                        partial.name.display(),
                        partial.received
                    );
                }
                close_and_drain(conn, Duration::from_secs(2)).await;
                conn.reset();
                inbox = MessageBuffer::default();
            }
            Err(e) => return Err(e.into()),
        }

        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

async fn handle_message<P: DatagramPort>(
    conn: &mut Connection<P>,
    dir: &Path,
    incoming: &mut Option<IncomingFile>,
    m: Message,
) -> anyhow::Result<()> {
    match m.op {
        OpCode::UploadReq => {
            let req = String::from_utf8_lossy(&m.payload).into_owned();
            let (name, size) = match req.split_once('|') {
                Some((n, s)) => (base_name(n), s.parse().unwrap_or(0)),
                None => (base_name(&req), 0),
            };
            let path = dir.join(format!("received_{name}"));
            log::info!("[ftp] receiving {} ({size} bytes)", path.display());
            *incoming = Some(IncomingFile {
                file: tokio::fs::File::create(&path).await?,
                name: path,
                expected: size,
                received: 0,
            });
        }
        OpCode::Data => {
            if let Some(upload) = incoming.as_mut() {
                upload.file.write_all(&m.payload).await?;
                upload.received += m.payload.len() as u64;
                if upload.expected > 0 && upload.received % (64 * 1024) == 0 {
                    log::debug!("[ftp] {} / {} bytes", upload.received, upload.expected);
                }
            }
        }
        OpCode::End => {
            if let Some(mut done) = incoming.take() {
                done.file.flush().await?;
                log::info!(
                    "[ftp] received {} ({} bytes)",
                    done.name.display(),
                    done.received
                );
                send_message(conn, OpCode::End, done.received.to_string().as_bytes()).await?;
            }
        }
        OpCode::DownloadReq => {
            let name = base_name(&String::from_utf8_lossy(&m.payload));
            serve_download(conn, &dir.join(name)).await?;
        }
        OpCode::Msg => {
            log::info!("[ftp] peer says: {}", String::from_utf8_lossy(&m.payload));
        }
        OpCode::Ack | OpCode::FileInfo | OpCode::Error => {}
    }
    Ok(())
}

/// Stream one file to the peer: FILE_INFO, DATA chunks, END.
async fn serve_download<P: DatagramPort>(
    conn: &mut Connection<P>,
    path: &Path,
) -> anyhow::Result<()> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(_) => {
            log::warn!("[ftp] download request for missing file {}", path.display());
            send_message(conn, OpCode::Error, b"file not found").await?;
            return Ok(());
        }
    };
    let size = file.metadata().await?.len();
    log::info!("[ftp] serving {} ({size} bytes)", path.display());
    send_message(conn, OpCode::FileInfo, size.to_string().as_bytes()).await?;

    let start = Instant::now();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        if start.elapsed() >= TRANSFER_TIMEOUT {
            bail!("download service timed out");
        }
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        send_message(conn, OpCode::Data, &chunk[..n]).await?;
        conn.update();
    }
    send_message(conn, OpCode::End, b"").await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .with_context(|| format!("{} has no file name", path.display()))
}

/// Strip any directory components a peer might smuggle into a name.
fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_owned()
}

/// Carriage-return progress bar, fifty columns wide.
fn print_progress(current: u64, total: u64) {
    if total == 0 {
        return;
    }
    let ratio = (current as f64 / total as f64).min(1.0);
    let filled = (50.0 * ratio) as usize;
    let bar: String = (0..50)
        .map(|i| match i.cmp(&filled) {
            std::cmp::Ordering::Less => '=',
            std::cmp::Ordering::Equal => '>',
            std::cmp::Ordering::Greater => ' ',
        })
        .collect();
    print!(
        "\r[{bar}] {:3.0} % ({} KiB / {} KiB)",
        ratio * 100.0,
        current / 1024,
        total / 1024
    );
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
