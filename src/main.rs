//! Entry point for `rudp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  All protocol work is delegated to library modules; `main.rs` owns
//! only process setup (logging, argument parsing) and the top-level drive
//! loops.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Parser, Subcommand};

use rudp::{ftp, Connection};

/// TCP-like reliable byte stream and file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run as a server, receiving uploads and serving downloads.
    Server {
        /// UDP port to listen on.
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
    },
    /// Run as a client against a remote server.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,

        #[command(subcommand)]
        action: Action,
    },
}

#[derive(Subcommand)]
enum Action {
    /// Upload a local file to the server.
    Upload { path: PathBuf },
    /// Download a file from the server's directory.
    Download { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    match cli.mode {
        Mode::Server { port } => {
            let mut conn = Connection::listen(SocketAddr::from(([0, 0, 0, 0], port)))?;
            log::info!("listening on UDP port {port}");
            ftp::serve(&mut conn, &std::env::current_dir()?).await
        }
        Mode::Client { server, action } => {
            let mut conn = Connection::connect(server)?;
            if !ftp::wait_established(&mut conn, Duration::from_secs(5)).await {
                bail!("handshake with {server} did not complete");
            }
            log::info!("connected to {server}");

            match action {
                Action::Upload { path } => {
                    ftp::upload(&mut conn, &path).await?;
                }
                Action::Download { name } => {
                    let dest = ftp::download(&mut conn, &name, &std::env::current_dir()?).await?;
                    println!("saved to {}", dest.display());
                }
            }

            ftp::close_and_drain(&mut conn, Duration::from_secs(5)).await;
            Ok(())
        }
    }
}
