// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Plain TCP echo server on the runtime's networking layer, no RPC: just
//! the accept loop, vectored socket I/O through a [`ByteArray`], and one
//! task per connection.
//!
//! ```text
//! cargo run --bin echo_server -- --listen 127.0.0.1:7000
//! ```

use clap::Parser;
use gossamer::ByteArray;
use gossamer::net::TcpServer;
use gossamer::{Runtime, Settings};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(about = "gossamer echo server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7000")]
    listen: SocketAddr,
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let args = Args::parse();

    let rt = Runtime::new(Settings::from_env())?;
    let server = Arc::new(TcpServer::bind(&rt, args.listen)?);
    server.set_name("echo");

    server.start(|stream| async move {
        let mut scratch = [0u8; 4096];
        loop {
            match stream.read(&mut scratch).await {
                Ok(0) => break,
                Ok(n) => {
                    let mut buffer = ByteArray::from_bytes(&scratch[..n]);
                    if stream.write_all_buf(&mut buffer).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "echo connection error");
                    break;
                }
            }
        }
    });

    rt.block_on(park_forever());
    Ok(())
}

async fn park_forever() {
    loop {
        gossamer::sleep_ms(60_000).await;
    }
}
