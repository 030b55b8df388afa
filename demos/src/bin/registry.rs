// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Run a standalone service registry.
//!
//! ```text
//! cargo run --bin registry -- --listen 127.0.0.1:8080
//! ```

use clap::Parser;
use gossamer::rpc::RpcServiceRegistry;
use gossamer::{Runtime, Settings};
use std::net::SocketAddr;

#[derive(Debug, Parser)]
#[command(about = "gossamer service registry")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let args = Args::parse();

    let rt = Runtime::new(Settings::from_env())?;
    let registry = RpcServiceRegistry::bind(&rt, args.listen)?;
    tracing::info!(listen = %args.listen, "registry up");
    registry.start();

    // Serve until killed.
    rt.block_on(park_forever());
    Ok(())
}

async fn park_forever() {
    loop {
        gossamer::sleep_ms(60_000).await;
    }
}
