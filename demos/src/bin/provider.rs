// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Serve a few demo methods and register them with the registry.
//!
//! ```text
//! cargo run --bin provider -- --listen 127.0.0.1:9000 --registry 127.0.0.1:8080
//! ```

use clap::Parser;
use gossamer::rpc::RpcServer;
use gossamer::{Runtime, Settings};
use std::net::SocketAddr;

#[derive(Debug, Parser)]
#[command(about = "gossamer demo provider")]
struct Args {
    /// Address to serve on; this port is what gets registered.
    #[arg(long, default_value = "127.0.0.1:9000")]
    listen: SocketAddr,

    /// Registry to announce to. Omit to serve standalone.
    #[arg(long)]
    registry: Option<SocketAddr>,
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let args = Args::parse();

    let rt = Runtime::new(Settings::from_env())?;
    let server = RpcServer::bind(&rt, args.listen)?;

    server.register("add", |(a, b): (i32, i32)| a + b);
    server.register("echo", |(s,): (String,)| s);
    server.register("reverse", |(mut v,): (Vec<String>,)| {
        v.reverse();
        v
    });

    rt.block_on(async {
        if let Some(registry) = args.registry {
            server.bind_registry(registry).await?;
        }
        server.start().await;
        tracing::info!(listen = %args.listen, "provider serving add/echo/reverse");
        Ok::<_, miette::Report>(())
    })?;

    rt.block_on(park_forever());
    Ok(())
}

async fn park_forever() {
    loop {
        gossamer::sleep_ms(60_000).await;
    }
}
