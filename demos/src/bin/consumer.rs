// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Discover providers through the registry and call them.
//!
//! ```text
//! cargo run --bin consumer -- --registry 127.0.0.1:8080
//! ```

use clap::Parser;
use gossamer::rpc::{RpcClientPool, Strategy};
use gossamer::{Runtime, Settings};
use std::net::SocketAddr;

#[derive(Debug, Parser)]
#[command(about = "gossamer demo consumer")]
struct Args {
    /// Registry to discover through.
    #[arg(long, default_value = "127.0.0.1:8080")]
    registry: SocketAddr,

    /// Number of calls to make.
    #[arg(long, default_value_t = 5)]
    calls: u32,

    /// Also subscribe to this topic and print what arrives.
    #[arg(long)]
    subscribe: Option<String>,
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let args = Args::parse();

    let rt = Runtime::new(Settings::from_env())?;
    let pool = RpcClientPool::with_strategy(&rt, Strategy::Random);

    rt.block_on(async {
        pool.connect(args.registry).await?;

        if let Some(topic) = &args.subscribe {
            pool.subscribe(topic, |s| match s.read::<String>() {
                Ok(payload) => tracing::info!(payload = %payload, "published message"),
                Err(error) => tracing::warn!(%error, "undecodable publish payload"),
            })
            .await?;
        }

        for i in 0..args.calls {
            let sum = pool.call::<i32, _>("add", (i as i32, 1000)).await;
            tracing::info!(call = i, code = %sum.code(), value = ?sum.value(), "add");

            let echoed = pool
                .call::<String, _>("echo", (format!("ping {i}"),))
                .await;
            tracing::info!(call = i, code = %echoed.code(), value = ?echoed.value(), "echo");
        }

        if args.subscribe.is_some() {
            tracing::info!("waiting for published messages; ctrl-c to quit");
            loop {
                gossamer::sleep_ms(60_000).await;
            }
        }

        pool.close().await;
        Ok::<_, miette::Report>(())
    })?;

    rt.stop();
    Ok(())
}
