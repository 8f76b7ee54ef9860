//! Tether RPC demo - exposes a calculator and a counter class over TCP.
//!
//! `tether-rpc serve` hosts the demo objects; `tether-rpc call` connects to a
//! running host and invokes `calculator.add`.

mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::{RpcService, TcpChannel, TcpChannelServer, Value};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-rpc")]
#[command(about = "Demo host and client for tether over TCP")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the demo calculator and Counter class
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,
    },
    /// Call calculator.add on a running host
    Call {
        /// Address of the host, e.g. 127.0.0.1:4000
        #[arg(long)]
        addr: SocketAddr,

        #[arg(short)]
        a: f64,

        #[arg(short)]
        b: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve { host, port } => serve(&host, port).await,
        Command::Call { addr, a, b } => call(addr, a, b).await,
    }
}

async fn serve(host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", host, port))?;
    let server = Arc::new(TcpChannelServer::bind(addr).await?);
    let service = RpcService::new(server.clone())?;
    demo::register(&service);

    // Print the address for scripts to read (intentional stdout)
    println!("TETHER_ADDR={}", server.local_addr());
    info!("Tether host running on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    server.shutdown();
    Ok(())
}

async fn call(addr: SocketAddr, a: f64, b: f64) -> Result<()> {
    let channel = TcpChannel::connect(addr).await?;
    let service = RpcService::new(Arc::new(channel))?;
    service.request_remote_descriptors()?.await?;

    let calculator = service.get_proxy_object("calculator")?;
    let sum = calculator
        .call_method("add", vec![Value::from(a), Value::from(b)])?
        .settle()
        .await?;

    println!("{}", serde_json::to_string(&sum.to_json()?)?);
    Ok(())
}
