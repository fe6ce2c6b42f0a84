//! Gatewire server binary.
//!
//! # Usage
//!
//! ```bash
//! # TCP only on the default port
//! gatewire-server --bind 0.0.0.0:7400
//!
//! # TCP and UDP, verbose logging
//! gatewire-server --bind 0.0.0.0:7400 --udp-bind 0.0.0.0:7401 --log-level debug
//! ```

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use gatewire_core::{
    HandlerAttributes, HandlerError, PacketContext, PacketHandler, Pipeline, PipelineConfig,
    RatePolicy,
};
use gatewire_proto::{BufferPool, Packet, PayloadBuf};
use gatewire_server::{IpLimiterConfig, Server, ServerConfig, TcpListenerConfig, UdpListenerConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Gatewire packet server
#[derive(Parser, Debug)]
#[command(name = "gatewire-server")]
#[command(about = "Packet-pipeline server over TCP/UDP")]
#[command(version)]
struct Args {
    /// TCP address to bind to
    #[arg(short, long, default_value = "0.0.0.0:7400")]
    bind: SocketAddr,

    /// UDP address to bind to (omit to disable the datagram path)
    #[arg(long)]
    udp_bind: Option<SocketAddr>,

    /// Maximum concurrent connections per source IP
    #[arg(long, default_value = "32")]
    max_connections_per_ip: u32,

    /// Permission level granted to fresh connections
    #[arg(long, default_value = "1")]
    permission_level: u8,

    /// Minimum runtime worker threads
    #[arg(long, default_value = "4")]
    min_worker_threads: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Demo echo handler: replies with the payload uppercased.
struct EchoHandler;

#[async_trait::async_trait]
impl PacketHandler for EchoHandler {
    async fn handle(&self, ctx: PacketContext) -> Result<Vec<Packet>, HandlerError> {
        let upper: Vec<u8> = ctx.packet.payload().iter().map(u8::to_ascii_uppercase).collect();
        let payload = PayloadBuf::copy_from(&upper, &ctx.pool)
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        Ok(vec![Packet::new(ctx.packet.op_code(), ctx.packet.transport(), payload)])
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let workers = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .max(args.min_worker_threads);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?
        .block_on(run(args))
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("gatewire server starting");

    let pool = BufferPool::with_defaults();
    let mut pipeline = Pipeline::new(PipelineConfig::default(), pool);

    // Demo echo handler: modest rate policy, short deadline
    pipeline.register(
        HandlerAttributes::for_op(0x0001)
            .rate_limited(RatePolicy::new(64, 32))
            .with_timeout(Duration::from_secs(5)),
        Arc::new(EchoHandler),
    );

    let config = ServerConfig {
        tcp: TcpListenerConfig {
            bind: args.bind,
            min_worker_threads: args.min_worker_threads,
            default_permission_level: args.permission_level,
            ..TcpListenerConfig::default()
        },
        udp: args.udp_bind.map(|bind| UdpListenerConfig { bind, ..UdpListenerConfig::default() }),
        ip_limits: IpLimiterConfig {
            max_connections_per_ip: args.max_connections_per_ip,
            ..IpLimiterConfig::default()
        },
    };

    let server = Server::bind(config, pipeline).await?;
    tracing::info!(tcp = %server.tcp().local_addr()?, "listening");
    if let Some(udp) = server.udp() {
        tracing::info!(udp = %udp.local_addr()?, "listening");
    }

    let cancel = server.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received");
            cancel.cancel();
        }
    });

    server.run().await?;
    Ok(())
}
