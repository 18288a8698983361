mod output;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use reflector::{ReflectorConfig, ReflectorRegistry, Scheduler, SourceDescriptor};
use tracing_subscriber::EnvFilter;

use crate::output::UdpOutput;

#[derive(Parser)]
#[command(
    name = "reflector",
    about = "Reflect one RTP/RTCP broadcast to a list of UDP receivers"
)]
struct Args {
    /// Address the broadcaster sends RTP to (RTCP on the next port)
    source: SocketAddr,

    /// Receiver RTP address; repeat for more receivers
    #[arg(long = "to", short = 't', required = true)]
    outputs: Vec<SocketAddr>,

    /// Only reflect the first SSRC seen, re-learning after a timeout
    #[arg(long)]
    ssrc_filter: bool,

    /// Seconds of silence before the SSRC filter re-learns
    #[arg(long, default_value_t = 30)]
    ssrc_timeout: u64,

    /// Keep a buffer window and replay it to receivers
    #[arg(long)]
    buffer: bool,

    /// RTP clock rate of the source
    #[arg(long, default_value_t = 90_000)]
    timescale: u32,

    /// Delay between bucket cohorts in milliseconds
    #[arg(long, default_value_t = 73)]
    bucket_delay: u64,

    /// Scheduler worker threads
    #[arg(long, default_value_t = 2)]
    workers: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("reflector failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> reflector::Result<()> {
    let config = ReflectorConfig::default()
        .bucket_delay(Duration::from_millis(args.bucket_delay))
        .ssrc_timeout(Duration::from_secs(args.ssrc_timeout))
        .worker_threads(args.workers);

    let scheduler = Scheduler::new(config.worker_threads);
    scheduler.start()?;
    let registry = ReflectorRegistry::with_scheduler(config, scheduler.clone());

    let descriptor = SourceDescriptor::new(args.source)
        .ssrc_filter(args.ssrc_filter)
        .buffering(args.buffer)
        .timescale(args.timescale);
    let stream = registry.bind(descriptor)?;

    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0")?);
    for addr in &args.outputs {
        let output = UdpOutput::new(socket.clone(), *addr);
        let bucket = stream.add_output(Arc::new(output), None)?;
        tracing::info!(addr = %addr, bucket, "receiver attached");
    }

    println!(
        "Reflecting {} to {} receiver(s), press Enter to stop",
        args.source,
        args.outputs.len()
    );
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin closed");
    }

    let stats = stream.stats();
    println!(
        "received {} packets ({} bytes), delivered {}, duplicates {}, lost {}, bit rate {} bps",
        stats.counters.packets_received,
        stats.counters.bytes_received,
        stats.counters.delivered,
        stats.counters.duplicates,
        stats.lost,
        stats.bit_rate
    );

    registry.remove(stream.id())?;
    scheduler.stop()?;
    Ok(())
}
