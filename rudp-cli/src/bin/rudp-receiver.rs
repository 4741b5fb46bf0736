//! RUDP Receiver - reliable-UDP stream receiver
//!
//! Receives a stream from `rudp-sender` and writes it to stdout or a file.

use anyhow::Context;
use clap::Parser;
use crossbeam::channel;
use rudp::{ConnectionEvent, Endpoint, RudpSocket};
use rudp_cli::{
    display_compact_stats, display_stats, init_logging, stream_registry, Config, ReceiverConfig,
    StreamEvent,
};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const RECV_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "rudp-receiver")]
#[command(about = "Reliable UDP stream receiver", long_about = None)]
struct Args {
    /// TOML config file ([receiver] and [transport] sections)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Output file (use '-' for stdout)
    #[arg(short, long)]
    output: Option<String>,

    /// Receive shards
    #[arg(long)]
    shards: Option<usize>,

    /// Give up after this many seconds without data
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long)]
    stats: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn open_output(output: &str) -> anyhow::Result<Box<dyn Write>> {
    if output == "-" {
        Ok(Box::new(BufWriter::new(io::stdout())))
    } else {
        let file = File::create(output).with_context(|| format!("creating {output}"))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let file_config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    let mut receiver = match (file_config.receiver.clone(), args.listen) {
        (Some(mut receiver), listen) => {
            if let Some(listen) = listen {
                receiver.listen = listen;
            }
            receiver
        }
        (None, Some(listen)) => ReceiverConfig::for_listen(listen),
        (None, None) => anyhow::bail!("A listen address is required (--listen or [receiver].listen)"),
    };
    if let Some(output) = args.output {
        receiver.output = output;
    }
    if let Some(idle) = args.idle_timeout {
        receiver.idle_timeout_secs = idle;
    }
    if let Some(stats) = args.stats {
        receiver.stats_interval_secs = stats;
    }

    let mut transport = file_config.transport_config();
    if let Some(shards) = args.shards {
        transport.shard_count = shards;
    }

    tracing::info!("RUDP Receiver starting...");
    tracing::info!("Output target: {}", receiver.output);

    let socket = RudpSocket::bind(receiver.listen)?;
    let endpoint = Endpoint::start(socket, transport)?;
    tracing::info!("Listening on {}", endpoint.local_addr());

    let (stream_tx, stream_rx) = channel::unbounded();
    let registry = stream_registry(stream_tx);
    let mut output = open_output(&receiver.output)?;

    let start_time = Instant::now();
    let mut last_data = Instant::now();
    let mut last_stats = Instant::now();
    let mut finished = false;

    while !finished {
        if let Some(message) = endpoint.recv_timeout(RECV_POLL)? {
            last_data = Instant::now();
            if let Err(e) = registry.dispatch_all(&message.payload, 0) {
                tracing::warn!("Dropping malformed message: {}", e);
            }
        }

        for event in stream_rx.try_iter() {
            match event {
                StreamEvent::Data(chunk) => output.write_all(&chunk)?,
                StreamEvent::End => {
                    tracing::info!("End of stream received");
                    finished = true;
                }
            }
        }

        for event in endpoint.events().try_iter() {
            match event {
                ConnectionEvent::TimedOut { rtt_ms } => {
                    anyhow::bail!("Connection timed out (rtt {rtt_ms}ms)")
                }
                ConnectionEvent::WindowReset => tracing::warn!("Receive window was reset"),
                _ => {}
            }
        }

        if !finished && last_data.elapsed() >= receiver.idle_timeout() {
            tracing::warn!("No data for {:?}, giving up", receiver.idle_timeout());
            break;
        }

        if receiver.stats_interval_secs > 0 && last_stats.elapsed() >= receiver.stats_interval() {
            display_compact_stats(&endpoint.stats(), start_time.elapsed());
            last_stats = Instant::now();
        }
    }

    output.flush()?;
    display_stats(&endpoint.stats(), start_time.elapsed());
    endpoint.shutdown();
    Ok(())
}
