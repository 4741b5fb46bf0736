//! RUDP Sender - reliable-UDP stream sender
//!
//! Reads from stdin or a file and streams it to a receiver, one framed chunk
//! per datagram.

use anyhow::Context;
use clap::Parser;
use rudp::{ConnectionState, Endpoint, Reliability, RudpSocket};
use rudp_cli::{
    display_compact_stats, display_stats, ensure_delivered, init_logging, Config, SenderConfig,
};
use rudp_cli::{KIND_DATA, KIND_END};
use rudp_protocol::encode_frame;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rudp-sender")]
#[command(about = "Reliable UDP stream sender", long_about = None)]
struct Args {
    /// TOML config file ([sender] and [transport] sections)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Receiver address (host:port)
    #[arg(short, long)]
    peer: Option<SocketAddr>,

    /// Local bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Input source: file path or '-' for stdin
    #[arg(short, long)]
    input: Option<String>,

    /// Bytes of input per datagram
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Send chunks unordered and unacknowledged
    #[arg(long)]
    unordered: bool,

    /// Receive shards
    #[arg(long)]
    shards: Option<usize>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long)]
    stats: Option<u64>,

    /// Print an example config file and exit
    #[arg(long)]
    example_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn open_input(input: &str) -> anyhow::Result<Box<dyn Read>> {
    if input == "-" {
        tracing::info!("Reading from stdin");
        Ok(Box::new(io::stdin()))
    } else {
        tracing::info!("Reading from {}", input);
        let file = File::open(input).with_context(|| format!("opening {input}"))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Fill `buf` as far as the reader allows, returning bytes read (0 at EOF)
fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.example_config {
        print!("{}", Config::example().to_toml()?);
        return Ok(());
    }

    let file_config = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    let mut sender = match (file_config.sender.clone(), args.peer) {
        (Some(mut sender), peer) => {
            if let Some(peer) = peer {
                sender.peer = peer;
            }
            sender
        }
        (None, Some(peer)) => SenderConfig::for_peer(peer),
        (None, None) => anyhow::bail!("A peer address is required (--peer or [sender].peer)"),
    };
    if let Some(bind) = args.bind {
        sender.bind = Some(bind);
    }
    if let Some(input) = args.input {
        sender.input = input;
    }
    if let Some(chunk_size) = args.chunk_size {
        sender.chunk_size = chunk_size;
    }
    if let Some(stats) = args.stats {
        sender.stats_interval_secs = stats;
    }
    sender.unordered |= args.unordered;
    sender.validate()?;

    let mut transport = file_config.transport_config();
    if let Some(shards) = args.shards {
        transport.shard_count = shards;
    }

    tracing::info!("RUDP Sender starting...");
    let socket = RudpSocket::connect(sender.bind_addr(), sender.peer)?;
    let endpoint = Endpoint::start(socket, transport)?;
    tracing::info!("Sending from {} to {}", endpoint.local_addr(), sender.peer);

    let reliability = if sender.unordered {
        Reliability::Unordered
    } else {
        Reliability::Ordered
    };

    let mut reader = open_input(&sender.input)?;
    let mut buffer = vec![0u8; sender.chunk_size];
    let start_time = Instant::now();
    let mut last_stats = Instant::now();

    loop {
        let n = read_chunk(reader.as_mut(), &mut buffer)?;
        if n == 0 {
            tracing::info!("End of input reached");
            break;
        }

        let frame = encode_frame(KIND_DATA, &buffer[..n])?;
        endpoint
            .send_timeout(&frame, reliability, sender.send_timeout())
            .context("sending chunk")?;

        if sender.stats_interval_secs > 0 && last_stats.elapsed() >= sender.stats_interval() {
            display_compact_stats(&endpoint.stats(), start_time.elapsed());
            last_stats = Instant::now();
        }
    }

    // end marker is always ordered so it cannot overtake ordered data
    let frame = encode_frame(KIND_END, &[])?;
    endpoint.send_timeout(&frame, Reliability::Ordered, sender.send_timeout())?;

    let deadline = Instant::now() + sender.send_timeout();
    // a timeout empties the send window, so in_flight alone cannot tell
    // success from failure
    while endpoint.connection().in_flight() > 0
        && endpoint.connection().state() == ConnectionState::Open
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(5));
    }

    let stats = endpoint.stats();
    display_stats(&stats, start_time.elapsed());
    endpoint.shutdown();

    ensure_delivered(&stats)
}
