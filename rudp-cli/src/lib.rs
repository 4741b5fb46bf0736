//! RUDP CLI Library
//!
//! Shared functionality for the reliable-UDP command-line tools.

pub mod config;
pub mod stats;
pub mod stream;

pub use config::{Config, ConfigError, ReceiverConfig, SenderConfig, TransportSection};
pub use stats::{
    display_compact_stats, display_stats, ensure_delivered, format_bandwidth, format_bytes,
    format_rtt,
};
pub use stream::{stream_registry, StreamEvent, KIND_DATA, KIND_END, MAX_CHUNK};

/// Install the `tracing` subscriber
///
/// `RUST_LOG` wins when set; otherwise `verbose` picks debug over info.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
