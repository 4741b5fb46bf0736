//! Statistics display and formatting

use rudp_protocol::{ConnectionState, ConnectionStats, RTT_TIMED_OUT};
use std::io::Write;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format an RTT estimate in milliseconds
pub fn format_rtt(rtt_ms: u64) -> String {
    if rtt_ms == RTT_TIMED_OUT {
        "timed out".to_string()
    } else if rtt_ms >= 1_000 {
        format!("{:.2}s", rtt_ms as f64 / 1_000.0)
    } else {
        format!("{}ms", rtt_ms)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Display connection statistics as a table on stderr
pub fn display_stats(stats: &ConnectionStats, elapsed: Duration) {
    eprintln!("\n┌─────────────────────────────────────────────────────────────┐");
    eprintln!("│ CONNECTION STATISTICS                                       │");
    eprintln!("├─────────────────────────────────────────────────────────────┤");
    eprintln!("│ State:    {:?}", stats.state);
    eprintln!("│ Uptime:   {}", format_duration(elapsed));
    eprintln!("│ RTT:      {}", format_rtt(stats.rtt_ms));
    eprintln!("│ In flight: {}", stats.in_flight);
    eprintln!("├─────────────────────────────────────────────────────────────┤");
    eprintln!(
        "│ Packets:  {} sent / {} received / {} retransmitted",
        stats.packets_sent, stats.packets_received, stats.retransmitted
    );
    eprintln!(
        "│ Bytes:    {} sent / {} delivered",
        format_bytes(stats.bytes_sent),
        format_bytes(stats.bytes_received)
    );
    eprintln!(
        "│ Acks:     {} received / {} sent / {} stale",
        stats.acks_received, stats.acks_sent, stats.stale_acks
    );
    eprintln!(
        "│ Dropped:  {} duplicates / {} backpressure",
        stats.duplicates, stats.backpressure_drops
    );
    eprintln!("└─────────────────────────────────────────────────────────────┘");
}

/// Display compact stats on one line (for continuous updates)
pub fn display_compact_stats(stats: &ConnectionStats, elapsed: Duration) {
    let bytes = stats.bytes_sent.max(stats.bytes_received);
    let throughput_bps = if elapsed.as_secs() > 0 {
        (bytes * 8) / elapsed.as_secs()
    } else {
        0
    };

    let mut err = std::io::stderr();
    let _ = write!(
        err,
        "\r[{:8}] RTT: {} | Bytes: {} | Rate: {} | Resent: {} | In flight: {}         ",
        format_duration(elapsed),
        format_rtt(stats.rtt_ms),
        format_bytes(bytes),
        format_bandwidth(throughput_bps),
        stats.retransmitted,
        stats.in_flight
    );
    let _ = err.flush();
}

/// Check that a finished sender got everything acknowledged
pub fn ensure_delivered(stats: &ConnectionStats) -> anyhow::Result<()> {
    match stats.state {
        ConnectionState::TimedOut => {
            anyhow::bail!("Connection timed out before the stream was acknowledged")
        }
        ConnectionState::Closed => {
            anyhow::bail!("Connection closed before the stream was acknowledged")
        }
        ConnectionState::Open if stats.in_flight > 0 => {
            anyhow::bail!("{} datagrams were never acknowledged", stats.in_flight)
        }
        ConnectionState::Open => Ok(()),
    }
}
