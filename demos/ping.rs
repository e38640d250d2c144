use async_ping::{ArpClient, ArpConfigBuilder, IcmpChannel, PingerBuilder};
use clap::Parser;
use std::io::Write;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

/// Simple example to show ICMP echo capabilities
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Host name or IPv4 address to ping
    target: String,
    /// Number of echo requests to send
    #[arg(short, long, default_value_t = 4)]
    count: u16,
    /// Seconds to wait for each reply
    #[arg(short = 'W', long, default_value_t = 1)]
    timeout: u64,
    /// Network interface used to look up the responder's MAC address
    #[arg(short, long)]
    iface: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut builder = PingerBuilder::new(IcmpChannel::open().unwrap());
    if let Some(iface) = &args.iface {
        let client = ArpClient::new(ArpConfigBuilder::new(iface).build()).unwrap();
        builder = builder.with_arp_client(Arc::new(client));
    }
    let pinger = builder.build().unwrap();

    pinger.on_probe(|probe, _| {
        let mut stdout = std::io::stdout().lock();
        if probe.answered {
            let mac = probe
                .link_address
                .map(|mac| format!(" mac={}", mac))
                .unwrap_or_default();
            writeln!(
                stdout,
                "{} bytes from {}: icmp_seq={} ttl={} time={:?}{}",
                probe.size, probe.target, probe.sequence, probe.ttl, probe.round_trip_time, mac
            )
            .unwrap();
        } else {
            writeln!(stdout, "Request timeout for icmp_seq={}", probe.sequence).unwrap();
        }
        ControlFlow::Continue(())
    });
    pinger.on_complete(|probe, stats| {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "--- {} ping statistics ---", probe.target).unwrap();
        writeln!(
            stdout,
            "{} packets transmitted, {} received, {:.1}% packet loss, time {:?}",
            stats.total_sent,
            stats.total_received,
            stats.loss() * 100.0,
            stats.total_elapsed
        )
        .unwrap();
    });

    pinger
        .begin(
            args.target.as_str(),
            args.count,
            Duration::from_secs(args.timeout),
        )
        .await
        .unwrap();
    pinger.finished().await;
}
