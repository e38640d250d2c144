use async_ping::{ArpClient, ArpConfigBuilder, IcmpChannel, PingerBuilder};
use clap::Parser;
use ipnet::Ipv4Net;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pings every host of an IPv4 network once and lists the ones that answered
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Network to sweep, e.g. 10.1.1.0/24
    net: Ipv4Net,
    /// Milliseconds to wait for each reply
    #[arg(short = 'W', long, default_value_t = 500)]
    timeout: u64,
    /// Network interface used to look up MAC addresses
    #[arg(short, long)]
    iface: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout);

    let channel = IcmpChannel::open().unwrap();
    let arp = args.iface.as_deref().map(|iface| {
        Arc::new(ArpClient::new(ArpConfigBuilder::new(iface).build()).unwrap())
    });
    let first_identifier: u16 = rand::random();
    let pingers: Vec<_> = args
        .net
        .hosts()
        .enumerate()
        .map(|(index, host)| {
            let mut builder = PingerBuilder::new(Arc::clone(&channel))
                .with_identifier(first_identifier.wrapping_add(index as u16));
            if let Some(arp) = &arp {
                builder = builder.with_arp_client(Arc::clone(arp));
            }
            (host, builder.build().unwrap())
        })
        .collect();

    let start = Instant::now();
    let sweeps = pingers.iter().map(|(host, pinger)| async move {
        pinger.begin(*host, 1, timeout).await?;
        pinger.finished().await;
        Ok::<_, async_ping::Error>(pinger.probe())
    });
    let outcomes = futures::future::join_all(sweeps).await;
    let sweep_duration = start.elapsed();

    let answered = outcomes
        .into_iter()
        .filter_map(|outcome| outcome.ok())
        .filter(|probe| probe.answered);

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "Found hosts:").unwrap();
        for probe in answered {
            let mac = probe
                .link_address
                .map(|mac| mac.to_string())
                .unwrap_or_else(|| "-".into());
            writeln!(
                stdout,
                "{:<15} ttl={:<3} time={:?} mac={}",
                probe.target, probe.ttl, probe.round_trip_time, mac
            )
            .unwrap();
        }
        writeln!(stdout, "Sweep took {:?}", sweep_duration).unwrap();
    }
}
