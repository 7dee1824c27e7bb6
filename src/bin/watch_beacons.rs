use std::{net::SocketAddr, time::Instant};

use clap::Parser;
use epicars_cac::{
    client::BeaconTable,
    messages::{CAMessage, RsrvIsUp},
    utils::{get_default_repeater_port, new_reusable_udp_socket},
};
use tracing::{debug, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

/// Listen for server beacons and report changes in their rhythm
#[derive(Parser)]
struct Options {
    /// Port to listen on. Defaults to the repeater port
    #[clap(short, long)]
    port: Option<u16>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = Options::parse();

    let filter = EnvFilter::default()
        .add_directive(
            match opts.verbose {
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                2.. => LevelFilter::TRACE,
            }
            .into(),
        )
        .add_directive("tokio=off".parse().unwrap())
        .add_directive("runtime=off".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let port = opts.port.unwrap_or_else(get_default_repeater_port);
    let socket = match new_reusable_udp_socket(("0.0.0.0", port)) {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("Could not listen on port {port}: {e}");
            std::process::exit(1);
        }
    };
    println!("Waiting for beacons on 0.0.0.0:{port}");

    let mut beacons = BeaconTable::new(Instant::now());
    let mut buf = vec![0u8; 0xFFFF];
    loop {
        let (size, sender) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Receive failed: {e}");
                continue;
            }
        };
        let Ok((_, beacon)) = RsrvIsUp::parse(&buf[..size]) else {
            debug!("Ignoring {size} byte datagram from {sender}");
            continue;
        };
        let server = SocketAddr::new(
            beacon.server_ip.map(Into::into).unwrap_or(sender.ip()),
            beacon.server_port,
        );
        let verdict = beacons.beacon_arrived(
            server,
            Instant::now(),
            beacon.beacon_id,
            beacon.protocol_version,
        );
        let period = beacons
            .average_period(&server)
            .map(|p| format!("{:.1} s", p.as_secs_f64()))
            .unwrap_or_else(|| "-".to_owned());
        let note = match (verdict.anomaly, verdict.network_wide) {
            (_, true) => " ANOMALY (network wide)",
            (true, false) => " ANOMALY",
            _ => "",
        };
        println!(
            "BEACON #{} from {server} (v{}, average {period}){note}",
            beacon.beacon_id, beacon.protocol_version
        );
    }
}
