use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use mdns_engine::engine::Engine;

mod control_socket;
mod net;

/// Where client processes find the daemon.
const CONTROL_SOCKET: &str = "/var/run/mdnsd.sock";

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("pretty") {
        if log_format.contains("no-time") {
            logger.pretty().without_time().init();
        } else {
            logger.pretty().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// A multicast DNS resolver daemon for the local link.
///
/// mdnsd answers lookups, service-type browses, and full service
/// resolutions for client processes connected to its control socket,
/// caching what it learns from the 224.0.0.251 multicast group.
///
/// It speaks IPv4 only: the networks it was written for have no
/// mDNS-over-IPv6 speakers.
struct Args {
    /// Interface address to join the multicast group on
    #[clap(short, long, value_parser, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// Path for the control socket, for test deployments
    #[clap(long, value_parser, default_value = CONTROL_SOCKET)]
    socket: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    tracing::info!(path = %args.socket.display(), "binding control socket");
    let listener = match control_socket::bind(&args.socket) {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(?error, "could not bind control socket");
            process::exit(1);
        }
    };

    tracing::info!(interface = %args.interface, group = %net::MDNS_GROUP, port = %net::MDNS_PORT, "joining multicast group");
    let socket = match net::multicast_socket(args.interface) {
        Ok(socket) => Arc::new(socket),
        Err(error) => {
            tracing::error!(?error, "could not join multicast group");
            process::exit(1);
        }
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (questions_tx, questions_rx) = mpsc::unbounded_channel();

    tokio::spawn(Engine::new(questions_tx).run(events_rx));
    tokio::spawn(control_socket::listen(listener, events_tx.clone()));
    tokio::spawn(net::outbound_task(socket.clone(), questions_rx));
    tokio::spawn(net::inbound_task(socket, events_tx));

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGINT");
            process::exit(1);
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
    }

    if let Err(error) = std::fs::remove_file(&args.socket) {
        tracing::debug!(?error, "could not unlink control socket");
    }
}
