//! Simulate a set of end devices sending periodically on a deterministic clock.

use bytes::Bytes;
use clap::{value_parser, Arg, Command};
use periodic_sender::{
    deterministic,
    offset::{self, Directory, Memory, Store},
    periodic::{self, Notification, Sender},
    size::{SizeChooser, Uniform},
    Metrics, Node, Transmitter,
};
use rand::RngCore;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Command line arguments parsed from user input
struct Arguments {
    nodes: u32,
    interval: Duration,
    initial_delay: Duration,
    packet_size: u8,
    random_size: Option<(u32, u32)>,
    duration: Duration,
    offsets: Option<PathBuf>,
    seed: u64,
    log_level: String,
}

/// A radio that only counts what it is asked to transmit.
#[derive(Clone)]
struct Radio {
    id: u32,
    transmitted: Arc<AtomicU64>,
}

impl Transmitter for Radio {
    fn transmit(&mut self, payload: Bytes) {
        debug!(node = self.id, size = payload.len(), "transmitting");
        self.transmitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// An end device with a single radio.
struct Device {
    id: u32,
    radio: Radio,
}

impl Node for Device {
    type Transmitter = Radio;

    fn id(&self) -> u32 {
        self.id
    }

    fn transmitter(&self) -> Option<Radio> {
        Some(self.radio.clone())
    }
}

fn main() {
    // Parse command line arguments
    let args = parse_arguments();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();
    debug!(nodes = args.nodes, seed = args.seed, "initializing simulation");

    // Run simulation
    match &args.offsets {
        Some(directory) => {
            let store = Directory::new(offset::Config::new(directory));
            info!(directory = ?store.path(), "using offset directory");
            simulate(&args, store);
        }
        None => simulate(&args, Memory::default()),
    }
}

/// Parse command line arguments and return structured data
fn parse_arguments() -> Arguments {
    let matches = Command::new("periodic-sender")
        .about("Simulate end devices sending periodically on a deterministic clock")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("nodes")
                .long("nodes")
                .value_parser(value_parser!(u32))
                .default_value("1")
                .help("Number of end devices"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .value_parser(value_parser!(f64))
                .default_value("10")
                .help("Seconds between sends"),
        )
        .arg(
            Arg::new("initial-delay")
                .long("initial-delay")
                .value_parser(value_parser!(f64))
                .default_value("1")
                .help("Seconds before the first send"),
        )
        .arg(
            Arg::new("packet-size")
                .long("packet-size")
                .value_parser(value_parser!(u8))
                .default_value("10")
                .help("Base payload size in bytes"),
        )
        .arg(
            Arg::new("random-size")
                .long("random-size")
                .value_parser(value_parser!(String))
                .help("Add a uniform number of bytes to each payload: <min>:<max>"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .value_parser(value_parser!(f64))
                .default_value("60")
                .help("Seconds of virtual time to simulate"),
        )
        .arg(
            Arg::new("offsets")
                .long("offsets")
                .value_parser(value_parser!(PathBuf))
                .help("Directory of per-node offset records (in-memory if omitted)"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(value_parser!(u64))
                .default_value("42")
                .help("Seed for the simulation"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_parser(value_parser!(String))
                .default_value("info")
                .help("Log filter (e.g. info, debug, periodic_sender=trace)"),
        )
        .get_matches();

    let seconds = |name: &str| {
        let value = *matches.get_one::<f64>(name).unwrap();
        Duration::try_from_secs_f64(value).unwrap_or_else(|_| panic!("invalid {name}: {value}"))
    };
    let random_size = matches.get_one::<String>("random-size").map(|range| {
        let (min, max) = range.split_once(':').expect("missing ':' in random size");
        let min = min.parse::<u32>().expect("invalid random size min");
        let max = max.parse::<u32>().expect("invalid random size max");
        assert!(min <= max, "random size min exceeds max");
        (min, max)
    });

    Arguments {
        nodes: *matches.get_one::<u32>("nodes").unwrap(),
        interval: seconds("interval"),
        initial_delay: seconds("initial-delay"),
        packet_size: *matches.get_one::<u8>("packet-size").unwrap(),
        random_size,
        duration: seconds("duration"),
        offsets: matches.get_one::<PathBuf>("offsets").cloned(),
        seed: *matches.get_one::<u64>("seed").unwrap(),
        log_level: matches.get_one::<String>("log-level").unwrap().clone(),
    }
}

/// Run every node until the configured duration elapses and print a summary.
fn simulate<S: Store + Clone>(args: &Arguments, store: S) {
    let (runner, context, auditor) = deterministic::Executor::init(deterministic::Config {
        seed: args.seed,
        timeout: None,
    });

    // Start all nodes
    let mut rng = context.clone();
    let transmitted = Arc::new(AtomicU64::new(0));
    let mut nodes = Vec::with_capacity(args.nodes as usize);
    for id in 0..args.nodes {
        let device = Device {
            id,
            radio: Radio {
                id,
                transmitted: transmitted.clone(),
            },
        };
        let size = match args.random_size {
            Some((min, max)) => SizeChooser::random(Uniform::new(min, max, rng.next_u64())),
            None => SizeChooser::None,
        };
        let cfg = periodic::Config {
            interval: args.interval,
            initial_delay: args.initial_delay,
            packet_size: args.packet_size,
            size,
        };
        let sender = Sender::new(
            context.with_label(&format!("node_{id}")),
            device,
            store.clone(),
            cfg,
        );
        let receiver = sender.subscribe();
        sender.start().expect("device has a radio");
        nodes.push((sender, receiver));
    }

    // Run until the deadline
    runner.run_until(args.duration);

    // Summarize
    for (sender, mut receiver) in nodes {
        sender.stop();
        let mut notifications: Vec<Notification> = Vec::new();
        while let Ok(Some(notification)) = receiver.try_next() {
            notifications.push(notification);
        }
        let bytes: usize = notifications.iter().map(|n| n.payload.len()).sum();
        let times: Vec<_> = notifications.iter().map(|n| n.at.as_secs_f64()).collect();
        info!(
            node = sender.id(),
            packets = notifications.len(),
            bytes,
            ?times,
            "node summary"
        );
    }
    info!(
        transmitted = transmitted.load(Ordering::Relaxed),
        auditor = %auditor.state(),
        "simulation complete"
    );
    println!("{}", context.encode());
}
