//! Run a simulation from the command line.

use clap::{value_parser, Arg, ArgAction, Command};
use keysim_runtime::{deterministic, Metrics, Runner};
use keysim_simulator::{run, Config};
use std::str::FromStr;
use tracing::{error, info, level_filters::LevelFilter, Level};
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse arguments
    let matches = Command::new("keysim")
        .about("simulate threshold-encryption key generation over a gossip network")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(String))
                .help("Path to a YAML configuration file (defaults are used if omitted)"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(value_parser!(u64))
                .help("Seed of the simulation (overrides the configuration)"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .value_parser(value_parser!(u64))
                .help("Length of the simulation in seconds (overrides the configuration)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(String))
                .help("Minimum level of emitted logs (overridden by RUST_LOG)"),
        )
        .get_matches();

    // Create logger
    let level = matches
        .get_one::<String>("log-level")
        .expect("log level has a default");
    let level = Level::from_str(level).expect("invalid log level");
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    if matches.get_flag("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load config
    let config = match matches.get_one::<String>("config") {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid config");
            std::process::exit(1);
        }
    };
    if let Some(seed) = matches.get_one::<u64>("seed") {
        config.seed = *seed;
    }
    if let Some(duration) = matches.get_one::<u64>("duration") {
        config.duration = *duration;
    }
    if let Err(err) = config.validate() {
        error!(%err, "invalid config");
        std::process::exit(1);
    }
    info!(seed = config.seed, duration = config.duration, "loaded config");

    // Run simulation
    let executor = deterministic::Runner::seeded(config.seed);
    let (result, metrics) = executor.start(|context| async move {
        let result = run(context.clone(), config).await;
        (result, context.encode())
    });
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            error!(%err, "simulation failed");
            std::process::exit(1);
        }
    };

    // Print results
    println!("{metrics}");
    match serde_yaml::to_string(&report) {
        Ok(report) => println!("{report}"),
        Err(err) => {
            error!(%err, "failed to encode report");
            std::process::exit(1);
        }
    }
}
