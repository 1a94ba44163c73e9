use std::{process::ExitCode, time::Duration};

use clap::Parser;
use stream_probe::{LoadConfig, Target, load};
use tracing_subscriber::EnvFilter;

/// Opens many concurrent sessions and reports throughput and latency.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Server URL
    #[arg(short, long, default_value = "ws://localhost:9999")]
    url: String,

    /// Concurrent sessions
    #[arg(short, long, default_value_t = 10)]
    clients: usize,

    /// Test duration in seconds
    #[arg(short, long, default_value_t = 10)]
    duration: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stream_probe=info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let target = match Target::parse(&args.url) {
        Ok(target) => target,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let config = LoadConfig {
        target,
        clients: args.clients,
        duration: Duration::from_secs(args.duration),
        ..LoadConfig::default()
    };

    let report = load::run(&config).await;
    println!("{report}");

    if report.ceiling_hit {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
