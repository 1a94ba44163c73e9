use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use stream_probe::{
    Target, ValidateConfig,
    config::{DEFAULT_PORT, DEFAULT_SERVER_BIN},
    validate,
};
use tracing_subscriber::EnvFilter;

/// Launches the server and checks that its stream is well formed.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Server executable to launch
    #[arg(long, env = "SERVER_BIN", default_value = DEFAULT_SERVER_BIN)]
    server_bin: PathBuf,

    /// Port the server listens on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Event batches to see after the snapshot
    #[arg(short, long, default_value_t = 5)]
    batches: usize,

    /// Seconds to wait for any one message
    #[arg(long, default_value_t = 30)]
    recv_timeout: u64,
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
    let config = ValidateConfig {
        server_bin: args.server_bin,
        server_args: ValidateConfig::default_server_args(args.port),
        target: Target::new("localhost", args.port),
        min_event_batches: args.batches,
        recv_timeout: Duration::from_secs(args.recv_timeout),
        ..ValidateConfig::default()
    };

    let run = validate::run(&config).await;
    match &run.result {
        Ok(summary) => println!("{summary}"),
        Err(e) => {
            println!("Test Failed: {e}");
            if let Some(output) = &run.server_output {
                println!("{output}");
            }
        }
    }
    ExitCode::from(run.exit_code())
}
