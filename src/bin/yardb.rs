use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use yardb::Engine;

/// A single-file document database with a REST/OData frontend.
#[derive(Debug, Parser)]
#[command(name = "yardb", version)]
struct Args {
    /// Log to standard error instead of standard output
    #[arg(long)]
    clog: bool,

    /// Syslog-style log level, 0-7
    #[arg(long = "slog_level", default_value_t = 6)]
    slog_level: u8,

    /// Database file
    #[arg(long, default_value = "yar.db")]
    file: PathBuf,

    /// Port to listen on
    #[arg(default_value = "2112")]
    service_or_port: String,
}

fn init_logging(args: &Args) {
    let level = match args.slog_level {
        0..=3 => "error",
        4 => "warn",
        5 | 6 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if args.clog {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let port: u16 = match args.service_or_port.parse() {
        Ok(port) => port,
        Err(_) => {
            error!(service_or_port = %args.service_or_port, "not a valid port number");
            return ExitCode::FAILURE;
        }
    };

    let engine = match Engine::open(&args.file) {
        Ok(engine) => engine,
        Err(e) => {
            error!(file = %args.file.display(), error = %e, "failed to open database");
            return ExitCode::FAILURE;
        }
    };

    info!(file = %args.file.display(), port, "starting up");
    if let Err(e) = yardb::serve(engine, port).await {
        error!(error = %e, "server terminated");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
