//! TideKV server binary.
//!
//! Binds the listener, builds the disposal pool and an empty index, and
//! hands them to the event loop. The loop runs on a blocking thread while
//! the runtime waits for Ctrl+C.

use anyhow::Context;
use std::time::Duration;
use tidekv::connection::{ConnectionEngine, EngineConfig};
use tidekv::pool::{DisposalPool, DEFAULT_WORKERS};
use tidekv::storage::HashIndex;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Disposal worker threads
    workers: usize,
    /// Idle connection timeout
    idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: tidekv::DEFAULT_HOST.to_string(),
            port: tidekv::DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            idle_timeout: EngineConfig::default().idle_timeout,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i, "--host").to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = parse_or_exit(value_of(&args, i, "--port"), "port number");
                    i += 2;
                }
                "--workers" | "-w" => {
                    config.workers =
                        parse_or_exit(value_of(&args, i, "--workers"), "worker count");
                    i += 2;
                }
                "--idle-timeout-ms" => {
                    let ms: u64 = parse_or_exit(
                        value_of(&args, i, "--idle-timeout-ms"),
                        "idle timeout",
                    );
                    config.idle_timeout = Duration::from_millis(ms);
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("TideKV version {}", tidekv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value.as_str(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn parse_or_exit<T: std::str::FromStr>(raw: &str, what: &str) -> T {
    raw.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid {}", what);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
TideKV - An Event-Loop Driven In-Memory Key-Value Server

USAGE:
    tidekv [OPTIONS]

OPTIONS:
    -h, --host <HOST>            Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>            Port to listen on (default: 1234)
    -w, --workers <N>            Disposal worker threads (default: 4)
        --idle-timeout-ms <MS>   Evict connections idle this long (default: 5000)
    -v, --version                Print version information
        --help                   Print this help message

ENVIRONMENT:
    RUST_LOG                     Log filter, e.g. "tidekv=debug" (default: info)

EXAMPLES:
    tidekv                       # Start on 127.0.0.1:1234
    tidekv --port 4000           # Start on port 4000
    tidekv --host 0.0.0.0 -w 8   # All interfaces, 8 disposal workers
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!(version = tidekv::VERSION, "Starting TideKV");

    // std sets SO_REUSEADDR on Unix listeners
    let listener = std::net::TcpListener::bind(config.bind_address())
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!("Listening on {}", config.bind_address());

    let pool = DisposalPool::new(config.workers).context("failed to start disposal pool")?;

    let engine_config = EngineConfig {
        idle_timeout: config.idle_timeout,
        ..EngineConfig::default()
    };
    let engine = ConnectionEngine::new(listener, HashIndex::new(), pool, engine_config)
        .context("failed to create event loop")?;
    let shutdown = engine.shutdown_handle();

    let mut event_loop = tokio::task::spawn_blocking(move || engine.run());

    tokio::select! {
        result = &mut event_loop => {
            result.context("event loop panicked")??;
            return Ok(());
        }
        signal = signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("Shutdown signal received, stopping server...");
                shutdown.shutdown().context("failed to wake event loop")?;
            }
            // Keep serving without signal handling.
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    }

    event_loop.await.context("event loop panicked")??;

    info!("Server shutdown complete");
    Ok(())
}
