//! fullname-server: a one-shot name transformation server
//!
//! Each TCP connection carries exactly one request and one reply:
//! - The client sends a three-part name, optionally followed by up to two words
//! - The server replies with the recased name reversed, its signature and
//!   the remaining words
//!
//! Features:
//! - One worker per connection, as a task or as a child process
//! - Watchdog that kills workers exceeding their deadline
//! - Activity and error logs as append-only files
//! - Graceful shutdown on SIGINT/SIGTERM, with optional draining
//! - Configuration via JSON (or TOML) file and CLI arguments

mod config;
mod logging;
mod protocol;
mod registry;
mod server;
mod shutdown;
mod watchdog;
mod worker;

use clap::Parser;
use config::{CliArgs, Command, Config, HandleArgs};
use server::Server;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    match &cli.command {
        Some(Command::Handle(args)) => run_worker(args),
        Some(Command::Serve) | None => run_server(&cli),
    }
}

/// Run the accept loop until a termination signal arrives.
fn run_server(cli: &CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load(cli)?;

    // Initialize logging
    logging::init(&config.log_file, &config.error_log_file, &config.log_level)?;

    info!(
        address = %config.listen_addr(),
        timeout_secs = config.timeout.as_secs(),
        watchdog_secs = config.watchdog_timeout.as_secs(),
        worker = ?config.worker,
        shutdown = ?config.shutdown,
        "Starting fullname-server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let server = Server::new(config);
    if let Err(e) = runtime.block_on(server.run()) {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    info!("Server stopped");
    Ok(())
}

/// Serve a single exchange over stdin/stdout.
fn run_worker(args: &HandleArgs) -> Result<(), Box<dyn std::error::Error>> {
    logging::init_worker(args.activity_log.as_deref(), &args.log_level)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(worker::handle_stdio(args))?;
    Ok(())
}
