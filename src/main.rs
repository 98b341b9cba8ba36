//! handoff - pre-forked worker pool with connection handoff.

mod cli;

use std::io::{ErrorKind, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, Commands};
use handoff::echo::EchoServer;
use handoff::logging::{self, LogConfig};
use handoff::worker::{
    Cluster, EnvFactory, SlotIndex, WorkerContext, default_env, run_worker_main,
};

/// How long the accept loop sleeps when no client is waiting.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(&cli, args),
        Commands::Worker => cmd_worker(&cli),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli, preset: LogConfig) {
    let mut config = preset
        .with_level(cli.log_level())
        .with_ansi(!cli.no_color);
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init(config.with_env_overrides());
}

/// Run the master: start the pool, then accept connections and entrust
/// them to the workers round-robin until Ctrl+C.
fn cmd_serve(cli: &Cli, args: &cli::ServeArgs) -> Result<()> {
    init_logging(cli, LogConfig::for_master());

    let no_color = cli.no_color;
    let env: EnvFactory = Arc::new(move |slot: SlotIndex| {
        let mut env = default_env(slot);
        // Workers log to the same terminal
        if no_color {
            env.insert("NO_COLOR".to_string(), "1".to_string());
        }
        env
    });
    let cluster =
        Cluster::with_env(args.pool_config(), env).context("Failed to create worker pool")?;
    let listener = TcpListener::bind(args.listen)
        .with_context(|| format!("Failed to listen on {}", args.listen))?;
    // Polled so the loop notices Ctrl+C
    listener.set_nonblocking(true)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    cluster
        .start_and_wait()
        .context("Workers failed to start")?;

    println!("listening on {}", listener.local_addr()?);
    std::io::stdout().flush()?;

    let mut next = 0usize;
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let slot = next % cluster.concurrency();
                next = next.wrapping_add(1);
                if let Err(e) = cluster.entrust(slot, stream) {
                    tracing::warn!(slot, peer = %peer, error = %e, "Connection rejected");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => tracing::warn!(error = %e, "Accept failed"),
        }
    }

    eprintln!("\nReceived Ctrl+C, stopping workers...");
    cluster.stop()?;
    Ok(())
}

/// Worker mode: serve the echo server over the channel the pool set up.
fn cmd_worker(cli: &Cli) -> Result<()> {
    init_logging(cli, LogConfig::for_worker());

    let context = WorkerContext::from_env().context("Cannot start worker")?;
    tracing::debug!(
        worker_id = %context.worker,
        slot = ?context.slot,
        "Worker starting"
    );
    run_worker_main(EchoServer::new(context.slot, context.worker))
}
