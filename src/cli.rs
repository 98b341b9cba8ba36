//! Command-line interface definitions using clap.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::Level;

use handoff::worker::{DEFAULT_PREFIX, PoolConfig, RestartPolicy};

/// Pre-forked worker pool that hands accepted connections to supervised workers.
#[derive(Parser, Debug)]
#[command(name = "handoff")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log level selected by -v/-q.
    pub fn log_level(&self) -> Level {
        if self.quiet {
            return Level::ERROR;
        }
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Accept TCP connections and spread them over a pool of echo workers.
    Serve(ServeArgs),

    /// Worker process entry point (started by the pool).
    #[command(hide = true)]
    Worker,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to accept connections on.
    #[arg(short, long, env = "HANDOFF_LISTEN", default_value = "127.0.0.1:7000")]
    pub listen: SocketAddr,

    /// Number of worker processes.
    #[arg(
        short,
        long,
        env = "HANDOFF_WORKERS",
        default_value_t = 4,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub workers: u16,

    /// Prefix of the frame tags exchanged with workers.
    #[arg(long, env = "HANDOFF_PREFIX", default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Seconds to wait for every worker to become ready.
    #[arg(long, env = "HANDOFF_STARTUP_TIMEOUT", default_value_t = 30)]
    pub startup_timeout: u64,

    /// Restarts allowed per slot within the restart window.
    #[arg(long, default_value_t = 5)]
    pub max_restarts: u32,

    /// Length of the restart window in seconds.
    #[arg(long, default_value_t = 60)]
    pub restart_window: u64,

    /// Connections queued per slot while its worker is restarting.
    #[arg(long, default_value_t = 64)]
    pub max_pending: usize,
}

impl ServeArgs {
    pub fn pool_config(&self) -> PoolConfig {
        let restart = RestartPolicy {
            max_restarts: self.max_restarts,
            window: Duration::from_secs(self.restart_window),
            ..RestartPolicy::default()
        };
        PoolConfig::new(usize::from(self.workers))
            .with_prefix(self.prefix.clone())
            .with_restart_policy(restart)
            .with_startup_timeout(Duration::from_secs(self.startup_timeout))
            .with_max_pending(self.max_pending)
    }
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "handoff",
            &mut std::io::stdout(),
        );
    }
}
