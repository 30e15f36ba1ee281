//! LDAP load balancer.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────┐
//!                 │                      LDAP BALANCER                       │
//!                 │                                                          │
//!   Clients       │  ┌──────────┐   daemon thread    ┌────────────────────┐  │
//!   ──────────────┼─▶│ listener │──accept + shard───▶│  I/O worker 0..n   │  │
//!                 │  └──────────┘                    │  read → Router     │  │
//!                 │                                  │  write ← queue     │  │
//!                 │  ┌──────────────┐                └─────────┬──────────┘  │
//!                 │  │ retry timers │──connect───┐             │             │
//!                 │  │ scanner      │            ▼             ▼             │
//!                 │  └──────────────┘      ┌───────────┐  ┌──────────┐       │   Directory
//!                 │                        │ backends  │◀─│ routing  │───────┼─▶ servers
//!                 │                        │ (pools)   │  │ msgid ↔  │       │
//!                 │                        └───────────┘  └──────────┘       │
//!                 └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ldap_balancer::config::loader::load_config;
use ldap_balancer::lifecycle::Daemon;
use ldap_balancer::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "ldap-balancer")]
#[command(about = "Load balancer for LDAP directory servers", long_about = None)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, default_value = "ldap-balancer.toml")]
    config: PathBuf,

    /// Override the number of I/O worker threads.
    #[arg(short, long)]
    threads: Option<usize>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(threads) = cli.threads {
        config.workers.threads = threads;
    }

    if cli.check {
        println!("{}: configuration ok", cli.config.display());
        return ExitCode::SUCCESS;
    }

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        listeners = config.listeners.len(),
        backends = config.backends.len(),
        "ldap-balancer starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    match Daemon::run(config) {
        Ok(report) => ExitCode::from(report.exit_code()),
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}
