//! keyring-autolockctl: query and drive the keyring auto-lock daemon.
//!
//! ## Subcommands
//!
//! - `status`: lock state, idle time and timeout
//! - `lock`: lock the keyring now (no-op when already locked)
//! - `health`: daemon liveness

mod client;

use autolock_core::config;
use autolock_core::indicator::{LOCKED_SYMBOL, UNLOCKED_SYMBOL};
use clap::{Parser, Subcommand};
use client::DaemonClient;
use keyring_autolock_protocol::{LockOutcomeKind, StatusSnapshot, TimeoutMode};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyring-autolockctl")]
#[command(about = "Control the keyring auto-lock daemon")]
#[command(version)]
struct Cli {
    /// Daemon socket (defaults to $KEYRING_AUTOLOCK_SOCKET or the runtime dir)
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show lock state and idle time
    Status {
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },

    /// Lock the keyring now
    Lock {
        /// Label recorded in the daemon log
        #[arg(long, default_value = "keyring-autolockctl")]
        source: String,
    },

    /// Check that the daemon is answering
    Health,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let cli = Cli::parse();
    let client = DaemonClient::new(cli.socket.unwrap_or_else(config::default_socket_path));
    tracing::debug!(socket = %client.socket().display(), "Using daemon socket");

    let result = match cli.command {
        Commands::Status { json } => client.status().and_then(|snapshot| {
            if json {
                serde_json::to_string_pretty(&snapshot)
                    .map(|text| println!("{}", text))
                    .map_err(|err| format!("Failed to render status: {}", err))
            } else {
                println!("{}", describe_status(&snapshot));
                Ok(())
            }
        }),
        Commands::Lock { source } => {
            client
                .lock(Some(source.as_str()))
                .map(|reply| match reply.outcome {
                    LockOutcomeKind::Locked => println!("{} keyring locked", LOCKED_SYMBOL),
                    LockOutcomeKind::AlreadyLocked => {
                        println!("{} keyring was already locked", LOCKED_SYMBOL)
                    }
                })
        }
        Commands::Health => client.health().map(|data| {
            let pid = data.get("pid").and_then(|value| value.as_u64()).unwrap_or(0);
            let version = data
                .get("version")
                .and_then(|value| value.as_str())
                .unwrap_or("unknown");
            println!("ok (pid {}, version {})", pid, version);
        }),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "keyring-autolockctl failed");
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn describe_status(snapshot: &StatusSnapshot) -> String {
    if !snapshot.running {
        return "monitor is not running".to_string();
    }
    if snapshot.locked {
        return format!("{} locked", LOCKED_SYMBOL);
    }
    match snapshot.mode {
        TimeoutMode::Disarmed => format!(
            "{} unlocked for {} min (auto-lock disabled)",
            UNLOCKED_SYMBOL, snapshot.idle_minutes
        ),
        TimeoutMode::Armed => format!(
            "{} unlocked for {} of {} min",
            UNLOCKED_SYMBOL, snapshot.idle_minutes, snapshot.timeout_minutes
        ),
    }
}
