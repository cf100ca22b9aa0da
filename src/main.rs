//! otp-relay: relays one-time codes from a mailbox to a Telegram chat.
//!
//! Configuration comes from the environment (a `.env` file is honored). See
//! [`RelayConfig::from_env`] for the keys.

use clap::{Parser, Subcommand};
use otp_relay::liveness::{self, DEFAULT_HEARTBEAT_FILE};
use otp_relay::{expiry, shutdown, ImapMailbox, RelayConfig, TelegramNotifier, Watcher};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "otp-relay", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch the mailbox and relay codes (default)
    Run,
    /// Exit 0 if the liveness marker is fresh, 1 otherwise
    Healthcheck {
        /// Maximum marker age in seconds
        #[arg(long, default_value_t = 1800)]
        max_age: u64,
        /// Liveness marker path
        #[arg(long, env = "HEARTBEAT_FILE", default_value = DEFAULT_HEARTBEAT_FILE)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            init_tracing();
            run().await
        }
        Command::Healthcheck { max_age, file } => healthcheck(&file, Duration::from_secs(max_age)),
    }
}

/// Reads the filter from `RUST_LOG`, else applies `LOG_LEVEL` to this crate.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL")
            .unwrap_or_else(|_| "info".to_string())
            .to_lowercase();
        EnvFilter::try_new(format!("otp_relay={level},warn"))
            .unwrap_or_else(|_| EnvFilter::new("otp_relay=info,warn"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn run() -> ExitCode {
    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    debug!(?config, "Configuration loaded");

    let notifier = match TelegramNotifier::new(&config) {
        Ok(notifier) => notifier,
        Err(e) => {
            error!(error = %e, "Cannot create notifier");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        warn!(signal, "Received signal, shutting down gracefully");
        trigger.trigger();
    });

    info!(
        email = %config.email(),
        imap_host = %config.effective_imap_host(),
        folder = %config.folder,
        "Starting otp-relay"
    );

    let watcher = Watcher::new(&config, ImapMailbox::new(config.clone()), &notifier);
    let summary = match config.code_lifetime {
        Some(lifetime) => {
            let (schedule, expirer) =
                expiry::channel(&notifier, lifetime, config.expiry_check_interval);
            let (summary, ()) = tokio::join!(
                watcher.with_expiry(schedule).run(shutdown.clone()),
                expirer.run(shutdown)
            );
            summary
        }
        None => watcher.run(shutdown).await,
    };

    info!(
        delivered = summary.delivered,
        delivery_failures = summary.delivery_failures,
        "Application stopped"
    );
    ExitCode::SUCCESS
}

async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                return tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                };
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

fn healthcheck(file: &Path, max_age: Duration) -> ExitCode {
    match liveness::marker_age(file, chrono::Utc::now()) {
        Ok(age) if age <= max_age => ExitCode::SUCCESS,
        Ok(age) => {
            println!(
                "Heartbeat stale: {}s > {}s (file: {})",
                age.as_secs(),
                max_age.as_secs(),
                file.display()
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            println!("Healthcheck error: {e}");
            ExitCode::FAILURE
        }
    }
}
