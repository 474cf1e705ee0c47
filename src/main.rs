//! mail-imap-actions-rs: IMAP IDLE watcher applying folder actions
//!
//! Watches one mailbox per configured account and moves every newly arrived
//! message to a target folder, optionally named from the message's received
//! timestamp. Change detection uses IMAP IDLE on a dedicated notify session;
//! each change runs one fetch/move cycle on a short-lived command session.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with CLI flags, env loading and tracing
//! - [`config`]: Environment-driven configuration for accounts and process settings
//! - [`errors`]: Application error model
//! - [`session`]: Mail session capability traits used by the engine
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`credentials`]: Static passwords and command-backed bearer tokens
//! - [`template`]: Destination mailbox templates with date patterns
//! - [`account`]: Per-account state machine
//! - [`watcher`]: IDLE notification watcher with a coalescing change queue
//! - [`pipeline`]: Fetch/classify/move pipeline for one handle cycle
//! - [`metrics`]: Prometheus metrics and the `/metrics` endpoint
//! - [`supervisor`]: Per-account task fan-out and outcome reporting

mod account;
mod config;
mod credentials;
mod errors;
mod imap;
mod metrics;
mod pipeline;
mod session;
mod supervisor;
mod template;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::{Credentials, ServerConfig};
use imap::ImapConnector;
use metrics::Metrics;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command line flags
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Load environment variables from this file instead of `./.env`
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Validate the configuration, list the accounts and exit
    #[arg(long)]
    check: bool,
}

/// Application entry point
///
/// Loads configuration from the environment, starts the optional metrics
/// endpoint and runs every account until all of them end or Ctrl-C is
/// pressed. Exits with an error when any account failed.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// MAIL_SMART_DEFAULT_HOST=imap.example.com \
/// MAIL_SMART_DEFAULT_USER=user@example.com \
/// MAIL_SMART_DEFAULT_PASS=secret \
/// MAIL_SMART_DEFAULT_MOVE=Archive/%yyyy% \
/// MAIL_SMART_DEFAULT_MOVE_TIMESTAMP=true \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config = ServerConfig::load_from_env()?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if cli.check {
        print_accounts(&config);
        return Ok(());
    }

    let metrics = Arc::new(Metrics::new()?);
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                on_signal.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    let metrics_server = config.metrics_listen.map(|addr| {
        let metrics = metrics.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = metrics.serve(addr, token).await {
                error!(error = %err, "metrics endpoint stopped");
            }
        })
    });

    info!(accounts = config.accounts.len(), "starting");
    let timeouts = config.timeouts;
    let outcomes = supervisor::supervise(
        &config.accounts,
        |account| ImapConnector::new(account.clone(), timeouts),
        &metrics,
        &cancel,
    )
    .await;

    cancel.cancel();
    if let Some(server) = metrics_server {
        server.await.ok();
    }

    for outcome in &outcomes {
        let last_error = outcome.last_error.as_ref().map(ToString::to_string);
        info!(
            account = %outcome.account,
            moved = outcome.moved,
            last_error = last_error.as_deref(),
            "account summary"
        );
    }
    let failed: Vec<String> = outcomes
        .iter()
        .filter(|outcome| outcome.failed())
        .map(|outcome| format!("{} ({})", outcome.account, outcome.phase))
        .collect();
    if !failed.is_empty() {
        return Err(format!("accounts failed: {}", failed.join(", ")).into());
    }
    Ok(())
}

/// Print the loaded accounts without their secrets
fn print_accounts(config: &ServerConfig) {
    for (name, account) in &config.accounts {
        let auth = match &account.credentials {
            Credentials::Password(_) => "password".to_owned(),
            Credentials::Bearer { provider, .. } => format!("xoauth2 ({provider})"),
        };
        let action = match &account.action {
            Some(action) if action.timestamp => {
                format!("move to '{}' (timestamped)", action.template)
            }
            Some(action) => format!("move to '{}'", action.template),
            None => "none".to_owned(),
        };
        let fallback = match account.idle_fallback() {
            Some(interval) => format!("{}s", interval.as_secs()),
            None => "off".to_owned(),
        };
        println!(
            "{name}: {}@{}:{} mailbox={} auth={auth} action={action} idle_fallback={fallback}",
            account.user, account.host, account.port, account.mailbox
        );
    }
    if let Some(addr) = config.metrics_listen {
        println!("metrics: http://{addr}/metrics");
    }
}
