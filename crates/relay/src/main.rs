//! Alert relay
//!
//! Receives Alertmanager webhooks, posts each alert group into the subscribed
//! Telegram chats and escalates it through three levels of members until
//! somebody acknowledges it or Alertmanager reports it resolved.

mod alertmanager;
mod commands;
mod poller;
mod server;
mod store;
mod templates;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use escalation::{AlertFormatter, Dispatcher, DuplicatePolicy, EscalationConfig};
use notify::channels::telegram::DEFAULT_API_URL;
use notify::TelegramChannel;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alertmanager::AlertmanagerClient;
use crate::commands::BotCommands;
use crate::server::{build_router, AppState};
use crate::store::Store;
use crate::templates::TemplateFormatter;

/// Alertmanager to Telegram relay with tiered escalation
#[derive(Parser, Debug)]
#[command(name = "alert-relay")]
#[command(about = "Relay Alertmanager notifications to Telegram with tiered escalation")]
#[command(version)]
struct Cli {
    /// Telegram bot token
    #[arg(long, env = "TELEGRAM_TOKEN", hide_env_values = true)]
    telegram_token: String,

    /// Telegram user IDs allowed to issue commands (comma separated)
    #[arg(long, env = "TELEGRAM_ADMIN", value_delimiter = ',', required = true)]
    telegram_admin: Vec<i64>,

    /// Telegram Bot API base URL
    #[arg(long, env = "TELEGRAM_API_URL", default_value = DEFAULT_API_URL)]
    telegram_api_url: String,

    /// Alertmanager base URL queried by /status, /alerts and /silences
    #[arg(long, env = "ALERTMANAGER_URL")]
    alertmanager_url: Option<String>,

    /// Address for the webhook server
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// JSON file holding chats, members and node owners
    #[arg(long, env = "STORE_PATH", default_value = "alert-relay.json")]
    store_path: PathBuf,

    /// Handlebars template for alert messages
    #[arg(long, env = "TEMPLATE_PATH")]
    template_path: Option<PathBuf>,

    /// Seconds without action before a case is forwarded to the next level
    #[arg(long, env = "ESCALATION_TIMEOUT_SECS", default_value = "300")]
    escalation_timeout_secs: u64,

    /// Handling of repeated firings: first-firing-wins or independent
    #[arg(long, env = "DUPLICATE_POLICY", default_value = "first-firing-wins")]
    duplicate_policy: DuplicatePolicy,

    /// Long-poll timeout for Telegram updates, in seconds
    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value = "30")]
    poll_timeout_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "alert_relay=debug,escalation=debug,notify=debug,tower_http=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!(
        listen_addr = %cli.listen_addr,
        store = %cli.store_path.display(),
        timeout_secs = cli.escalation_timeout_secs,
        duplicate_policy = %cli.duplicate_policy,
        admins = cli.telegram_admin.len(),
        "Starting alert relay"
    );

    let started_at = Utc::now();
    let store = Arc::new(Store::open(&cli.store_path).await?);

    let telegram = Arc::new(
        TelegramChannel::new(cli.telegram_token.clone()).with_api_url(&cli.telegram_api_url),
    );
    let me = telegram
        .get_me()
        .await
        .context("Failed to authenticate with the Telegram Bot API")?;
    info!(bot = %me.handle(), "Connected to Telegram");

    let formatter: Arc<dyn AlertFormatter> = Arc::new(match &cli.template_path {
        Some(path) => TemplateFormatter::from_file(path)?,
        None => TemplateFormatter::new()?,
    });
    let mut commands = BotCommands::new(
        store.clone(),
        telegram.clone(),
        cli.telegram_admin.iter().copied(),
        me.handle(),
    )
    .with_started_at(started_at);
    match &cli.alertmanager_url {
        Some(url) => {
            info!(url = %url, "Alertmanager queries enabled");
            commands = commands.with_alertmanager(AlertmanagerClient::new(url)?);
        }
        None => warn!("No Alertmanager URL configured, /alerts and /silences are unavailable"),
    }
    let commands = Arc::new(commands);

    let config = EscalationConfig {
        escalation_timeout: Duration::from_secs(cli.escalation_timeout_secs),
        duplicate_policy: cli.duplicate_policy,
        ..EscalationConfig::default()
    };
    let (dispatcher, handle) = Dispatcher::new(config, store.clone(), telegram.clone());
    let dispatcher = dispatcher
        .with_formatter(formatter)
        .with_commands(commands);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let dispatch_task = tokio::spawn(dispatcher.run(async move {
        stop_rx.await.ok();
    }));

    let mut poller_task = tokio::spawn(poller::run(
        telegram.clone(),
        handle.clone(),
        cli.poll_timeout_secs,
    ));

    let app = build_router(Arc::new(AppState {
        handle,
        store,
        started_at,
    }));
    let listener = TcpListener::bind(&cli.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen_addr))?;
    info!(addr = %cli.listen_addr, "Webhook server listening");
    let mut server_task = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => warn!("Webhook server exited"),
                Ok(Err(e)) => error!(error = %e, "Webhook server failed"),
                Err(e) => error!(error = %e, "Webhook server task panicked"),
            }
        }
        _ = &mut poller_task => warn!("Telegram poller exited"),
    }

    poller_task.abort();
    server_task.abort();
    let _ = stop_tx.send(());
    dispatch_task
        .await
        .context("Dispatch loop terminated abnormally")?;

    info!("Alert relay stopped");
    Ok(())
}
