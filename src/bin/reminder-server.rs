//! Reminder Server - HTTP trigger endpoint plus the background reminder runner.
//!
//! This binary:
//! - Connects to PostgreSQL (or falls back to in-memory storage)
//! - Runs the reminder runner that replays due runs
//! - Serves the HTTP API for starting runs and reading their status
//!
//! See [`renewal_reminders::config`] for the environment variables.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use renewal_reminders::{
    Clock, EngineConfig, HttpState, InMemorySubscriptions, MemoryRunStore, PgSubscriptionLookup,
    PostgresRunStore, ReminderEngine, ReminderWorkflow, RunStore, SubscriptionLookup,
    SystemClock, TemplateDispatcher, TracingTransport, create_router, spawn_runner,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "renewal_reminders=info,reminder_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env()?;
    let shutdown = shutdown_signal()?;

    info!(
        http_addr = %config.http_addr,
        offsets = %config.offsets,
        missed_policy = config.missed_policy.as_str(),
        "starting reminder server"
    );

    // Storage and subscription lookup share one pool when a database is configured.
    let (store, lookup): (Arc<dyn RunStore>, Arc<dyn SubscriptionLookup>) =
        match &config.database_url {
            Some(url) => {
                let store = PostgresRunStore::connect(url)
                    .await
                    .context("failed to connect to database")?;
                let lookup = PgSubscriptionLookup::new(store.pool().clone());
                info!("connected to database");
                let store: Arc<dyn RunStore> = Arc::new(store);
                let lookup: Arc<dyn SubscriptionLookup> = Arc::new(lookup);
                (store, lookup)
            }
            None => {
                warn!("REMINDERS_DATABASE_URL not set; runs are kept in memory only");
                let lookup = match &config.subscriptions_file {
                    Some(path) => InMemorySubscriptions::from_json_file(path)
                        .with_context(|| format!("failed to load {}", path.display()))?,
                    None => InMemorySubscriptions::new(),
                };
                info!(subscriptions = lookup.len(), "using in-memory subscriptions");
                let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
                let lookup: Arc<dyn SubscriptionLookup> = Arc::new(lookup);
                (store, lookup)
            }
        };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dispatcher = TemplateDispatcher::new(
        TracingTransport,
        &config.offsets,
        config.mail_from.clone(),
        clock.clone(),
    )
    .context("failed to build reminder templates")?;

    let workflow = ReminderWorkflow::new(lookup, Arc::new(dispatcher), config.reminder_settings());
    let engine = Arc::new(ReminderEngine::new(
        store,
        clock,
        workflow,
        config.retry_policy(),
    ));

    let (runner_handle, runner_shutdown) = spawn_runner(engine.clone(), config.runner_config());

    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!(addr = %config.http_addr, "HTTP server listening");

    let app = create_router(HttpState { engine });
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    let _ = runner_shutdown.send(true);
    if let Err(err) = runner_handle.await {
        error!(error = %err, "reminder runner task panicked");
    }

    info!("shutdown complete");
    Ok(())
}

/// Install the shutdown signal handlers. Errors surface before the server starts.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut terminate = {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};
        unix_signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?
    };

    Ok(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Ctrl+C received"),
                Err(err) => {
                    error!(error = %err, "Ctrl+C listener failed");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }

        #[cfg(not(unix))]
        ctrl_c.await;
    })
}
