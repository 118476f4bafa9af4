//! botherd entry point.
//!
//! Wires the supervisor, handler registry, dispatcher and scheduler
//! together, starts the networks named on the command line, then runs
//! until every session is gone or the process is interrupted.

use anyhow::{Context as _, bail};
use botherd::config::BotConfig;
use botherd::dispatch::Dispatcher;
use botherd::handlers::{self, BotContext, Registry};
use botherd::scheduler::Scheduler;
use botherd::store::StateStore;
use botherd::supervisor::Supervisor;
use botherd::transport::{ConnectionEvent, IrcConnectionFactory};
use botherd::worker::WorkerPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(networks_arg) = args.next() else {
        bail!("usage: botherd <network[,network...]> [base-dir]");
    };
    let base = PathBuf::from(args.next().unwrap_or_else(|| ".".to_string()));
    let networks: Vec<String> = networks_arg
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if networks.is_empty() {
        bail!("no networks given");
    }

    let settings_dir = base.join("settings");
    let config = BotConfig::load_or_default(settings_dir.join("global.toml"))
        .context("loading global configuration")?;
    let store = Arc::new(
        StateStore::new(base.join(&config.data_dir)).context("opening state store")?,
    );
    let workers = WorkerPool::new(config.worker_capacity);

    let (supervisor, mut events) = Supervisor::new(
        settings_dir,
        Arc::new(IrcConnectionFactory),
        Duration::from_secs(config.quit_grace_secs),
    );
    let ctx = Arc::new(BotContext::new(Arc::clone(&supervisor), Arc::clone(&store)));

    let registry = Arc::new(
        Registry::load(handlers::builtin(&config), &store)
            .await
            .context("loading handlers")?,
    );
    ctx.attach_registry(Arc::clone(&registry));
    info!(handlers = registry.descriptors().len(), "Handlers loaded");

    let dispatcher = Dispatcher::new(Arc::clone(&registry), workers.clone(), Arc::clone(&ctx));
    Scheduler::new(workers, Arc::clone(&ctx)).start(&registry);

    let mut started = 0usize;
    for network in &networks {
        match supervisor.start_network(network).await {
            Ok(()) => started += 1,
            Err(e) => {
                error!(network = %network, code = e.error_code(), error = %e, "Failed to start network");
            }
        }
    }
    if started == 0 {
        bail!("no network sessions could be started");
    }
    info!(started, "Bot running");

    let pump_supervisor = Arc::clone(&supervisor);
    tokio::spawn(async move {
        while let Some((network, event)) = events.recv().await {
            match event {
                ConnectionEvent::Message(message) => {
                    dispatcher.on_inbound_message(message).await;
                }
                ConnectionEvent::SessionEnded { reason } => {
                    pump_supervisor.on_session_ended(&network, &reason);
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            supervisor.shutdown("Shutting down...").await;
            supervisor.wait_for_termination().await;
        }
        _ = supervisor.wait_for_termination() => {}
    }

    info!("All sessions gone, exiting");
    Ok(())
}
