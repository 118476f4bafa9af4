//! Network session supervision.
//!
//! The supervisor owns the map of live network sessions. It starts
//! sessions from per-network settings files, stops them on request, and
//! schedules process termination once the last session is gone. All
//! connection events are funneled into one channel, tagged with the
//! network they came from, so the rest of the bot routes on network id
//! without holding connection handles.

use crate::config::NetworkConfig;
use crate::error::SupervisorError;
use crate::transport::{Connection, ConnectionEvent, ConnectionFactory};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 256;

struct NetworkSession {
    connection: Arc<dyn Connection>,
}

/// Supervises the set of live network sessions.
pub struct Supervisor {
    settings_dir: PathBuf,
    factory: Arc<dyn ConnectionFactory>,
    /// Delay between the last session ending and process termination.
    grace: Duration,
    sessions: DashMap<String, NetworkSession>,
    events_tx: mpsc::Sender<(String, ConnectionEvent)>,
    termination_scheduled: AtomicBool,
    terminated_tx: watch::Sender<bool>,
    terminated_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Create a supervisor. The returned receiver carries every event
    /// from every session, tagged with its network id.
    pub fn new(
        settings_dir: impl Into<PathBuf>,
        factory: Arc<dyn ConnectionFactory>,
        grace: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<(String, ConnectionEvent)>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (terminated_tx, terminated_rx) = watch::channel(false);
        let supervisor = Arc::new(Self {
            settings_dir: settings_dir.into(),
            factory,
            grace,
            sessions: DashMap::new(),
            events_tx,
            termination_scheduled: AtomicBool::new(false),
            terminated_tx,
            terminated_rx,
        });
        (supervisor, events_rx)
    }

    /// Start a session on a network.
    ///
    /// Fails when the network is already active, has no settings file, or
    /// the settings or connection are bad. A failed start leaves the
    /// session map untouched.
    pub async fn start_network(self: &Arc<Self>, network: &str) -> Result<(), SupervisorError> {
        if self.sessions.contains_key(network) {
            return Err(SupervisorError::AlreadyActive(network.to_string()));
        }
        if !NetworkConfig::exists(&self.settings_dir, network) {
            return Err(SupervisorError::UnknownConfiguration(network.to_string()));
        }
        let config = NetworkConfig::load(&self.settings_dir, network).map_err(|source| {
            SupervisorError::Config {
                network: network.to_string(),
                source,
            }
        })?;

        let (connection, events) =
            self.factory
                .connect(network, &config)
                .await
                .map_err(|source| SupervisorError::Connect {
                    network: network.to_string(),
                    source,
                })?;

        // Connecting awaited; someone may have raced us in.
        match self.sessions.entry(network.to_string()) {
            Entry::Occupied(_) => {
                if let Err(e) = connection.quit("Duplicate session").await {
                    warn!(network, error = %e, "Failed to close duplicate connection");
                }
                return Err(SupervisorError::AlreadyActive(network.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(NetworkSession { connection });
            }
        }
        info!(network, server = %config.server, "Network session started");
        self.pump_events(network.to_string(), events);
        Ok(())
    }

    /// Forward one session's events into the shared channel, tagged with
    /// the network id. Stops after the session-ended event.
    fn pump_events(&self, network: String, mut events: mpsc::Receiver<ConnectionEvent>) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let last = matches!(event, ConnectionEvent::SessionEnded { .. });
                if events_tx.send((network.clone(), event)).await.is_err() {
                    break;
                }
                if last {
                    break;
                }
            }
        });
    }

    /// Stop a session with a parting message.
    pub async fn stop_network(
        self: &Arc<Self>,
        network: &str,
        message: &str,
    ) -> Result<(), SupervisorError> {
        let Some((_, session)) = self.sessions.remove(network) else {
            return Err(SupervisorError::UnknownNetwork(network.to_string()));
        };
        if let Err(e) = session.connection.quit(message).await {
            warn!(network, error = %e, "Quit failed, dropping session anyway");
        }
        info!(network, "Network session stopped");
        self.after_session_removed();
        Ok(())
    }

    /// Stop every session and schedule termination.
    pub async fn shutdown(self: &Arc<Self>, message: &str) {
        let networks: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for network in networks {
            if let Some((_, session)) = self.sessions.remove(&network) {
                if let Err(e) = session.connection.quit(message).await {
                    warn!(network = %network, error = %e, "Quit failed during shutdown");
                }
            }
        }
        info!("All network sessions stopped");
        self.schedule_termination();
    }

    /// Handle a session ending on its own (server disconnect, transport
    /// failure). Sessions stopped through the supervisor are already
    /// unregistered by the time their end event arrives.
    pub fn on_session_ended(self: &Arc<Self>, network: &str, reason: &str) {
        if self.sessions.remove(network).is_some() {
            warn!(network, reason, "Network session ended unexpectedly");
            self.after_session_removed();
        } else {
            debug!(network, reason, "Session already unregistered");
        }
    }

    fn after_session_removed(self: &Arc<Self>) {
        if self.sessions.is_empty() {
            info!("Last network session gone, scheduling termination");
            self.schedule_termination();
        }
    }

    /// Arrange for [`Supervisor::wait_for_termination`] to return after
    /// the grace period. Idempotent; only the first call arms the timer.
    fn schedule_termination(self: &Arc<Self>) {
        if self.termination_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let grace = self.grace;
        let terminated_tx = self.terminated_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = terminated_tx.send(true);
        });
    }

    /// Wait until termination has been scheduled and its grace period has
    /// elapsed.
    pub async fn wait_for_termination(&self) {
        let mut rx = self.terminated_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The live connection for a network, if it has one.
    pub fn connection(&self, network: &str) -> Option<Arc<dyn Connection>> {
        self.sessions
            .get(network)
            .map(|session| Arc::clone(&session.connection))
    }

    pub fn is_active(&self, network: &str) -> bool {
        self.sessions.contains_key(network)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}
