//! Shared fixtures for the integration tests: an in-process transport
//! that records everything sent through it, and a handful of scripted
//! handlers.

#![allow(dead_code)]

use async_trait::async_trait;
use botherd::config::NetworkConfig;
use botherd::dispatch::{CommandInvocation, Dispatcher};
use botherd::error::{HandlerError, HandlerLoadError, HandlerResult};
use botherd::handlers::{BotContext, Handler, Registry};
use botherd::store::StateStore;
use botherd::supervisor::Supervisor;
use botherd::transport::{
    Connection, ConnectionEvent, ConnectionFactory, InboundMessage, TransportError,
};
use botherd::worker::WorkerPool;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// In-memory connection that records sends and quits.
pub struct TestConnection {
    network: String,
    sent: Mutex<Vec<(String, String)>>,
    quits: Mutex<Vec<String>>,
    members: Mutex<HashMap<String, HashSet<String>>>,
}

impl TestConnection {
    pub fn new(network: &str) -> Arc<Self> {
        Arc::new(Self {
            network: network.to_string(),
            sent: Mutex::new(Vec::new()),
            quits: Mutex::new(Vec::new()),
            members: Mutex::new(HashMap::new()),
        })
    }

    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn quit_messages(&self) -> Vec<String> {
        self.quits.lock().clone()
    }

    pub fn set_members(&self, channel: &str, nicks: &[&str]) {
        self.members.lock().insert(
            channel.to_string(),
            nicks.iter().map(|n| n.to_string()).collect(),
        );
    }
}

#[async_trait]
impl Connection for TestConnection {
    fn network(&self) -> &str {
        &self.network
    }

    async fn send(&self, target: &str, text: &str) -> Result<(), TransportError> {
        self.sent.lock().push((target.to_string(), text.to_string()));
        Ok(())
    }

    async fn quit(&self, message: &str) -> Result<(), TransportError> {
        self.quits.lock().push(message.to_string());
        Ok(())
    }

    fn channel_members(&self, channel: &str) -> HashSet<String> {
        self.members.lock().get(channel).cloned().unwrap_or_default()
    }
}

/// Factory that hands out [`TestConnection`]s and keeps the event
/// senders so tests can inject inbound traffic and session endings.
#[derive(Default)]
pub struct TestFactory {
    connections: Mutex<HashMap<String, Arc<TestConnection>>>,
    event_senders: Mutex<HashMap<String, mpsc::Sender<ConnectionEvent>>>,
}

impl TestFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The connection handed out for a network. Panics when it was never
    /// connected.
    pub fn connection(&self, network: &str) -> Arc<TestConnection> {
        Arc::clone(
            self.connections
                .lock()
                .get(network)
                .expect("network was never connected"),
        )
    }

    pub async fn inject(&self, network: &str, event: ConnectionEvent) {
        let sender = self
            .event_senders
            .lock()
            .get(network)
            .expect("network was never connected")
            .clone();
        sender.send(event).await.expect("event channel closed");
    }

    pub async fn end_session(&self, network: &str, reason: &str) {
        self.inject(
            network,
            ConnectionEvent::SessionEnded {
                reason: reason.to_string(),
            },
        )
        .await;
    }
}

#[async_trait]
impl ConnectionFactory for TestFactory {
    async fn connect(
        &self,
        network: &str,
        _config: &NetworkConfig,
    ) -> Result<(Arc<dyn Connection>, mpsc::Receiver<ConnectionEvent>), TransportError> {
        let connection = TestConnection::new(network);
        let (tx, rx) = mpsc::channel(16);
        self.connections
            .lock()
            .insert(network.to_string(), Arc::clone(&connection));
        self.event_senders.lock().insert(network.to_string(), tx);
        Ok((connection as Arc<dyn Connection>, rx))
    }
}

/// Write a minimal settings file for `network` under `settings_dir`.
pub fn write_network_settings(settings_dir: &Path, network: &str) {
    std::fs::create_dir_all(settings_dir).expect("create settings dir");
    std::fs::write(
        settings_dir.join(format!("{network}.toml")),
        "server = \"irc.example.net:6667\"\nnickname = \"botherd\"\nchannels = [\"#test\"]\n",
    )
    .expect("write network settings");
}

/// Replies "pong" and records every invocation it sees.
#[derive(Default)]
pub struct PingHandler {
    pub calls: Mutex<Vec<CommandInvocation>>,
}

#[async_trait]
impl Handler for PingHandler {
    fn name(&self) -> &'static str {
        "ping"
    }
    fn triggers(&self) -> &[&'static str] {
        &["ping"]
    }
    fn help_text(&self) -> &str {
        "Replies with pong."
    }
    async fn execute(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult {
        self.calls.lock().push(invocation.clone());
        ctx.reply(invocation, "pong").await
    }
}

/// Like [`PingHandler`] but marked off-thread, with a small delay so the
/// worker-pool path is actually exercised.
pub struct SlowPingHandler;

#[async_trait]
impl Handler for SlowPingHandler {
    fn name(&self) -> &'static str {
        "slowping"
    }
    fn triggers(&self) -> &[&'static str] {
        &["slowping"]
    }
    fn help_text(&self) -> &str {
        "Replies with pong, slowly."
    }
    fn runs_off_thread(&self) -> bool {
        true
    }
    async fn execute(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult {
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.reply(invocation, "pong (eventually)").await
    }
}

/// Channel-only handler, for exercising the private-message refusal.
pub struct ChannelOnlyHandler;

#[async_trait]
impl Handler for ChannelOnlyHandler {
    fn name(&self) -> &'static str {
        "channelonly"
    }
    fn triggers(&self) -> &[&'static str] {
        &["channelonly"]
    }
    fn help_text(&self) -> &str {
        "Only works in channels."
    }
    fn allows_private(&self) -> bool {
        false
    }
    async fn execute(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult {
        ctx.reply(invocation, "in a channel").await
    }
}

/// Always fails with an error.
pub struct FailingHandler;

#[async_trait]
impl Handler for FailingHandler {
    fn name(&self) -> &'static str {
        "failing"
    }
    fn triggers(&self) -> &[&'static str] {
        &["explode"]
    }
    fn help_text(&self) -> &str {
        "Always fails."
    }
    async fn execute(&self, _ctx: &BotContext, _invocation: &CommandInvocation) -> HandlerResult {
        Err(HandlerError::Failed("scripted failure".to_string()))
    }
}

/// Handler whose one-time initialization always fails, leaving it
/// registered but disabled.
pub struct BrokenLoadHandler;

#[async_trait]
impl Handler for BrokenLoadHandler {
    fn name(&self) -> &'static str {
        "brokenload"
    }
    fn triggers(&self) -> &[&'static str] {
        &["broken"]
    }
    fn help_text(&self) -> &str {
        "Never loads."
    }
    async fn on_load(&self, _store: &StateStore) -> Result<(), HandlerLoadError> {
        Err(HandlerLoadError::Other("scripted load failure".to_string()))
    }
    async fn execute(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult {
        ctx.reply(invocation, "should never run").await
    }
}

/// Always panics.
pub struct PanickingHandler;

#[async_trait]
impl Handler for PanickingHandler {
    fn name(&self) -> &'static str {
        "panicking"
    }
    fn triggers(&self) -> &[&'static str] {
        &["panic"]
    }
    fn help_text(&self) -> &str {
        "Always panics."
    }
    async fn execute(&self, _ctx: &BotContext, _invocation: &CommandInvocation) -> HandlerResult {
        panic!("scripted panic");
    }
}

/// Scheduled handler that counts ticks, optionally failing every tick
/// and optionally blocking for a while per tick.
pub struct ScriptedScheduledHandler {
    interval: Option<Duration>,
    block_for: Option<Duration>,
    fail: bool,
    pub ticks: AtomicUsize,
}

impl ScriptedScheduledHandler {
    pub fn counting(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval: Some(interval),
            block_for: None,
            fail: false,
            ticks: AtomicUsize::new(0),
        })
    }

    pub fn failing(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval: Some(interval),
            block_for: None,
            fail: true,
            ticks: AtomicUsize::new(0),
        })
    }

    pub fn blocking(interval: Duration, block_for: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval: Some(interval),
            block_for: Some(block_for),
            fail: false,
            ticks: AtomicUsize::new(0),
        })
    }

    pub fn unscheduled() -> Arc<Self> {
        Arc::new(Self {
            interval: None,
            block_for: None,
            fail: false,
            ticks: AtomicUsize::new(0),
        })
    }

    pub fn tick_count(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for ScriptedScheduledHandler {
    fn name(&self) -> &'static str {
        "scripted"
    }
    fn triggers(&self) -> &[&'static str] {
        &["scripted"]
    }
    fn help_text(&self) -> &str {
        "Scripted background work."
    }
    fn poll_interval(&self) -> Option<Duration> {
        self.interval
    }
    async fn execute(&self, _ctx: &BotContext, _invocation: &CommandInvocation) -> HandlerResult {
        Ok(())
    }
    async fn execute_scheduled(&self, _ctx: &BotContext) -> HandlerResult {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        if let Some(block_for) = self.block_for {
            tokio::time::sleep(block_for).await;
        }
        if self.fail {
            return Err(HandlerError::Failed("scripted tick failure".to_string()));
        }
        Ok(())
    }
}

/// A fully wired bot over the in-memory transport, with `testnet`
/// started and `#test` populated.
pub struct Harness {
    pub supervisor: Arc<Supervisor>,
    pub factory: Arc<TestFactory>,
    pub ctx: Arc<BotContext>,
    pub registry: Arc<Registry>,
    pub dispatcher: Dispatcher,
    pub events: mpsc::Receiver<(String, ConnectionEvent)>,
    _base: tempfile::TempDir,
}

impl Harness {
    pub async fn start(handlers: Vec<Arc<dyn Handler>>) -> Self {
        let base = tempfile::tempdir().expect("tempdir");
        let settings_dir = base.path().join("settings");
        write_network_settings(&settings_dir, "testnet");

        let factory = TestFactory::new();
        let (supervisor, events) = Supervisor::new(
            &settings_dir,
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            Duration::from_millis(100),
        );
        let store = Arc::new(
            botherd::store::StateStore::new(base.path().join("data")).expect("store"),
        );
        let ctx = Arc::new(BotContext::new(Arc::clone(&supervisor), store));
        let registry = Arc::new(
            Registry::load(handlers, &ctx.store).await.expect("registry load"),
        );
        ctx.attach_registry(Arc::clone(&registry));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            WorkerPool::new(4),
            Arc::clone(&ctx),
        );

        supervisor
            .start_network("testnet")
            .await
            .expect("start testnet");
        factory
            .connection("testnet")
            .set_members("#test", &["botherd", "alice"]);

        Self {
            supervisor,
            factory,
            ctx,
            registry,
            dispatcher,
            events,
            _base: base,
        }
    }

    pub fn connection(&self) -> Arc<TestConnection> {
        self.factory.connection("testnet")
    }

    /// Dispatch one channel message from alice on #test.
    pub async fn say(&self, text: &str) {
        self.dispatcher
            .on_inbound_message(channel_message(text))
            .await;
    }

    /// Dispatch one private message from alice.
    pub async fn whisper(&self, text: &str) {
        self.dispatcher
            .on_inbound_message(private_message(text))
            .await;
    }
}

pub fn channel_message(text: &str) -> InboundMessage {
    InboundMessage {
        network: "testnet".to_string(),
        source: "#test".to_string(),
        sender: "alice".to_string(),
        is_private: false,
        text: text.to_string(),
    }
}

pub fn private_message(text: &str) -> InboundMessage {
    InboundMessage {
        network: "testnet".to_string(),
        source: "alice".to_string(),
        sender: "alice".to_string(),
        is_private: true,
        text: text.to_string(),
    }
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}
