//! Command handlers.
//!
//! This module contains the [`Handler`] contract, the loaded-handler
//! [`Registry`], and the [`BotContext`] handed to every handler entry
//! point.
//!
//! Handlers are a closed set registered in [`builtin`]; the registry
//! normalizes and validates their trigger words at load time so routing
//! is never ambiguous at dispatch time.

mod help;
mod stream_watch;
mod wolfram;

pub use help::HelpHandler;
pub use stream_watch::StreamWatchHandler;
pub use wolfram::WolframHandler;

use crate::config::BotConfig;
use crate::dispatch::CommandInvocation;
use crate::error::{HandlerLoadError, HandlerResult, RegistryError};
use crate::store::StateStore;
use crate::supervisor::Supervisor;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Shared context passed to handler entry points.
///
/// Everything a handler may touch goes through here; there is no ambient
/// global lookup.
pub struct BotContext {
    pub supervisor: Arc<Supervisor>,
    pub store: Arc<StateStore>,
    registry: OnceLock<Arc<Registry>>,
}

impl BotContext {
    pub fn new(supervisor: Arc<Supervisor>, store: Arc<StateStore>) -> Self {
        Self {
            supervisor,
            store,
            registry: OnceLock::new(),
        }
    }

    /// Attach the loaded registry. Called once during startup wiring;
    /// later calls are ignored.
    pub fn attach_registry(&self, registry: Arc<Registry>) {
        let _ = self.registry.set(registry);
    }

    /// The loaded registry, for handlers that introspect it (help).
    pub fn registry(&self) -> Option<&Arc<Registry>> {
        self.registry.get()
    }

    /// Send a message on a network, if it has a live session.
    pub async fn send(&self, network: &str, target: &str, text: &str) -> HandlerResult {
        let connection = self
            .supervisor
            .connection(network)
            .ok_or_else(|| crate::error::HandlerError::NoSession(network.to_string()))?;
        connection.send(target, text).await?;
        Ok(())
    }

    /// Reply on the channel (or private conversation) an invocation came
    /// from.
    pub async fn reply(&self, invocation: &CommandInvocation, text: &str) -> HandlerResult {
        self.send(&invocation.network, &invocation.source, text).await
    }

    /// Known members of a channel on a network. Empty when there is no
    /// session or the bot is not in the channel.
    pub fn channel_members(&self, network: &str, channel: &str) -> HashSet<String> {
        self.supervisor
            .connection(network)
            .map(|connection| connection.channel_members(channel))
            .unwrap_or_default()
    }
}

/// Contract every command handler implements.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable handler name, used for logging and the state store key.
    fn name(&self) -> &'static str;

    /// Trigger words. Non-empty; lowercased and checked for registry-wide
    /// uniqueness at load time.
    fn triggers(&self) -> &[&'static str];

    /// Human help text shown by the help command.
    fn help_text(&self) -> &str;

    /// Whether the handler works in private messages. When false, the
    /// dispatcher replies with [`Handler::private_refusal`] instead of
    /// executing.
    fn allows_private(&self) -> bool {
        true
    }

    /// Refusal text for private invocations of a channel-only handler.
    fn private_refusal(&self) -> &str {
        "Sorry, this command does not work in private messages."
    }

    /// When true, [`Handler::execute`] runs on the worker pool instead of
    /// the primary dispatch context, and may block on slow external calls.
    fn runs_off_thread(&self) -> bool {
        false
    }

    /// Cadence for [`Handler::execute_scheduled`]. `None` disables
    /// background polling for this handler.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// One-time initialization at registry load. Failure disables this
    /// handler without failing the load.
    async fn on_load(&self, _store: &StateStore) -> Result<(), HandlerLoadError> {
        Ok(())
    }

    /// Execute a command invocation. Side effects (replies) go through
    /// the context.
    async fn execute(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult;

    /// Background poll entry point, invoked by the scheduler on the
    /// worker pool. Only meaningful with a poll interval.
    async fn execute_scheduled(&self, _ctx: &BotContext) -> HandlerResult {
        Ok(())
    }
}

/// One loaded handler plus its registry-owned runtime flags.
///
/// The trigger list is immutable after load.
pub struct HandlerDescriptor {
    pub name: &'static str,
    pub triggers: Vec<String>,
    pub handler: Arc<dyn Handler>,
    enabled: AtomicBool,
    pub(crate) tick_in_flight: AtomicBool,
}

impl HandlerDescriptor {
    fn new(name: &'static str, triggers: Vec<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            name,
            triggers,
            handler,
            enabled: AtomicBool::new(true),
            tick_in_flight: AtomicBool::new(false),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

/// Registry of loaded command handlers.
pub struct Registry {
    descriptors: Vec<Arc<HandlerDescriptor>>,
    by_trigger: HashMap<String, Arc<HandlerDescriptor>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.descriptors.len())
            .finish()
    }
}

impl Registry {
    /// Load a set of handlers.
    ///
    /// Trigger validation (non-empty, unique across the registry after
    /// lowercasing) fails the whole load; a handler whose `on_load` fails
    /// is merely disabled so one broken handler cannot keep the bot from
    /// starting.
    pub async fn load(
        handlers: Vec<Arc<dyn Handler>>,
        store: &StateStore,
    ) -> Result<Self, RegistryError> {
        let mut descriptors = Vec::new();
        let mut by_trigger: HashMap<String, Arc<HandlerDescriptor>> = HashMap::new();

        for handler in handlers {
            let name = handler.name();
            if handler.triggers().is_empty() {
                return Err(RegistryError::EmptyTriggers(name));
            }
            let triggers: Vec<String> = handler
                .triggers()
                .iter()
                .map(|t| t.to_lowercase())
                .collect();

            for trigger in &triggers {
                if let Some(existing) = by_trigger.get(trigger) {
                    return Err(RegistryError::DuplicateTrigger {
                        trigger: trigger.clone(),
                        first: existing.name,
                        second: name,
                    });
                }
            }

            let descriptor = Arc::new(HandlerDescriptor::new(name, triggers.clone(), handler));
            for trigger in triggers {
                by_trigger.insert(trigger, Arc::clone(&descriptor));
            }
            descriptors.push(descriptor);
        }

        let registry = Self {
            descriptors,
            by_trigger,
        };

        for descriptor in &registry.descriptors {
            if let Err(e) = descriptor.handler.on_load(store).await {
                warn!(
                    handler = descriptor.name,
                    error = %e,
                    "Handler failed to initialize, disabling"
                );
                descriptor.disable();
            }
        }

        Ok(registry)
    }

    /// Case-insensitive exact match on a command's first token. A miss is
    /// not an error; unmatched input is silently ignored upstream.
    pub fn find_by_trigger(&self, token: &str) -> Option<Arc<HandlerDescriptor>> {
        self.by_trigger.get(&token.to_lowercase()).cloned()
    }

    /// Enabled descriptors with an active poll interval, for the
    /// scheduler.
    pub fn all_scheduled(&self) -> impl Iterator<Item = Arc<HandlerDescriptor>> + '_ {
        self.descriptors
            .iter()
            .filter(|d| d.enabled() && d.handler.poll_interval().is_some())
            .cloned()
    }

    /// All loaded descriptors, in load order.
    pub fn descriptors(&self) -> &[Arc<HandlerDescriptor>] {
        &self.descriptors
    }
}

/// The handlers shipped with the bot.
pub fn builtin(config: &BotConfig) -> Vec<Arc<dyn Handler>> {
    vec![
        Arc::new(HelpHandler),
        Arc::new(StreamWatchHandler::new(
            config.api_keys.get("twitch").cloned(),
        )),
        Arc::new(WolframHandler::new(
            config.api_keys.get("wolframalpha").cloned(),
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubHandler {
        name: &'static str,
        triggers: &'static [&'static str],
        interval: Option<Duration>,
        fail_load: bool,
    }

    impl StubHandler {
        fn new(name: &'static str, triggers: &'static [&'static str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                triggers,
                interval: None,
                fail_load: false,
            })
        }
    }

    #[async_trait]
    impl Handler for StubHandler {
        fn name(&self) -> &'static str {
            self.name
        }
        fn triggers(&self) -> &[&'static str] {
            self.triggers
        }
        fn help_text(&self) -> &str {
            "stub"
        }
        fn poll_interval(&self) -> Option<Duration> {
            self.interval
        }
        async fn on_load(&self, _store: &StateStore) -> Result<(), HandlerLoadError> {
            if self.fail_load {
                Err(HandlerLoadError::Other("broken".into()))
            } else {
                Ok(())
            }
        }
        async fn execute(&self, _ctx: &BotContext, _invocation: &CommandInvocation) -> HandlerResult {
            Ok(())
        }
    }

    fn test_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path()).expect("store");
        (dir, store)
    }

    #[tokio::test]
    async fn load_accepts_unique_triggers() {
        let (_dir, store) = test_store();
        let registry = Registry::load(
            vec![
                StubHandler::new("ping", &["ping"]),
                StubHandler::new("echo", &["echo", "say"]),
            ],
            &store,
        )
        .await
        .expect("load");
        assert_eq!(registry.descriptors().len(), 2);
    }

    #[tokio::test]
    async fn load_fails_on_case_insensitive_collision() {
        let (_dir, store) = test_store();
        let err = Registry::load(
            vec![
                StubHandler::new("ping", &["Ping"]),
                StubHandler::new("latency", &["PING"]),
            ],
            &store,
        )
        .await
        .unwrap_err();
        match err {
            RegistryError::DuplicateTrigger { trigger, first, second } => {
                assert_eq!(trigger, "ping");
                assert_eq!(first, "ping");
                assert_eq!(second, "latency");
            }
            other => panic!("expected DuplicateTrigger, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_fails_on_empty_trigger_set() {
        let (_dir, store) = test_store();
        let err = Registry::load(vec![StubHandler::new("mute", &[])], &store)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::EmptyTriggers("mute")));
    }

    #[tokio::test]
    async fn failing_on_load_disables_only_that_handler() {
        let (_dir, store) = test_store();
        let broken = Arc::new(StubHandler {
            name: "broken",
            triggers: &["broken"],
            interval: Some(Duration::from_secs(60)),
            fail_load: true,
        });
        let registry = Registry::load(vec![broken, StubHandler::new("ping", &["ping"])], &store)
            .await
            .expect("load continues past a broken handler");

        let broken = registry.find_by_trigger("broken").expect("still registered");
        assert!(!broken.enabled());
        let ping = registry.find_by_trigger("ping").expect("registered");
        assert!(ping.enabled());
        // Disabled handlers never reach the scheduler.
        assert_eq!(registry.all_scheduled().count(), 0);
    }

    #[tokio::test]
    async fn find_by_trigger_is_case_insensitive() {
        let (_dir, store) = test_store();
        let registry = Registry::load(vec![StubHandler::new("ping", &["ping"])], &store)
            .await
            .expect("load");
        assert!(registry.find_by_trigger("PiNg").is_some());
        assert!(registry.find_by_trigger("pong").is_none());
    }

    #[tokio::test]
    async fn all_scheduled_filters_on_interval() {
        let (_dir, store) = test_store();
        let polling = Arc::new(StubHandler {
            name: "watcher",
            triggers: &["watch"],
            interval: Some(Duration::from_secs(300)),
            fail_load: false,
        });
        let registry = Registry::load(vec![polling, StubHandler::new("ping", &["ping"])], &store)
            .await
            .expect("load");
        let scheduled: Vec<_> = registry.all_scheduled().collect();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].name, "watcher");
    }
}
