//! Message dispatch.
//!
//! Inbound chat messages are matched on their first token against the
//! handler registry. A miss is not an error; chat traffic that is not a
//! command flows past the bot untouched. Matched invocations run either
//! inline or on the worker pool, and a failing or panicking handler is
//! contained to a logged error plus a generic reply.

use crate::error::HandlerError;
use crate::handlers::{BotContext, HandlerDescriptor, Registry};
use crate::transport::InboundMessage;
use crate::worker::WorkerPool;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

const GENERIC_FAILURE_REPLY: &str = "Sorry, something went wrong while running that command.";

/// One parsed command invocation, as handed to a handler.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub network: String,
    /// Reply target: the channel, or the sender's nick for private messages.
    pub source: String,
    pub sender: String,
    pub is_private: bool,
    /// The matched trigger, lowercased.
    pub trigger: String,
    /// Whitespace-split arguments after the trigger.
    pub args: Vec<String>,
    /// The full original message text.
    pub raw: String,
}

impl CommandInvocation {
    /// Parse a message into an invocation. `None` when the message has no
    /// first token at all.
    pub fn parse(message: &InboundMessage) -> Option<Self> {
        let mut tokens = message.text.split_whitespace();
        let trigger = tokens.next()?.to_lowercase();
        let args = tokens.map(str::to_string).collect();
        Some(Self {
            network: message.network.clone(),
            source: message.source.clone(),
            sender: message.sender.clone(),
            is_private: message.is_private,
            trigger,
            args,
            raw: message.text.clone(),
        })
    }
}

/// Routes inbound messages to handlers.
pub struct Dispatcher {
    registry: Arc<Registry>,
    workers: WorkerPool,
    ctx: Arc<BotContext>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, workers: WorkerPool, ctx: Arc<BotContext>) -> Self {
        Self {
            registry,
            workers,
            ctx,
        }
    }

    /// Handle one inbound message. Returns after the handler finishes for
    /// inline handlers, and after handoff to the worker pool for
    /// off-thread ones.
    pub async fn on_inbound_message(&self, message: InboundMessage) {
        let Some(invocation) = CommandInvocation::parse(&message) else {
            return;
        };
        let Some(descriptor) = self.registry.find_by_trigger(&invocation.trigger) else {
            return;
        };
        if !descriptor.enabled() {
            debug!(
                handler = descriptor.name,
                trigger = %invocation.trigger,
                "Ignoring trigger for disabled handler"
            );
            return;
        }

        if invocation.is_private && !descriptor.handler.allows_private() {
            let refusal = descriptor.handler.private_refusal().to_string();
            if let Err(e) = self.ctx.reply(&invocation, &refusal).await {
                warn!(
                    handler = descriptor.name,
                    network = %invocation.network,
                    error = %e,
                    "Failed to send private-use refusal"
                );
            }
            return;
        }

        if descriptor.handler.runs_off_thread() {
            let descriptor = Arc::clone(&descriptor);
            let ctx = Arc::clone(&self.ctx);
            self.workers.spawn(async move {
                run_handler(&descriptor, &ctx, &invocation).await;
            });
        } else {
            run_handler(&descriptor, &self.ctx, &invocation).await;
        }
    }
}

/// Run one invocation, containing both `Err` returns and panics.
async fn run_handler(
    descriptor: &HandlerDescriptor,
    ctx: &BotContext,
    invocation: &CommandInvocation,
) {
    let outcome = AssertUnwindSafe(descriptor.handler.execute(ctx, invocation))
        .catch_unwind()
        .await;
    let failure: Option<String> = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };
    let Some(failure) = failure else {
        return;
    };

    error!(
        handler = descriptor.name,
        trigger = %invocation.trigger,
        network = %invocation.network,
        source = %invocation.source,
        error = %failure,
        "Handler failed"
    );
    // Best effort; a dead connection is already logged above.
    if let Err(e) = ctx.reply(invocation, GENERIC_FAILURE_REPLY).await {
        if !matches!(e, HandlerError::NoSession(_)) {
            warn!(
                handler = descriptor.name,
                error = %e,
                "Failed to send failure reply"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}
