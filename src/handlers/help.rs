//! The help command.

use crate::dispatch::CommandInvocation;
use crate::error::HandlerResult;
use crate::handlers::{BotContext, Handler};
use async_trait::async_trait;

/// Lists loaded commands, or shows the help text for one of them.
pub struct HelpHandler;

#[async_trait]
impl Handler for HelpHandler {
    fn name(&self) -> &'static str {
        "help"
    }

    fn triggers(&self) -> &[&'static str] {
        &["help", "commands"]
    }

    fn help_text(&self) -> &str {
        "Shows the commands I know. Pass a command name for details on that one."
    }

    async fn execute(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult {
        let Some(registry) = ctx.registry() else {
            return ctx.reply(invocation, "I'm still starting up, ask again shortly.").await;
        };

        match invocation.args.first() {
            None => {
                let mut triggers: Vec<&str> = registry
                    .descriptors()
                    .iter()
                    .filter(|d| d.enabled())
                    .flat_map(|d| d.triggers.iter().map(String::as_str))
                    .collect();
                triggers.sort_unstable();
                let reply = format!("I know these commands: {}", triggers.join(", "));
                ctx.reply(invocation, &reply).await
            }
            Some(wanted) => match registry.find_by_trigger(wanted) {
                Some(descriptor) if descriptor.enabled() => {
                    let reply = format!("{}: {}", wanted.to_lowercase(), descriptor.handler.help_text());
                    ctx.reply(invocation, &reply).await
                }
                _ => {
                    let reply = format!("I don't know a '{wanted}' command.");
                    ctx.reply(invocation, &reply).await
                }
            },
        }
    }
}
