//! Twitch stream watcher.
//!
//! Channels subscribe to streamers; a background poll asks the streams
//! API who is live and announces streamers that just went live to the
//! channels that asked for reports. The subscription state is persisted
//! through the state store so restarts do not lose it.

use crate::dispatch::CommandInvocation;
use crate::error::{HandlerError, HandlerLoadError, HandlerResult};
use crate::handlers::{BotContext, Handler};
use crate::store::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_API_URL: &str = "https://api.twitch.tv/helix/streams";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscriptions for one streamer.
///
/// Scope keys are `"<network> <channel>"`, so the same streamer can be
/// watched from channels on different networks independently.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WatchedStreamer {
    /// Scopes that only want `live` queries to include this streamer.
    follow_scopes: BTreeSet<String>,
    /// Scopes that want going-live announcements.
    report_scopes: BTreeSet<String>,
    /// Whether the current broadcast was already announced.
    #[serde(default)]
    reported_live: bool,
    /// Per-scope display nicknames, for when a streamer's chat nick and
    /// their streaming name differ.
    #[serde(default)]
    nicknames: BTreeMap<String, String>,
}

impl WatchedStreamer {
    fn is_empty(&self) -> bool {
        self.follow_scopes.is_empty() && self.report_scopes.is_empty()
    }

    fn watched_in(&self, scope: &str) -> bool {
        self.follow_scopes.contains(scope) || self.report_scopes.contains(scope)
    }

    fn display_name<'a>(&'a self, scope: &str, fallback: &'a str) -> &'a str {
        self.nicknames.get(scope).map(String::as_str).unwrap_or(fallback)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WatchState {
    streamers: BTreeMap<String, WatchedStreamer>,
}

/// One live stream as returned by the streams API.
#[derive(Debug, Deserialize)]
struct LiveStream {
    user_login: String,
    user_name: String,
    title: String,
    #[serde(default)]
    game_name: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct StreamsResponse {
    data: Vec<LiveStream>,
}

/// Watches Twitch streamers and announces when they go live.
pub struct StreamWatchHandler {
    api_key: Option<String>,
    api_url: String,
    client: OnceLock<reqwest::Client>,
    state: Mutex<WatchState>,
}

impl StreamWatchHandler {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_api_url(api_key, DEFAULT_API_URL)
    }

    /// Same as [`StreamWatchHandler::new`] but pointed at a different
    /// streams endpoint. Used by tests.
    pub fn with_api_url(api_key: Option<String>, api_url: impl Into<String>) -> Self {
        Self {
            api_key,
            api_url: api_url.into(),
            client: OnceLock::new(),
            state: Mutex::new(WatchState::default()),
        }
    }

    fn scope_key(invocation: &CommandInvocation) -> String {
        format!("{} {}", invocation.network, invocation.source)
    }

    fn save(&self, store: &StateStore) -> HandlerResult {
        let state = self.state.lock();
        store.save(self.name(), &*state)?;
        Ok(())
    }

    /// Query the streams API for the given logins. Empty input short-circuits
    /// to an empty result without a request.
    async fn query_live(&self, logins: &[String]) -> Result<Vec<LiveStream>, HandlerError> {
        if logins.is_empty() {
            return Ok(Vec::new());
        }
        let client = self
            .client
            .get()
            .ok_or_else(|| HandlerError::Failed("stream watcher not initialized".to_string()))?;
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| HandlerError::Failed("no API key configured".to_string()))?;

        let query: Vec<(&str, &str)> = logins.iter().map(|l| ("user_login", l.as_str())).collect();
        let response: StreamsResponse = client
            .get(&self.api_url)
            .header("Client-ID", key)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.data)
    }

    async fn cmd_add(
        &self,
        ctx: &BotContext,
        invocation: &CommandInvocation,
        names: &[String],
        report: bool,
    ) -> HandlerResult {
        if names.is_empty() {
            return ctx
                .reply(invocation, "Add which streamer? Give me one or more names.")
                .await;
        }
        let scope = Self::scope_key(invocation);
        let mut added = Vec::new();
        let mut already = Vec::new();
        {
            let mut state = self.state.lock();
            for name in names {
                let login = name.to_lowercase();
                let entry = state.streamers.entry(login.clone()).or_default();
                // A scope is in at most one of the two sets; switching
                // between them goes through toggle.
                if entry.watched_in(&scope) {
                    already.push(login);
                    continue;
                }
                if report {
                    entry.report_scopes.insert(scope.clone());
                } else {
                    entry.follow_scopes.insert(scope.clone());
                }
                added.push(login);
            }
        }
        if !added.is_empty() {
            self.save(&ctx.store)?;
        }
        let mut parts = Vec::new();
        if !added.is_empty() {
            let what = if report { "reporting" } else { "following" };
            parts.push(format!("now {what} {}", added.join(", ")));
        }
        if !already.is_empty() {
            parts.push(format!("already watching {}", already.join(", ")));
        }
        ctx.reply(invocation, &format!("Ok: {}.", parts.join("; "))).await
    }

    async fn cmd_remove(
        &self,
        ctx: &BotContext,
        invocation: &CommandInvocation,
        names: &[String],
    ) -> HandlerResult {
        if names.is_empty() {
            return ctx.reply(invocation, "Remove which streamer?").await;
        }
        let scope = Self::scope_key(invocation);
        let mut removed = Vec::new();
        {
            let mut state = self.state.lock();
            for name in names {
                let login = name.to_lowercase();
                if let Some(entry) = state.streamers.get_mut(&login) {
                    let was_watched = entry.follow_scopes.remove(&scope)
                        | entry.report_scopes.remove(&scope);
                    if was_watched {
                        removed.push(login.clone());
                    }
                    if entry.is_empty() {
                        state.streamers.remove(&login);
                    }
                }
            }
        }
        self.save(&ctx.store)?;
        let reply = if removed.is_empty() {
            "None of those streamers were being watched here.".to_string()
        } else {
            format!("Ok, no longer watching {}.", removed.join(", "))
        };
        ctx.reply(invocation, &reply).await
    }

    async fn cmd_toggle(
        &self,
        ctx: &BotContext,
        invocation: &CommandInvocation,
        names: &[String],
    ) -> HandlerResult {
        if names.is_empty() {
            return ctx.reply(invocation, "Toggle reporting for which streamer?").await;
        }
        let scope = Self::scope_key(invocation);
        let mut now_reporting = Vec::new();
        let mut now_following = Vec::new();
        let mut unknown = Vec::new();
        {
            let mut state = self.state.lock();
            for name in names {
                let login = name.to_lowercase();
                match state.streamers.get_mut(&login) {
                    Some(entry) => {
                        if entry.report_scopes.remove(&scope) {
                            entry.follow_scopes.insert(scope.clone());
                            now_following.push(login);
                        } else if entry.follow_scopes.remove(&scope) {
                            entry.report_scopes.insert(scope.clone());
                            now_reporting.push(login);
                        } else {
                            unknown.push(login);
                        }
                    }
                    None => unknown.push(login),
                }
            }
        }
        self.save(&ctx.store)?;
        let mut parts = Vec::new();
        if !now_reporting.is_empty() {
            parts.push(format!("now reporting {}", now_reporting.join(", ")));
        }
        if !now_following.is_empty() {
            parts.push(format!("only following {}", now_following.join(", ")));
        }
        if !unknown.is_empty() {
            parts.push(format!("not watching {}", unknown.join(", ")));
        }
        ctx.reply(invocation, &format!("Ok: {}.", parts.join("; "))).await
    }

    async fn cmd_setnick(
        &self,
        ctx: &BotContext,
        invocation: &CommandInvocation,
        args: &[String],
    ) -> HandlerResult {
        let [name, nick] = args else {
            return ctx
                .reply(invocation, "Set a nickname with: setnick <streamer> <nickname>.")
                .await;
        };
        let scope = Self::scope_key(invocation);
        let login = name.to_lowercase();
        let known = {
            let mut state = self.state.lock();
            match state.streamers.get_mut(&login) {
                Some(entry) if entry.watched_in(&scope) => {
                    entry.nicknames.insert(scope, nick.clone());
                    true
                }
                _ => false,
            }
        };
        if !known {
            return ctx
                .reply(
                    invocation,
                    &format!("I'm not watching {login} here; add them first."),
                )
                .await;
        }
        self.save(&ctx.store)?;
        ctx.reply(invocation, &format!("Ok, I'll call {login} '{nick}' from now on."))
            .await
    }

    async fn cmd_removenick(
        &self,
        ctx: &BotContext,
        invocation: &CommandInvocation,
        args: &[String],
    ) -> HandlerResult {
        let Some(name) = args.first() else {
            return ctx
                .reply(invocation, "Remove whose nickname? Give me a streamer name.")
                .await;
        };
        let scope = Self::scope_key(invocation);
        let wanted = name.to_lowercase();
        let removed = {
            let mut state = self.state.lock();
            // Accept the nickname itself too, since that's what people see
            // in announcements.
            let login = state
                .streamers
                .iter()
                .find(|(login, entry)| {
                    *login == &wanted
                        || entry
                            .nicknames
                            .get(&scope)
                            .is_some_and(|nick| nick.to_lowercase() == wanted)
                })
                .map(|(login, _)| login.clone());
            login.and_then(|login| {
                let entry = state.streamers.get_mut(&login)?;
                entry.nicknames.remove(&scope).map(|nick| (login, nick))
            })
        };
        let Some((login, nick)) = removed else {
            return ctx
                .reply(invocation, &format!("No nickname stored for {wanted} here."))
                .await;
        };
        self.save(&ctx.store)?;
        ctx.reply(
            invocation,
            &format!("Ok, dropped the nickname '{nick}'; back to calling them {login}."),
        )
        .await
    }

    async fn cmd_list(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult {
        let scope = Self::scope_key(invocation);
        let listed = |state: &WatchState, scopes: fn(&WatchedStreamer) -> &BTreeSet<String>| {
            state
                .streamers
                .iter()
                .filter(|(_, s)| scopes(s).contains(&scope))
                .map(|(login, s)| match s.nicknames.get(&scope) {
                    Some(nick) => format!("{nick} ({login})"),
                    None => login.clone(),
                })
                .collect::<Vec<String>>()
        };
        let (following, reporting) = {
            let state = self.state.lock();
            (
                listed(&state, |s| &s.follow_scopes),
                listed(&state, |s| &s.report_scopes),
            )
        };
        let reply = if following.is_empty() && reporting.is_empty() {
            "No streamers are being watched here.".to_string()
        } else {
            let mut parts = Vec::new();
            if !reporting.is_empty() {
                parts.push(format!("reporting: {}", reporting.join(", ")));
            }
            if !following.is_empty() {
                parts.push(format!("following: {}", following.join(", ")));
            }
            parts.join(" | ")
        };
        ctx.reply(invocation, &reply).await
    }

    async fn cmd_live(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult {
        let scope = Self::scope_key(invocation);
        let (logins, nicknames) = {
            let state = self.state.lock();
            let mut logins = Vec::new();
            let mut nicknames = BTreeMap::new();
            for (login, entry) in &state.streamers {
                if entry.watched_in(&scope) {
                    logins.push(login.clone());
                    if let Some(nick) = entry.nicknames.get(&scope) {
                        nicknames.insert(login.clone(), nick.clone());
                    }
                }
            }
            (logins, nicknames)
        };
        if logins.is_empty() {
            return ctx
                .reply(invocation, "No streamers are being watched here.")
                .await;
        }
        let live = self.query_live(&logins).await?;
        let reply = if live.is_empty() {
            "Nobody is live right now.".to_string()
        } else {
            let lines: Vec<String> = live
                .iter()
                .map(|stream| {
                    let display = nicknames
                        .get(&stream.user_login)
                        .map(String::as_str)
                        .unwrap_or(&stream.user_name);
                    describe_stream_as(display, stream)
                })
                .collect();
            format!("Live now: {}", lines.join(" | "))
        };
        ctx.reply(invocation, &reply).await
    }

    /// Look up arbitrary streamers by name, watched or not.
    async fn cmd_lookup(
        &self,
        ctx: &BotContext,
        invocation: &CommandInvocation,
        names: &[String],
    ) -> HandlerResult {
        if names.is_empty() {
            return ctx.reply(invocation, "Look up which streamer?").await;
        }
        let logins: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        let live = self.query_live(&logins).await?;
        let live_logins: BTreeSet<&str> = live.iter().map(|s| s.user_login.as_str()).collect();
        let offline: Vec<&str> = logins
            .iter()
            .map(String::as_str)
            .filter(|login| !live_logins.contains(login))
            .collect();

        let mut parts = Vec::new();
        if !live.is_empty() {
            let lines: Vec<String> = live.iter().map(describe_stream).collect();
            parts.push(format!("Live: {}", lines.join(" | ")));
        }
        if !offline.is_empty() {
            parts.push(format!("Offline: {}", offline.join(", ")));
        }
        ctx.reply(invocation, &parts.join(" | ")).await
    }
}

fn describe_stream(stream: &LiveStream) -> String {
    describe_stream_as(&stream.user_name, stream)
}

fn describe_stream_as(display: &str, stream: &LiveStream) -> String {
    let mut line = format!(
        "{} (https://twitch.tv/{}): {}",
        display,
        stream.user_login,
        stream.title.trim()
    );
    if !stream.game_name.is_empty() {
        line.push_str(&format!(" [{}]", stream.game_name));
    }
    line
}

#[async_trait]
impl Handler for StreamWatchHandler {
    fn name(&self) -> &'static str {
        "streamwatcher"
    }

    fn triggers(&self) -> &[&'static str] {
        &["streamwatcher", "streamwatch"]
    }

    fn help_text(&self) -> &str {
        "Watches Twitch streamers. Subcommands: add, remove, toggle, list, live, lookup. \
         'add' only makes streamers show up in 'live'; 'toggle' switches a streamer \
         to being announced here when they go live."
    }

    fn allows_private(&self) -> bool {
        false
    }

    fn private_refusal(&self) -> &str {
        "Stream watching only works in channels, since that's where the reports go."
    }

    fn runs_off_thread(&self) -> bool {
        true
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(POLL_INTERVAL)
    }

    async fn on_load(&self, store: &StateStore) -> Result<(), HandlerLoadError> {
        if self.api_key.is_none() {
            return Err(HandlerLoadError::MissingApiKey("twitch"));
        }
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| HandlerLoadError::Other(format!("http client: {e}")))?;
        let _ = self.client.set(client);

        if let Some(saved) = store.load::<WatchState>(self.name())? {
            *self.state.lock() = saved;
        }
        Ok(())
    }

    async fn execute(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult {
        let subcommand = invocation.args.first().map(|s| s.to_lowercase());
        let rest = invocation.args.get(1..).unwrap_or_default();
        match subcommand.as_deref() {
            Some("add") | Some("follow") => self.cmd_add(ctx, invocation, rest, false).await,
            Some("report") => self.cmd_add(ctx, invocation, rest, true).await,
            Some("remove") => self.cmd_remove(ctx, invocation, rest).await,
            Some("toggle") | Some("autoreport") => self.cmd_toggle(ctx, invocation, rest).await,
            Some("setnick") => self.cmd_setnick(ctx, invocation, rest).await,
            Some("removenick") => self.cmd_removenick(ctx, invocation, rest).await,
            Some("list") => self.cmd_list(ctx, invocation).await,
            Some("live") => self.cmd_live(ctx, invocation).await,
            Some("lookup") => self.cmd_lookup(ctx, invocation, rest).await,
            // Anything else is taken as a streamer name to look up.
            Some(_) => self.cmd_lookup(ctx, invocation, &invocation.args).await,
            None => {
                ctx.reply(
                    invocation,
                    "Add a parameter: a streamer name for stream info, or one of \
                     add, report, remove, toggle, setnick, removenick, list, live, lookup.",
                )
                .await
            }
        }
    }

    async fn execute_scheduled(&self, ctx: &BotContext) -> HandlerResult {
        let logins: Vec<String> = {
            let state = self.state.lock();
            state
                .streamers
                .iter()
                .filter(|(_, s)| !s.report_scopes.is_empty())
                .map(|(login, _)| login.clone())
                .collect()
        };
        if logins.is_empty() {
            return Ok(());
        }

        let live = self.query_live(&logins).await?;

        // Streams that started well before this tick were either announced
        // already or missed while we were down; either way, announcing them
        // now would be stale.
        let stale_cutoff = Utc::now()
            - chrono::Duration::from_std(POLL_INTERVAL * 3 / 2)
                .unwrap_or_else(|_| chrono::Duration::seconds(450));

        let mut announcements: Vec<(String, String)> = Vec::new();
        {
            let mut state = self.state.lock();
            let live_logins: BTreeSet<&str> =
                live.iter().map(|s| s.user_login.as_str()).collect();

            for stream in &live {
                let Some(entry) = state.streamers.get_mut(&stream.user_login) else {
                    continue;
                };
                if entry.reported_live {
                    continue;
                }
                entry.reported_live = true;
                if stream.started_at < stale_cutoff {
                    debug!(streamer = %stream.user_login, "Stream started a while ago, not announcing");
                    continue;
                }
                for scope in &entry.report_scopes {
                    let display = entry.display_name(scope, &stream.user_name);
                    let text =
                        format!("Streamer went live: {}", describe_stream_as(display, stream));
                    announcements.push((scope.clone(), text));
                }
            }

            // A streamer that is no longer live can be announced again next
            // time they start.
            for (login, entry) in &mut state.streamers {
                if !live_logins.contains(login.as_str()) {
                    entry.reported_live = false;
                }
            }
        }

        for (scope, text) in announcements {
            let Some((network, channel)) = scope.split_once(' ') else {
                continue;
            };
            // Only announce where the bot actually sits; sessions come and
            // go independently of the subscription state.
            if ctx.channel_members(network, channel).is_empty() {
                debug!(network, channel, "Skipping announcement, not in channel");
                continue;
            }
            if let Err(e) = ctx.send(network, channel, &text).await {
                warn!(network, channel, error = %e, "Failed to announce stream");
            }
        }

        self.save(&ctx.store)?;
        Ok(())
    }
}
