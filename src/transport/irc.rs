//! Minimal client-side IRC transport.
//!
//! One connection runs a single Tokio task that owns the framed socket:
//!
//! ```text
//!    ┌──────────────────────────────────────────────┐
//!    │              Connection IO task              │
//!    │                                              │
//!    │  Framed<TcpStream, LinesCodec>               │
//!    │        │ inbound lines                       │
//!    │        ▼                                     │
//!    │  tokio::select! ◄── outbound mpsc (send/quit)│
//!    │        │                                     │
//!    │        ▼                                     │
//!    │  protocol reactions ──▶ event mpsc           │
//!    │  (PONG, JOIN, names)    (messages, ended)    │
//!    └──────────────────────────────────────────────┘
//! ```
//!
//! Deliberately small: no TLS, no reconnect, no IRCv3 negotiation. The
//! supervisor treats a dropped link as a session-ended event and nothing
//! here tries to be cleverer than that.

use super::{Connection, ConnectionEvent, ConnectionFactory, InboundMessage, TransportError};
use crate::config::NetworkConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 64;
// RFC 1459 lines are 512 bytes; allow slack for sloppy servers.
const MAX_LINE_LEN: usize = 1024;

/// A live IRC session.
pub struct IrcConnection {
    network: String,
    nick: Mutex<String>,
    outbound: mpsc::Sender<String>,
    /// Channel name (lowercased) -> known member nicks.
    members: DashMap<String, HashSet<String>>,
}

impl IrcConnection {
    /// Connect, start the IO task, and queue the registration handshake.
    pub async fn connect(
        network: &str,
        config: &NetworkConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ConnectionEvent>), TransportError> {
        let stream = TcpStream::connect(&config.server)
            .await
            .map_err(TransportError::Io)?;
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));

        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(EVENT_QUEUE);

        let connection = Arc::new(Self {
            network: network.to_string(),
            nick: Mutex::new(config.nickname.clone()),
            outbound: outbound_tx,
            members: DashMap::new(),
        });

        // Registration handshake goes through the same outbound queue the
        // IO task drains, so ordering is preserved.
        if let Some(pass) = &config.server_password {
            connection.queue(format!("PASS {pass}")).await?;
        }
        connection.queue(format!("NICK {}", config.nickname)).await?;
        connection
            .queue(format!("USER {} 0 * :{}", config.nickname, config.realname))
            .await?;

        let io = IoTask {
            connection: Arc::clone(&connection),
            channels: config.channels.clone(),
            event_tx,
        };
        tokio::spawn(io.run(framed, outbound_rx));

        info!(network = %network, server = %config.server, "Connected");
        Ok((connection, event_rx))
    }

    async fn queue(&self, line: String) -> Result<(), TransportError> {
        self.outbound
            .send(line)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn current_nick(&self) -> String {
        self.nick.lock().clone()
    }
}

#[async_trait]
impl Connection for IrcConnection {
    fn network(&self) -> &str {
        &self.network
    }

    async fn send(&self, target: &str, text: &str) -> Result<(), TransportError> {
        self.queue(format!("PRIVMSG {target} :{text}")).await
    }

    async fn quit(&self, message: &str) -> Result<(), TransportError> {
        self.queue(format!("QUIT :{message}")).await
    }

    fn channel_members(&self, channel: &str) -> HashSet<String> {
        self.members
            .get(&channel.to_lowercase())
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

/// Factory used by the supervisor in production.
pub struct IrcConnectionFactory;

#[async_trait]
impl ConnectionFactory for IrcConnectionFactory {
    async fn connect(
        &self,
        network: &str,
        config: &NetworkConfig,
    ) -> Result<(Arc<dyn Connection>, mpsc::Receiver<ConnectionEvent>), TransportError> {
        let (connection, events) = IrcConnection::connect(network, config).await?;
        Ok((connection, events))
    }
}

// ============================================================================
// IO task
// ============================================================================

struct IoTask {
    connection: Arc<IrcConnection>,
    channels: Vec<String>,
    event_tx: mpsc::Sender<ConnectionEvent>,
}

impl IoTask {
    async fn run(
        self,
        mut framed: Framed<TcpStream, LinesCodec>,
        mut outbound_rx: mpsc::Receiver<String>,
    ) {
        let network = self.connection.network.clone();
        let reason = loop {
            tokio::select! {
                line = outbound_rx.recv() => {
                    match line {
                        Some(line) => {
                            debug!(network = %network, line = %line, "-->");
                            if let Err(e) = framed.send(line).await {
                                warn!(network = %network, error = %e, "Write error");
                                break "write error".to_string();
                            }
                        }
                        // All senders dropped: the connection object is gone.
                        None => break "connection dropped".to_string(),
                    }
                }
                line = framed.next() => {
                    match line {
                        Some(Ok(line)) => {
                            debug!(network = %network, line = %line, "<--");
                            if let Some(reason) = self.handle_line(&line).await {
                                break reason;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(network = %network, error = %e, "Read error");
                            break "read error".to_string();
                        }
                        None => break "server closed connection".to_string(),
                    }
                }
            }
        };

        info!(network = %network, reason = %reason, "Session ended");
        let _ = self
            .event_tx
            .send(ConnectionEvent::SessionEnded { reason })
            .await;
    }

    /// React to one server line. Returns `Some(reason)` when the session
    /// is over.
    async fn handle_line(&self, line: &str) -> Option<String> {
        let conn = &self.connection;
        let Some(msg) = parse_line(line) else {
            return None;
        };

        match msg.command {
            "PING" => {
                let token = msg.params.first().copied().unwrap_or("");
                let _ = conn.queue(format!("PONG :{token}")).await;
            }
            // Welcome: registration done, join the configured channels.
            "001" => {
                for channel in &self.channels {
                    let _ = conn.queue(format!("JOIN {channel}")).await;
                }
            }
            // Nick collision: retry with a trailing underscore.
            "433" => {
                let new_nick = format!("{}_", conn.current_nick());
                warn!(network = %conn.network, nick = %new_nick, "Nick in use, retrying");
                *conn.nick.lock() = new_nick.clone();
                let _ = conn.queue(format!("NICK {new_nick}")).await;
            }
            // NAMES reply: params are [me, "=", channel, "nick nick ..."].
            "353" => {
                if msg.params.len() >= 2 {
                    let channel = msg.params[msg.params.len() - 2].to_lowercase();
                    let names = msg.params[msg.params.len() - 1];
                    let mut entry = conn.members.entry(channel).or_default();
                    for name in names.split_whitespace() {
                        entry.insert(strip_rank(name).to_string());
                    }
                }
            }
            "JOIN" => {
                let nick = msg.prefix.map(prefix_nick).unwrap_or_default();
                if let Some(channel) = msg.params.first() {
                    let channel = channel.to_lowercase();
                    conn.members
                        .entry(channel)
                        .or_default()
                        .insert(nick.to_string());
                }
            }
            "PART" => {
                let nick = msg.prefix.map(prefix_nick).unwrap_or_default();
                if let Some(channel) = msg.params.first() {
                    let channel = channel.to_lowercase();
                    if nick == conn.current_nick() {
                        conn.members.remove(&channel);
                    } else if let Some(mut entry) = conn.members.get_mut(&channel) {
                        entry.remove(nick);
                    }
                }
            }
            "KICK" => {
                if msg.params.len() >= 2 {
                    let channel = msg.params[0].to_lowercase();
                    let victim = msg.params[1];
                    if victim == conn.current_nick() {
                        conn.members.remove(&channel);
                    } else if let Some(mut entry) = conn.members.get_mut(&channel) {
                        entry.remove(victim);
                    }
                }
            }
            "QUIT" => {
                let nick = msg.prefix.map(prefix_nick).unwrap_or_default();
                for mut entry in conn.members.iter_mut() {
                    entry.value_mut().remove(nick);
                }
            }
            "NICK" => {
                let old = msg.prefix.map(prefix_nick).unwrap_or_default().to_string();
                if let Some(new) = msg.params.first() {
                    for mut entry in conn.members.iter_mut() {
                        if entry.value_mut().remove(&old) {
                            entry.value_mut().insert((*new).to_string());
                        }
                    }
                    if old == conn.current_nick() {
                        *conn.nick.lock() = (*new).to_string();
                    }
                }
            }
            "PRIVMSG" => {
                if msg.params.len() >= 2 {
                    let sender = msg.prefix.map(prefix_nick).unwrap_or_default();
                    // Never dispatch our own messages back into the bot.
                    if !sender.is_empty() && sender != conn.current_nick() {
                        let target = msg.params[0];
                        let is_private = !is_channel(target);
                        let source = if is_private { sender } else { target };
                        let event = ConnectionEvent::Message(InboundMessage {
                            network: conn.network.clone(),
                            source: source.to_string(),
                            sender: sender.to_string(),
                            is_private,
                            text: msg.params[1].to_string(),
                        });
                        let _ = self.event_tx.send(event).await;
                    }
                }
            }
            "ERROR" => {
                let reason = msg.params.first().copied().unwrap_or("server error");
                return Some(reason.to_string());
            }
            _ => {}
        }
        None
    }
}

// ============================================================================
// Line parsing
// ============================================================================

/// One parsed server line: optional prefix, command, params with the
/// trailing parameter unfolded.
#[derive(Debug, PartialEq)]
struct RawLine<'a> {
    prefix: Option<&'a str>,
    command: &'a str,
    params: Vec<&'a str>,
}

fn parse_line(line: &str) -> Option<RawLine<'_>> {
    let mut rest = line.trim_end_matches(['\r', '\n']);
    if rest.is_empty() {
        return None;
    }

    let prefix = if let Some(stripped) = rest.strip_prefix(':') {
        let (prefix, tail) = stripped.split_once(' ')?;
        rest = tail.trim_start();
        Some(prefix)
    } else {
        None
    };

    let mut params = Vec::new();
    let command = match rest.split_once(' ') {
        Some((command, tail)) => {
            let mut tail = tail.trim_start();
            while !tail.is_empty() {
                if let Some(trailing) = tail.strip_prefix(':') {
                    params.push(trailing);
                    break;
                }
                match tail.split_once(' ') {
                    Some((param, next)) => {
                        params.push(param);
                        tail = next.trim_start();
                    }
                    None => {
                        params.push(tail);
                        break;
                    }
                }
            }
            command
        }
        None => rest,
    };

    if command.is_empty() {
        return None;
    }
    Some(RawLine { prefix, command, params })
}

/// Nick portion of a `nick!user@host` prefix.
fn prefix_nick(prefix: &str) -> &str {
    prefix.split('!').next().unwrap_or(prefix)
}

fn is_channel(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

/// Strip channel-rank sigils from a NAMES entry.
fn strip_rank(name: &str) -> &str {
    name.trim_start_matches(['@', '+', '%', '~', '&'])
}
