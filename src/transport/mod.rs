//! Transport seam between the core and the wire protocol.
//!
//! The supervisor and dispatcher only ever see these traits and event
//! types; the IRC client in [`irc`] is one implementation, the tests
//! provide another.

pub mod irc;

pub use irc::{IrcConnection, IrcConnectionFactory};

use crate::config::NetworkConfig;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection's outbound queue is gone (session already closed).
    #[error("connection closed")]
    Closed,
}

/// One inbound chat message, as delivered to the dispatcher.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Network the message arrived on.
    pub network: String,
    /// Reply target: the channel, or the sender's nick for private messages.
    pub source: String,
    /// Nick of the user who sent the message.
    pub sender: String,
    /// Whether this was a private message rather than channel traffic.
    pub is_private: bool,
    /// Full message text.
    pub text: String,
}

/// Events a connection emits on its event channel.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// An inbound chat message.
    Message(InboundMessage),
    /// The session closed (server disconnect, kick from the network,
    /// transport failure). Emitted exactly once, last.
    SessionEnded { reason: String },
}

/// One live session to one network.
///
/// Implementations must be cheap to share (`Arc`) and safe to call from
/// both the primary dispatch context and worker-pool tasks.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Network identifier this connection belongs to.
    fn network(&self) -> &str;

    /// Send a message to a channel or nick.
    async fn send(&self, target: &str, text: &str) -> Result<(), TransportError>;

    /// Leave the network with a parting message. The session-ended event
    /// follows once the server closes the link.
    async fn quit(&self, message: &str) -> Result<(), TransportError>;

    /// Known members of a channel. Empty when the bot is not in it.
    fn channel_members(&self, channel: &str) -> HashSet<String>;
}

/// Constructs connections for the supervisor.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection to `network` and return it together with the
    /// receiving end of its event channel.
    async fn connect(
        &self,
        network: &str,
        config: &NetworkConfig,
    ) -> Result<(Arc<dyn Connection>, mpsc::Receiver<ConnectionEvent>), TransportError>;
}
