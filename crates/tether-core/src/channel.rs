//! The channel contract and an in-process channel pair.
//!
//! A channel may support synchronous sends, asynchronous sends, or both.
//! The service adapts its call strategy to whatever the channel offers.
//! Inbound messages are delivered to a registered handler together with an
//! optional reply channel, for transports that can only answer a specific
//! sender (a server with many clients) rather than originate sends.

use crate::error::{Result, TetherError};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delivers an inbound message. The return value is the synchronous reply,
/// used only when the message arrived through a sync send.
pub type MessageHandler =
    Arc<dyn Fn(JsonValue, Option<Arc<dyn Channel>>) -> Option<JsonValue> + Send + Sync>;

/// Wrap a closure as a [`MessageHandler`].
pub fn message_handler<F>(handler: F) -> MessageHandler
where
    F: Fn(JsonValue, Option<Arc<dyn Channel>>) -> Option<JsonValue> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// A message channel to a peer.
///
/// Every method has a default that reports the capability as missing, so a
/// transport implements only what it supports.
pub trait Channel: Send + Sync {
    fn supports_sync(&self) -> bool {
        false
    }

    fn supports_async(&self) -> bool {
        false
    }

    /// Send and block until the peer's handler returns its reply.
    fn send_sync(&self, _message: JsonValue) -> Result<Option<JsonValue>> {
        Err(TetherError::Unsupported("synchronous send"))
    }

    /// Send without waiting.
    fn send_async(&self, _message: JsonValue) -> Result<()> {
        Err(TetherError::Unsupported("asynchronous send"))
    }

    /// Register the inbound message handler.
    fn receive(&self, _handler: MessageHandler) -> Result<()> {
        Err(TetherError::Unsupported("receive"))
    }
}

/// Send a message that expects no reply, preferring asynchronous delivery.
pub fn send_oneway(channel: &dyn Channel, message: JsonValue) -> Result<()> {
    if channel.supports_async() {
        channel.send_async(message)
    } else if channel.supports_sync() {
        channel.send_sync(message).map(|_| ())
    } else {
        Err(TetherError::Unsupported("sending"))
    }
}

/// Which send operations a [`MemoryChannel`] pair offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    SyncOnly,
    AsyncOnly,
    Both,
}

impl ChannelMode {
    fn sync(self) -> bool {
        matches!(self, ChannelMode::SyncOnly | ChannelMode::Both)
    }

    fn asynchronous(self) -> bool {
        matches!(self, ChannelMode::AsyncOnly | ChannelMode::Both)
    }
}

#[derive(Default)]
struct Endpoint {
    handler: Mutex<Option<MessageHandler>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<JsonValue>>>,
}

/// One end of an in-process channel pair.
///
/// Sync sends call the peer's handler directly on the caller's thread, so a
/// handler may itself send back before returning (reentrant round trips).
/// Async sends are queued and delivered in order by a tokio task started
/// when the peer registers its handler.
#[derive(Clone)]
pub struct MemoryChannel {
    mode: ChannelMode,
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
    outbox: mpsc::UnboundedSender<JsonValue>,
}

impl MemoryChannel {
    /// Create two connected ends.
    pub fn pair(mode: ChannelMode) -> (MemoryChannel, MemoryChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Endpoint {
            handler: Mutex::new(None),
            inbox: Mutex::new(Some(a_rx)),
        });
        let b = Arc::new(Endpoint {
            handler: Mutex::new(None),
            inbox: Mutex::new(Some(b_rx)),
        });

        (
            MemoryChannel {
                mode,
                local: a.clone(),
                peer: b.clone(),
                outbox: b_tx,
            },
            MemoryChannel {
                mode,
                local: b,
                peer: a,
                outbox: a_tx,
            },
        )
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }
}

impl Channel for MemoryChannel {
    fn supports_sync(&self) -> bool {
        self.mode.sync()
    }

    fn supports_async(&self) -> bool {
        self.mode.asynchronous()
    }

    fn send_sync(&self, message: JsonValue) -> Result<Option<JsonValue>> {
        if !self.mode.sync() {
            return Err(TetherError::Unsupported("synchronous send"));
        }
        // Clone out of the lock: the handler may send on this pair again.
        let handler = self.peer.handler.lock().clone();
        match handler {
            Some(handler) => Ok(handler(message, None)),
            None => Err(TetherError::ChannelClosed),
        }
    }

    fn send_async(&self, message: JsonValue) -> Result<()> {
        if !self.mode.asynchronous() {
            return Err(TetherError::Unsupported("asynchronous send"));
        }
        self.outbox
            .send(message)
            .map_err(|_| TetherError::ChannelClosed)
    }

    fn receive(&self, handler: MessageHandler) -> Result<()> {
        *self.local.handler.lock() = Some(handler.clone());

        if !self.mode.asynchronous() {
            return Ok(());
        }
        let Some(mut inbox) = self.local.inbox.lock().take() else {
            warn!("Memory channel handler replaced; async delivery keeps the first pump");
            return Ok(());
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TetherError::Unsupported("asynchronous delivery outside a tokio runtime"))?;

        runtime.spawn(async move {
            while let Some(message) = inbox.recv().await {
                if handler(message, None).is_some() {
                    debug!("Dropping sync reply produced for an async delivery");
                }
            }
            debug!("Memory channel pump finished");
        });
        Ok(())
    }
}
