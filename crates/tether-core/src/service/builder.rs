//! Builder for configuring an [`RpcService`].

use super::{RpcService, ServiceInner};
use crate::channel::Channel;
use crate::config::ServiceDefaults;
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of ids for implicitly registered entities and async calls.
///
/// Ids only need to be unique per service. Peers generate ids
/// independently, and a service keeps the ids it receives apart from the
/// ids it generates.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Deterministic `prefix` + counter ids, for tests and logs.
///
/// Give each peer its own prefix: replies to this service's calls and
/// settlements of the peer's deferreds share one correlation table.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}

/// Builder for [`RpcService`].
///
/// # Example
///
/// ```rust,ignore
/// use tether_core::{ChannelMode, MemoryChannel, RpcService, SequentialIds};
///
/// let (host_end, client_end) = MemoryChannel::pair(ChannelMode::SyncOnly);
/// let host = RpcService::builder(Arc::new(host_end))
///     .id_generator(SequentialIds::new("host-"))
///     .build()?;
/// ```
pub struct RpcServiceBuilder {
    channel: Arc<dyn Channel>,
    ids: Arc<dyn IdGenerator>,
    early_reply_capacity: usize,
}

impl RpcServiceBuilder {
    pub(crate) fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            ids: Arc::new(UuidGenerator),
            early_reply_capacity: ServiceDefaults::EARLY_REPLY_CAPACITY,
        }
    }

    /// Replace the id generator.
    ///
    /// Default: [`UuidGenerator`]
    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    /// How many replies with a not-yet-known call id are held back.
    ///
    /// The oldest stashed reply is dropped when the stash is full.
    ///
    /// Default: [`ServiceDefaults::EARLY_REPLY_CAPACITY`]
    pub fn early_reply_capacity(mut self, capacity: usize) -> Self {
        self.early_reply_capacity = capacity;
        self
    }

    /// Create the service and register it as the channel's receiver.
    ///
    /// A channel without `receive` yields a send-only service; that is
    /// logged but not an error.
    pub fn build(self) -> Result<RpcService> {
        let inner = Arc::new_cyclic(|weak| {
            ServiceInner::new(
                weak.clone(),
                self.channel,
                self.ids,
                self.early_reply_capacity,
            )
        });
        let service = RpcService { inner };
        service.connect()?;
        Ok(service)
    }
}
