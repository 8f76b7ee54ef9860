//! The RPC service: host registry, proxy factory and message dispatcher.
//!
//! One service sits on each end of a channel. It exposes local entities
//! under string ids, answers the peer's calls against them, and builds
//! proxies for what the peer exposes.
//!
//! # Thread Safety
//!
//! All state lives behind `parking_lot` mutexes inside an `Arc`, so a
//! service can be cloned into tokio tasks spawned by transports. No lock is
//! held while user code runs or while a message is sent, so a sync call's
//! peer may call back into this service before replying.

mod builder;
mod dispatch;
pub(crate) mod host;
pub(crate) mod proxy;

pub use builder::{IdGenerator, RpcServiceBuilder, SequentialIds, UuidGenerator};

use crate::channel::{message_handler, send_oneway, Channel};
use crate::deferred::Deferred;
use crate::descriptor::{ClassDescriptor, FunctionDescriptor, ObjectDescriptor};
use crate::error::{Result, TetherError};
use crate::object::{Class, Function, FunctionInner, Object, ObjectInner};
use crate::protocol::{
    self, CallType, ClassEntry, DescriptorSet, ObjectEntry, ReplyMessage, RpcMessage,
};
use crate::liveness::LivenessRegistry;
use crate::serialize::Marshal;
use crate::value::Value;
use host::{HostEntry, HostRegistry, RouteKey};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// A bidirectional RPC endpoint over one channel.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RpcService {
    inner: Arc<ServiceInner>,
}

pub(crate) struct ServiceInner {
    self_ref: Weak<ServiceInner>,
    pub(crate) channel: Arc<dyn Channel>,
    ids: Arc<dyn IdGenerator>,
    pub(crate) host: HostRegistry,
    remote: Mutex<DescriptorSet>,
    descriptor_waiters: Mutex<Vec<Deferred>>,
    /// Proxies with a liveness guard, held weakly.
    proxy_functions: LivenessRegistry<FunctionInner>,
    proxy_objects: LivenessRegistry<ObjectInner>,
    /// Proxies of explicitly exposed entities, held for the service lifetime
    /// and keyed by the route that reaches them.
    exposed_functions: Mutex<HashMap<(RouteKey, String), Function>>,
    exposed_objects: Mutex<HashMap<(RouteKey, String), Object>>,
    proxy_classes: Mutex<HashMap<(RouteKey, String), Class>>,
    /// Async calls and inbound deferreds waiting for a `fn_reply`.
    pending: Mutex<HashMap<String, Deferred>>,
    early_replies: Mutex<VecDeque<ReplyMessage>>,
    early_reply_capacity: usize,
    /// Proxies carried back to their origin by the last sync reply. The peer
    /// has read that reply by the time it sends anything else.
    pinned: Mutex<Vec<Value>>,
}

impl RpcService {
    /// Create a service with default settings.
    pub fn new(channel: Arc<dyn Channel>) -> Result<Self> {
        Self::builder(channel).build()
    }

    pub fn builder(channel: Arc<dyn Channel>) -> RpcServiceBuilder {
        RpcServiceBuilder::new(channel)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ServiceInner> {
        &self.inner
    }

    fn connect(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let handler = message_handler(move |message, reply_to| {
            let inner = weak.upgrade()?;
            inner.handle_message(message, reply_to)
        });
        match self.inner.channel.receive(handler) {
            Ok(()) => Ok(()),
            Err(TetherError::Unsupported(_)) => {
                warn!("Channel has no receive; service can only send");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ========================================
    // Host registration
    // ========================================

    /// Expose `object` to the peer under `id`.
    pub fn register_host_object(
        &self,
        id: impl Into<String>,
        object: Object,
        descriptor: ObjectDescriptor,
    ) {
        let id = id.into();
        debug!("Registering host object {}", id);
        self.inner
            .host
            .expose(&id, HostEntry::Object { object, descriptor });
    }

    /// Expose `function` to the peer under `id`.
    pub fn register_host_function(
        &self,
        id: impl Into<String>,
        function: Function,
        descriptor: FunctionDescriptor,
    ) {
        let id = id.into();
        debug!("Registering host function {}", id);
        self.inner
            .host
            .expose(&id, HostEntry::Function { function, descriptor });
    }

    /// Expose `class` under its class id.
    ///
    /// Instances of a registered class are sent by reference: the peer gets
    /// a proxy instance sharing the proxy class's prototype.
    pub fn register_host_class(&self, class: Class, descriptor: ClassDescriptor) {
        let class_id = class.id().to_string();
        debug!("Registering host class {}", class_id);
        let descriptor = ClassDescriptor {
            class_id: class_id.clone(),
            ..descriptor
        };
        self.inner
            .host
            .expose(&class_id, HostEntry::Class { class, descriptor });
    }

    // ========================================
    // Descriptor exchange
    // ========================================

    /// Push this side's descriptors to the peer, or to `reply_to`.
    pub fn send_remote_descriptors(&self, reply_to: Option<Arc<dyn Channel>>) -> Result<()> {
        let route = reply_to.unwrap_or_else(|| self.inner.channel.clone());
        let marshal = Marshal::new(&self.inner, &route);
        let set = self.inner.descriptor_set(&marshal)?;
        send_oneway(
            route.as_ref(),
            protocol::encode(&RpcMessage::Descriptors(set))?,
        )
    }

    /// Ask the peer for its descriptors.
    ///
    /// Over a channel with sync send the returned deferred is already
    /// settled; otherwise it settles when the `descriptors` message arrives.
    pub fn request_remote_descriptors(&self) -> Result<Deferred> {
        self.inner.request_remote_descriptors()
    }

    /// The descriptors last received from the peer.
    pub fn remote_descriptors(&self) -> DescriptorSet {
        self.inner.remote.lock().clone()
    }

    // ========================================
    // Proxies
    // ========================================

    /// Proxy for the peer's object exposed under `id`.
    ///
    /// Repeated calls return the same proxy.
    pub fn get_proxy_object(&self, id: &str) -> Result<Object> {
        self.inner.exposed_proxy_object(id, &self.inner.channel)
    }

    /// Proxy for the peer's function exposed under `id`.
    pub fn get_proxy_function(&self, id: &str) -> Result<Function> {
        self.inner.exposed_proxy_function(id, &self.inner.channel)
    }

    /// Proxy for the peer's class `class_id`.
    pub fn get_proxy_class(&self, class_id: &str) -> Result<Class> {
        self.inner.exposed_proxy_class(class_id, &self.inner.channel)
    }

    // ========================================
    // Inbound
    // ========================================

    /// Process one inbound message, returning the sync reply if any.
    ///
    /// Transports normally call this through the handler registered at build
    /// time; it is public for transports that deliver messages themselves.
    pub fn handle_message(
        &self,
        message: JsonValue,
        reply_to: Option<Arc<dyn Channel>>,
    ) -> Option<JsonValue> {
        self.inner.handle_message(message, reply_to)
    }

    // ========================================
    // Introspection
    // ========================================

    /// Number of entries in the host registry, exposed and implicit.
    pub fn host_entry_count(&self) -> usize {
        self.inner.host.len()
    }

    /// Async calls and inbound deferreds still waiting for a reply.
    pub fn pending_call_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Proxies of implicitly shared entities that are still reachable.
    pub fn live_proxy_count(&self) -> usize {
        self.inner.proxy_functions.live_count() + self.inner.proxy_objects.live_count()
    }
}

impl ServiceInner {
    fn new(
        self_ref: Weak<ServiceInner>,
        channel: Arc<dyn Channel>,
        ids: Arc<dyn IdGenerator>,
        early_reply_capacity: usize,
    ) -> Self {
        Self {
            self_ref,
            channel,
            ids,
            host: HostRegistry::default(),
            remote: Mutex::new(DescriptorSet::default()),
            descriptor_waiters: Mutex::new(Vec::new()),
            proxy_functions: LivenessRegistry::new(),
            proxy_objects: LivenessRegistry::new(),
            exposed_functions: Mutex::new(HashMap::new()),
            exposed_objects: Mutex::new(HashMap::new()),
            proxy_classes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            early_replies: Mutex::new(VecDeque::new()),
            early_reply_capacity,
            pinned: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn next_id(&self) -> String {
        self.ids.next_id()
    }

    pub(crate) fn weak(&self) -> Weak<ServiceInner> {
        self.self_ref.clone()
    }

    pub(crate) fn is_self(&self, other: &Weak<ServiceInner>) -> bool {
        Weak::ptr_eq(&self.self_ref, other)
    }

    pub(crate) fn pin_reply(&self, values: Vec<Value>) {
        if !values.is_empty() {
            self.pinned.lock().extend(values);
        }
    }

    /// Release pinned proxies. Dropping them may send `obj_died`, so this
    /// runs outside the lock.
    pub(crate) fn unpin_all(&self) {
        let released = std::mem::take(&mut *self.pinned.lock());
        drop(released);
    }

    // ========================================
    // Descriptors
    // ========================================

    /// Descriptors of everything explicitly exposed, with read-once values.
    pub(crate) fn descriptor_set(&self, marshal: &Marshal<'_>) -> Result<DescriptorSet> {
        let mut set = DescriptorSet::default();

        for (id, entry) in self.host.exposed() {
            match entry {
                HostEntry::Object { object, descriptor } => {
                    let props = read_once_values(marshal, &object, &descriptor)?;
                    set.objects.insert(id, ObjectEntry { descriptor, props });
                }
                HostEntry::Function { descriptor, .. } => {
                    set.functions.insert(id, descriptor);
                }
                HostEntry::Class { class, descriptor } => {
                    let static_props =
                        read_once_values(marshal, &class.statics(), &descriptor.statics)?;
                    set.classes.insert(
                        id,
                        ClassEntry {
                            descriptor,
                            static_props,
                        },
                    );
                }
                HostEntry::Promise { .. } => {}
            }
        }
        Ok(set)
    }

    pub(crate) fn store_remote_descriptors(&self, set: DescriptorSet) {
        info!(
            "Received remote descriptors: {} objects, {} functions, {} classes",
            set.objects.len(),
            set.functions.len(),
            set.classes.len()
        );
        *self.remote.lock() = set;
        let waiters = std::mem::take(&mut *self.descriptor_waiters.lock());
        for waiter in waiters {
            waiter.resolve(Value::Null);
        }
    }

    fn request_remote_descriptors(&self) -> Result<Deferred> {
        let channel = &self.channel;
        if channel.supports_sync() {
            let request = protocol::encode(&RpcMessage::GetDescriptors {
                call_type: CallType::Sync,
            })?;
            let response = channel.send_sync(request)?;
            self.unpin_all();
            let response = response.ok_or_else(|| TetherError::protocol("missing response"))?;
            return match protocol::decode(response)? {
                Some(RpcMessage::Descriptors(set)) => {
                    self.store_remote_descriptors(set);
                    Ok(Deferred::resolved(Value::Null))
                }
                Some(other) => Err(TetherError::protocol(format!(
                    "expected descriptors, got {}",
                    other.action_name()
                ))),
                None => Err(TetherError::protocol(
                    "response is missing the protocol marker",
                )),
            };
        }
        if channel.supports_async() {
            let waiter = Deferred::new();
            self.descriptor_waiters.lock().push(waiter.clone());
            let request = protocol::encode(&RpcMessage::GetDescriptors {
                call_type: CallType::Async,
            })?;
            channel.send_async(request)?;
            return Ok(waiter);
        }
        Err(TetherError::Unsupported("sending"))
    }

    // ========================================
    // Reply correlation
    // ========================================

    /// Turn a reply into the caller-visible outcome.
    pub(crate) fn reply_outcome(&self, route: &Arc<dyn Channel>, reply: ReplyMessage) -> Result<Value> {
        if reply.success {
            Marshal::new(self, route).deserialize(reply.result, None)
        } else {
            let message = match reply.result {
                JsonValue::String(s) => s,
                other => other.to_string(),
            };
            Err(TetherError::Remote(message))
        }
    }

    /// Settle the pending entry for an inbound `fn_reply`, or stash it.
    pub(crate) fn accept_reply(&self, route: &Arc<dyn Channel>, reply: ReplyMessage) {
        let Some(call_id) = reply.call_id.clone() else {
            warn!("Dropping fn_reply without callId");
            return;
        };
        let waiting = {
            let mut pending = self.pending.lock();
            match pending.remove(&call_id) {
                Some(deferred) => deferred,
                None => {
                    self.stash_early_reply(reply);
                    return;
                }
            }
        };
        let outcome = self.reply_outcome(route, reply);
        waiting.settle(outcome);
    }

    fn stash_early_reply(&self, reply: ReplyMessage) {
        if self.early_reply_capacity == 0 {
            warn!("Dropping fn_reply for unknown callId {:?}", reply.call_id);
            return;
        }
        debug!("Stashing fn_reply for unknown callId {:?}", reply.call_id);
        let mut stash = self.early_replies.lock();
        if stash.len() >= self.early_reply_capacity {
            if let Some(dropped) = stash.pop_front() {
                warn!("Early reply stash full; dropping {:?}", dropped.call_id);
            }
        }
        stash.push_back(reply);
    }

    /// Register a deferred that settles when the reply for `id` arrives.
    pub(crate) fn await_reply(&self, route: &Arc<dyn Channel>, id: &str) -> Deferred {
        let deferred = Deferred::new();
        let early = {
            let mut pending = self.pending.lock();
            let mut stash = self.early_replies.lock();
            match stash.iter().position(|r| r.call_id.as_deref() == Some(id)) {
                Some(pos) => stash.remove(pos),
                None => {
                    pending.insert(id.to_string(), deferred.clone());
                    None
                }
            }
        };
        if let Some(reply) = early {
            deferred.settle(self.reply_outcome(route, reply));
        }
        deferred
    }

    pub(crate) fn forget_pending(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    /// Send the `fn_reply` settling an async call or an outbound deferred.
    pub(crate) fn send_async_reply(
        &self,
        route: &Arc<dyn Channel>,
        call_id: &str,
        outcome: Result<Value>,
    ) {
        let marshal = Marshal::new(self, route);
        let Some(reply) = self.reply_json(&marshal, CallType::Async, Some(call_id), outcome) else {
            return;
        };
        if let Err(e) = send_oneway(route.as_ref(), reply) {
            warn!("Failed to send reply for {}: {}", call_id, e);
        }
    }

    /// Encode an `fn_reply`, turning serialization failures into a failure
    /// reply.
    pub(crate) fn reply_json(
        &self,
        marshal: &Marshal<'_>,
        call_type: CallType,
        call_id: Option<&str>,
        outcome: Result<Value>,
    ) -> Option<JsonValue> {
        let (success, result) = match outcome.and_then(|v| marshal.serialize(&v, None)) {
            Ok(json) => (true, json),
            Err(e) => (false, JsonValue::String(e.to_wire_message())),
        };
        let reply = RpcMessage::FnReply(ReplyMessage {
            call_type,
            call_id: call_id.map(str::to_string),
            success,
            result,
        });
        match protocol::encode(&reply) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!("Failed to encode reply: {}", e);
                None
            }
        }
    }
}

/// Current values of an object's read-once properties, serialized.
fn read_once_values(
    marshal: &Marshal<'_>,
    object: &Object,
    descriptor: &ObjectDescriptor,
) -> Result<BTreeMap<String, JsonValue>> {
    descriptor
        .readonly_properties
        .iter()
        .map(|name| {
            let value = object.get(name)?;
            Ok((name.clone(), marshal.serialize(&value, None)?))
        })
        .collect()
}
