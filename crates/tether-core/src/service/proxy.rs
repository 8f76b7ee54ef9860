//! Proxies for remote functions, objects and classes.
//!
//! A proxy carries the remote id, the descriptor it was generated from and a
//! [`RemoteLink`] back to the owning service and the channel that reaches
//! the remote side. Implicitly shared proxies also carry a
//! [`DisposeGuard`]; explicitly exposed ones and class static sides do not,
//! since the host never releases those.
//!
//! Every call goes through [`ServiceInner::invoke_remote`], which picks one
//! of three strategies from the declared return behavior and what the
//! channel supports:
//!
//! | declared | channel has       | strategy                               |
//! |----------|-------------------|----------------------------------------|
//! | sync     | sync send         | block for the reply                    |
//! | sync     | async send only   | send with a call id, return a deferred |
//! | async    | async send        | send with a call id, return a deferred |
//! | async    | sync send only    | block, wrap the outcome in a deferred  |
//! | void     | either            | send, return null                      |

use super::host::RouteKey;
use super::ServiceInner;
use crate::channel::{send_oneway, Channel};
use crate::deferred::Deferred;
use crate::descriptor::{ClassDescriptor, Descriptor, FunctionDescriptor, ObjectDescriptor, Returns};
use crate::error::{Result, TetherError};
use crate::liveness::{DisposeCallback, DisposeGuard, DisposeReason};
use crate::object::{Class, ClassInner, Function, FunctionInner, Object, ObjectInner};
use crate::protocol::{self, CallAction, CallMessage, CallType, RpcMessage};
use crate::serialize::Marshal;
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Where a proxy sends its calls.
pub(crate) struct RemoteLink {
    pub(crate) service: Weak<ServiceInner>,
    pub(crate) route: Arc<dyn Channel>,
}

impl RemoteLink {
    fn service(&self) -> Result<Arc<ServiceInner>> {
        self.service.upgrade().ok_or(TetherError::ServiceDropped)
    }

    /// True if this link reaches the peer that `route` reaches, through
    /// `service`.
    pub(crate) fn is_route(&self, service: &ServiceInner, route: &Arc<dyn Channel>) -> bool {
        service.is_self(&self.service) && same_channel(&self.route, route)
    }
}

pub(crate) fn same_channel(a: &Arc<dyn Channel>, b: &Arc<dyn Channel>) -> bool {
    RouteKey::of(a) == RouteKey::of(b)
}

// ============================================================================
// Proxy types
// ============================================================================

pub(crate) struct ProxyFunction {
    pub(crate) id: String,
    pub(crate) descriptor: FunctionDescriptor,
    pub(crate) link: RemoteLink,
    guard: Option<DisposeGuard>,
}

impl ProxyFunction {
    pub(crate) fn call(&self, args: Vec<Value>) -> Result<Value> {
        if self.is_disposed() {
            return Err(TetherError::Disposed {
                id: self.id.clone(),
            });
        }
        self.link.service()?.invoke_remote(
            &self.link.route,
            CallAction::Function,
            &self.id,
            None,
            args,
            &self.descriptor,
        )
    }

    pub(crate) fn dispose(&self) -> bool {
        self.guard.as_ref().is_some_and(DisposeGuard::dispose)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.guard.as_ref().is_some_and(DisposeGuard::is_disposed)
    }
}

/// The member table shared by every instance of a proxy class.
#[derive(Default)]
pub(crate) struct ProxyPrototype {
    pub(crate) descriptor: ObjectDescriptor,
}

pub(crate) struct ProxyObject {
    pub(crate) id: String,
    pub(crate) class: Option<Class>,
    pub(crate) prototype: Arc<ProxyPrototype>,
    /// Read-once values shipped with the descriptor or the reference token.
    props: BTreeMap<String, Value>,
    pub(crate) link: RemoteLink,
    guard: Option<DisposeGuard>,
}

impl ProxyObject {
    fn check_alive(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(TetherError::Disposed {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Read a member: a shipped value, a bound method, or a proxied
    /// property round trip.
    pub(crate) fn get(&self, handle: &Object, name: &str) -> Result<Value> {
        if let Some(value) = self.props.get(name) {
            return Ok(value.clone());
        }
        self.check_alive()?;
        match self.prototype.descriptor.member(name) {
            Some(Descriptor::Function(_)) => Ok(Value::Function(Function::from_inner(Arc::new(
                FunctionInner::Method {
                    object: handle.clone(),
                    name: name.to_string(),
                },
            )))),
            Some(Descriptor::Property(property)) => self.link.service()?.invoke_remote(
                &self.link.route,
                CallAction::PropertyGet,
                &self.id,
                Some(name),
                Vec::new(),
                &FunctionDescriptor::with_returns(property.get_returns()),
            ),
            Some(Descriptor::Object(_) | Descriptor::Class(_)) | None => {
                Err(TetherError::NoMember {
                    name: name.to_string(),
                })
            }
        }
    }

    pub(crate) fn set(&self, name: &str, value: Value) -> Result<()> {
        let readonly = || TetherError::Readonly {
            name: name.to_string(),
        };
        if self.props.contains_key(name) || self.prototype.descriptor.is_readonly_property(name) {
            return Err(readonly());
        }
        self.check_alive()?;
        match self.prototype.descriptor.member(name) {
            Some(Descriptor::Property(property)) if property.readonly => Err(readonly()),
            Some(Descriptor::Property(property)) => {
                let outcome = self.link.service()?.invoke_remote(
                    &self.link.route,
                    CallAction::PropertySet,
                    &self.id,
                    Some(name),
                    vec![value],
                    &FunctionDescriptor::with_returns(property.set_returns()),
                )?;
                if let Value::Promise(pending) = outcome {
                    let name = name.to_string();
                    pending.on_settled(move |outcome| {
                        if let Err(e) = outcome {
                            warn!("Async write of {} failed: {}", name, e);
                        }
                    });
                }
                Ok(())
            }
            Some(Descriptor::Function(_)) => Err(readonly()),
            Some(Descriptor::Object(_) | Descriptor::Class(_)) | None => {
                Err(TetherError::NoMember {
                    name: name.to_string(),
                })
            }
        }
    }

    pub(crate) fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.check_alive()?;
        let descriptor = self
            .prototype
            .descriptor
            .find_function(name)
            .ok_or_else(|| TetherError::NoMember {
                name: name.to_string(),
            })?;
        self.link.service()?.invoke_remote(
            &self.link.route,
            CallAction::Method,
            &self.id,
            Some(name),
            args,
            &descriptor,
        )
    }

    pub(crate) fn dispose(&self) -> bool {
        self.guard.as_ref().is_some_and(DisposeGuard::dispose)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.guard.as_ref().is_some_and(DisposeGuard::is_disposed)
    }
}

pub(crate) struct ProxyClass {
    pub(crate) class_id: String,
    descriptor: ClassDescriptor,
    pub(crate) prototype: Arc<ProxyPrototype>,
    pub(crate) statics: Object,
    link: RemoteLink,
}

impl ProxyClass {
    pub(crate) fn construct(&self, args: Vec<Value>) -> Result<Value> {
        self.link.service()?.invoke_remote(
            &self.link.route,
            CallAction::Constructor,
            &self.class_id,
            None,
            args,
            &self.descriptor.ctor_descriptor(),
        )
    }
}

// ============================================================================
// Outbound calls and proxy construction
// ============================================================================

/// Which liveness registry a disposed proxy is evicted from.
#[derive(Clone, Copy)]
enum ProxyKind {
    Function,
    Object,
}

/// Pick the call type the channel can carry for the declared behavior.
pub(crate) fn effective_call_type(channel: &dyn Channel, declared: Returns) -> Result<CallType> {
    let (sync, asynchronous) = (channel.supports_sync(), channel.supports_async());
    match CallType::from(declared) {
        CallType::Sync if sync => Ok(CallType::Sync),
        CallType::Sync if asynchronous => Ok(CallType::Async),
        CallType::Async if asynchronous => Ok(CallType::Async),
        CallType::Async if sync => Ok(CallType::Sync),
        CallType::Void if sync || asynchronous => Ok(CallType::Void),
        _ => Err(TetherError::Unsupported("sending")),
    }
}

impl ServiceInner {
    /// Send a call message and produce the caller-visible result.
    ///
    /// Unwrap tokens among `args` stay pinned until the message has been
    /// sent, or for a sync call until the reply is back.
    pub(crate) fn invoke_remote(
        &self,
        route: &Arc<dyn Channel>,
        action: CallAction,
        obj_id: &str,
        prop: Option<&str>,
        args: Vec<Value>,
        descriptor: &FunctionDescriptor,
    ) -> Result<Value> {
        let call_type = effective_call_type(route.as_ref(), descriptor.returns)?;
        let marshal = Marshal::new(self, route);
        let args = args
            .iter()
            .enumerate()
            .map(|(i, arg)| marshal.serialize(arg, descriptor.argument_at(i)))
            .collect::<Result<Vec<_>>>()?;
        let mut call = CallMessage {
            call_type,
            obj_id: obj_id.to_string(),
            prop: prop.map(str::to_string),
            args,
            call_id: None,
        };

        match call_type {
            CallType::Sync => {
                let message = protocol::encode(&RpcMessage::call(action, call))?;
                let response = route.send_sync(message);
                // The peer has read any earlier sync reply of ours by now.
                self.unpin_all();
                let reply = protocol::decode_reply(response?)?;
                let outcome = self.reply_outcome(route, reply);
                drop(marshal);
                if descriptor.returns != Returns::Async {
                    return outcome;
                }
                match outcome {
                    Ok(Value::Promise(deferred)) => Ok(Value::Promise(deferred)),
                    other => Ok(Value::Promise(Deferred::from_result(other))),
                }
            }
            CallType::Async => {
                let call_id = self.next_id();
                call.call_id = Some(call_id.clone());
                let deferred = self.await_reply(route, &call_id);
                let sent = protocol::encode(&RpcMessage::call(action, call))
                    .and_then(|message| route.send_async(message));
                if let Err(e) = sent {
                    self.forget_pending(&call_id);
                    return Err(e);
                }
                Ok(Value::Promise(deferred))
            }
            CallType::Void => {
                send_oneway(
                    route.as_ref(),
                    protocol::encode(&RpcMessage::call(action, call))?,
                )?;
                Ok(Value::Null)
            }
        }
    }

    fn link(&self, route: &Arc<dyn Channel>) -> RemoteLink {
        RemoteLink {
            service: self.weak(),
            route: route.clone(),
        }
    }

    fn dispose_callback(&self, route: &Arc<dyn Channel>, kind: ProxyKind) -> DisposeCallback {
        let service = self.weak();
        let route = route.clone();
        Arc::new(move |id: &str, reason: DisposeReason| {
            let Some(service) = service.upgrade() else {
                return;
            };
            match (kind, reason) {
                (ProxyKind::Function, DisposeReason::Explicit) => {
                    service.proxy_functions.remove(id);
                }
                (ProxyKind::Function, DisposeReason::Dropped) => {
                    service.proxy_functions.remove_if_dead(id);
                }
                (ProxyKind::Object, DisposeReason::Explicit) => {
                    service.proxy_objects.remove(id);
                }
                (ProxyKind::Object, DisposeReason::Dropped) => {
                    service.proxy_objects.remove_if_dead(id);
                }
            }
            debug!("Proxy {} disposed ({:?})", id, reason);
            let notice = protocol::encode(&RpcMessage::ObjDied {
                obj_id: id.to_string(),
            });
            if let Err(e) = notice.and_then(|message| send_oneway(route.as_ref(), message)) {
                warn!("Failed to notify peer that {} died: {}", id, e);
            }
        })
    }

    /// Memoized proxy for an implicitly shared remote function.
    pub(crate) fn proxy_function(
        &self,
        id: &str,
        descriptor: FunctionDescriptor,
        route: &Arc<dyn Channel>,
    ) -> Function {
        let inner = self.proxy_functions.get_or_insert_with(id, || {
            Arc::new(FunctionInner::Proxy(ProxyFunction {
                id: id.to_string(),
                descriptor,
                link: self.link(route),
                guard: Some(DisposeGuard::new(
                    id,
                    self.dispose_callback(route, ProxyKind::Function),
                )),
            }))
        });
        Function::from_inner(inner)
    }

    /// Memoized proxy for a remote class instance.
    pub(crate) fn proxy_instance(
        &self,
        class_id: &str,
        id: &str,
        props: BTreeMap<String, Value>,
        route: &Arc<dyn Channel>,
    ) -> Result<Object> {
        let class = self.proxy_class(class_id, route)?;
        let prototype = class
            .as_proxy()
            .map(|p| p.prototype.clone())
            .unwrap_or_default();
        let inner = self.proxy_objects.get_or_insert_with(id, || {
            Arc::new(ObjectInner::Proxy(ProxyObject {
                id: id.to_string(),
                class: Some(class),
                prototype,
                props,
                link: self.link(route),
                guard: Some(DisposeGuard::new(
                    id,
                    self.dispose_callback(route, ProxyKind::Object),
                )),
            }))
        });
        Ok(Object::from_inner(inner))
    }

    /// Proxy for a function the peer behind `route` exposed under `id`.
    pub(crate) fn exposed_proxy_function(
        &self,
        id: &str,
        route: &Arc<dyn Channel>,
    ) -> Result<Function> {
        let key = (RouteKey::of(route), id.to_string());
        if let Some(existing) = self.exposed_functions.lock().get(&key) {
            return Ok(existing.clone());
        }
        let descriptor = self
            .remote
            .lock()
            .functions
            .get(id)
            .cloned()
            .ok_or_else(|| TetherError::NoObject { id: id.to_string() })?;
        let created = Function::from_inner(Arc::new(FunctionInner::Proxy(ProxyFunction {
            id: id.to_string(),
            descriptor,
            link: self.link(route),
            guard: None,
        })));
        Ok(self
            .exposed_functions
            .lock()
            .entry(key)
            .or_insert(created)
            .clone())
    }

    /// Proxy for an object the peer behind `route` exposed under `id`.
    pub(crate) fn exposed_proxy_object(&self, id: &str, route: &Arc<dyn Channel>) -> Result<Object> {
        let key = (RouteKey::of(route), id.to_string());
        if let Some(existing) = self.exposed_objects.lock().get(&key) {
            return Ok(existing.clone());
        }
        let entry = self
            .remote
            .lock()
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| TetherError::NoObject { id: id.to_string() })?;
        let props = Marshal::new(self, route).deserialize_map(entry.props)?;
        let created = Object::from_inner(Arc::new(ObjectInner::Proxy(ProxyObject {
            id: id.to_string(),
            class: None,
            prototype: Arc::new(ProxyPrototype {
                descriptor: entry.descriptor,
            }),
            props,
            link: self.link(route),
            guard: None,
        })));
        Ok(self
            .exposed_objects
            .lock()
            .entry(key)
            .or_insert(created)
            .clone())
    }

    pub(crate) fn exposed_proxy_class(
        &self,
        class_id: &str,
        route: &Arc<dyn Channel>,
    ) -> Result<Class> {
        if !self.remote.lock().classes.contains_key(class_id) {
            return Err(TetherError::NoClass {
                class_id: class_id.to_string(),
            });
        }
        self.proxy_class(class_id, route)
    }

    /// Memoized proxy class. A class the peer never described gets an empty
    /// prototype, so its instances expose only their shipped values.
    fn proxy_class(&self, class_id: &str, route: &Arc<dyn Channel>) -> Result<Class> {
        let key = (RouteKey::of(route), class_id.to_string());
        if let Some(existing) = self.proxy_classes.lock().get(&key) {
            return Ok(existing.clone());
        }
        let entry = self.remote.lock().classes.get(class_id).cloned();
        let (descriptor, static_props) = match entry {
            Some(entry) => (entry.descriptor, entry.static_props),
            None => {
                warn!("No descriptor for remote class {}", class_id);
                (ClassDescriptor::new(class_id), BTreeMap::new())
            }
        };
        let static_props = Marshal::new(self, route).deserialize_map(static_props)?;

        let statics = Object::from_inner(Arc::new(ObjectInner::Proxy(ProxyObject {
            id: class_id.to_string(),
            class: None,
            prototype: Arc::new(ProxyPrototype {
                descriptor: descriptor.statics.clone(),
            }),
            props: static_props,
            link: self.link(route),
            guard: None,
        })));
        let created = Class::from_inner(Arc::new(ClassInner::Proxy(ProxyClass {
            class_id: class_id.to_string(),
            prototype: Arc::new(ProxyPrototype {
                descriptor: descriptor.instance.clone(),
            }),
            descriptor,
            statics,
            link: self.link(route),
        })));
        Ok(self
            .proxy_classes
            .lock()
            .entry(key)
            .or_insert(created)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelMode, MemoryChannel};

    #[test]
    fn test_effective_call_type_degrades() {
        let (sync_only, _) = MemoryChannel::pair(ChannelMode::SyncOnly);
        let (async_only, _) = MemoryChannel::pair(ChannelMode::AsyncOnly);
        let (both, _) = MemoryChannel::pair(ChannelMode::Both);

        assert_eq!(
            effective_call_type(&sync_only, Returns::Async).unwrap(),
            CallType::Sync
        );
        assert_eq!(
            effective_call_type(&async_only, Returns::Sync).unwrap(),
            CallType::Async
        );
        assert_eq!(
            effective_call_type(&both, Returns::Sync).unwrap(),
            CallType::Sync
        );
        assert_eq!(
            effective_call_type(&both, Returns::Async).unwrap(),
            CallType::Async
        );
        assert_eq!(
            effective_call_type(&async_only, Returns::Void).unwrap(),
            CallType::Void
        );
    }
}
