//! Marshalling between live values and wire JSON.
//!
//! Outbound, every live handle is replaced by a reference token:
//!
//! - a proxy for something the receiver hosts is unwrapped back to the
//!   receiver's own id (`"unwrap": true`) instead of being wrapped again;
//! - a local function is registered in the host registry (reusing its id if
//!   it was sent before) and sent as a function token;
//! - an instance of a registered class is registered the same way and sent
//!   as an object token carrying its class id and read-once values;
//! - an explicitly exposed object is sent by its id;
//! - a deferred is registered under a fresh id and sent as an object token
//!   of class `Promise`; its settlement is pushed later as an `fn_reply`
//!   keyed on that id.
//!
//! Any other local object is copied field by field. Inbound is the mirror
//! image.
//!
//! A proxy sent back to its origin is pinned by the marshal. If the token
//! carried the last handle, the proxy's `obj_died` would otherwise reach the
//! origin before the token does. Whoever sends the message decides how long
//! the pins live; see [`Marshal::into_pinned`].

use crate::channel::Channel;
use crate::config::ProtocolConfig;
use crate::deferred::Deferred;
use crate::descriptor::FunctionDescriptor;
use crate::error::{Result, TetherError};
use crate::object::{Function, Object};
use crate::protocol::Token;
use crate::service::host::{HostEntry, RouteKey};
use crate::service::ServiceInner;
use crate::value::Value;
use serde_json::{Map, Value as JsonValue};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Marshals values exchanged with the peer reached through `route`.
pub(crate) struct Marshal<'a> {
    service: &'a ServiceInner,
    route: &'a Arc<dyn Channel>,
    /// Proxies serialized as unwrap tokens. Dropped with the marshal unless
    /// taken with [`Marshal::into_pinned`].
    pinned: RefCell<Vec<Value>>,
}

impl<'a> Marshal<'a> {
    pub(crate) fn new(service: &'a ServiceInner, route: &'a Arc<dyn Channel>) -> Self {
        Self {
            service,
            route,
            pinned: RefCell::new(Vec::new()),
        }
    }

    /// Proxies that must outlive the message this marshal produced.
    ///
    /// A message that is sent before the marshal is dropped needs nothing
    /// more: the channel delivers it ahead of any `obj_died`. A sync reply is
    /// only handed back to the transport, so its pins go to the service.
    pub(crate) fn into_pinned(self) -> Vec<Value> {
        self.pinned.into_inner()
    }

    fn pin(&self, value: Value) {
        self.pinned.borrow_mut().push(value);
    }

    fn route_key(&self) -> RouteKey {
        RouteKey::of(self.route)
    }

    // ========================================
    // Outbound
    // ========================================

    /// Serialize `value`. `hint` describes the calling convention to use if
    /// the value is a function.
    pub(crate) fn serialize(
        &self,
        value: &Value,
        hint: Option<&FunctionDescriptor>,
    ) -> Result<JsonValue> {
        match value {
            Value::Null => Ok(JsonValue::Null),
            Value::Bool(b) => Ok(JsonValue::Bool(*b)),
            Value::Number(n) => Ok(JsonValue::Number(n.clone())),
            Value::String(s) => Ok(JsonValue::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| self.serialize(item, None))
                .collect::<Result<Vec<_>>>()
                .map(JsonValue::Array),
            Value::Map(entries) => self.serialize_fields(entries),
            Value::Function(function) => self.function_token(function, hint)?.to_json(),
            Value::Object(object) => self.serialize_object(object),
            Value::Promise(deferred) => self.promise_token(deferred).to_json(),
        }
    }

    fn serialize_fields(&self, entries: &BTreeMap<String, Value>) -> Result<JsonValue> {
        let mut out = Map::new();
        for (key, value) in entries {
            out.insert(key.clone(), self.serialize(value, None)?);
        }
        Ok(JsonValue::Object(out))
    }

    fn function_token(
        &self,
        function: &Function,
        hint: Option<&FunctionDescriptor>,
    ) -> Result<Token> {
        if let Some(proxy) = function.as_proxy() {
            if proxy.link.is_route(self.service, self.route) {
                self.pin(Value::Function(function.clone()));
                return Ok(Token::Function {
                    id: proxy.id.clone(),
                    unwrap: true,
                });
            }
        }
        if function.is_disposed() {
            return Err(TetherError::Disposed {
                id: function.remote_id().unwrap_or_default().to_string(),
            });
        }
        let descriptor = hint.cloned().unwrap_or_default();
        let id = self.service.host.register_implicit(
            function.addr(),
            self.route_key(),
            || HostEntry::Function {
                function: function.clone(),
                descriptor,
            },
            || self.service.next_id(),
        );
        Ok(Token::Function { id, unwrap: false })
    }

    fn serialize_object(&self, object: &Object) -> Result<JsonValue> {
        if let Some(proxy) = object.as_proxy() {
            if !proxy.link.is_route(self.service, self.route) {
                return Err(TetherError::protocol(format!(
                    "proxy {} belongs to another peer and cannot be forwarded",
                    proxy.id
                )));
            }
            self.pin(Value::Object(object.clone()));
            return Token::Object {
                id: proxy.id.clone(),
                class_id: proxy
                    .class
                    .as_ref()
                    .map(|c| c.id().to_string())
                    .unwrap_or_default(),
                props: BTreeMap::new(),
                unwrap: true,
            }
            .to_json();
        }

        if let Some(class) = object.class() {
            if let Some(descriptor) = self.service.host.class_descriptor(&class) {
                let id = self.service.host.register_implicit(
                    object.addr(),
                    self.route_key(),
                    || HostEntry::Object {
                        object: object.clone(),
                        descriptor: descriptor.instance.clone(),
                    },
                    || self.service.next_id(),
                );
                let mut props = BTreeMap::new();
                for name in &descriptor.instance.readonly_properties {
                    props.insert(name.clone(), self.serialize(&object.get(name)?, None)?);
                }
                return Token::Object {
                    id,
                    class_id: class.id().to_string(),
                    props,
                    unwrap: false,
                }
                .to_json();
            }
        }

        if let Some(id) = self.service.host.id_of(object.addr()) {
            return Token::Object {
                id,
                class_id: String::new(),
                props: BTreeMap::new(),
                unwrap: false,
            }
            .to_json();
        }

        match object.local_fields() {
            Some(fields) => self.serialize_fields(&fields),
            None => Err(TetherError::protocol("cannot serialize proxy object")),
        }
    }

    fn promise_token(&self, deferred: &Deferred) -> Token {
        let id = self.service.next_id();
        let holder = self.route_key();
        self.service.host.register_promise(&id, deferred.clone(), holder);

        let service = self.service.weak();
        let route = self.route.clone();
        let call_id = id.clone();
        deferred.on_settled(move |outcome| {
            if let Some(service) = service.upgrade() {
                service.host.release(&call_id, holder);
                service.send_async_reply(&route, &call_id, outcome.clone());
            }
        });

        Token::Object {
            id,
            class_id: ProtocolConfig::PROMISE_CLASS_ID.to_string(),
            props: BTreeMap::new(),
            unwrap: false,
        }
    }

    // ========================================
    // Inbound
    // ========================================

    /// Deserialize `json`. `hint` is the calling convention for a function
    /// token in this position.
    pub(crate) fn deserialize(
        &self,
        json: JsonValue,
        hint: Option<&FunctionDescriptor>,
    ) -> Result<Value> {
        if let Some(token) = Token::parse(&json) {
            return self.from_token(token?, hint);
        }
        match json {
            JsonValue::Object(map) => map
                .into_iter()
                .map(|(key, value)| Ok((key, self.deserialize(value, None)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Value::Map),
            JsonValue::Array(items) => items
                .into_iter()
                .map(|item| self.deserialize(item, None))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            primitive => Ok(Value::from(primitive)),
        }
    }

    pub(crate) fn deserialize_map(
        &self,
        entries: BTreeMap<String, JsonValue>,
    ) -> Result<BTreeMap<String, Value>> {
        entries
            .into_iter()
            .map(|(key, value)| Ok((key, self.deserialize(value, None)?)))
            .collect()
    }

    /// Deserialize call arguments, matching argument descriptors by position.
    pub(crate) fn deserialize_args(
        &self,
        args: Vec<JsonValue>,
        descriptor: &FunctionDescriptor,
    ) -> Result<Vec<Value>> {
        args.into_iter()
            .enumerate()
            .map(|(i, arg)| self.deserialize(arg, descriptor.argument_at(i)))
            .collect()
    }

    fn from_token(&self, token: Token, hint: Option<&FunctionDescriptor>) -> Result<Value> {
        match token {
            Token::Function { id, unwrap: true } => match self.service.host.get(&id) {
                Some(HostEntry::Function { function, .. }) => Ok(Value::Function(function)),
                Some(other) => Err(TetherError::TypeMismatch {
                    expected: "function",
                    actual: other.kind(),
                }),
                None => Err(TetherError::NoObject { id }),
            },
            Token::Function { id, unwrap: false } => Ok(Value::Function(
                self.service
                    .proxy_function(&id, hint.cloned().unwrap_or_default(), self.route),
            )),
            Token::Object {
                id, unwrap: true, ..
            } => match self.service.host.get(&id) {
                Some(HostEntry::Object { object, .. }) => Ok(Value::Object(object)),
                Some(HostEntry::Class { class, .. }) => Ok(Value::Object(class.statics())),
                Some(other) => Err(TetherError::TypeMismatch {
                    expected: "object",
                    actual: other.kind(),
                }),
                None => Err(TetherError::NoObject { id }),
            },
            Token::Object { id, class_id, .. }
                if class_id == ProtocolConfig::PROMISE_CLASS_ID =>
            {
                Ok(Value::Promise(self.service.await_reply(self.route, &id)))
            }
            Token::Object { id, class_id, .. } if class_id.is_empty() => {
                self.service
                    .exposed_proxy_object(&id, self.route)
                    .map(Value::Object)
            }
            Token::Object {
                id,
                class_id,
                props,
                ..
            } => {
                let props = self.deserialize_map(props)?;
                self.service
                    .proxy_instance(&class_id, &id, props, self.route)
                    .map(Value::Object)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::{ChannelMode, MemoryChannel};
    use crate::object::{Class, Function, Object};
    use crate::service::{RpcService, SequentialIds};
    use crate::value::Value;
    use crate::ClassDescriptor;
    use serde_json::json;
    use std::sync::Arc;

    fn service() -> RpcService {
        let (end, _peer) = MemoryChannel::pair(ChannelMode::SyncOnly);
        RpcService::builder(Arc::new(end))
            .id_generator(SequentialIds::new("t-"))
            .build()
            .unwrap()
    }

    fn with_marshal<R>(service: &RpcService, f: impl FnOnce(&super::Marshal<'_>) -> R) -> R {
        let inner = service.inner();
        let route = inner.channel.clone();
        f(&super::Marshal::new(inner, &route))
    }

    #[test]
    fn test_plain_data_passes_through() {
        let svc = service();
        let value = Value::from(json!({"a": [1, "two", null, true]}));
        let wire = with_marshal(&svc, |m| m.serialize(&value, None)).unwrap();
        assert_eq!(wire, json!({"a": [1, "two", null, true]}));
        let back = with_marshal(&svc, |m| m.deserialize(wire, None)).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_function_is_registered_once() {
        let svc = service();
        let f = Function::native("cb", |_, _| Ok(Value::Null));
        let value = Value::Array(vec![Value::from(f.clone()), Value::from(f)]);

        let wire = with_marshal(&svc, |m| m.serialize(&value, None)).unwrap();
        assert_eq!(
            wire,
            json!([
                {"_rpc_type": "function", "id": "t-1"},
                {"_rpc_type": "function", "id": "t-1"}
            ])
        );
        assert_eq!(svc.host_entry_count(), 1);
    }

    #[test]
    fn test_plain_object_is_copied() {
        let svc = service();
        let obj = Object::builder().field("x", 1).field("y", "z").build();
        let wire = with_marshal(&svc, |m| m.serialize(&Value::from(obj), None)).unwrap();
        assert_eq!(wire, json!({"x": 1, "y": "z"}));
        assert_eq!(svc.host_entry_count(), 0);
    }

    #[test]
    fn test_registered_class_instance_ships_read_once_props() {
        let svc = service();
        let class = Class::builder("Point").build();
        svc.register_host_class(
            class.clone(),
            ClassDescriptor::new("Point")
                .instance(crate::ObjectDescriptor::new().readonly_property("x")),
        );
        let point = class.instantiate([("x", Value::from(3)), ("secret", Value::from(9))]);

        let wire = with_marshal(&svc, |m| m.serialize(&Value::from(point), None)).unwrap();
        assert_eq!(
            wire,
            json!({"_rpc_type": "object", "id": "t-1", "classId": "Point", "props": {"x": 3}})
        );
    }

    #[test]
    fn test_unwrap_token_resolves_host_original() {
        let svc = service();
        let f = Function::native("cb", |_, _| Ok(Value::Null));
        let wire = with_marshal(&svc, |m| m.serialize(&Value::from(f.clone()), None)).unwrap();
        let id = wire["id"].as_str().unwrap().to_string();

        let back = with_marshal(&svc, |m| {
            m.deserialize(json!({"_rpc_type": "function", "id": id, "unwrap": true}), None)
        })
        .unwrap();
        assert!(back.expect_function().unwrap().ptr_eq(&f));
    }

    #[test]
    fn test_unknown_unwrap_token_fails() {
        let svc = service();
        let err = with_marshal(&svc, |m| {
            m.deserialize(json!({"_rpc_type": "function", "id": "nope", "unwrap": true}), None)
        })
        .unwrap_err();
        assert!(matches!(err, crate::TetherError::NoObject { .. }));
    }

    #[test]
    fn test_function_token_yields_memoized_proxy() {
        let svc = service();
        let token = json!({"_rpc_type": "function", "id": "remote-1"});
        let a = with_marshal(&svc, |m| m.deserialize(token.clone(), None)).unwrap();
        let b = with_marshal(&svc, |m| m.deserialize(token, None)).unwrap();
        let (a, b) = (a.expect_function().unwrap(), b.expect_function().unwrap());
        assert!(a.is_proxy());
        assert!(a.ptr_eq(b));
        assert_eq!(a.remote_id(), Some("remote-1"));
    }
}
