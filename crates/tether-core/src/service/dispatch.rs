//! Inbound message dispatch.
//!
//! Errors never escape the dispatcher: a failed call becomes a failure
//! reply (or a debug log line for void calls) and the next message is
//! processed normally.

use super::host::{HostEntry, RouteKey};
use super::ServiceInner;
use crate::channel::{send_oneway, Channel};
use crate::deferred::Deferred;
use crate::descriptor::{FunctionDescriptor, ObjectDescriptor};
use crate::error::{Result, TetherError};
use crate::protocol::{self, CallAction, CallMessage, CallType, RpcMessage};
use crate::serialize::Marshal;
use crate::value::Value;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, warn};

impl ServiceInner {
    pub(crate) fn handle_message(
        &self,
        message: JsonValue,
        reply_to: Option<Arc<dyn Channel>>,
    ) -> Option<JsonValue> {
        let message = match protocol::decode(message) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Ignoring message without protocol marker");
                return None;
            }
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                return None;
            }
        };
        let route = reply_to.unwrap_or_else(|| self.channel.clone());
        self.unpin_all();

        let message = match message.into_call() {
            Ok((action, call)) => return self.handle_call(action, call, &route),
            Err(other) => other,
        };
        match message {
            RpcMessage::GetDescriptors { call_type } => {
                self.handle_get_descriptors(call_type, &route)
            }
            RpcMessage::Descriptors(set) => {
                self.store_remote_descriptors(set);
                None
            }
            RpcMessage::FnReply(reply) => {
                self.accept_reply(&route, reply);
                None
            }
            RpcMessage::ObjDied { obj_id } => {
                if self.host.release(&obj_id, RouteKey::of(&route)) {
                    debug!("Released host entry {}", obj_id);
                } else {
                    debug!("Ignoring obj_died for {}", obj_id);
                }
                None
            }
            RpcMessage::FnCall(_)
            | RpcMessage::MethodCall(_)
            | RpcMessage::CtorCall(_)
            | RpcMessage::PropGet(_)
            | RpcMessage::PropSet(_) => None,
        }
    }

    fn handle_get_descriptors(
        &self,
        call_type: CallType,
        route: &Arc<dyn Channel>,
    ) -> Option<JsonValue> {
        let marshal = Marshal::new(self, route);
        let encoded = self
            .descriptor_set(&marshal)
            .and_then(|set| protocol::encode(&RpcMessage::Descriptors(set)));
        let message = match encoded {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to build descriptors: {}", e);
                return None;
            }
        };
        match call_type {
            CallType::Sync => {
                self.pin_reply(marshal.into_pinned());
                Some(message)
            }
            CallType::Async | CallType::Void => {
                if let Err(e) = send_oneway(route.as_ref(), message) {
                    warn!("Failed to send descriptors: {}", e);
                }
                None
            }
        }
    }

    fn handle_call(
        &self,
        action: CallAction,
        call: CallMessage,
        route: &Arc<dyn Channel>,
    ) -> Option<JsonValue> {
        let call_type = call.call_type;
        let call_id = call.call_id.clone();
        let target = call.obj_id.clone();
        let outcome = self.invoke_local(action, call, route);

        match call_type {
            CallType::Void => {
                if let Err(e) = outcome {
                    debug!("Void call on {} failed: {}", target, e);
                }
                None
            }
            CallType::Sync => {
                let marshal = Marshal::new(self, route);
                let reply = self.reply_json(&marshal, CallType::Sync, None, outcome);
                self.pin_reply(marshal.into_pinned());
                reply
            }
            CallType::Async => {
                let Some(call_id) = call_id else {
                    warn!("Async call on {} without callId", target);
                    return None;
                };
                let settled = match outcome {
                    Ok(Value::Promise(deferred)) => deferred,
                    other => Deferred::from_result(other),
                };
                let service = self.weak();
                let route = route.clone();
                settled.on_settled(move |outcome| {
                    if let Some(service) = service.upgrade() {
                        service.send_async_reply(&route, &call_id, outcome.clone());
                    }
                });
                None
            }
        }
    }

    /// Apply a call to its host target.
    fn invoke_local(
        &self,
        action: CallAction,
        call: CallMessage,
        route: &Arc<dyn Channel>,
    ) -> Result<Value> {
        let CallMessage {
            obj_id, prop, args, ..
        } = call;
        let entry = self
            .host
            .get(&obj_id)
            .ok_or_else(|| TetherError::NoObject { id: obj_id.clone() })?;
        let marshal = Marshal::new(self, route);
        let prop = prop.as_deref();

        match (action, entry) {
            (CallAction::Function, HostEntry::Function { function, descriptor }) => {
                let args = marshal.deserialize_args(args, &descriptor)?;
                function.call(args)
            }
            (CallAction::Method, HostEntry::Object { object, descriptor }) => {
                let name = required_prop(&obj_id, prop)?;
                let method = declared_function(&descriptor, name)?;
                let args = marshal.deserialize_args(args, &method)?;
                object.call_method(name, args)
            }
            (CallAction::Method, HostEntry::Class { class, descriptor }) => {
                let name = required_prop(&obj_id, prop)?;
                let method = declared_function(&descriptor.statics, name)?;
                let args = marshal.deserialize_args(args, &method)?;
                class.statics().call_method(name, args)
            }
            (CallAction::Constructor, HostEntry::Class { class, descriptor }) => {
                let args = marshal.deserialize_args(args, &descriptor.ctor_descriptor())?;
                class.construct(args)
            }
            (CallAction::PropertyGet, HostEntry::Object { object, descriptor }) => {
                let name = required_prop(&obj_id, prop)?;
                readable(&descriptor, name)?;
                object.get(name)
            }
            (CallAction::PropertyGet, HostEntry::Class { class, descriptor }) => {
                let name = required_prop(&obj_id, prop)?;
                readable(&descriptor.statics, name)?;
                class.statics().get(name)
            }
            (CallAction::PropertySet, HostEntry::Object { object, descriptor }) => {
                let name = required_prop(&obj_id, prop)?;
                writable(&descriptor, name)?;
                let value = first_arg(&marshal, args)?;
                object.set(name, value).map(|_| Value::Null)
            }
            (CallAction::PropertySet, HostEntry::Class { class, descriptor }) => {
                let name = required_prop(&obj_id, prop)?;
                writable(&descriptor.statics, name)?;
                let value = first_arg(&marshal, args)?;
                class.statics().set(name, value).map(|_| Value::Null)
            }
            (action, entry) => Err(TetherError::protocol(format!(
                "cannot apply {:?} to {} {}",
                action,
                entry.kind(),
                obj_id
            ))),
        }
    }
}

fn required_prop<'a>(obj_id: &str, prop: Option<&'a str>) -> Result<&'a str> {
    prop.ok_or_else(|| TetherError::protocol(format!("call on {} is missing prop", obj_id)))
}

/// Only declared members are reachable from the peer.
fn declared_function(descriptor: &ObjectDescriptor, name: &str) -> Result<FunctionDescriptor> {
    descriptor
        .find_function(name)
        .ok_or_else(|| TetherError::NoMember {
            name: name.to_string(),
        })
}

fn readable(descriptor: &ObjectDescriptor, name: &str) -> Result<()> {
    if descriptor.find_property(name).is_some() || descriptor.is_readonly_property(name) {
        Ok(())
    } else {
        Err(TetherError::NoMember {
            name: name.to_string(),
        })
    }
}

fn writable(descriptor: &ObjectDescriptor, name: &str) -> Result<()> {
    match descriptor.find_property(name) {
        Some(property) if !property.readonly => Ok(()),
        Some(_) => Err(TetherError::Readonly {
            name: name.to_string(),
        }),
        None if descriptor.is_readonly_property(name) => Err(TetherError::Readonly {
            name: name.to_string(),
        }),
        None => Err(TetherError::NoMember {
            name: name.to_string(),
        }),
    }
}

fn first_arg(marshal: &Marshal<'_>, args: Vec<JsonValue>) -> Result<Value> {
    match args.into_iter().next() {
        Some(json) => marshal.deserialize(json, None),
        None => Ok(Value::Null),
    }
}
