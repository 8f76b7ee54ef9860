//! Wire protocol messages and reference tokens.
//!
//! Every message is a JSON object carrying `rpc_marker: "tether"` plus an
//! `action` tag:
//!
//! ```text
//! {"rpc_marker":"tether","action":"get_descriptors","callType":"sync"}
//! {"rpc_marker":"tether","action":"descriptors","objects":{..},"functions":{..},"classes":{..}}
//! {"rpc_marker":"tether","action":"method_call","callType":"async","objId":"calc","prop":"add","args":[2,3],"callId":"c1"}
//! {"rpc_marker":"tether","action":"fn_reply","callType":"async","callId":"c1","success":true,"result":5}
//! {"rpc_marker":"tether","action":"obj_died","objId":"f-17"}
//! ```
//!
//! Messages without the marker are unrelated traffic on a shared channel and
//! are ignored by the receiver.

use crate::config::ProtocolConfig;
use crate::descriptor::{ClassDescriptor, FunctionDescriptor, ObjectDescriptor, Returns};
use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// How the caller expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Sync,
    Async,
    Void,
}

impl From<Returns> for CallType {
    fn from(r: Returns) -> Self {
        match r {
            Returns::Sync => CallType::Sync,
            Returns::Async => CallType::Async,
            Returns::Void => CallType::Void,
        }
    }
}

/// What a call message asks the receiver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallAction {
    /// Apply args to a function target.
    Function,
    /// Call the named method with the target object as scope.
    Method,
    /// Invoke a class target as a constructor.
    Constructor,
    /// Read a named property.
    PropertyGet,
    /// Write a named property; the value is the single argument.
    PropertySet,
}

/// Payload shared by every call action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMessage {
    pub call_type: CallType,
    pub obj_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prop: Option<String>,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    /// Present only for async calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// Reply to a sync or async call, or the settlement of a deferred token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessage {
    pub call_type: CallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub success: bool,
    /// The serialized result, or the error string on failure.
    #[serde(default)]
    pub result: JsonValue,
}

/// An object descriptor with its read-once property values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectEntry {
    #[serde(flatten)]
    pub descriptor: ObjectDescriptor,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, JsonValue>,
}

/// A class descriptor with the read-once values of its static side.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassEntry {
    #[serde(flatten)]
    pub descriptor: ClassDescriptor,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub static_props: BTreeMap<String, JsonValue>,
}

/// Everything a peer exposes, as exchanged during descriptor exchange.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DescriptorSet {
    #[serde(default)]
    pub objects: BTreeMap<String, ObjectEntry>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionDescriptor>,
    #[serde(default)]
    pub classes: BTreeMap<String, ClassEntry>,
}

/// The closed message vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RpcMessage {
    GetDescriptors {
        #[serde(rename = "callType")]
        call_type: CallType,
    },
    Descriptors(DescriptorSet),
    FnCall(CallMessage),
    MethodCall(CallMessage),
    CtorCall(CallMessage),
    PropGet(CallMessage),
    PropSet(CallMessage),
    FnReply(ReplyMessage),
    ObjDied {
        #[serde(rename = "objId")]
        obj_id: String,
    },
}

impl RpcMessage {
    /// Build the call message for `action`.
    pub fn call(action: CallAction, call: CallMessage) -> Self {
        match action {
            CallAction::Function => RpcMessage::FnCall(call),
            CallAction::Method => RpcMessage::MethodCall(call),
            CallAction::Constructor => RpcMessage::CtorCall(call),
            CallAction::PropertyGet => RpcMessage::PropGet(call),
            CallAction::PropertySet => RpcMessage::PropSet(call),
        }
    }

    /// Split a call message into its action and payload.
    pub fn into_call(self) -> std::result::Result<(CallAction, CallMessage), RpcMessage> {
        match self {
            RpcMessage::FnCall(c) => Ok((CallAction::Function, c)),
            RpcMessage::MethodCall(c) => Ok((CallAction::Method, c)),
            RpcMessage::CtorCall(c) => Ok((CallAction::Constructor, c)),
            RpcMessage::PropGet(c) => Ok((CallAction::PropertyGet, c)),
            RpcMessage::PropSet(c) => Ok((CallAction::PropertySet, c)),
            other => Err(other),
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            RpcMessage::GetDescriptors { .. } => "get_descriptors",
            RpcMessage::Descriptors(_) => "descriptors",
            RpcMessage::FnCall(_) => "fn_call",
            RpcMessage::MethodCall(_) => "method_call",
            RpcMessage::CtorCall(_) => "ctor_call",
            RpcMessage::PropGet(_) => "prop_get",
            RpcMessage::PropSet(_) => "prop_set",
            RpcMessage::FnReply(_) => "fn_reply",
            RpcMessage::ObjDied { .. } => "obj_died",
        }
    }
}

/// True if `message` carries the protocol marker.
pub fn is_protocol_message(message: &JsonValue) -> bool {
    message
        .get(ProtocolConfig::MARKER_FIELD)
        .and_then(JsonValue::as_str)
        == Some(ProtocolConfig::MARKER)
}

/// Serialize a message and stamp it with the protocol marker.
pub fn encode(message: &RpcMessage) -> Result<JsonValue> {
    let mut value = serde_json::to_value(message)?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert(
                ProtocolConfig::MARKER_FIELD.to_string(),
                JsonValue::String(ProtocolConfig::MARKER.to_string()),
            );
        }
        None => return Err(TetherError::protocol("message did not serialize to an object")),
    }
    Ok(value)
}

/// Parse an inbound message. Returns `None` for traffic without the marker.
pub fn decode(message: JsonValue) -> Result<Option<RpcMessage>> {
    if !is_protocol_message(&message) {
        return Ok(None);
    }
    serde_json::from_value(message)
        .map(Some)
        .map_err(|e| TetherError::protocol(format!("malformed message: {}", e)))
}

/// Parse the response to a sync send, which must be a marked `fn_reply`.
pub fn decode_reply(response: Option<JsonValue>) -> Result<ReplyMessage> {
    let response = response.ok_or_else(|| TetherError::protocol("missing response"))?;
    match decode(response)? {
        Some(RpcMessage::FnReply(reply)) => Ok(reply),
        Some(other) => Err(TetherError::protocol(format!(
            "expected fn_reply, got {}",
            other.action_name()
        ))),
        None => Err(TetherError::protocol("response is missing the protocol marker")),
    }
}

/// Wire-safe substitute for a live function or object.
///
/// `unwrap` marks a token that refers to an entity hosted by the receiver
/// (a proxy being sent back to its origin); the receiver resolves it to its
/// own original instead of building a proxy of a proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_rpc_type", rename_all = "lowercase")]
pub enum Token {
    Function {
        id: String,
        #[serde(default, skip_serializing_if = "is_false")]
        unwrap: bool,
    },
    Object {
        id: String,
        #[serde(rename = "classId", default, skip_serializing_if = "String::is_empty")]
        class_id: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        props: BTreeMap<String, JsonValue>,
        #[serde(default, skip_serializing_if = "is_false")]
        unwrap: bool,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Token {
    /// Parse a token from a JSON object carrying the token tag.
    ///
    /// Returns `None` for values without [`ProtocolConfig::TOKEN_TAG`]. An
    /// object that has the tag but is not a valid token is an error rather
    /// than plain data.
    pub fn parse(value: &JsonValue) -> Option<Result<Token>> {
        value.get(ProtocolConfig::TOKEN_TAG)?;
        Some(
            serde_json::from_value(value.clone())
                .map_err(|e| TetherError::protocol(format!("malformed reference token: {}", e))),
        )
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}
