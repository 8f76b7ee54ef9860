//! Declarative descriptors of what a peer exposes.
//!
//! Descriptors never hold live references. They are created at registration
//! time, shipped to the peer during descriptor exchange and never mutated
//! afterwards. Functions and properties may be declared either by bare name
//! (defaults apply) or by a full descriptor; the helpers here normalize both
//! forms.
//!
//! ```text
//! {"functions": ["reset", {"name": "add", "returns": "sync"}],
//!  "proxiedProperties": [{"name": "value", "readonly": true}],
//!  "readonlyProperties": ["label"]}
//! ```

use serde::{Deserialize, Serialize};

/// How a call's return value propagates back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Returns {
    /// Caller blocks for a same-turn reply.
    Sync,
    /// Caller receives a deferred settled by a later reply.
    #[default]
    Async,
    /// Fire-and-forget; no reply is ever produced.
    Void,
}

fn accessor_default_returns() -> Returns {
    Returns::Sync
}

/// Describes an exposed function or method.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    #[serde(default)]
    pub name: String,
    /// Only function-typed arguments need describing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<ArgumentDescriptor>,
    #[serde(default)]
    pub returns: Returns,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Anonymous descriptor with the given return behavior.
    pub fn with_returns(returns: Returns) -> Self {
        Self {
            returns,
            ..Self::default()
        }
    }

    pub fn returns(mut self, returns: Returns) -> Self {
        self.returns = returns;
        self
    }

    pub fn argument(mut self, argument: ArgumentDescriptor) -> Self {
        self.arguments.push(argument);
        self
    }

    /// Descriptor for the argument at `idx`.
    ///
    /// The first argument descriptor whose index matches, or that carries no
    /// index at all, wins.
    pub fn argument_at(&self, idx: usize) -> Option<&FunctionDescriptor> {
        self.arguments
            .iter()
            .find(|arg| arg.idx.map_or(true, |i| i == idx))
            .map(|arg| &arg.function)
    }
}

/// Describes a function-typed argument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArgumentDescriptor {
    /// Position this descriptor applies to; `None` applies to every position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idx: Option<usize>,
    #[serde(flatten)]
    pub function: FunctionDescriptor,
}

impl ArgumentDescriptor {
    /// Applies to every argument position.
    pub fn any(function: FunctionDescriptor) -> Self {
        Self {
            idx: None,
            function,
        }
    }

    pub fn at(idx: usize, function: FunctionDescriptor) -> Self {
        Self {
            idx: Some(idx),
            function,
        }
    }
}

/// Return behavior of a property accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessorDescriptor {
    #[serde(default = "accessor_default_returns")]
    pub returns: Returns,
}

/// Describes a property read and written through round trips.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<AccessorDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<AccessorDescriptor>,
    #[serde(default)]
    pub readonly: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn getter(mut self, returns: Returns) -> Self {
        self.get = Some(AccessorDescriptor { returns });
        self
    }

    pub fn setter(mut self, returns: Returns) -> Self {
        self.set = Some(AccessorDescriptor { returns });
        self
    }

    /// Getter behavior, sync unless declared otherwise.
    pub fn get_returns(&self) -> Returns {
        self.get.map_or(Returns::Sync, |a| a.returns)
    }

    /// Setter behavior, sync unless declared otherwise.
    pub fn set_returns(&self) -> Returns {
        self.set.map_or(Returns::Sync, |a| a.returns)
    }
}

/// A function declared by bare name or by full descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionEntry {
    Name(String),
    Descriptor(FunctionDescriptor),
}

impl FunctionEntry {
    pub fn name(&self) -> &str {
        match self {
            FunctionEntry::Name(name) => name,
            FunctionEntry::Descriptor(d) => &d.name,
        }
    }

    /// Full descriptor, applying defaults to the bare-name form.
    pub fn to_descriptor(&self) -> FunctionDescriptor {
        match self {
            FunctionEntry::Name(name) => FunctionDescriptor::new(name.clone()),
            FunctionEntry::Descriptor(d) => d.clone(),
        }
    }
}

impl From<&str> for FunctionEntry {
    fn from(name: &str) -> Self {
        FunctionEntry::Name(name.to_string())
    }
}

impl From<FunctionDescriptor> for FunctionEntry {
    fn from(d: FunctionDescriptor) -> Self {
        FunctionEntry::Descriptor(d)
    }
}

/// A proxied property declared by bare name or by full descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyEntry {
    Name(String),
    Descriptor(PropertyDescriptor),
}

impl PropertyEntry {
    pub fn name(&self) -> &str {
        match self {
            PropertyEntry::Name(name) => name,
            PropertyEntry::Descriptor(d) => &d.name,
        }
    }

    pub fn to_descriptor(&self) -> PropertyDescriptor {
        match self {
            PropertyEntry::Name(name) => PropertyDescriptor::new(name.clone()),
            PropertyEntry::Descriptor(d) => d.clone(),
        }
    }
}

impl From<&str> for PropertyEntry {
    fn from(name: &str) -> Self {
        PropertyEntry::Name(name.to_string())
    }
}

impl From<PropertyDescriptor> for PropertyEntry {
    fn from(d: PropertyDescriptor) -> Self {
        PropertyEntry::Descriptor(d)
    }
}

/// Describes an exposed object (or one side of a class).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescriptor {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxied_properties: Vec<PropertyEntry>,
    /// Sent by value once, at descriptor exchange or instance transfer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_properties: Vec<String>,
}

impl ObjectDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(mut self, entry: impl Into<FunctionEntry>) -> Self {
        self.functions.push(entry.into());
        self
    }

    pub fn proxied_property(mut self, entry: impl Into<PropertyEntry>) -> Self {
        self.proxied_properties.push(entry.into());
        self
    }

    pub fn readonly_property(mut self, name: impl Into<String>) -> Self {
        self.readonly_properties.push(name.into());
        self
    }

    /// Look up a function by name.
    pub fn find_function(&self, name: &str) -> Option<FunctionDescriptor> {
        self.functions
            .iter()
            .find(|f| f.name() == name)
            .map(FunctionEntry::to_descriptor)
    }

    /// Look up a proxied property by name.
    pub fn find_property(&self, name: &str) -> Option<PropertyDescriptor> {
        self.proxied_properties
            .iter()
            .find(|p| p.name() == name)
            .map(PropertyEntry::to_descriptor)
    }

    pub fn is_readonly_property(&self, name: &str) -> bool {
        self.readonly_properties.iter().any(|p| p == name)
    }

    /// The member named `name`, functions taking precedence over properties.
    pub fn member(&self, name: &str) -> Option<Descriptor> {
        if let Some(f) = self.find_function(name) {
            return Some(Descriptor::Function(f));
        }
        self.find_property(name).map(Descriptor::Property)
    }
}

/// Describes an exposed class.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDescriptor {
    #[serde(default)]
    pub class_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctor: Option<FunctionDescriptor>,
    #[serde(rename = "static", default)]
    pub statics: ObjectDescriptor,
    #[serde(default)]
    pub instance: ObjectDescriptor,
}

impl ClassDescriptor {
    pub fn new(class_id: impl Into<String>) -> Self {
        Self {
            class_id: class_id.into(),
            ..Self::default()
        }
    }

    pub fn ctor(mut self, ctor: FunctionDescriptor) -> Self {
        self.ctor = Some(ctor);
        self
    }

    pub fn statics(mut self, statics: ObjectDescriptor) -> Self {
        self.statics = statics;
        self
    }

    pub fn instance(mut self, instance: ObjectDescriptor) -> Self {
        self.instance = instance;
        self
    }

    /// Constructor descriptor, sync unless declared otherwise.
    pub fn ctor_descriptor(&self) -> FunctionDescriptor {
        self.ctor
            .clone()
            .unwrap_or_else(|| FunctionDescriptor::with_returns(Returns::Sync))
    }
}

/// Any descriptor, matched exhaustively at each processing site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Function(FunctionDescriptor),
    Property(PropertyDescriptor),
    Object(ObjectDescriptor),
    Class(ClassDescriptor),
}

impl Descriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            Descriptor::Function(_) => "function",
            Descriptor::Property(_) => "property",
            Descriptor::Object(_) => "object",
            Descriptor::Class(_) => "class",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shorthand_and_full_forms_parse() {
        let d: ObjectDescriptor = serde_json::from_value(json!({
            "functions": ["reset", {"name": "add", "returns": "sync"}],
            "proxiedProperties": ["value", {"name": "limit", "readonly": true}],
            "readonlyProperties": ["label"]
        }))
        .unwrap();

        assert_eq!(d.find_function("reset").unwrap().returns, Returns::Async);
        assert_eq!(d.find_function("add").unwrap().returns, Returns::Sync);
        assert!(!d.find_property("value").unwrap().readonly);
        assert!(d.find_property("limit").unwrap().readonly);
        assert!(d.is_readonly_property("label"));
        assert!(d.find_function("missing").is_none());
    }

    #[test]
    fn test_member_prefers_functions() {
        let d = ObjectDescriptor::new()
            .function("size")
            .proxied_property("size")
            .proxied_property("count");

        assert!(matches!(d.member("size"), Some(Descriptor::Function(_))));
        assert!(matches!(d.member("count"), Some(Descriptor::Property(_))));
        assert!(d.member("nope").is_none());
    }

    #[test]
    fn test_argument_lookup_with_and_without_index() {
        let cb_void = FunctionDescriptor::with_returns(Returns::Void);
        let cb_sync = FunctionDescriptor::with_returns(Returns::Sync);

        let f = FunctionDescriptor::new("on")
            .argument(ArgumentDescriptor::at(1, cb_void.clone()));
        assert!(f.argument_at(0).is_none());
        assert_eq!(f.argument_at(1), Some(&cb_void));

        let g = FunctionDescriptor::new("each").argument(ArgumentDescriptor::any(cb_sync.clone()));
        assert_eq!(g.argument_at(0), Some(&cb_sync));
        assert_eq!(g.argument_at(7), Some(&cb_sync));
    }

    #[test]
    fn test_argument_descriptor_flattens_on_the_wire() {
        let arg = ArgumentDescriptor::at(0, FunctionDescriptor::with_returns(Returns::Void));
        let v = serde_json::to_value(&arg).unwrap();
        assert_eq!(v, json!({"idx": 0, "name": "", "returns": "void"}));
    }

    #[test]
    fn test_accessor_defaults_are_sync() {
        let p: PropertyDescriptor =
            serde_json::from_value(json!({"name": "value", "get": {}})).unwrap();
        assert_eq!(p.get_returns(), Returns::Sync);
        assert_eq!(p.set_returns(), Returns::Sync);

        let p = PropertyDescriptor::new("value").setter(Returns::Void);
        assert_eq!(p.set_returns(), Returns::Void);
    }

    #[test]
    fn test_class_descriptor_static_key() {
        let c = ClassDescriptor::new("Counter")
            .statics(ObjectDescriptor::new().function("create"))
            .instance(ObjectDescriptor::new().readonly_property("label"));
        let v = serde_json::to_value(&c).unwrap();
        assert!(v.get("static").is_some());
        assert_eq!(v["classId"], "Counter");
        assert_eq!(c.ctor_descriptor().returns, Returns::Sync);
    }
}
