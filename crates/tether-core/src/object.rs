//! Live functions, objects and classes.
//!
//! Each handle is a cheap clone over shared state and compares by identity.
//! A handle is either local (backed by native closures and a field map) or a
//! proxy generated from a remote descriptor; callers use both the same way.
//!
//! Local objects created from a class share that class's methods, the same
//! way every instance of a class shares one prototype. Proxy instances share
//! their proxy class's prototype in the same manner.

use crate::error::{Result, TetherError};
use crate::service::proxy::{ProxyClass, ProxyFunction, ProxyObject};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Signature of a native function body. The first argument is the call
/// scope (`this`) when invoked as a method.
pub type NativeFn = dyn Fn(Option<&Object>, Vec<Value>) -> Result<Value> + Send + Sync;

/// Signature of a native class constructor.
pub type NativeCtor = dyn Fn(&Class, Vec<Value>) -> Result<Object> + Send + Sync;

// ============================================================================
// Function
// ============================================================================

pub(crate) enum FunctionInner {
    Native { name: String, body: Box<NativeFn> },
    Proxy(ProxyFunction),
    /// A member of a proxy object, bound to that object.
    Method { object: Object, name: String },
}

/// A callable handle.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

impl Function {
    /// Wrap a native closure.
    pub fn native<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Option<&Object>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FunctionInner::Native {
                name: name.into(),
                body: Box::new(body),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<FunctionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn as_proxy(&self) -> Option<&ProxyFunction> {
        match &*self.inner {
            FunctionInner::Proxy(p) => Some(p),
            _ => None,
        }
    }

    /// Address used as the identity key when registering as a host function.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.call_with_this(None, args)
    }

    /// Call with an explicit scope. Proxies ignore the scope; the remote side
    /// binds its own.
    pub fn call_with_this(&self, this: Option<&Object>, args: Vec<Value>) -> Result<Value> {
        match &*self.inner {
            FunctionInner::Native { body, .. } => body(this, args),
            FunctionInner::Proxy(p) => p.call(args),
            FunctionInner::Method { object, name } => object.call_method(name, args),
        }
    }

    pub fn name(&self) -> &str {
        match &*self.inner {
            FunctionInner::Native { name, .. } => name,
            FunctionInner::Proxy(p) => &p.descriptor.name,
            FunctionInner::Method { name, .. } => name,
        }
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_proxy(&self) -> bool {
        matches!(&*self.inner, FunctionInner::Proxy(_))
    }

    /// Id of the remote function this proxy stands for.
    pub fn remote_id(&self) -> Option<&str> {
        self.as_proxy().map(|p| p.id.as_str())
    }

    /// Release the remote counterpart now. Idempotent; false for non-proxies
    /// and for proxies that were already disposed.
    pub fn dispose(&self) -> bool {
        self.as_proxy().is_some_and(ProxyFunction::dispose)
    }

    pub fn is_disposed(&self) -> bool {
        self.as_proxy().is_some_and(ProxyFunction::is_disposed)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            FunctionInner::Native { name, .. } => write!(f, "Function(native {})", name),
            FunctionInner::Proxy(p) => write!(f, "Function(proxy {})", p.id),
            FunctionInner::Method { name, .. } => write!(f, "Function(method {})", name),
        }
    }
}

// ============================================================================
// Object
// ============================================================================

pub(crate) struct LocalObject {
    class: Option<Class>,
    fields: Mutex<BTreeMap<String, Value>>,
}

pub(crate) enum ObjectInner {
    Local(LocalObject),
    Proxy(ProxyObject),
}

/// An object handle with named members.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Object {
    /// An empty local object.
    pub fn new() -> Self {
        Self::local(None, BTreeMap::new())
    }

    pub fn builder() -> ObjectBuilder {
        ObjectBuilder::default()
    }

    fn local(class: Option<Class>, fields: BTreeMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(ObjectInner::Local(LocalObject {
                class,
                fields: Mutex::new(fields),
            })),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ObjectInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn as_proxy(&self) -> Option<&ProxyObject> {
        match &*self.inner {
            ObjectInner::Proxy(p) => Some(p),
            ObjectInner::Local(_) => None,
        }
    }

    /// Snapshot of a local object's own fields.
    pub(crate) fn local_fields(&self) -> Option<BTreeMap<String, Value>> {
        match &*self.inner {
            ObjectInner::Local(local) => Some(local.fields.lock().clone()),
            ObjectInner::Proxy(_) => None,
        }
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Read a member. Local objects yield `Null` for missing members; proxies
    /// fail with `NoMember` for anything their descriptor does not declare.
    pub fn get(&self, name: &str) -> Result<Value> {
        match &*self.inner {
            ObjectInner::Local(local) => {
                if let Some(v) = local.fields.lock().get(name) {
                    return Ok(v.clone());
                }
                Ok(local
                    .class
                    .as_ref()
                    .and_then(|c| c.method(name))
                    .map_or(Value::Null, Value::Function))
            }
            ObjectInner::Proxy(p) => p.get(self, name),
        }
    }

    /// Write a member.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        match &*self.inner {
            ObjectInner::Local(local) => {
                local.fields.lock().insert(name.to_string(), value);
                Ok(())
            }
            ObjectInner::Proxy(p) => p.set(name, value),
        }
    }

    /// Call a method with this object as scope.
    pub fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match &*self.inner {
            ObjectInner::Local(_) => match self.get(name)? {
                Value::Function(f) => f.call_with_this(Some(self), args),
                Value::Null => Err(TetherError::NoMember {
                    name: name.to_string(),
                }),
                other => Err(TetherError::TypeMismatch {
                    expected: "function",
                    actual: other.kind(),
                }),
            },
            ObjectInner::Proxy(p) => p.call_method(name, args),
        }
    }

    /// The class this object is an instance of, if any.
    pub fn class(&self) -> Option<Class> {
        match &*self.inner {
            ObjectInner::Local(local) => local.class.clone(),
            ObjectInner::Proxy(p) => p.class.clone(),
        }
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_proxy(&self) -> bool {
        matches!(&*self.inner, ObjectInner::Proxy(_))
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.as_proxy().map(|p| p.id.as_str())
    }

    /// Release the remote counterpart now. Idempotent.
    pub fn dispose(&self) -> bool {
        self.as_proxy().is_some_and(ProxyObject::dispose)
    }

    pub fn is_disposed(&self) -> bool {
        self.as_proxy().is_some_and(ProxyObject::is_disposed)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            ObjectInner::Local(local) => {
                let class = local.class.as_ref().map(|c| c.id().to_string());
                f.debug_struct("Object")
                    .field("class", &class)
                    .field("fields", &local.fields.lock().keys().collect::<Vec<_>>())
                    .finish()
            }
            ObjectInner::Proxy(p) => write!(f, "Object(proxy {})", p.id),
        }
    }
}

/// Builder for local objects.
#[derive(Default)]
pub struct ObjectBuilder {
    fields: BTreeMap<String, Value>,
}

impl ObjectBuilder {
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Option<&Object>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        self.fields
            .insert(name.clone(), Value::Function(Function::native(name, body)));
        self
    }

    pub fn build(self) -> Object {
        Object::local(None, self.fields)
    }
}

// ============================================================================
// Class
// ============================================================================

pub(crate) struct LocalClass {
    id: String,
    ctor: Option<Box<NativeCtor>>,
    statics: Object,
    methods: BTreeMap<String, Function>,
}

pub(crate) enum ClassInner {
    Local(LocalClass),
    Proxy(ProxyClass),
}

/// A constructible class handle.
#[derive(Clone)]
pub struct Class {
    inner: Arc<ClassInner>,
}

impl Class {
    pub fn builder(id: impl Into<String>) -> ClassBuilder {
        ClassBuilder {
            id: id.into(),
            ctor: None,
            statics: ObjectBuilder::default(),
            methods: BTreeMap::new(),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClassInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn as_proxy(&self) -> Option<&ProxyClass> {
        match &*self.inner {
            ClassInner::Proxy(p) => Some(p),
            ClassInner::Local(_) => None,
        }
    }

    pub fn id(&self) -> &str {
        match &*self.inner {
            ClassInner::Local(local) => &local.id,
            ClassInner::Proxy(p) => &p.class_id,
        }
    }

    /// Construct an instance. Proxy classes may yield a promise when their
    /// constructor is declared async.
    pub fn construct(&self, args: Vec<Value>) -> Result<Value> {
        match &*self.inner {
            ClassInner::Local(local) => match &local.ctor {
                Some(ctor) => ctor(self, args).map(Value::Object),
                None => Err(TetherError::NoMember {
                    name: format!("{}.constructor", local.id),
                }),
            },
            ClassInner::Proxy(p) => p.construct(args),
        }
    }

    /// Create a local instance of this class with the given own fields.
    pub fn instantiate<I, K>(&self, fields: I) -> Object
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let fields = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Object::local(Some(self.clone()), fields)
    }

    /// The static side of the class.
    pub fn statics(&self) -> Object {
        match &*self.inner {
            ClassInner::Local(local) => local.statics.clone(),
            ClassInner::Proxy(p) => p.statics.clone(),
        }
    }

    /// A prototype method of a local class.
    pub fn method(&self, name: &str) -> Option<Function> {
        match &*self.inner {
            ClassInner::Local(local) => local.methods.get(name).cloned(),
            ClassInner::Proxy(_) => None,
        }
    }

    /// True if instances of this class respond to `name` as a method.
    pub fn has_method(&self, name: &str) -> bool {
        match &*self.inner {
            ClassInner::Local(local) => local.methods.contains_key(name),
            ClassInner::Proxy(p) => p.prototype.descriptor.find_function(name).is_some(),
        }
    }

    pub fn ptr_eq(&self, other: &Class) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_proxy(&self) -> bool {
        matches!(&*self.inner, ClassInner::Proxy(_))
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            ClassInner::Local(local) => write!(f, "Class(local {})", local.id),
            ClassInner::Proxy(p) => write!(f, "Class(proxy {})", p.class_id),
        }
    }
}

/// Builder for local classes.
pub struct ClassBuilder {
    id: String,
    ctor: Option<Box<NativeCtor>>,
    statics: ObjectBuilder,
    methods: BTreeMap<String, Function>,
}

impl ClassBuilder {
    pub fn constructor<F>(mut self, ctor: F) -> Self
    where
        F: Fn(&Class, Vec<Value>) -> Result<Object> + Send + Sync + 'static,
    {
        self.ctor = Some(Box::new(ctor));
        self
    }

    /// Add a prototype method shared by every instance.
    pub fn method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Option<&Object>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        self.methods
            .insert(name.clone(), Function::native(name, body));
        self
    }

    pub fn static_method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Option<&Object>, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.statics = self.statics.method(name, body);
        self
    }

    pub fn static_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.statics = self.statics.field(name, value);
        self
    }

    pub fn build(self) -> Class {
        Class {
            inner: Arc::new(ClassInner::Local(LocalClass {
                id: self.id,
                ctor: self.ctor,
                statics: self.statics.build(),
                methods: self.methods,
            })),
        }
    }
}

/// Resolve the `this` scope of a native method, failing if it is missing.
pub fn this_object(this: Option<&Object>) -> Result<&Object> {
    this.ok_or_else(|| TetherError::failed("method called without an object scope"))
}
