//! Runtime values exchanged through channels.
//!
//! [`Value`] is the tagged union every channel operation works with. The
//! copy-or-reference decision is made on the tag alone: [`Value::Object`] and
//! [`Value::Remote`] travel by reference, everything else is copied inline.
//!
//! [`ObjectRef`] is the identity-bearing object model: a property table with
//! an optional prototype, optionally callable (function, bound function) or
//! constructible. Every object carries a stable [`ObjectId`] which the
//! object registry uses for its reverse index.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{ChannelError, Result};
use crate::proxy::RemoteProxy;

/// Ordered segments addressing a value inside a channel's object graph.
pub type Path = Vec<String>;

/// Build a [`Path`] from anything string-like.
pub fn path<I, S>(segments: I) -> Path
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    segments.into_iter().map(Into::into).collect()
}

/// A value as seen by local code.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A local object, passed by reference.
    Object(ObjectRef),
    /// A placeholder for an object living in another channel.
    Remote(RemoteProxy),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Remote(_) => "remote",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for values that travel by reference.
    pub fn is_reference(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Remote(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteProxy> {
        match self {
            Value::Remote(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Interpret the value as a property key.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }

    /// Convert a copiable value to JSON. Returns `None` if the graph holds a
    /// reference.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Value::List(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Option<Vec<_>>>()?,
            ),
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect::<Option<serde_json::Map<_, _>>>()?,
            ),
            Value::Object(_) | Value::Remote(_) => return None,
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Remote(a), Value::Remote(b)) => a.same_target(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Map(map) => f.debug_map().entries(map).finish(),
            Value::Object(obj) => fmt::Debug::fmt(obj, f),
            Value::Remote(proxy) => fmt::Debug::fmt(proxy, f),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}

impl From<RemoteProxy> for Value {
    fn from(proxy: RemoteProxy) -> Self {
        Value::Remote(proxy)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Stable identity of an [`ObjectRef`], unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Native function body: receives `this` and the call arguments.
pub type NativeFn = Arc<dyn Fn(Value, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Native constructor body.
pub type NativeCtor = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A single own property slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub value: Value,
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
}

impl Property {
    /// A plain writable, enumerable, configurable data property.
    pub fn data(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// A property that can be neither reassigned nor deleted.
    pub fn frozen(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            writable: false,
            enumerable: true,
            configurable: false,
        }
    }

    /// Render as a descriptor map (`value`, `writable`, `enumerable`, `configurable`).
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("value".to_string(), self.value.clone());
        map.insert("writable".to_string(), Value::Bool(self.writable));
        map.insert("enumerable".to_string(), Value::Bool(self.enumerable));
        map.insert("configurable".to_string(), Value::Bool(self.configurable));
        Value::Map(map)
    }
}

enum Callable {
    Function(NativeFn),
    Constructor(NativeCtor),
    Bound { target: ObjectRef, this: Value },
}

struct ObjectState {
    properties: BTreeMap<String, Property>,
    prototype: Option<ObjectRef>,
    extensible: bool,
    arity: usize,
}

struct ObjectCell {
    id: ObjectId,
    callable: Option<Callable>,
    state: RwLock<ObjectState>,
}

/// Shared handle to a local object. Cloning shares identity.
#[derive(Clone)]
pub struct ObjectRef(Arc<ObjectCell>);

impl Default for ObjectRef {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRef {
    fn with_callable(callable: Option<Callable>, arity: usize) -> Self {
        Self(Arc::new(ObjectCell {
            id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            callable,
            state: RwLock::new(ObjectState {
                properties: BTreeMap::new(),
                prototype: None,
                extensible: true,
                arity,
            }),
        }))
    }

    /// An empty plain object.
    pub fn new() -> Self {
        Self::with_callable(None, 0)
    }

    /// A function backed by a synchronous closure.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let body: NativeFn = Arc::new(move |this, args| futures::future::ready(f(this, args)).boxed());
        Self::with_callable(Some(Callable::Function(body)), 0)
    }

    /// A function backed by an async closure.
    pub fn async_function<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let body: NativeFn = Arc::new(move |this, args| f(this, args).boxed());
        Self::with_callable(Some(Callable::Function(body)), 0)
    }

    /// A constructor backed by a synchronous closure.
    pub fn constructor<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let body: NativeCtor = Arc::new(move |args| futures::future::ready(f(args)).boxed());
        Self::with_callable(Some(Callable::Constructor(body)), 0)
    }

    /// A function with `this` fixed to `this`.
    pub fn bind(&self, this: Value) -> Self {
        Self::with_callable(
            Some(Callable::Bound {
                target: self.clone(),
                this,
            }),
            self.arity(),
        )
    }

    /// Declare the number of parameters reported in descriptors.
    pub fn with_arity(self, arity: usize) -> Self {
        self.write_state().arity = arity;
        self
    }

    /// Builder-style property insertion.
    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.define(key, Property::data(value));
        self
    }

    pub fn id(&self) -> ObjectId {
        self.0.id
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn arity(&self) -> usize {
        self.read_state().arity
    }

    pub fn is_callable(&self) -> bool {
        match &self.0.callable {
            Some(Callable::Function(_)) => true,
            Some(Callable::Bound { target, .. }) => target.is_callable(),
            _ => false,
        }
    }

    pub fn is_constructor(&self) -> bool {
        match &self.0.callable {
            Some(Callable::Constructor(_)) => true,
            Some(Callable::Bound { target, .. }) => target.is_constructor(),
            _ => false,
        }
    }

    /// Invoke the object as a function.
    pub fn call(&self, this: Value, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        match &self.0.callable {
            Some(Callable::Function(body)) => body(this, args),
            Some(Callable::Bound { target, this }) => target.call(this.clone(), args),
            _ => {
                let path = self.id().to_string();
                async move { Err(ChannelError::NotCallable { path }) }.boxed()
            }
        }
    }

    /// Invoke the object as a constructor.
    pub fn construct(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        match &self.0.callable {
            Some(Callable::Constructor(body)) => body(args),
            Some(Callable::Bound { target, .. }) => target.construct(args),
            _ => {
                let path = self.id().to_string();
                async move { Err(ChannelError::NotConstructible { path }) }.boxed()
            }
        }
    }

    /// Read a property, walking the prototype chain.
    pub fn get(&self, key: &str) -> Option<Value> {
        let proto = {
            let state = self.read_state();
            if let Some(prop) = state.properties.get(key) {
                return Some(prop.value.clone());
            }
            state.prototype.clone()
        };
        proto.and_then(|p| p.get(key))
    }

    /// Assign an own property. Fails on read-only slots and on new keys of a
    /// non-extensible object.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        let mut state = self.write_state();
        let extensible = state.extensible;
        match state.properties.get_mut(&key) {
            Some(prop) if !prop.writable => false,
            Some(prop) => {
                prop.value = value.into();
                true
            }
            None if !extensible => false,
            None => {
                state.properties.insert(key, Property::data(value));
                true
            }
        }
    }

    /// Define or redefine an own property, honoring `configurable`.
    pub fn define(&self, key: impl Into<String>, property: Property) -> bool {
        let key = key.into();
        let mut state = self.write_state();
        let extensible = state.extensible;
        match state.properties.get(&key) {
            Some(existing) if !existing.configurable => false,
            None if !extensible => false,
            _ => {
                state.properties.insert(key, property);
                true
            }
        }
    }

    pub fn has(&self, key: &str) -> bool {
        let proto = {
            let state = self.read_state();
            if state.properties.contains_key(key) {
                return true;
            }
            state.prototype.clone()
        };
        proto.is_some_and(|p| p.has(key))
    }

    /// Delete an own property. Deleting an absent key succeeds.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.write_state();
        match state.properties.get(key) {
            Some(prop) if !prop.configurable => false,
            Some(_) => {
                state.properties.remove(key);
                true
            }
            None => true,
        }
    }

    pub fn own_keys(&self) -> Vec<String> {
        self.read_state().properties.keys().cloned().collect()
    }

    pub fn own_property(&self, key: &str) -> Option<Property> {
        self.read_state().properties.get(key).cloned()
    }

    pub fn prototype(&self) -> Option<ObjectRef> {
        self.read_state().prototype.clone()
    }

    /// Replace the prototype. Refused on non-extensible objects and when the
    /// new chain would loop back to this object.
    pub fn set_prototype(&self, proto: Option<ObjectRef>) -> bool {
        let mut cursor = proto.clone();
        while let Some(candidate) = cursor {
            if candidate.ptr_eq(self) {
                return false;
            }
            cursor = candidate.prototype();
        }

        let mut state = self.write_state();
        let unchanged = match (&state.prototype, &proto) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return true;
        }
        if !state.extensible {
            return false;
        }
        state.prototype = proto;
        true
    }

    pub fn is_extensible(&self) -> bool {
        self.read_state().extensible
    }

    pub fn prevent_extensions(&self) -> bool {
        self.write_state().extensible = false;
        true
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ObjectState> {
        self.0.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ObjectState> {
        self.0.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.0.callable {
            None => "object",
            Some(Callable::Function(_)) => "function",
            Some(Callable::Constructor(_)) => "constructor",
            Some(Callable::Bound { .. }) => "bound",
        };
        write!(f, "ObjectRef({kind} {})", self.id())
    }
}
