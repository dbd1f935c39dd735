//! Descriptor codec: copy-or-reference encoding of [`Value`]s for the wire.
//!
//! Copiable values (primitives, binary buffers, and lists/maps made only of
//! copiable values) are inlined as [`WireValue`]s. Objects are exported as
//! [`Descriptor`]s naming the owning channel and a registry path; exporting
//! an unregistered object registers it under a fresh random path.
//!
//! On the receiving side a descriptor owned by the local channel resolves
//! back to the registered value; any other descriptor becomes a
//! [`RemoteProxy`], deduplicated through a [`DecodeCache`] so the same
//! `(owner, path)` always yields the same proxy instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError, Weak};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::proxy::{Invoker, RemoteProxy, WeakProxy};
use crate::registry::ObjectRegistry;
use crate::value::{ObjectRef, Path, Value};

/// Wire form of a remote reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub path: Path,
    pub owner_channel: String,
    pub channel: String,
    #[serde(default)]
    pub primitive: bool,
    #[serde(default = "default_true")]
    pub writable: bool,
    #[serde(default = "default_true")]
    pub enumerable: bool,
    #[serde(default = "default_true")]
    pub configurable: bool,
    /// Declared parameter count; -1 for non-functions.
    #[serde(default = "default_arity")]
    pub argument_count: i64,
}

fn default_true() -> bool {
    true
}

fn default_arity() -> i64 {
    -1
}

impl Descriptor {
    pub fn new(owner: impl Into<String>, channel: impl Into<String>, path: Path) -> Self {
        Self {
            path,
            owner_channel: owner.into(),
            channel: channel.into(),
            primitive: false,
            writable: true,
            enumerable: true,
            configurable: true,
            argument_count: -1,
        }
    }

    /// Descriptor for a local object exported to `channel`.
    pub fn for_object(owner: &str, channel: &str, path: Path, object: &ObjectRef) -> Self {
        let mut descriptor = Self::new(owner, channel, path);
        if object.is_callable() || object.is_constructor() {
            descriptor.argument_count = object.arity() as i64;
        }
        descriptor
    }

    /// Render as a plain map value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).map(Value::from).unwrap_or_default()
    }
}

/// A value as carried inside a message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Bytes),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Descriptor(Descriptor),
}

impl WireValue {
    pub fn as_descriptor(&self) -> Option<&Descriptor> {
        match self {
            WireValue::Descriptor(d) => Some(d),
            _ => None,
        }
    }

    /// Plain JSON rendering; descriptors appear as their field map.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            WireValue::Null => serde_json::Value::Null,
            WireValue::Bool(b) => serde_json::Value::Bool(*b),
            WireValue::Int(i) => serde_json::Value::from(*i),
            WireValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            WireValue::String(s) => serde_json::Value::String(s.clone()),
            WireValue::Binary(b) => {
                serde_json::Value::Array(b.iter().map(|byte| serde_json::Value::from(*byte)).collect())
            }
            WireValue::List(items) => serde_json::Value::Array(items.iter().map(WireValue::to_json).collect()),
            WireValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            WireValue::Descriptor(d) => serde_json::to_value(d).unwrap_or_default(),
        }
    }
}

/// Whether `value` can be copied inline. A pure function of the tags.
pub fn is_copiable(value: &Value) -> bool {
    match value {
        Value::Object(_) | Value::Remote(_) => false,
        Value::List(items) => items.iter().all(is_copiable),
        Value::Map(map) => map.values().all(is_copiable),
        _ => true,
    }
}

/// Encodes values sent from `local` to `target`.
pub struct Encoder<'a> {
    local: &'a str,
    target: &'a str,
    registry: &'a ObjectRegistry,
}

impl<'a> Encoder<'a> {
    pub fn new(local: &'a str, target: &'a str, registry: &'a ObjectRegistry) -> Self {
        Self {
            local,
            target,
            registry,
        }
    }

    /// Encode recursively; nested objects become descriptors.
    pub fn encode(&self, value: &Value) -> WireValue {
        match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::String(s) => WireValue::String(s.clone()),
            Value::Binary(b) => WireValue::Binary(b.clone()),
            Value::List(items) => WireValue::List(items.iter().map(|v| self.encode(v)).collect()),
            Value::Map(map) => {
                WireValue::Map(map.iter().map(|(k, v)| (k.clone(), self.encode(v))).collect())
            }
            Value::Object(obj) => WireValue::Descriptor(self.export(obj)),
            Value::Remote(proxy) => WireValue::Descriptor(self.forward(proxy)),
        }
    }

    pub fn encode_all(&self, values: &[Value]) -> Vec<WireValue> {
        values.iter().map(|v| self.encode(v)).collect()
    }

    /// Descriptor for a local object, registering it when needed.
    pub fn export(&self, object: &ObjectRef) -> Descriptor {
        let path = self.registry.register(object);
        Descriptor::for_object(self.local, self.target, path, object)
    }

    /// Descriptor for a local object at a known path, without registering.
    pub fn export_at(&self, object: &ObjectRef, path: Path) -> Descriptor {
        Descriptor::for_object(self.local, self.target, path, object)
    }

    /// Re-export a proxy: the descriptor keeps pointing at the real owner.
    pub fn forward(&self, proxy: &RemoteProxy) -> Descriptor {
        let mut descriptor = proxy.descriptor();
        descriptor.channel = self.target.to_string();
        descriptor
    }
}

/// Identity-preserving cache of decoded proxies.
#[derive(Default)]
pub struct DecodeCache {
    entries: Mutex<HashMap<(String, Path), WeakProxy>>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live proxy for `(owner, path)`, or create one with `make`.
    pub fn resolve(&self, descriptor: &Descriptor, make: impl FnOnce() -> RemoteProxy) -> RemoteProxy {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (descriptor.owner_channel.clone(), descriptor.path.clone());
        if let Some(proxy) = entries.get(&key).and_then(WeakProxy::upgrade) {
            return proxy;
        }
        entries.retain(|_, weak| weak.is_alive());
        let proxy = make();
        entries.insert(key, proxy.downgrade());
        proxy
    }

    /// Number of live cached proxies.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|w| w.is_alive())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Decodes values received by `local`.
pub struct Decoder<'a> {
    local: &'a str,
    registry: &'a ObjectRegistry,
    cache: &'a DecodeCache,
    invoker: Weak<dyn Invoker>,
}

impl<'a> Decoder<'a> {
    pub fn new(
        local: &'a str,
        registry: &'a ObjectRegistry,
        cache: &'a DecodeCache,
        invoker: Weak<dyn Invoker>,
    ) -> Self {
        Self {
            local,
            registry,
            cache,
            invoker,
        }
    }

    pub fn decode(&self, wire: WireValue) -> Value {
        match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::String(s) => Value::String(s),
            WireValue::Binary(b) => Value::Binary(b),
            WireValue::List(items) => Value::List(items.into_iter().map(|w| self.decode(w)).collect()),
            WireValue::Map(map) => {
                Value::Map(map.into_iter().map(|(k, w)| (k, self.decode(w))).collect())
            }
            WireValue::Descriptor(descriptor) => self.decode_descriptor(descriptor),
        }
    }

    pub fn decode_all(&self, values: Vec<WireValue>) -> Vec<Value> {
        values.into_iter().map(|w| self.decode(w)).collect()
    }

    /// Local descriptors dereference through the registry (a stale path
    /// yields null); foreign ones become cached proxies.
    pub fn decode_descriptor(&self, descriptor: Descriptor) -> Value {
        if descriptor.owner_channel == self.local {
            return self.registry.read(&descriptor.path).unwrap_or_default();
        }
        let invoker = self.invoker.clone();
        let proxy = self.cache.resolve(&descriptor, || {
            RemoteProxy::from_descriptor(invoker, descriptor.clone())
        });
        Value::Remote(proxy)
    }
}
