//! Remote proxies: local placeholders for objects owned by another channel.
//!
//! Every operation on a [`RemoteProxy`] becomes an `(action, path, args)`
//! request through its [`Invoker`], normally the channel that decoded it.
//! Member access is explicit (`proxy.child("x")`, `proxy.call(args)`), and
//! child proxies are cached so repeated access yields the same instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;

use crate::codec::Descriptor;
use crate::error::{ChannelError, Result};
use crate::reflect::Action;
use crate::value::{Path, Value};

/// Reserved member: the proxy's path as a list of strings.
pub const PATH_MEMBER: &str = "$path";
/// Reserved member: the owning channel name.
pub const CHANNEL_MEMBER: &str = "$channel";
/// Reserved member: the descriptor this proxy stands for.
pub const DESCRIPTOR_MEMBER: &str = "$descriptor";
/// Reserved member: marker that the value is invocable remotely.
pub const INVOKE_MEMBER: &str = "$invoke";

/// Sends one remote action and waits for its result.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, target: &str, action: Action, path: Path, args: Vec<Value>) -> Result<Value>;
}

struct ProxyInner {
    invoker: Weak<dyn Invoker>,
    channel: String,
    path: Path,
    descriptor: Option<Descriptor>,
    children: Mutex<HashMap<String, RemoteProxy>>,
}

/// Placeholder bound to `(invoker, channel, path)`.
#[derive(Clone)]
pub struct RemoteProxy {
    inner: Arc<ProxyInner>,
}

/// Non-owning handle used by decode caches.
#[derive(Clone)]
pub struct WeakProxy(Weak<ProxyInner>);

impl WeakProxy {
    pub fn upgrade(&self) -> Option<RemoteProxy> {
        self.0.upgrade().map(|inner| RemoteProxy { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl RemoteProxy {
    pub fn new(invoker: Weak<dyn Invoker>, channel: impl Into<String>, path: Path) -> Self {
        Self::build(invoker, channel.into(), path, None)
    }

    /// Proxy for a decoded descriptor; targets the descriptor's owner.
    pub fn from_descriptor(invoker: Weak<dyn Invoker>, descriptor: Descriptor) -> Self {
        let channel = descriptor.owner_channel.clone();
        let path = descriptor.path.clone();
        Self::build(invoker, channel, path, Some(descriptor))
    }

    fn build(
        invoker: Weak<dyn Invoker>,
        channel: String,
        path: Path,
        descriptor: Option<Descriptor>,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                invoker,
                channel,
                path,
                descriptor,
                children: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Owning channel.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn path(&self) -> &[String] {
        &self.inner.path
    }

    /// The descriptor this proxy was decoded from, or one synthesized from
    /// its channel and path.
    pub fn descriptor(&self) -> Descriptor {
        self.inner.descriptor.clone().unwrap_or_else(|| {
            Descriptor::new(self.channel(), self.channel(), self.inner.path.clone())
        })
    }

    pub fn downgrade(&self) -> WeakProxy {
        WeakProxy(Arc::downgrade(&self.inner))
    }

    /// Same owner and path.
    /// Whether both handles are the same proxy instance.
    pub fn ptr_eq(&self, other: &RemoteProxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn same_target(&self, other: &RemoteProxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.channel == other.inner.channel && self.inner.path == other.inner.path)
    }

    /// Cached child proxy at `path + [name]`.
    pub fn child(&self, name: &str) -> RemoteProxy {
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        children
            .entry(name.to_string())
            .or_insert_with(|| {
                let mut path = self.inner.path.clone();
                path.push(name.to_string());
                Self::build(self.inner.invoker.clone(), self.inner.channel.clone(), path, None)
            })
            .clone()
    }

    /// Member access: reserved names answer locally, anything else yields
    /// a child proxy.
    pub fn get(&self, name: &str) -> Value {
        match name {
            PATH_MEMBER => Value::List(self.inner.path.iter().cloned().map(Value::String).collect()),
            CHANNEL_MEMBER => Value::String(self.inner.channel.clone()),
            DESCRIPTOR_MEMBER => self.descriptor().to_value(),
            INVOKE_MEMBER => Value::Bool(true),
            _ => Value::Remote(self.child(name)),
        }
    }

    /// Send `action` against this proxy's path.
    pub async fn invoke(&self, action: Action, args: Vec<Value>) -> Result<Value> {
        self.invoke_at(action, self.inner.path.clone(), args).await
    }

    async fn invoke_at(&self, action: Action, path: Path, args: Vec<Value>) -> Result<Value> {
        let invoker = self.inner.invoker.upgrade().ok_or_else(|| ChannelError::Closed {
            channel: self.inner.channel.clone(),
        })?;
        invoker.invoke(&self.inner.channel, action, path, args).await
    }

    /// Fetch the value this proxy points at.
    pub async fn value(&self) -> Result<Value> {
        match self.inner.path.split_last() {
            Some((name, parent)) => {
                self.invoke_at(Action::Get, parent.to_vec(), vec![Value::String(name.clone())])
                    .await
            }
            None => Ok(Value::Null),
        }
    }

    /// Assign `value` to member `name`.
    pub async fn set(&self, name: &str, value: impl Into<Value>) -> Result<bool> {
        self.invoke(Action::Set, vec![Value::from(name), value.into()])
            .await
            .map(truthy)
    }

    /// Call the remote function.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.invoke(Action::Apply, vec![Value::List(args)]).await
    }

    /// Construct with the remote constructor.
    pub async fn construct(&self, args: Vec<Value>) -> Result<Value> {
        self.invoke(Action::Construct, vec![Value::List(args)]).await
    }

    pub async fn has(&self, name: &str) -> Result<bool> {
        self.invoke(Action::Has, vec![Value::from(name)]).await.map(truthy)
    }

    /// Delete member `name` on the remote side.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let mut path = self.inner.path.clone();
        path.push(name.to_string());
        self.invoke_at(Action::DeleteProperty, path, Vec::new())
            .await
            .map(truthy)
    }

    /// Release the remote registry entry behind this proxy.
    pub async fn dispose(&self) -> Result<bool> {
        self.invoke(Action::Dispose, Vec::new()).await.map(truthy)
    }

    pub async fn own_keys(&self) -> Result<Vec<String>> {
        let keys = self.invoke(Action::OwnKeys, Vec::new()).await?;
        Ok(keys
            .as_list()
            .map(|items| items.iter().filter_map(Value::as_key).collect())
            .unwrap_or_default())
    }

    pub async fn get_own_property_descriptor(&self, name: &str) -> Result<Value> {
        self.invoke(Action::GetOwnPropertyDescriptor, vec![Value::from(name)])
            .await
    }

    pub async fn get_prototype_of(&self) -> Result<Value> {
        self.invoke(Action::GetPrototypeOf, Vec::new()).await
    }

    pub async fn set_prototype_of(&self, proto: impl Into<Value>) -> Result<bool> {
        self.invoke(Action::SetPrototypeOf, vec![proto.into()])
            .await
            .map(truthy)
    }

    pub async fn is_extensible(&self) -> Result<bool> {
        self.invoke(Action::IsExtensible, Vec::new()).await.map(truthy)
    }

    pub async fn prevent_extensions(&self) -> Result<bool> {
        self.invoke(Action::PreventExtensions, Vec::new())
            .await
            .map(truthy)
    }
}

fn truthy(value: Value) -> bool {
    value.as_bool().unwrap_or(false)
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteProxy({}:{})", self.inner.channel, self.inner.path.join("."))
    }
}
