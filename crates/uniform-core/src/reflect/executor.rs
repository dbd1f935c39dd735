use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::{Action, ModuleLoader, Reflect};
use crate::error::{ChannelError, Result};
use crate::registry::ObjectRegistry;
use crate::value::{Path, Value};

/// Who is asking: the executing channel and the requesting sender.
#[derive(Debug, Clone, Default)]
pub struct ExecScope {
    pub channel: String,
    pub sender: String,
    /// Explicit `this` for APPLY, overriding the parent-path object.
    pub context: Option<Value>,
}

impl ExecScope {
    pub fn new(channel: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sender: sender.into(),
            context: None,
        }
    }
}

/// Outcome of one action.
#[derive(Debug)]
pub struct Execution {
    pub result: Result<Value>,
    /// Path the result lives at; GET extends the request path by the key.
    pub path: Path,
    /// Binary payloads marked for zero-copy hand-off.
    pub transfer: Vec<Bytes>,
}

/// Runs reflection actions against a channel's object registry.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<ObjectRegistry>,
    reflect: Arc<dyn Reflect>,
    modules: Option<Arc<dyn ModuleLoader>>,
}

impl Executor {
    pub fn new(
        registry: Arc<ObjectRegistry>,
        reflect: Arc<dyn Reflect>,
        modules: Option<Arc<dyn ModuleLoader>>,
    ) -> Self {
        Self {
            registry,
            reflect,
            modules,
        }
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    /// Resolve `path` and perform `action` on it.
    ///
    /// Strategy failures are captured in [`Execution::result`]; this never
    /// panics on bad input.
    pub async fn execute(
        &self,
        action: Action,
        path: &[String],
        args: Vec<Value>,
        scope: &ExecScope,
    ) -> Execution {
        let mut out_path = path.to_vec();
        let mut transfer = Vec::new();
        trace!(channel = %scope.channel, %action, path = %path.join("."), "execute");

        let result = match action {
            Action::Get => self.get(path, &args, &mut out_path),
            Action::Set => self.set(path, args),
            Action::Apply => self.apply(path, args, scope).await,
            Action::Construct => self.construct(path, args).await,
            Action::DeleteProperty => match args.first().and_then(Value::as_key) {
                Some(key) if !path.is_empty() => self
                    .reflect
                    .delete_property(&self.target(path), &key)
                    .map(Value::Bool),
                _ => Ok(Value::Bool(self.dispose(path, &args))),
            },
            Action::Dispose => Ok(Value::Bool(self.dispose(path, &args))),
            Action::Has => self.has(path, &args),
            Action::OwnKeys => self.own_keys(path),
            Action::GetOwnPropertyDescriptor => {
                let target = self.target(path);
                key_arg(&args, 0).and_then(|key| {
                    self.reflect
                        .get_own_property_descriptor(&target, &key)
                        .map(|prop| prop.map(|p| p.to_value()).unwrap_or_default())
                })
            }
            Action::GetPrototypeOf => self.reflect.get_prototype_of(&self.target(path)),
            Action::SetPrototypeOf => {
                let proto = args.into_iter().next().unwrap_or_default();
                self.reflect
                    .set_prototype_of(&self.target(path), &proto)
                    .map(Value::Bool)
            }
            Action::IsExtensible => self.reflect.is_extensible(&self.target(path)).map(Value::Bool),
            Action::PreventExtensions => self
                .reflect
                .prevent_extensions(&self.target(path))
                .map(Value::Bool),
            Action::Transfer => {
                let value = self.target(path);
                if scope.channel != scope.sender {
                    if let Value::Binary(bytes) = &value {
                        transfer.push(bytes.clone());
                    }
                }
                Ok(value)
            }
            Action::Import => self.import(&args).await,
            Action::Unknown => Ok(Value::Null),
        };

        if let Err(e) = &result {
            debug!(channel = %scope.channel, %action, path = %path.join("."), error = %e, "action failed");
        }

        Execution {
            result,
            path: out_path,
            transfer,
        }
    }

    fn target(&self, path: &[String]) -> Value {
        self.registry.read(path).unwrap_or_default()
    }

    fn get(&self, path: &[String], args: &[Value], out_path: &mut Path) -> Result<Value> {
        let Some(key) = args.first().and_then(Value::as_key) else {
            return Ok(self.target(path));
        };
        out_path.push(key.clone());

        if path.is_empty() {
            return Ok(self.registry.read(&[key]).unwrap_or_default());
        }

        let target = self.target(path);
        if let Value::Remote(proxy) = &target {
            return Ok(Value::Remote(proxy.child(&key)));
        }
        let value = self.reflect.get(&target, &key)?;
        Ok(match (&value, &target) {
            (Value::Object(f), Value::Object(_)) if f.is_callable() => Value::Object(f.bind(target.clone())),
            _ => value,
        })
    }

    fn set(&self, path: &[String], args: Vec<Value>) -> Result<Value> {
        let mut args = args.into_iter();
        let key = args
            .next()
            .and_then(|k| k.as_key())
            .ok_or_else(|| invalid_arg("set", "missing property key"))?;
        let value = args.next().unwrap_or_default();

        let mut member = path.to_vec();
        member.push(key.clone());
        if path.is_empty() {
            return Ok(Value::Bool(self.registry.write(&member, value)));
        }

        match self.target(path) {
            target @ Value::Object(_) => {
                let written = self.reflect.set(&target, &key, value.clone())?;
                if written {
                    // keep the reverse index in step with the new member
                    self.registry.write(&member, value);
                }
                Ok(Value::Bool(written))
            }
            _ => Ok(Value::Bool(self.registry.write(&member, value))),
        }
    }

    async fn apply(&self, path: &[String], args: Vec<Value>, scope: &ExecScope) -> Result<Value> {
        let call_args = spread(args);
        match self.target(path) {
            Value::Object(f) if f.is_callable() => {
                let this = match &scope.context {
                    Some(ctx) => ctx.clone(),
                    None => match path.split_last() {
                        Some((_, parent)) if !parent.is_empty() => self.target(parent),
                        _ => Value::Null,
                    },
                };
                self.reflect.apply(&f, this, call_args).await
            }
            Value::Remote(proxy) => proxy.call(call_args).await,
            _ => Err(ChannelError::NotCallable {
                path: path.join("."),
            }),
        }
    }

    async fn construct(&self, path: &[String], args: Vec<Value>) -> Result<Value> {
        let ctor_args = spread(args);
        match self.target(path) {
            Value::Object(ctor) if ctor.is_constructor() => {
                self.reflect.construct(&ctor, ctor_args).await
            }
            Value::Remote(proxy) => proxy.construct(ctor_args).await,
            _ => Err(ChannelError::NotConstructible {
                path: path.join("."),
            }),
        }
    }

    fn dispose(&self, path: &[String], args: &[Value]) -> bool {
        if !path.is_empty() {
            return self.registry.remove(path);
        }
        args.first()
            .is_some_and(|value| self.registry.remove_by_value(value))
    }

    fn has(&self, path: &[String], args: &[Value]) -> Result<Value> {
        let key = key_arg(args, 0)?;
        if path.is_empty() {
            return Ok(Value::Bool(self.registry.read(&[key]).is_some()));
        }
        self.reflect.has(&self.target(path), &key).map(Value::Bool)
    }

    fn own_keys(&self, path: &[String]) -> Result<Value> {
        let keys = if path.is_empty() {
            self.registry.roots()
        } else {
            self.reflect.own_keys(&self.target(path))?
        };
        Ok(Value::List(keys.into_iter().map(Value::String).collect()))
    }

    async fn import(&self, args: &[Value]) -> Result<Value> {
        let specifier = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| invalid_arg("import", "missing module specifier"))?;
        match &self.modules {
            Some(loader) => loader.load(specifier).await,
            None => Err(ChannelError::ModuleNotFound {
                specifier: specifier.to_string(),
            }),
        }
    }
}

/// APPLY/CONSTRUCT carry their arguments as a single list.
fn spread(args: Vec<Value>) -> Vec<Value> {
    match args.into_iter().next() {
        Some(Value::List(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

fn key_arg(args: &[Value], index: usize) -> Result<String> {
    args.get(index)
        .and_then(Value::as_key)
        .ok_or_else(|| invalid_arg("key", "missing property key"))
}

fn invalid_arg(field: &str, message: &str) -> ChannelError {
    ChannelError::Validation {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{ModuleTable, NativeReflect};
    use crate::value::{path, ObjectRef};

    fn create_test_executor() -> Executor {
        let registry = Arc::new(ObjectRegistry::new("host"));
        Executor::new(registry, Arc::new(NativeReflect), None)
    }

    fn scope() -> ExecScope {
        ExecScope::new("host", "worker")
    }

    #[tokio::test]
    async fn test_get_missing_path_returns_null() {
        let executor = create_test_executor();
        let exec = executor
            .execute(Action::Get, &path(["missing"]), vec![Value::from("x")], &scope())
            .await;
        assert_eq!(exec.result.unwrap(), Value::Null);
        assert_eq!(exec.path, path(["missing", "x"]));
    }

    #[tokio::test]
    async fn test_get_root_from_empty_path() {
        let executor = create_test_executor();
        executor.registry().write(&path(["answer"]), Value::Int(42));
        let exec = executor
            .execute(Action::Get, &[], vec![Value::from("answer")], &scope())
            .await;
        assert_eq!(exec.result.unwrap(), Value::Int(42));
    }

    #[tokio::test]
    async fn test_apply_uses_parent_as_this() {
        let executor = create_test_executor();
        let counter = ObjectRef::new().with("count", 7);
        counter.set(
            "read",
            ObjectRef::function(|this, _| {
                Ok(this
                    .as_object()
                    .and_then(|o| o.get("count"))
                    .unwrap_or_default())
            }),
        );
        executor.registry().write(&path(["counter"]), Value::Object(counter));

        let exec = executor
            .execute(Action::Apply, &path(["counter", "read"]), vec![Value::List(vec![])], &scope())
            .await;
        assert_eq!(exec.result.unwrap(), Value::Int(7));
    }

    #[tokio::test]
    async fn test_apply_on_non_callable_fails() {
        let executor = create_test_executor();
        executor.registry().write(&path(["data"]), Value::Int(1));
        let exec = executor
            .execute(Action::Apply, &path(["data"]), vec![], &scope())
            .await;
        assert!(matches!(exec.result, Err(ChannelError::NotCallable { .. })));
    }

    #[tokio::test]
    async fn test_function_errors_are_captured() {
        let executor = create_test_executor();
        executor.registry().write(
            &path(["boom"]),
            Value::Object(ObjectRef::function(|_, _| Err(ChannelError::Other("kaboom".into())))),
        );
        let exec = executor
            .execute(Action::Apply, &path(["boom"]), vec![Value::List(vec![])], &scope())
            .await;
        assert_eq!(exec.result.unwrap_err().to_string(), "kaboom");
    }

    #[tokio::test]
    async fn test_construct_passes_arguments() {
        let executor = create_test_executor();
        let ctor = ObjectRef::constructor(|args| {
            Ok(Value::Object(ObjectRef::new().with("size", args.len())))
        });
        executor.registry().write(&path(["Thing"]), Value::Object(ctor));

        let exec = executor
            .execute(
                Action::Construct,
                &path(["Thing"]),
                vec![Value::List(vec![Value::Int(1), Value::Int(2)])],
                &scope(),
            )
            .await;
        let instance = exec.result.unwrap();
        assert_eq!(instance.as_object().unwrap().get("size"), Some(Value::Int(2)));
    }

    #[tokio::test]
    async fn test_set_then_delete_member() {
        let executor = create_test_executor();
        let obj = ObjectRef::new();
        executor.registry().write(&path(["o"]), Value::Object(obj.clone()));

        let exec = executor
            .execute(Action::Set, &path(["o"]), vec![Value::from("k"), Value::Int(5)], &scope())
            .await;
        assert_eq!(exec.result.unwrap(), Value::Bool(true));
        assert_eq!(obj.get("k"), Some(Value::Int(5)));

        let exec = executor
            .execute(Action::DeleteProperty, &path(["o", "k"]), vec![], &scope())
            .await;
        assert_eq!(exec.result.unwrap(), Value::Bool(true));
        assert!(!obj.has("k"));
    }

    #[tokio::test]
    async fn test_delete_property_with_key_keeps_target_registered() {
        let executor = create_test_executor();
        let obj = ObjectRef::new().with("k", 1).with("keep", 2);
        executor.registry().write(&path(["o"]), Value::Object(obj.clone()));

        let exec = executor
            .execute(Action::DeleteProperty, &path(["o"]), vec![Value::from("k")], &scope())
            .await;
        assert_eq!(exec.result.unwrap(), Value::Bool(true));
        assert!(!obj.has("k"));
        assert_eq!(obj.get("keep"), Some(Value::Int(2)));
        assert!(executor.registry().read(&path(["o"])).is_some());

        executor.registry().write(&path(["n"]), Value::Int(3));
        let exec = executor
            .execute(Action::DeleteProperty, &path(["n"]), vec![Value::from("x")], &scope())
            .await;
        assert_eq!(exec.result.unwrap(), Value::Bool(false));
    }

    #[tokio::test]
    async fn test_get_own_property_descriptor_requires_key() {
        let executor = create_test_executor();
        executor
            .registry()
            .write(&path(["o"]), Value::Object(ObjectRef::new().with("k", 1)));

        let exec = executor
            .execute(Action::GetOwnPropertyDescriptor, &path(["o"]), vec![Value::from("k")], &scope())
            .await;
        assert!(exec.result.unwrap().as_map().is_some());

        let exec = executor
            .execute(Action::GetOwnPropertyDescriptor, &path(["o"]), vec![], &scope())
            .await;
        assert!(matches!(exec.result, Err(ChannelError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_dispose_by_value() {
        let executor = create_test_executor();
        let obj = Value::Object(ObjectRef::new());
        executor.registry().write(&path(["tmp"]), obj.clone());

        let exec = executor.execute(Action::Dispose, &[], vec![obj], &scope()).await;
        assert_eq!(exec.result.unwrap(), Value::Bool(true));
        assert!(executor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_own_keys_on_non_object_is_empty() {
        let executor = create_test_executor();
        executor.registry().write(&path(["n"]), Value::Int(3));
        let exec = executor.execute(Action::OwnKeys, &path(["n"]), vec![], &scope()).await;
        assert_eq!(exec.result.unwrap(), Value::List(vec![]));
    }

    #[tokio::test]
    async fn test_transfer_marks_binary_for_other_sender() {
        let executor = create_test_executor();
        executor
            .registry()
            .write(&path(["blob"]), Value::Binary(Bytes::from_static(b"abc")));

        let exec = executor.execute(Action::Transfer, &path(["blob"]), vec![], &scope()).await;
        assert_eq!(exec.transfer.len(), 1);

        let same = ExecScope::new("host", "host");
        let exec = executor.execute(Action::Transfer, &path(["blob"]), vec![], &same).await;
        assert!(exec.transfer.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_is_noop() {
        let executor = create_test_executor();
        let exec = executor.execute(Action::Unknown, &path(["x"]), vec![], &scope()).await;
        assert_eq!(exec.result.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_import_through_module_table() {
        let modules = Arc::new(ModuleTable::new());
        modules.register("util", || Ok(Value::from("loaded")));
        let executor = Executor::new(
            Arc::new(ObjectRegistry::new("host")),
            Arc::new(NativeReflect),
            Some(modules),
        );

        let exec = executor
            .execute(Action::Import, &[], vec![Value::from("util")], &scope())
            .await;
        assert_eq!(exec.result.unwrap(), Value::from("loaded"));
    }

    #[tokio::test]
    async fn test_prototype_actions() {
        let executor = create_test_executor();
        let base = ObjectRef::new();
        let obj = ObjectRef::new();
        executor.registry().write(&path(["obj"]), Value::Object(obj.clone()));

        let exec = executor
            .execute(Action::SetPrototypeOf, &path(["obj"]), vec![Value::Object(base.clone())], &scope())
            .await;
        assert_eq!(exec.result.unwrap(), Value::Bool(true));

        let exec = executor.execute(Action::GetPrototypeOf, &path(["obj"]), vec![], &scope()).await;
        assert_eq!(exec.result.unwrap(), Value::Object(base));

        let exec = executor.execute(Action::PreventExtensions, &path(["obj"]), vec![], &scope()).await;
        assert_eq!(exec.result.unwrap(), Value::Bool(true));
        let exec = executor.execute(Action::IsExtensible, &path(["obj"]), vec![], &scope()).await;
        assert_eq!(exec.result.unwrap(), Value::Bool(false));
    }
}
