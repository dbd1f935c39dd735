//! Path-addressed registry of live local objects.
//!
//! Each channel owns one [`ObjectRegistry`]. Roots are named slots; deeper
//! paths traverse into objects, maps and lists. A reverse index maps object
//! identity back to the path it was registered under, and is maintained in
//! the same critical section as every write and remove.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::value::{ObjectId, ObjectRef, Path, Value};

#[derive(Default)]
struct RegistryState {
    roots: HashMap<String, Value>,
    reverse: HashMap<ObjectId, Path>,
}

/// Object table owned by a single channel.
pub struct ObjectRegistry {
    local: String,
    state: Mutex<RegistryState>,
}

impl ObjectRegistry {
    /// Create a registry for the channel named `local`.
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Name of the owning channel.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Store `value` at `path`.
    ///
    /// A single segment sets a root; longer paths assign into the parent.
    /// Proxies that point back into this channel are dereferenced first.
    /// Returns false when the parent does not exist or refuses the write.
    pub fn write(&self, path: &[String], value: Value) -> bool {
        let mut state = self.lock_state();
        let value = match value {
            Value::Remote(proxy) if proxy.channel() == self.local => {
                resolve(&state.roots, proxy.path()).unwrap_or_default()
            }
            other => other,
        };

        let written = match path {
            [] => false,
            [root] => {
                state.roots.insert(root.clone(), value.clone());
                true
            }
            [root, rest @ ..] => match state.roots.get_mut(root) {
                Some(parent) => assign(parent, rest, value.clone()),
                None => false,
            },
        };

        if written {
            purge_subtree(&mut state.reverse, path);
            index_value(&mut state.reverse, path, &value);
            trace!(channel = %self.local, path = %path.join("."), "registry write");
        }
        written
    }

    /// Resolve `path`. Unknown roots and missing members yield `None`.
    pub fn read(&self, path: &[String]) -> Option<Value> {
        resolve(&self.lock_state().roots, path)
    }

    /// Remove the entry at `path`. Returns whether something was removed.
    pub fn remove(&self, path: &[String]) -> bool {
        let mut state = self.lock_state();
        let removed = match path {
            [] => false,
            [root] => state.roots.remove(root).is_some(),
            [root, rest @ ..] => match state.roots.get_mut(root) {
                Some(parent) => detach(parent, rest),
                None => false,
            },
        };
        if removed {
            purge_subtree(&mut state.reverse, path);
            trace!(channel = %self.local, path = %path.join("."), "registry remove");
        }
        removed
    }

    /// Remove whatever path `value` is registered under.
    pub fn remove_by_value(&self, value: &Value) -> bool {
        match self.path_of(value) {
            Some(path) => self.remove(&path),
            None => false,
        }
    }

    /// Whether `value` is currently registered.
    pub fn has_path(&self, value: &Value) -> bool {
        self.path_of(value).is_some()
    }

    /// The path `value` is registered under, if it still resolves there.
    pub fn path_of(&self, value: &Value) -> Option<Path> {
        let id = match value {
            Value::Object(obj) => obj.id(),
            _ => return None,
        };
        let state = self.lock_state();
        let path = state.reverse.get(&id)?;
        match resolve(&state.roots, path) {
            Some(Value::Object(found)) if found.id() == id => Some(path.clone()),
            _ => None,
        }
    }

    /// Return the object's path, registering it under a fresh random root
    /// when it has none.
    pub fn register(&self, object: &ObjectRef) -> Path {
        let mut state = self.lock_state();
        if let Some(path) = state.reverse.get(&object.id()) {
            if let Some(Value::Object(found)) = resolve(&state.roots, path) {
                if found.ptr_eq(object) {
                    return path.clone();
                }
            }
        }

        let root = uuid::Uuid::new_v4().to_string();
        let path = vec![root.clone()];
        state.roots.insert(root, Value::Object(object.clone()));
        state.reverse.insert(object.id(), path.clone());
        trace!(channel = %self.local, object = %object.id(), "registered under random path");
        path
    }

    /// Names of all roots.
    pub fn roots(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_state().roots.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock_state().roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.roots.clear();
        state.reverse.clear();
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn resolve(roots: &HashMap<String, Value>, path: &[String]) -> Option<Value> {
    let (root, rest) = path.split_first()?;
    walk(roots.get(root)?, rest)
}

fn walk(value: &Value, rest: &[String]) -> Option<Value> {
    let Some((segment, rest)) = rest.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Map(map) => walk(map.get(segment)?, rest),
        Value::List(items) => walk(items.get(segment.parse::<usize>().ok()?)?, rest),
        Value::Object(obj) => walk(&obj.get(segment)?, rest),
        Value::Remote(proxy) => walk(&Value::Remote(proxy.child(segment)), rest),
        _ => None,
    }
}

fn assign(target: &mut Value, path: &[String], value: Value) -> bool {
    let Some((segment, rest)) = path.split_first() else {
        return false;
    };
    if rest.is_empty() {
        return match target {
            Value::Object(obj) => obj.set(segment.clone(), value),
            Value::Map(map) => {
                map.insert(segment.clone(), value);
                true
            }
            Value::List(items) => match segment.parse::<usize>() {
                Ok(i) if i < items.len() => {
                    items[i] = value;
                    true
                }
                Ok(i) if i == items.len() => {
                    items.push(value);
                    true
                }
                _ => false,
            },
            _ => false,
        };
    }

    match target {
        Value::Object(obj) => match obj.get(segment) {
            Some(Value::Object(child)) => assign(&mut Value::Object(child), rest, value),
            Some(mut child) => assign(&mut child, rest, value) && obj.set(segment.clone(), child),
            None => false,
        },
        Value::Map(map) => match map.get_mut(segment) {
            Some(child) => assign(child, rest, value),
            None => false,
        },
        Value::List(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            Some(child) => assign(child, rest, value),
            None => false,
        },
        _ => false,
    }
}

fn detach(target: &mut Value, path: &[String]) -> bool {
    let Some((segment, rest)) = path.split_first() else {
        return false;
    };
    if rest.is_empty() {
        return match target {
            Value::Object(obj) => obj.own_property(segment).is_some() && obj.delete(segment),
            Value::Map(map) => map.remove(segment).is_some(),
            _ => false,
        };
    }
    match target {
        Value::Object(obj) => match obj.get(segment) {
            Some(Value::Object(child)) => detach(&mut Value::Object(child), rest),
            Some(mut child) => detach(&mut child, rest) && obj.set(segment.clone(), child),
            None => false,
        },
        Value::Map(map) => map.get_mut(segment).is_some_and(|child| detach(child, rest)),
        Value::List(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get_mut(i))
            .is_some_and(|child| detach(child, rest)),
        _ => false,
    }
}

fn purge_subtree(reverse: &mut HashMap<ObjectId, Path>, prefix: &[String]) {
    reverse.retain(|_, path| !path.starts_with(prefix));
}

/// Index objects reachable from `value` without crossing into other objects.
fn index_value(reverse: &mut HashMap<ObjectId, Path>, path: &[String], value: &Value) {
    match value {
        Value::Object(obj) => {
            reverse.insert(obj.id(), path.to_vec());
        }
        Value::Map(map) => {
            for (key, child) in map {
                let mut child_path = path.to_vec();
                child_path.push(key.clone());
                index_value(reverse, &child_path, child);
            }
        }
        Value::List(items) => {
            for (i, child) in items.iter().enumerate() {
                let mut child_path = path.to_vec();
                child_path.push(i.to_string());
                index_value(reverse, &child_path, child);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::path;
    use std::collections::BTreeMap;

    fn create_test_registry() -> ObjectRegistry {
        ObjectRegistry::new("host")
    }

    #[test]
    fn test_read_unknown_root_returns_none() {
        let registry = create_test_registry();
        assert!(registry.read(&path(["missing"])).is_none());
        assert!(registry.read(&[]).is_none());
    }

    #[test]
    fn test_write_root_and_nested_member() {
        let registry = create_test_registry();
        let obj = ObjectRef::new();
        assert!(registry.write(&path(["svc"]), Value::Object(obj.clone())));
        assert!(registry.write(&path(["svc", "count"]), Value::Int(3)));

        assert_eq!(registry.read(&path(["svc", "count"])), Some(Value::Int(3)));
        assert_eq!(obj.get("count"), Some(Value::Int(3)));
    }

    #[test]
    fn test_write_into_missing_parent_fails() {
        let registry = create_test_registry();
        assert!(!registry.write(&path(["nope", "x"]), Value::Int(1)));
    }

    #[test]
    fn test_nested_map_write_mutates_in_place() {
        let registry = create_test_registry();
        let mut inner = BTreeMap::new();
        inner.insert("a".to_string(), Value::Int(1));
        registry.write(&path(["cfg"]), Value::Map(inner));

        assert!(registry.write(&path(["cfg", "b"]), Value::Int(2)));
        assert_eq!(registry.read(&path(["cfg", "b"])), Some(Value::Int(2)));
    }

    #[test]
    fn test_reverse_index_tracks_writes_and_removes() {
        let registry = create_test_registry();
        let obj = Value::Object(ObjectRef::new());

        assert!(!registry.has_path(&obj));
        registry.write(&path(["a"]), obj.clone());
        assert_eq!(registry.path_of(&obj), Some(path(["a"])));

        assert!(registry.remove(&path(["a"])));
        assert!(!registry.has_path(&obj));
        assert!(registry.read(&path(["a"])).is_none());
    }

    #[test]
    fn test_reregistering_updates_reverse_mapping() {
        let registry = create_test_registry();
        let obj = Value::Object(ObjectRef::new());
        registry.write(&path(["first"]), obj.clone());
        registry.write(&path(["second"]), obj.clone());
        assert_eq!(registry.path_of(&obj), Some(path(["second"])));
    }

    #[test]
    fn test_overwrite_drops_stale_reverse_entry() {
        let registry = create_test_registry();
        let obj = Value::Object(ObjectRef::new());
        registry.write(&path(["slot"]), obj.clone());
        registry.write(&path(["slot"]), Value::Int(1));
        assert!(!registry.has_path(&obj));
    }

    #[test]
    fn test_remove_by_value() {
        let registry = create_test_registry();
        let obj = Value::Object(ObjectRef::new());
        registry.write(&path(["x"]), obj.clone());

        assert!(registry.remove_by_value(&obj));
        assert!(!registry.remove_by_value(&obj));
        assert!(!registry.remove_by_value(&Value::Int(1)));
    }

    #[test]
    fn test_remove_nested_member() {
        let registry = create_test_registry();
        let obj = ObjectRef::new().with("child", ObjectRef::new());
        registry.write(&path(["root"]), Value::Object(obj.clone()));

        assert!(registry.remove(&path(["root", "child"])));
        assert!(!obj.has("child"));
        assert!(!registry.remove(&path(["root", "child"])));
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = create_test_registry();
        let obj = ObjectRef::new();
        let first = registry.register(&obj);
        let second = registry.register(&obj);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_segments_resolve_by_index() {
        let registry = create_test_registry();
        registry.write(
            &path(["items"]),
            Value::List(vec![Value::from("a"), Value::from("b")]),
        );
        assert_eq!(registry.read(&path(["items", "1"])), Some(Value::from("b")));
        assert!(registry.read(&path(["items", "9"])).is_none());
    }

    #[test]
    fn test_clear_empties_registry() {
        let registry = create_test_registry();
        registry.write(&path(["a"]), Value::Int(1));
        registry.clear();
        assert!(registry.is_empty());
    }
}
