use async_trait::async_trait;

use super::Reflect;
use crate::error::Result;
use crate::value::{ObjectRef, Property, Value};

/// Default member semantics over [`ObjectRef`], maps and lists.
///
/// Maps and lists are read-only here; writes into them go through the
/// registry so the stored value is updated in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeReflect;

#[async_trait]
impl Reflect for NativeReflect {
    fn get(&self, target: &Value, key: &str) -> Result<Value> {
        Ok(match target {
            Value::Object(obj) => obj.get(key).unwrap_or_default(),
            Value::Map(map) => map.get(key).cloned().unwrap_or_default(),
            Value::List(items) if key == "length" => Value::from(items.len()),
            Value::List(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or_default(),
            Value::String(s) if key == "length" => Value::from(s.chars().count()),
            Value::Binary(b) if key == "length" => Value::from(b.len()),
            _ => Value::Null,
        })
    }

    fn set(&self, target: &Value, key: &str, value: Value) -> Result<bool> {
        Ok(match target {
            Value::Object(obj) => obj.set(key, value),
            _ => false,
        })
    }

    fn has(&self, target: &Value, key: &str) -> Result<bool> {
        Ok(match target {
            Value::Object(obj) => obj.has(key),
            Value::Map(map) => map.contains_key(key),
            Value::List(items) => key.parse::<usize>().is_ok_and(|i| i < items.len()),
            _ => false,
        })
    }

    async fn apply(&self, target: &ObjectRef, this: Value, args: Vec<Value>) -> Result<Value> {
        target.call(this, args).await
    }

    async fn construct(&self, target: &ObjectRef, args: Vec<Value>) -> Result<Value> {
        target.construct(args).await
    }

    fn delete_property(&self, target: &Value, key: &str) -> Result<bool> {
        Ok(match target {
            Value::Object(obj) => obj.delete(key),
            _ => false,
        })
    }

    fn own_keys(&self, target: &Value) -> Result<Vec<String>> {
        Ok(match target {
            Value::Object(obj) => obj.own_keys(),
            Value::Map(map) => map.keys().cloned().collect(),
            Value::List(items) => (0..items.len()).map(|i| i.to_string()).collect(),
            _ => Vec::new(),
        })
    }

    fn get_own_property_descriptor(&self, target: &Value, key: &str) -> Result<Option<Property>> {
        Ok(match target {
            Value::Object(obj) => obj.own_property(key),
            Value::Map(map) => map.get(key).cloned().map(Property::data),
            _ => None,
        })
    }

    fn get_prototype_of(&self, target: &Value) -> Result<Value> {
        Ok(match target {
            Value::Object(obj) => obj.prototype().map(Value::Object).unwrap_or_default(),
            _ => Value::Null,
        })
    }

    fn set_prototype_of(&self, target: &Value, proto: &Value) -> Result<bool> {
        Ok(match (target, proto) {
            (Value::Object(obj), Value::Object(proto)) => obj.set_prototype(Some(proto.clone())),
            (Value::Object(obj), Value::Null) => obj.set_prototype(None),
            _ => false,
        })
    }

    fn is_extensible(&self, target: &Value) -> Result<bool> {
        Ok(match target {
            Value::Object(obj) => obj.is_extensible(),
            _ => true,
        })
    }

    fn prevent_extensions(&self, target: &Value) -> Result<bool> {
        Ok(match target {
            Value::Object(obj) => obj.prevent_extensions(),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_object_fallbacks() {
        let reflect = NativeReflect;
        assert_eq!(reflect.own_keys(&Value::Int(1)).unwrap(), Vec::<String>::new());
        assert!(!reflect.has(&Value::Null, "x").unwrap());
        assert!(reflect.is_extensible(&Value::from("s")).unwrap());
        assert_eq!(reflect.get(&Value::Null, "x").unwrap(), Value::Null);
        assert_eq!(reflect.get_prototype_of(&Value::Int(3)).unwrap(), Value::Null);
    }

    #[test]
    fn test_list_and_map_members() {
        let reflect = NativeReflect;
        let list = Value::List(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(reflect.get(&list, "length").unwrap(), Value::Int(2));
        assert_eq!(reflect.get(&list, "1").unwrap(), Value::from("b"));
        assert_eq!(reflect.own_keys(&list).unwrap(), vec!["0", "1"]);

        let map = Value::from(serde_json::json!({"k": 1}));
        assert!(reflect.has(&map, "k").unwrap());
        let prop = reflect.get_own_property_descriptor(&map, "k").unwrap().unwrap();
        assert_eq!(prop.value, Value::Int(1));
    }
}
