use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ChannelError, Result};
use crate::value::Value;

/// Loads modules for the IMPORT action.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, specifier: &str) -> Result<Value>;
}

type ModuleFactory = Arc<dyn Fn() -> Result<Value> + Send + Sync>;

/// A [`ModuleLoader`] backed by registered factories.
///
/// Each module is instantiated on first import and the instance is reused
/// for later imports of the same specifier.
#[derive(Default)]
pub struct ModuleTable {
    factories: RwLock<HashMap<String, ModuleFactory>>,
    loaded: RwLock<HashMap<String, Value>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `specifier`, replacing any previous one.
    pub fn register<F>(&self, specifier: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        let specifier = specifier.into();
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&specifier);
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(specifier, Arc::new(factory));
    }

    pub fn specifiers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ModuleLoader for ModuleTable {
    async fn load(&self, specifier: &str) -> Result<Value> {
        if let Some(module) = self
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(specifier)
        {
            return Ok(module.clone());
        }

        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(specifier)
            .cloned()
            .ok_or_else(|| ChannelError::ModuleNotFound {
                specifier: specifier.to_string(),
            })?;

        debug!(specifier, "instantiating module");
        let module = factory()?;
        self.loaded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(specifier.to_string(), module.clone());
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjectRef;

    #[tokio::test]
    async fn test_module_instantiated_once() {
        let table = ModuleTable::new();
        table.register("math", || Ok(Value::Object(ObjectRef::new().with("e", 2.5))));

        let first = table.load("math").await.unwrap();
        let second = table.load("math").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(table.specifiers(), vec!["math".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_module_errors() {
        let table = ModuleTable::new();
        assert!(matches!(
            table.load("nope").await,
            Err(ChannelError::ModuleNotFound { .. })
        ));
    }
}
