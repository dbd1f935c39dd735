//! Reflection: the action vocabulary and the strategy that performs it.
//!
//! - [`Action`]: the stable opcode set carried by request messages
//! - [`Reflect`]: pluggable member semantics (default [`NativeReflect`])
//! - [`Executor`]: resolves a path through the object registry and runs one action
//! - [`ModuleLoader`]: host capability behind the IMPORT action

mod action;
mod executor;
mod modules;
mod native;

pub use action::Action;
pub use executor::{ExecScope, Execution, Executor};
pub use modules::{ModuleLoader, ModuleTable};
pub use native::NativeReflect;

use async_trait::async_trait;

use crate::error::Result;
use crate::value::{ObjectRef, Property, Value};

/// Member semantics applied by the executor.
///
/// Implementations must tolerate any [`Value`] as target; non-object targets
/// get safe fallbacks instead of errors.
#[async_trait]
pub trait Reflect: Send + Sync {
    fn get(&self, target: &Value, key: &str) -> Result<Value>;

    fn set(&self, target: &Value, key: &str, value: Value) -> Result<bool>;

    fn has(&self, target: &Value, key: &str) -> Result<bool>;

    async fn apply(&self, target: &ObjectRef, this: Value, args: Vec<Value>) -> Result<Value>;

    async fn construct(&self, target: &ObjectRef, args: Vec<Value>) -> Result<Value>;

    fn delete_property(&self, target: &Value, key: &str) -> Result<bool>;

    fn own_keys(&self, target: &Value) -> Result<Vec<String>>;

    fn get_own_property_descriptor(&self, target: &Value, key: &str) -> Result<Option<Property>>;

    fn get_prototype_of(&self, target: &Value) -> Result<Value>;

    fn set_prototype_of(&self, target: &Value, proto: &Value) -> Result<bool>;

    fn is_extensible(&self, target: &Value) -> Result<bool>;

    fn prevent_extensions(&self, target: &Value) -> Result<bool>;
}
