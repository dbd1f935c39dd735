use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One opcode of the reflection vocabulary.
///
/// Parsing is case-insensitive and accepts the aliases used on the wire
/// (`call` for `apply`, `delete` for `deleteProperty`, `getPropertyDescriptor`
/// for `getOwnPropertyDescriptor`). Anything unrecognized parses as
/// [`Action::Unknown`], which executes as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Get,
    Set,
    Apply,
    Construct,
    DeleteProperty,
    Dispose,
    Has,
    OwnKeys,
    GetOwnPropertyDescriptor,
    GetPrototypeOf,
    SetPrototypeOf,
    IsExtensible,
    PreventExtensions,
    Transfer,
    Import,
    Unknown,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Get => "get",
            Action::Set => "set",
            Action::Apply => "apply",
            Action::Construct => "construct",
            Action::DeleteProperty => "deleteProperty",
            Action::Dispose => "dispose",
            Action::Has => "has",
            Action::OwnKeys => "ownKeys",
            Action::GetOwnPropertyDescriptor => "getOwnPropertyDescriptor",
            Action::GetPrototypeOf => "getPrototypeOf",
            Action::SetPrototypeOf => "setPrototypeOf",
            Action::IsExtensible => "isExtensible",
            Action::PreventExtensions => "preventExtensions",
            Action::Transfer => "transfer",
            Action::Import => "import",
            Action::Unknown => "unknown",
        }
    }
}

impl FromStr for Action {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "get" => Action::Get,
            "set" => Action::Set,
            "call" | "apply" => Action::Apply,
            "construct" => Action::Construct,
            "delete" | "deleteproperty" => Action::DeleteProperty,
            "dispose" => Action::Dispose,
            "has" => Action::Has,
            "ownkeys" => Action::OwnKeys,
            "getownpropertydescriptor" | "getpropertydescriptor" => {
                Action::GetOwnPropertyDescriptor
            }
            "getprototypeof" => Action::GetPrototypeOf,
            "setprototypeof" => Action::SetPrototypeOf,
            "isextensible" => Action::IsExtensible,
            "preventextensions" => Action::PreventExtensions,
            "transfer" => Action::Transfer,
            "import" => Action::Import,
            _ => Action::Unknown,
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or(Action::Unknown))
    }
}
