//! Uniform Core - reflective remote-object channels over pluggable transports.
//!
//! A [`Channel`] lets code in one execution context invoke objects living in
//! another without shared memory. Member access, assignment, calls and
//! construction on a [`RemoteProxy`] become `(action, path, args)` requests;
//! the owning channel resolves the path in its [`ObjectRegistry`], runs the
//! action through the [`reflect::Executor`] and answers with either an
//! inlined copy or a descriptor for a by-reference value.
//!
//! Undeliverable messages can be parked in the durable mailbox of
//! [`ChannelStorage`], which also hosts a shared, lockable key/value
//! exchange.
//!
//! # Example
//!
//! ```rust,ignore
//! use uniform_core::{path, Channel, MessagePort, ObjectRef, Value};
//!
//! #[tokio::main]
//! async fn main() -> uniform_core::Result<()> {
//!     let host = Channel::new("host");
//!     let worker = Channel::new("worker");
//!     let (a, b) = MessagePort::pair();
//!     host.listen(a, None);
//!     worker.connect(b, "host");
//!
//!     host.expose("greet", ObjectRef::function(|_, _| Ok(Value::from("hi"))));
//!     let reply = worker.call("host", path(["greet"]), vec![]).await?;
//!     assert_eq!(reply, Value::from("hi"));
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod message;
pub mod proxy;
pub mod reflect;
pub mod registry;
pub mod storage;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use channel::{Channel, Delivery};
pub use codec::{Descriptor, WireValue};
pub use config::{ChannelConfig, ProtocolConfig, StorageConfig};
pub use connection::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionQuery, ConnectionRegistry,
    ConnectionStatus, Direction,
};
pub use context::{ChannelContext, ContextConnection};
pub use error::{ChannelError, Result};
pub use message::{Message, MessageKind};
pub use proxy::RemoteProxy;
pub use reflect::{Action, ModuleTable, NativeReflect, Reflect};
pub use registry::ObjectRegistry;
pub use storage::{
    ChannelStorage, DeferOptions, ExchangeOp, ExchangeRecord, ExchangeTransaction, MailboxEntry,
    MailboxStats, MailboxStatus,
};
pub use transport::{
    BroadcastGroup, LoopbackBinding, MessageBus, MessagePort, SocketBinding, SocketServer,
    SocketServerHandle, TransportBinding, TransportKind,
};
pub use value::{path, ObjectRef, Path, Property, Value};
