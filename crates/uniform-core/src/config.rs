//! Centralized configuration for channels, transports and storage.
//!
//! Tuning constants live on unit structs; per-channel settings are carried by
//! [`ChannelConfig`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::reflect::{ModuleLoader, NativeReflect, Reflect};

/// Protocol and transport tuning.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const INBOX_CAPACITY: usize = 1024;
    pub const EVENT_BUFFER: usize = 100;
    pub const CONNECTION_EVENT_BUFFER: usize = 200;
    pub const MAX_CONCURRENT_REQUESTS: usize = 64;
    pub const SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_SOCKET_CONNECTIONS: usize = 64;
    pub const BROADCAST_CAPACITY: usize = 256;
}

/// Durable mailbox and exchange tuning.
pub struct StorageConfig;

impl StorageConfig {
    pub const APP_DIR_NAME: &'static str = "uniform-channel";
    pub const DB_FILENAME: &'static str = "channels.sqlite";
    pub const BUSY_TIMEOUT_MS: u64 = 5_000;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
    pub const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const PENDING_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const UPDATE_BUFFER: usize = 100;
    pub const WILDCARD: &'static str = "*";
}

/// Runtime settings for a single channel.
#[derive(Clone)]
pub struct ChannelConfig {
    pub name: String,
    pub timeout: Duration,
    pub reflect: Arc<dyn Reflect>,
    pub modules: Option<Arc<dyn ModuleLoader>>,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: ProtocolConfig::DEFAULT_TIMEOUT,
            reflect: Arc::new(NativeReflect),
            modules: None,
        }
    }

    /// Default deadline for `invoke`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Swap the reflection strategy used by the executor.
    pub fn with_reflect(mut self, reflect: Arc<dyn Reflect>) -> Self {
        self.reflect = reflect;
        self
    }

    /// Enable the IMPORT action.
    pub fn with_modules(mut self, modules: Arc<dyn ModuleLoader>) -> Self {
        self.modules = Some(modules);
        self
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("modules", &self.modules.is_some())
            .finish()
    }
}
