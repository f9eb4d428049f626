//! Configuration for joining a world

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::device::Device;

/// Role requested when entering a world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    /// Join an existing world or create it
    #[default]
    Any,
    /// Create the world; fails if it already exists
    Master,
    /// Join an existing world; fails if it does not exist
    Slave,
}

/// What happens to a world when the process is duplicated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForkAction {
    /// The duplicate starts disconnected
    #[default]
    Close,
    /// The duplicate joins as a new fusionee inheriting local reference counts
    Fork,
}

/// Which backend carries the shared state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendConfig {
    /// Memory-mapped world file plus local datagram sockets under `root`
    Socket {
        /// Directory holding one `world.<index>` subdirectory per world
        root: PathBuf,
    },
    /// In-process authority modelling a privileged device
    #[serde(skip)]
    Device(Device),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Socket {
            root: std::env::temp_dir().join("fusion"),
        }
    }
}

/// Table capacities of a socket-backend world file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketLimits {
    /// Concurrently joined fusionees
    pub fusionees: u32,
    /// Live skirmishes
    pub skirmishes: u32,
    /// Live references
    pub refs: u32,
    /// (reference, fusionee) pairs with a local count
    pub holders: u32,
    /// Live reactors
    pub reactors: u32,
    /// (reactor, channel, fusionee) listener entries
    pub listeners: u32,
    /// Live calls
    pub calls: u32,
    /// Outstanding dispatch countdowns
    pub countdowns: u32,
}

impl Default for SocketLimits {
    fn default() -> Self {
        Self {
            fusionees: 64,
            skirmishes: 1024,
            refs: 1024,
            holders: 4096,
            reactors: 512,
            listeners: 2048,
            calls: 512,
            countdowns: 256,
        }
    }
}

/// Configuration for entering a world
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Backend selection
    pub backend: BackendConfig,

    /// World index; `None` always creates a fresh world at the lowest free index
    pub index: Option<u32>,

    /// ABI version every joiner must agree on
    pub abi_version: u32,

    /// Requested role
    pub role: Role,

    /// Fork policy
    pub fork_action: ForkAction,

    /// Queued one-way calls per batch before a flush
    pub call_batch_limit: usize,

    /// Age of a queued batch before the flusher sends it (milliseconds)
    pub call_batch_window_ms: u64,

    /// Interval between owner liveness probes while blocked (milliseconds)
    pub liveness_interval_ms: u64,

    /// Upper bound on waiting for in-flight messages to drain (milliseconds)
    pub sync_timeout_ms: u64,

    /// Socket backend table capacities
    pub limits: SocketLimits,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            index: Some(0),
            abi_version: 1,
            role: Role::Any,
            fork_action: ForkAction::Close,
            call_batch_limit: 16,
            call_batch_window_ms: 16,
            liveness_interval_ms: 100,
            sync_timeout_ms: 5000,
            limits: SocketLimits::default(),
        }
    }
}

impl WorldConfig {
    /// Configuration for the socket backend rooted at `root`
    pub fn socket<P: AsRef<Path>>(root: P) -> Self {
        Self {
            backend: BackendConfig::Socket {
                root: root.as_ref().to_path_buf(),
            },
            ..Default::default()
        }
    }

    /// Configuration for an in-process device
    pub fn device(device: &Device) -> Self {
        Self {
            backend: BackendConfig::Device(device.clone()),
            ..Default::default()
        }
    }

    /// Set the world index
    #[must_use]
    pub const fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Always create a fresh world at the lowest free index
    #[must_use]
    pub const fn with_auto_index(mut self) -> Self {
        self.index = None;
        self
    }

    /// Set the ABI version
    #[must_use]
    pub const fn with_abi_version(mut self, abi_version: u32) -> Self {
        self.abi_version = abi_version;
        self
    }

    /// Set the requested role
    #[must_use]
    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the fork policy
    #[must_use]
    pub const fn with_fork_action(mut self, action: ForkAction) -> Self {
        self.fork_action = action;
        self
    }

    /// Set the batch size and window for queued one-way calls
    #[must_use]
    pub const fn with_call_batching(mut self, limit: usize, window_ms: u64) -> Self {
        self.call_batch_limit = limit;
        self.call_batch_window_ms = window_ms;
        self
    }

    /// Set the owner liveness probe interval
    #[must_use]
    pub const fn with_liveness_interval(mut self, interval_ms: u64) -> Self {
        self.liveness_interval_ms = interval_ms;
        self
    }

    /// Set the message drain timeout
    #[must_use]
    pub const fn with_sync_timeout(mut self, timeout_ms: u64) -> Self {
        self.sync_timeout_ms = timeout_ms;
        self
    }

    /// Set socket backend table capacities
    #[must_use]
    pub const fn with_limits(mut self, limits: SocketLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Batch window as a duration
    pub const fn call_batch_window(&self) -> Duration {
        Duration::from_millis(self.call_batch_window_ms)
    }

    /// Liveness probe interval as a duration
    pub const fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// Drain timeout as a duration
    pub const fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
