//! Multi-process coordination layer.
//!
//! Unrelated processes join a numbered *world* and share coordination
//! primitives through it. Every primitive is named by a process-portable
//! identifier, and a background dispatch thread in each process routes
//! cross-process events to the local representation of the right primitive.
//!
//! - **Skirmish**: recursive cross-process lock with abandonment detection
//! - **FusionRef**: shared reference counter with local and global counts,
//!   drain-to-zero locking and a zero-count watch
//! - **Reactor**: channel-based publish/subscribe with local and global reactions
//! - **FusionCall**: remote procedure owned by one process, with one-way batching
//! - **Arena**: named "first in initializes, others join" bootstrap record
//! - **ObjectPool / FusionObject**: shared objects destructed automatically
//!   when their last reference anywhere in the world goes away
//!
//! Two backends implement the shared state: an in-process authority that
//! models a privileged device ([`backend::device::Device`]) and a
//! non-privileged one built from a memory-mapped file and local datagram
//! sockets ([`backend::socket::SocketBackend`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use fusion_ipc::{Skirmish, World, WorldConfig};
//!
//! let world = World::enter(WorldConfig::socket("/run/fusion").with_index(0))?;
//! let lock = Skirmish::new(&world, "engine")?;
//! {
//!     let _guard = lock.lock()?;
//!     // exclusive across every process in the world
//! }
//! world.exit(false)?;
//! # Ok::<(), fusion_ipc::FusionError>(())
//! ```

#![warn(missing_docs)]

use thiserror::Error;

// Shared state backends
pub mod backend;

// Configuration
pub mod config;

// Primitives
pub mod call;
pub mod reactor;
pub mod reference;
pub mod skirmish;

// Higher level building blocks
pub mod arena;
pub mod object;
pub mod shm_pool;

// Process admission and dispatch
pub mod world;

pub use arena::Arena;
pub use call::{CallContext, CallHandlerResult, CallOutput, FusionCall};
pub use config::{BackendConfig, ForkAction, Role, SocketLimits, WorldConfig};
pub use fusion_wire::{
    CallFlags, CallId, FusionId, ObjectId, PoolId, ReactorId, RefId, SharedPtr, SkirmishId,
};
pub use object::{FusionObject, ObjectPool, ObjectState};
pub use reactor::{GlobalReaction, GlobalReactionFn, Reaction, ReactionResult, Reactor, ReactorMessage};
pub use reference::FusionRef;
pub use shm_pool::ShmPool;
pub use skirmish::{Skirmish, SkirmishGuard};
pub use world::{Host, World};

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, FusionError>;

/// Errors that can occur during coordination operations.
#[derive(Debug, Error)]
pub enum FusionError {
    /// The entity was torn down; the operation can never succeed.
    #[error("Destroyed")]
    Destroyed,

    /// Contended or temporarily unavailable; the caller may retry.
    #[error("Busy")]
    Busy,

    /// Reference is zero-locked by another party.
    #[error("Locked")]
    Locked,

    /// Deadline elapsed.
    #[error("Timed out")]
    Timeout,

    /// Invariant violation caused by the caller.
    #[error("Bug: {0}")]
    Bug(String),

    /// I/O error on the backend transport or shared file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend failure that ends world membership.
    #[error("Fusion error: {0}")]
    Fusion(String),

    /// World was created with a different ABI version.
    #[error("ABI version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version requested by this process
        expected: u32,
        /// Version recorded in the world
        found: u32,
    },

    /// Rejected before any shared state was touched.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Named entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A backend table is full.
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// Frame codec error.
    #[error("Wire error: {0}")]
    Wire(#[from] fusion_wire::WireError),

    /// Shared record could not be (de)serialized.
    #[error("Record error: {0}")]
    Record(#[from] serde_json::Error),
}

impl FusionError {
    /// Build a [`FusionError::Bug`], logging it loudly at the point it is raised.
    pub fn bug(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("fusion bug: {message}");
        Self::Bug(message)
    }
}
