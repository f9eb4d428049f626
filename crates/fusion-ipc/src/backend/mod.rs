//! Shared state backends
//!
//! A backend owns everything that must be visible to every fusionee of a
//! world: the world header, the primitive tables (skirmishes, references,
//! reactor listeners, calls, dispatch countdowns), the record store and the
//! per-fusionee inbound frame queues. The primitives above this line only
//! ever talk to a [`Backend`] trait object, so both implementations provide
//! identical semantics:
//!
//! - [`device`]: a single in-process authority modelling a privileged device
//! - [`socket`]: a memory-mapped world file plus local datagram sockets

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use fusion_wire::{
    CallFrame, CallId, CallReply, Frame, FusionId, PoolId, ReactorId, RefId, SkirmishId,
};

use crate::Result;
use crate::config::{BackendConfig, WorldConfig};

pub mod device;
#[cfg(unix)]
pub mod socket;

/// Lock owner: one thread of one fusionee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner {
    /// Fusionee holding the lock
    pub fusion_id: FusionId,
    /// Process-local thread sequence number (never zero)
    pub thread: u32,
}

static NEXT_THREAD: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_SEQ: u32 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
}

impl Owner {
    /// The calling thread acting for `fusion_id`
    pub fn current(fusion_id: FusionId) -> Self {
        Self {
            fusion_id,
            thread: THREAD_SEQ.with(|seq| *seq),
        }
    }

    /// Pack into one word: fusion id in the high half, thread in the low half
    pub const fn token(self) -> u64 {
        ((self.fusion_id.0 & 0xFFFF_FFFF) << 32) | self.thread as u64
    }

    /// Inverse of [`Owner::token`]; `None` for the unlocked value
    pub const fn from_token(token: u64) -> Option<Self> {
        if token == 0 {
            return None;
        }
        Some(Self {
            fusion_id: FusionId(token >> 32),
            thread: token as u32,
        })
    }
}

/// Snapshot of the shared world header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldHeader {
    /// World index
    pub index: u32,
    /// ABI version agreed by every fusionee
    pub abi_version: u32,
    /// World creation time (Unix milliseconds); all world clocks are relative to it
    pub start_millis: u64,
    /// Master shared memory pool
    pub pool: PoolId,
    /// Lock protecting the master pool
    pub pool_lock: SkirmishId,
    /// Lock protecting the arena list
    pub arena_lock: SkirmishId,
}

/// Behaviour shared by both backends.
///
/// Every method acts on behalf of the fusionee returned by
/// [`Backend::fusion_id`]. Blocking methods block the calling thread only.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Short backend name for diagnostics
    fn kind(&self) -> &'static str;

    /// This fusionee
    fn fusion_id(&self) -> FusionId;

    /// Header written by the master at creation
    fn header(&self) -> WorldHeader;

    /// Mint an identifier from the world's shared counter. Pools, blocks,
    /// call serials and global reactions all draw from it, so every value
    /// is unique in the world regardless of what it names.
    fn mint(&self) -> Result<u32>;

    /// Currently joined fusionees
    fn fusionees(&self) -> Result<Vec<FusionId>>;

    /// Whether `fusion_id` is joined and its process alive
    fn is_alive(&self, fusion_id: FusionId) -> bool;

    /// Remove fusionees whose process died, reclaiming their local state
    fn reap(&self) -> Result<Vec<FusionId>>;

    /// Join the same world as a new fusionee inheriting this one's local counts
    fn fork(&self) -> Result<Arc<dyn Backend>>;

    /// Leave the world; the master tears it down
    fn leave(&self, emergency: bool) -> Result<()>;

    // Messaging

    /// Queue a frame for another fusionee's dispatch thread
    fn send(&self, to: FusionId, frame: &Frame) -> Result<()>;

    /// Next inbound frame, `None` on timeout
    fn recv(&self, timeout: Duration) -> Result<Option<Frame>>;

    /// Mark one received frame fully processed; fails with `Destroyed` once
    /// this fusionee is no longer part of the world
    fn processed(&self) -> Result<()>;

    /// Unblock this fusionee's dispatch thread
    fn wake(&self) -> Result<()>;

    /// Wait until every fusionee processed all frames sent to it
    fn sync(&self, include_self: bool, timeout: Duration) -> Result<()>;

    // Skirmish

    /// Create an unlocked skirmish
    fn skirmish_new(&self) -> Result<SkirmishId>;
    /// Acquire, blocking; recursive for the same owner
    fn skirmish_prevail(&self, id: SkirmishId, owner: Owner) -> Result<()>;
    /// Acquire without blocking
    fn skirmish_swoop(&self, id: SkirmishId, owner: Owner) -> Result<()>;
    /// Release one level
    fn skirmish_dismiss(&self, id: SkirmishId, owner: Owner) -> Result<()>;
    /// Recursion depth held by `owner`, zero when not the owner
    fn skirmish_lock_count(&self, id: SkirmishId, owner: Owner) -> Result<u32>;
    /// Release fully, wait for a notification, reacquire at the same depth
    fn skirmish_wait(&self, id: SkirmishId, owner: Owner, timeout: Option<Duration>)
    -> Result<()>;
    /// Wake every waiter
    fn skirmish_notify(&self, id: SkirmishId) -> Result<()>;
    /// Destroy
    fn skirmish_destroy(&self, id: SkirmishId) -> Result<()>;

    // Reference

    /// Create a reference at count zero, created by this fusionee
    fn ref_new(&self) -> Result<RefId>;
    /// Increment the local or global count
    fn ref_up(&self, id: RefId, global: bool) -> Result<()>;
    /// Decrement the local or global count
    fn ref_down(&self, id: RefId, global: bool) -> Result<()>;
    /// Local plus global count
    fn ref_stat(&self, id: RefId) -> Result<i32>;
    /// Block until zero, then hold exclusivity
    fn ref_zero_lock(&self, id: RefId) -> Result<()>;
    /// Non-blocking [`Backend::ref_zero_lock`]
    fn ref_zero_trylock(&self, id: RefId) -> Result<()>;
    /// Release exclusivity
    fn ref_unlock(&self, id: RefId) -> Result<()>;
    /// Register the zero-count call
    fn ref_watch(&self, id: RefId, call: CallId, arg: i32) -> Result<()>;
    /// Complete a creator transfer nominated by `ref_throw`
    fn ref_catch(&self, id: RefId) -> Result<()>;
    /// Nominate `target` as next creator
    fn ref_throw(&self, id: RefId, target: FusionId) -> Result<()>;
    /// Destroy
    fn ref_destroy(&self, id: RefId) -> Result<()>;

    // Reactor

    /// Create a reactor with no listeners
    fn reactor_new(&self) -> Result<ReactorId>;
    /// Count one local listener of this fusionee on `channel`
    fn reactor_attach(&self, id: ReactorId, channel: i32) -> Result<()>;
    /// Drop one local listener of this fusionee on `channel`
    fn reactor_detach(&self, id: ReactorId, channel: i32) -> Result<()>;
    /// Fusionees with at least one listener on `channel`
    fn reactor_listeners(&self, id: ReactorId, channel: i32) -> Result<Vec<FusionId>>;
    /// Destroy
    fn reactor_destroy(&self, id: ReactorId) -> Result<()>;

    // Dispatch countdown

    /// Start a countdown that releases `(call, arg)` after `count` ticks
    fn countdown_new(&self, count: u32, call: CallId, arg: i32) -> Result<u32>;
    /// Tick; returns the call to run once the countdown reaches zero
    fn countdown_tick(&self, id: u32) -> Result<Option<(CallId, i32)>>;

    // Call

    /// Create a call owned by this fusionee
    fn call_new(&self) -> Result<CallId>;
    /// Owning fusionee
    fn call_owner(&self, id: CallId) -> Result<FusionId>;
    /// Deliver an invocation to `owner`, waiting for the reply unless one-way
    fn call_execute(&self, owner: FusionId, frame: CallFrame) -> Result<Option<CallReply>>;
    /// Answer a blocked caller
    fn call_return(&self, reply: CallReply) -> Result<()>;
    /// Destroy; blocked callers fail Destroyed
    fn call_destroy(&self, id: CallId) -> Result<()>;

    // Record store

    /// Read a record
    fn record_get(&self, kind: &str, name: &str) -> Result<Option<Vec<u8>>>;
    /// Create or replace a record
    fn record_put(&self, kind: &str, name: &str, data: &[u8]) -> Result<()>;
    /// Remove a record, reporting whether it existed
    fn record_remove(&self, kind: &str, name: &str) -> Result<bool>;
    /// Names of every record of `kind`
    fn record_list(&self, kind: &str) -> Result<Vec<String>>;
}

/// Key under which a process-wide host registers worlds of this backend
pub(crate) fn host_key(config: &BackendConfig) -> String {
    match config {
        BackendConfig::Socket { root } => format!("socket:{}", root.display()),
        BackendConfig::Device(device) => format!("device:{}", device.id()),
    }
}

/// Enter a world through the configured backend
pub(crate) fn connect(config: &WorldConfig) -> Result<Arc<dyn Backend>> {
    match &config.backend {
        BackendConfig::Device(device) => {
            let backend: Arc<dyn Backend> = device::DeviceBackend::enter(device, config)?;
            Ok(backend)
        }
        #[cfg(unix)]
        BackendConfig::Socket { root } => {
            let backend: Arc<dyn Backend> = socket::SocketBackend::enter(root, config)?;
            Ok(backend)
        }
        #[cfg(not(unix))]
        BackendConfig::Socket { .. } => Err(crate::FusionError::InvalidArgument(
            "socket backend requires a unix platform".to_string(),
        )),
    }
}

/// Milliseconds since the Unix epoch
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Watch invocation sent when a reference drops to zero
pub(crate) const fn watch_frame(call: CallId, arg: i32) -> CallFrame {
    CallFrame {
        call_id: call,
        serial: 0,
        caller: FusionId::WORLD,
        flags: fusion_wire::CallFlags::ONE_WAY,
        arg,
        ptr: fusion_wire::SharedPtr::NULL,
        ret_size: 0,
        data: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_token() {
        let owner = Owner {
            fusion_id: FusionId(5),
            thread: 17,
        };
        assert_eq!(Owner::from_token(owner.token()), Some(owner));
        assert_eq!(Owner::from_token(0), None);
    }

    #[test]
    fn test_current_thread_is_stable() {
        let a = Owner::current(FusionId(1));
        let b = Owner::current(FusionId(1));
        assert_eq!(a, b);
        assert_ne!(a.thread, 0);

        let other = std::thread::spawn(|| Owner::current(FusionId(1)))
            .join()
            .unwrap_or(a);
        assert_ne!(other.thread, a.thread);
    }
}
