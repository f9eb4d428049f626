//! World membership
//!
//! A [`World`] is this process's handle on one joined world. It owns the
//! backend connection, the process-local tables that give shared identifiers
//! their local meaning (call handlers, reactor listeners), the dispatch
//! thread that routes inbound frames, and the one-way call batcher.
//!
//! Worlds are normally entered through a [`Host`], which shares one `World`
//! between every local join of the same index and counts them.

mod batch;
mod dispatch;
mod host;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, ThreadId};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use fusion_wire::{CallFlags, CallFrame, CallId, FusionId, ReactorId, SharedPtr};

use crate::backend::{Backend, WorldHeader, unix_millis};
use crate::call::{self, CallHandler};
use crate::config::{ForkAction, WorldConfig};
use crate::reactor::LocalListeners;
use crate::shm_pool::ShmPool;
use crate::{FusionError, Result};

pub(crate) use self::batch::CallBatcher;
pub use self::host::Host;

type LeaveCallback = dyn Fn(FusionId) + Send + Sync;

pub(crate) struct WorldInner {
    backend: Arc<dyn Backend>,
    config: WorldConfig,
    host: Option<(Host, host::HostKey)>,
    local_count: Mutex<usize>,
    fork_action: Mutex<ForkAction>,
    calls: DashMap<CallId, Arc<CallHandler>>,
    reactors: DashMap<ReactorId, Arc<LocalListeners>>,
    batcher: Arc<CallBatcher>,
    leave_callback: Mutex<Option<Arc<LeaveCallback>>>,
    stopping: AtomicBool,
    dispatch_thread: OnceLock<ThreadId>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle on one joined world.
///
/// Cheap to clone; every clone refers to the same membership. The membership
/// ends when [`World::exit`] has been called once per local join.
#[derive(Clone)]
pub struct World {
    pub(crate) inner: Arc<WorldInner>,
}

impl World {
    /// Enter a world through the process-wide [`Host`]
    pub fn enter(config: WorldConfig) -> Result<Self> {
        Host::global().enter(config)
    }

    /// Wrap a connected backend and start the background threads.
    fn start(
        backend: Arc<dyn Backend>,
        config: WorldConfig,
        host: Option<(Host, host::HostKey)>,
    ) -> Result<Self> {
        let batcher = Arc::new(CallBatcher::new(
            config.call_batch_limit,
            config.call_batch_window(),
        ));
        let world = Self {
            inner: Arc::new(WorldInner {
                fork_action: Mutex::new(config.fork_action),
                backend,
                config,
                host,
                local_count: Mutex::new(1),
                calls: DashMap::new(),
                reactors: DashMap::new(),
                batcher,
                leave_callback: Mutex::new(None),
                stopping: AtomicBool::new(false),
                dispatch_thread: OnceLock::new(),
                threads: Mutex::new(Vec::new()),
            }),
        };

        let dispatcher = dispatch::spawn(&world)?;
        let flusher = batch::spawn_flusher(
            Arc::clone(&world.inner.batcher),
            Arc::clone(&world.inner.backend),
            world.fusion_id(),
        )?;
        world.inner.threads.lock().extend([dispatcher, flusher]);

        info!(
            "{} joined world {} via {} backend{}",
            world.fusion_id(),
            world.index(),
            world.inner.backend.kind(),
            if world.is_master() { " as master" } else { "" }
        );
        Ok(world)
    }

    /// Leave once; the membership ends when every local join has left.
    ///
    /// With `emergency` the background threads are not joined.
    pub fn exit(&self, emergency: bool) -> Result<()> {
        if let Some((host, key)) = &self.inner.host {
            if !host.release(key, self)? {
                return Ok(());
            }
        } else {
            let mut count = self.inner.local_count.lock();
            if *count == 0 {
                return Err(FusionError::Destroyed);
            }
            *count -= 1;
            if *count > 0 {
                return Ok(());
            }
        }
        self.shutdown(emergency)
    }

    fn shutdown(&self, emergency: bool) -> Result<()> {
        if let Err(e) = self.flush_calls() {
            debug!("queued calls of {} dropped at exit: {e}", self.fusion_id());
        }

        self.inner.stopping.store(true, Ordering::Release);
        self.inner.batcher.stop();
        if let Err(e) = self.inner.backend.wake() {
            debug!("dispatch thread of {} not woken: {e}", self.fusion_id());
        }

        let threads: Vec<JoinHandle<()>> = self.inner.threads.lock().drain(..).collect();
        if emergency {
            debug!("{} leaving without joining {} threads", self.fusion_id(), threads.len());
        } else {
            let current = std::thread::current().id();
            for thread in threads {
                if thread.thread().id() == current {
                    continue;
                }
                if thread.join().is_err() {
                    warn!("a background thread of {} panicked", self.fusion_id());
                }
            }
        }

        let left = self.inner.backend.leave(emergency);
        self.inner.calls.clear();
        self.inner.reactors.clear();
        self.inner.leave_callback.lock().take();
        info!("{} exited world {}", self.fusion_id(), self.index());
        left
    }

    /// This process's fusion id in the world
    pub fn fusion_id(&self) -> FusionId {
        self.inner.backend.fusion_id()
    }

    /// World index
    pub fn index(&self) -> u32 {
        self.header().index
    }

    /// Whether this process created the world
    pub fn is_master(&self) -> bool {
        self.fusion_id().is_master()
    }

    /// Shared header snapshot
    pub fn header(&self) -> WorldHeader {
        self.inner.backend.header()
    }

    /// Configuration this world was entered with
    pub fn config(&self) -> &WorldConfig {
        &self.inner.config
    }

    /// Milliseconds since the world was created
    pub fn millis(&self) -> u64 {
        unix_millis().saturating_sub(self.header().start_millis)
    }

    /// Currently joined fusionees
    pub fn fusionees(&self) -> Result<Vec<FusionId>> {
        self.inner.backend.fusionees()
    }

    /// Wait until every fusionee has processed all frames sent to it.
    ///
    /// Called from the dispatch thread it skips this fusionee's own queue,
    /// which still holds the frame being handled.
    pub fn sync(&self) -> Result<()> {
        let include_self = !self.on_dispatch_thread();
        self.inner
            .backend
            .sync(include_self, self.inner.config.sync_timeout())
    }

    /// Run `callback` on the dispatch thread whenever another fusionee
    /// leaves or is reaped. Only the master observes departures.
    pub fn set_leave_callback<F>(&self, callback: F)
    where
        F: Fn(FusionId) + Send + Sync + 'static,
    {
        *self.inner.leave_callback.lock() = Some(Arc::new(callback));
    }

    /// Current fork action
    pub fn fork_action(&self) -> ForkAction {
        *self.inner.fork_action.lock()
    }

    /// Change what [`World::fork`] does
    pub fn set_fork_action(&self, action: ForkAction) {
        *self.inner.fork_action.lock() = action;
    }

    /// Duplication point for process forking.
    ///
    /// With [`ForkAction::Close`] the child starts disconnected and this
    /// returns `None`. With [`ForkAction::Fork`] the child joins as a new
    /// fusionee holding copies of this fusionee's local reference counts,
    /// with its own dispatch thread.
    pub fn fork(&self) -> Result<Option<Self>> {
        match self.fork_action() {
            ForkAction::Close => {
                debug!("{} fork: child starts disconnected", self.fusion_id());
                Ok(None)
            }
            ForkAction::Fork => {
                let backend = self.inner.backend.fork()?;
                Self::start(backend, self.inner.config.clone(), None).map(Some)
            }
        }
    }

    /// Master shared memory pool
    pub fn pool(&self) -> ShmPool {
        ShmPool::master(self)
    }

    /// Send every queued one-way call of every thread now
    pub fn flush_calls(&self) -> Result<()> {
        self.inner.batcher.flush_all(self.inner.backend.as_ref())
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    pub(crate) fn batcher(&self) -> &CallBatcher {
        &self.inner.batcher
    }

    pub(crate) fn on_dispatch_thread(&self) -> bool {
        self.inner.dispatch_thread.get() == Some(&std::thread::current().id())
    }

    pub(crate) fn register_call(&self, id: CallId, handler: CallHandler) {
        self.inner.calls.insert(id, Arc::new(handler));
    }

    pub(crate) fn unregister_call(&self, id: CallId) {
        self.inner.calls.remove(&id);
    }

    pub(crate) fn call_handler(&self, id: CallId) -> Option<Arc<CallHandler>> {
        self.inner.calls.get(&id).map(|handler| Arc::clone(handler.value()))
    }

    pub(crate) fn listeners(&self, id: ReactorId) -> Arc<LocalListeners> {
        Arc::clone(
            self.inner
                .reactors
                .entry(id)
                .or_insert_with(|| Arc::new(LocalListeners::default()))
                .value(),
        )
    }

    pub(crate) fn existing_listeners(&self, id: ReactorId) -> Option<Arc<LocalListeners>> {
        self.inner
            .reactors
            .get(&id)
            .map(|listeners| Arc::clone(listeners.value()))
    }

    pub(crate) fn drop_listeners(&self, id: ReactorId) -> Option<Arc<LocalListeners>> {
        self.inner.reactors.remove(&id).map(|(_, listeners)| listeners)
    }

    /// Execute `call` one-way on behalf of the world itself.
    pub(crate) fn invoke_one_way(&self, call: CallId, arg: i32) -> Result<()> {
        let owner = self.inner.backend.call_owner(call)?;
        let frame = CallFrame {
            call_id: call,
            serial: 0,
            caller: FusionId::WORLD,
            flags: CallFlags::ONE_WAY,
            arg,
            ptr: SharedPtr::NULL,
            ret_size: 0,
            data: Vec::new(),
        };
        if owner == self.fusion_id() {
            call::serve(self, frame, true);
            Ok(())
        } else {
            self.inner.backend.call_execute(owner, frame).map(|_| ())
        }
    }

    fn notify_leave(&self, fusion_id: FusionId) {
        info!("{fusion_id} left world {}", self.index());
        let callback = self.inner.leave_callback.lock().clone();
        if let Some(callback) = callback {
            callback(fusion_id);
        }
    }

    fn stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("backend", &self.inner.backend.kind())
            .field("index", &self.index())
            .field("fusion_id", &self.fusion_id())
            .field("calls", &self.inner.calls.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::Device;
    use crate::config::Role;

    #[test]
    fn test_shared_local_join() {
        let device = Device::new();
        let host = Host::new();
        let first = host.enter(WorldConfig::device(&device)).expect("enter");
        let second = host.enter(WorldConfig::device(&device)).expect("enter again");

        assert_eq!(first.fusion_id(), second.fusion_id());
        assert!(first.is_master());

        first.exit(false).expect("first exit");
        assert_eq!(device.fusionees(0), vec![FusionId::MASTER]);
        second.exit(false).expect("last exit");
        assert!(device.worlds().is_empty());
    }

    #[test]
    fn test_master_request_on_slave_membership() {
        let device = Device::new();
        let master = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("master");

        let host = Host::new();
        let slave = host.enter(WorldConfig::device(&device)).expect("slave");
        assert!(matches!(
            host.enter(WorldConfig::device(&device).with_role(Role::Master)),
            Err(FusionError::InvalidArgument(_))
        ));

        slave.exit(false).expect("slave exit");
        master.exit(false).expect("master exit");
    }

    #[test]
    fn test_fork_close_and_fork() {
        let device = Device::new();
        let world = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("enter");

        assert!(world.fork().expect("fork").is_none());

        world.set_fork_action(ForkAction::Fork);
        let child = world.fork().expect("fork").expect("child world");
        assert_ne!(child.fusion_id(), world.fusion_id());
        assert_eq!(
            world.fusionees().expect("fusionees"),
            vec![world.fusion_id(), child.fusion_id()]
        );

        child.exit(false).expect("child exit");
        world.exit(false).expect("exit");
    }

    #[test]
    fn test_leave_callback_on_master() {
        let device = Device::new();
        let master = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("master");
        let (sender, receiver) = crossbeam_channel::unbounded();
        master.set_leave_callback(move |fusion_id| {
            let _ = sender.send(fusion_id);
        });

        let slave = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("slave");
        let slave_id = slave.fusion_id();
        slave.exit(false).expect("slave exit");

        let left = receiver
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("leave notification");
        assert_eq!(left, slave_id);
        master.exit(false).expect("master exit");
    }

    #[test]
    fn test_millis_is_relative_to_start() {
        let device = Device::new();
        let world = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("enter");
        assert!(world.millis() < 60_000);
        world.exit(false).expect("exit");
    }
}
