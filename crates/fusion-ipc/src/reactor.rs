//! Channel based publish/subscribe.
//!
//! A reactor delivers fixed-size messages on integer channels. Each process
//! attaches its own local callbacks; the backend only tracks, per channel,
//! which fusionees have at least one of them, so a dispatch is forwarded to
//! exactly those fusionees and their dispatch threads run the callbacks.
//!
//! Global reactions are stored in the reactor's shared record as a table
//! index plus an opaque context. The dispatching process resolves the index
//! against the function table it passes to [`Reactor::dispatch`], so no code
//! address ever crosses a process boundary. The global list is guarded by a
//! replaceable [`Skirmish`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use fusion_wire::{CallId, Frame, FusionId, ReactorFrame, ReactorId, SkirmishId};

use crate::call::FusionCall;
use crate::skirmish::Skirmish;
use crate::world::World;
use crate::{FusionError, Result};

const RECORD_KIND: &str = "reactor";

/// What a reaction wants after seeing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionResult {
    /// Keep the reaction
    Ok,
    /// Detach the reaction; later dispatches skip it
    Remove,
    /// Keep the reaction but do not run the remaining ones for this message
    Drop,
}

/// One delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorMessage {
    /// Reactor the message was dispatched on
    pub reactor: ReactorId,
    /// Channel
    pub channel: i32,
    /// Dispatching fusionee
    pub sender: FusionId,
    /// Payload, at most the reactor's message size
    pub data: Vec<u8>,
}

/// Entry of a process's global reaction table
pub type GlobalReactionFn = fn(&ReactorMessage, u64) -> ReactionResult;

type LocalCallback = dyn Fn(&ReactorMessage) -> ReactionResult + Send + Sync;

/// A local attachment, returned by [`Reactor::attach`]
#[derive(Debug, PartialEq, Eq)]
pub struct Reaction {
    reactor: ReactorId,
    channel: i32,
    id: u64,
}

impl Reaction {
    /// Channel the reaction listens on
    pub const fn channel(&self) -> i32 {
        self.channel
    }
}

/// A global attachment, returned by [`Reactor::attach_global`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalReaction {
    reactor: ReactorId,
    id: u32,
}

struct LocalReaction {
    id: u64,
    channel: i32,
    callback: Arc<LocalCallback>,
}

/// This process's callbacks for one reactor
#[derive(Default)]
pub(crate) struct LocalListeners {
    reactions: Mutex<Vec<LocalReaction>>,
    next_id: AtomicU64,
}

impl LocalListeners {
    fn remove(&self, id: u64) -> Option<i32> {
        let mut reactions = self.reactions.lock();
        let position = reactions.iter().position(|reaction| reaction.id == id)?;
        Some(reactions.remove(position).channel)
    }

    fn take_all(&self) -> Vec<i32> {
        self.reactions
            .lock()
            .drain(..)
            .map(|reaction| reaction.channel)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GlobalEntry {
    id: u32,
    index: usize,
    context: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReactorRecord {
    message_size: usize,
    lock: SkirmishId,
    own_lock: Option<SkirmishId>,
    globals: Vec<GlobalEntry>,
    dispatch_callback: Option<(CallId, i32)>,
}

/// Handle on a reactor
#[derive(Clone)]
pub struct Reactor {
    world: World,
    id: ReactorId,
    message_size: usize,
}

impl Reactor {
    /// Create a reactor for messages of at most `message_size` bytes, with
    /// its own lock for the global reaction list
    pub fn new(world: &World, message_size: usize) -> Result<Self> {
        let id = world.backend().reactor_new()?;
        let lock = Skirmish::new(world, format!("{id} globals"))?;
        Self::publish(world, id, message_size, lock.id(), Some(lock.id()))
    }

    /// Create a reactor whose global reaction list is guarded by `lock`
    pub(crate) fn with_lock(world: &World, message_size: usize, lock: &Skirmish) -> Result<Self> {
        let id = world.backend().reactor_new()?;
        Self::publish(world, id, message_size, lock.id(), None)
    }

    fn publish(
        world: &World,
        id: ReactorId,
        message_size: usize,
        lock: SkirmishId,
        own_lock: Option<SkirmishId>,
    ) -> Result<Self> {
        let reactor = Self {
            world: world.clone(),
            id,
            message_size,
        };
        reactor.store(&ReactorRecord {
            message_size,
            lock,
            own_lock,
            globals: Vec::new(),
            dispatch_callback: None,
        })?;
        trace!("{} created {id} ({message_size} byte messages)", world.fusion_id());
        Ok(reactor)
    }

    /// Attach to a reactor created by any fusionee
    pub fn open(world: &World, id: ReactorId) -> Result<Self> {
        let record = load(world, id)?;
        Ok(Self {
            world: world.clone(),
            id,
            message_size: record.message_size,
        })
    }

    pub(crate) fn from_parts(world: &World, id: ReactorId, message_size: usize) -> Self {
        Self {
            world: world.clone(),
            id,
            message_size,
        }
    }

    /// Reactor id
    pub const fn id(&self) -> ReactorId {
        self.id
    }

    /// Largest message accepted by [`Reactor::dispatch`]
    pub const fn message_size(&self) -> usize {
        self.message_size
    }

    fn store(&self, record: &ReactorRecord) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        self.world
            .backend()
            .record_put(RECORD_KIND, &self.id.get().to_string(), &data)
    }

    /// Run `f` on the record under the global reaction lock, storing the
    /// record afterwards when `f` reports a change.
    fn locked<T>(&self, f: impl FnOnce(&mut ReactorRecord) -> (T, bool)) -> Result<T> {
        loop {
            let lock = Skirmish::open(&self.world, load(&self.world, self.id)?.lock);
            let _guard = lock.lock()?;

            // the lock may have been replaced while we waited for it
            let mut record = load(&self.world, self.id)?;
            if record.lock != lock.id() {
                continue;
            }
            let (value, changed) = f(&mut record);
            if changed {
                self.store(&record)?;
            }
            return Ok(value);
        }
    }

    /// Attach a local callback on `channel`
    pub fn attach<F>(&self, channel: i32, callback: F) -> Result<Reaction>
    where
        F: Fn(&ReactorMessage) -> ReactionResult + Send + Sync + 'static,
    {
        self.prune(self.world.backend().reactor_attach(self.id, channel))?;
        let listeners = self.world.listeners(self.id);
        let id = listeners.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        listeners.reactions.lock().push(LocalReaction {
            id,
            channel,
            callback: Arc::new(callback),
        });
        Ok(Reaction {
            reactor: self.id,
            channel,
            id,
        })
    }

    /// Detach a local callback; a no-op if it already removed itself or the
    /// reactor was destroyed meanwhile
    pub fn detach(&self, reaction: Reaction) -> Result<()> {
        if reaction.reactor != self.id {
            return Err(FusionError::InvalidArgument(format!(
                "reaction of {} detached from {}",
                reaction.reactor, self.id
            )));
        }
        let removed = self
            .world
            .existing_listeners(self.id)
            .and_then(|listeners| listeners.remove(reaction.id));
        match removed {
            Some(channel) => match self.world.backend().reactor_detach(self.id, channel) {
                Err(FusionError::Destroyed) => {
                    self.prune(Err::<(), _>(FusionError::Destroyed)).or(Ok(()))
                }
                result => result,
            },
            None => {
                debug!("reaction {} on {} already detached", reaction.id, self.id);
                Ok(())
            }
        }
    }

    /// Attach a global reaction: entry `index` of the dispatcher's function
    /// table, called with `context`
    pub fn attach_global(&self, index: usize, context: u64) -> Result<GlobalReaction> {
        let id = self.world.backend().mint()?;
        self.locked(|record| {
            record.globals.push(GlobalEntry { id, index, context });
            ((), true)
        })?;
        Ok(GlobalReaction {
            reactor: self.id,
            id,
        })
    }

    /// Detach a global reaction
    pub fn detach_global(&self, reaction: GlobalReaction) -> Result<()> {
        if reaction.reactor != self.id {
            return Err(FusionError::InvalidArgument(format!(
                "global reaction of {} detached from {}",
                reaction.reactor, self.id
            )));
        }
        let removed = self.locked(|record| {
            let before = record.globals.len();
            record.globals.retain(|entry| entry.id != reaction.id);
            let removed = record.globals.len() != before;
            (removed, removed)
        })?;
        if !removed {
            debug!("global reaction {} on {} already detached", reaction.id, self.id);
        }
        Ok(())
    }

    /// Number of global reactions attached
    pub fn global_count(&self) -> Result<usize> {
        Ok(load(&self.world, self.id)?.globals.len())
    }

    /// Deliver `data` on `channel`: global reactions first, then this
    /// process's callbacks when `include_self`, then every other fusionee
    /// listening on the channel.
    pub fn dispatch(
        &self,
        channel: i32,
        data: &[u8],
        include_self: bool,
        globals: &[GlobalReactionFn],
    ) -> Result<()> {
        if data.len() > self.message_size {
            return Err(FusionError::InvalidArgument(format!(
                "{} byte message exceeds {} limit of {}",
                data.len(),
                self.id,
                self.message_size
            )));
        }

        let me = self.world.fusion_id();
        let message = ReactorMessage {
            reactor: self.id,
            channel,
            sender: me,
            data: data.to_vec(),
        };

        let record = self.prune(load(&self.world, self.id))?;
        if !globals.is_empty() && !record.globals.is_empty() {
            self.locked(|record| run_globals(record, &message, globals))?;
        }

        if include_self {
            if let Some(listeners) = self.world.existing_listeners(self.id) {
                run_local(&self.world, &listeners, &message);
            }
        }

        let backend = self.world.backend();
        let recipients: Vec<FusionId> = backend
            .reactor_listeners(self.id, channel)?
            .into_iter()
            .filter(|fusion_id| *fusion_id != me)
            .collect();

        let countdown = match record.dispatch_callback {
            Some((call, arg)) if recipients.is_empty() => {
                self.world.invoke_one_way(call, arg)?;
                0
            }
            Some((call, arg)) => backend.countdown_new(recipients.len() as u32, call, arg)?,
            None => 0,
        };

        let frame = Frame::Reactor(ReactorFrame {
            reactor_id: self.id,
            channel,
            sender: me,
            countdown,
            payload: message.data,
        });
        for recipient in recipients {
            if let Err(e) = backend.send(recipient, &frame) {
                debug!("{} message for {recipient} not delivered: {e}", self.id);
                if countdown != 0 {
                    if let Some((call, arg)) = backend.countdown_tick(countdown)? {
                        self.world.invoke_one_way(call, arg)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Execute `call` one-way with `arg` once every remote recipient of a
    /// dispatch processed it; `None` clears the callback
    pub fn set_dispatch_callback(&self, call: Option<&FusionCall>, arg: i32) -> Result<()> {
        let callback = call.map(|call| (call.id(), arg));
        self.locked(|record| {
            record.dispatch_callback = callback;
            ((), true)
        })
    }

    /// Guard the global reaction list with `lock`, switching under the
    /// current lock
    pub fn set_lock(&self, lock: &Skirmish) -> Result<()> {
        let id = lock.id();
        self.locked(|record| {
            record.lock = id;
            ((), true)
        })
    }

    /// Guard the global reaction list with `lock` without taking the
    /// current one; only safe before the reactor is shared
    pub fn set_lock_only(&self, lock: &Skirmish) -> Result<()> {
        let mut record = load(&self.world, self.id)?;
        record.lock = lock.id();
        self.store(&record)
    }

    /// Drop this process's local callbacks
    pub fn free(&self) -> Result<()> {
        let Some(listeners) = self.world.drop_listeners(self.id) else {
            return Ok(());
        };
        for channel in listeners.take_all() {
            match self.world.backend().reactor_detach(self.id, channel) {
                Ok(()) | Err(FusionError::Destroyed) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Destroy the reactor in every process.
    ///
    /// No message reaches any fusionee afterwards. Other fusionees drop
    /// their local callbacks lazily: on `free`, on world exit, or when their
    /// next `attach`, `detach` or `dispatch` finds the reactor gone.
    pub fn destroy(&self) -> Result<()> {
        let record = load(&self.world, self.id)?;
        self.world.drop_listeners(self.id);
        self.world.backend().reactor_destroy(self.id)?;
        self.world
            .backend()
            .record_remove(RECORD_KIND, &self.id.get().to_string())?;
        if let Some(own_lock) = record.own_lock {
            Skirmish::open(&self.world, own_lock).destroy()?;
        }
        Ok(())
    }
}

impl Reactor {
    fn prune<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(FusionError::Destroyed))
            && self.world.drop_listeners(self.id).is_some()
        {
            debug!("{} is gone, dropped local callbacks of {}", self.id, self.world.fusion_id());
        }
        result
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.id)
            .field("message_size", &self.message_size)
            .finish_non_exhaustive()
    }
}

fn load(world: &World, id: ReactorId) -> Result<ReactorRecord> {
    match world
        .backend()
        .record_get(RECORD_KIND, &id.get().to_string())?
    {
        Some(data) => Ok(serde_json::from_slice(&data)?),
        None => Err(FusionError::Destroyed),
    }
}

fn run_globals(
    record: &mut ReactorRecord,
    message: &ReactorMessage,
    table: &[GlobalReactionFn],
) -> ((), bool) {
    let mut removed = Vec::new();
    for entry in &record.globals {
        let Some(reaction) = table.get(entry.index) else {
            continue;
        };
        match reaction(message, entry.context) {
            ReactionResult::Ok => {}
            ReactionResult::Remove => removed.push(entry.id),
            ReactionResult::Drop => break,
        }
    }
    record.globals.retain(|entry| !removed.contains(&entry.id));
    ((), !removed.is_empty())
}

/// Run this process's callbacks for the message's channel, newest first.
fn run_local(world: &World, listeners: &LocalListeners, message: &ReactorMessage) {
    let snapshot: Vec<(u64, Arc<LocalCallback>)> = listeners
        .reactions
        .lock()
        .iter()
        .rev()
        .filter(|reaction| reaction.channel == message.channel)
        .map(|reaction| (reaction.id, Arc::clone(&reaction.callback)))
        .collect();

    let mut removed = Vec::new();
    for (id, callback) in snapshot {
        match callback(message) {
            ReactionResult::Ok => {}
            ReactionResult::Remove => removed.push(id),
            ReactionResult::Drop => break,
        }
    }

    for id in removed {
        if let Some(channel) = listeners.remove(id) {
            if let Err(e) = world.backend().reactor_detach(message.reactor, channel) {
                debug!("detaching removed reaction from {} failed: {e}", message.reactor);
            }
        }
    }
}

/// Run local callbacks for a message forwarded by another fusionee.
pub(crate) fn deliver_remote(world: &World, frame: ReactorFrame) {
    let Some(listeners) = world.existing_listeners(frame.reactor_id) else {
        debug!(
            "{} has no listeners on {}, message dropped",
            world.fusion_id(),
            frame.reactor_id
        );
        return;
    };
    let message = ReactorMessage {
        reactor: frame.reactor_id,
        channel: frame.channel,
        sender: frame.sender,
        data: frame.payload,
    };
    run_local(world, &listeners, &message);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::backend::device::Device;
    use crate::call::CallHandlerResult;
    use crate::config::WorldConfig;
    use crate::world::Host;

    fn enter(device: &Device) -> World {
        Host::new()
            .enter(WorldConfig::device(device))
            .expect("enter")
    }

    #[test]
    fn test_include_self_and_remove() {
        let device = Device::new();
        let world = enter(&device);
        let reactor = Reactor::new(&world, 8).expect("reactor");
        let hits = Arc::new(AtomicUsize::new(0));

        let _reaction = {
            let hits = Arc::clone(&hits);
            reactor
                .attach(1, move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    ReactionResult::Remove
                })
                .expect("attach")
        };

        reactor.dispatch(1, b"x", false, &[]).expect("dispatch");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        reactor.dispatch(1, b"x", true, &[]).expect("dispatch");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        reactor.dispatch(1, b"x", true, &[]).expect("dispatch");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        world.exit(false).expect("exit");
    }

    #[test]
    fn test_newest_first_and_drop() {
        let device = Device::new();
        let world = enter(&device);
        let reactor = Reactor::new(&world, 8).expect("reactor");
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, result) in [(1, ReactionResult::Ok), (2, ReactionResult::Drop), (3, ReactionResult::Ok)] {
            let order = Arc::clone(&order);
            reactor
                .attach(0, move |_| {
                    order.lock().push(tag);
                    result
                })
                .expect("attach");
        }

        reactor.dispatch(0, b"", true, &[]).expect("dispatch");
        assert_eq!(*order.lock(), vec![3, 2]);
        world.exit(false).expect("exit");
    }

    #[test]
    fn test_message_size_limit() {
        let device = Device::new();
        let world = enter(&device);
        let reactor = Reactor::new(&world, 4).expect("reactor");
        assert!(matches!(
            reactor.dispatch(0, b"too long", true, &[]),
            Err(FusionError::InvalidArgument(_))
        ));
        world.exit(false).expect("exit");
    }

    fn count_and_remove(_: &ReactorMessage, context: u64) -> ReactionResult {
        if context == 0 {
            ReactionResult::Remove
        } else {
            ReactionResult::Ok
        }
    }

    #[test]
    fn test_globals_resolved_by_index() {
        let device = Device::new();
        let world = enter(&device);
        let reactor = Reactor::new(&world, 4).expect("reactor");

        reactor.attach_global(0, 0).expect("removing global");
        let kept = reactor.attach_global(0, 1).expect("kept global");
        reactor.attach_global(5, 0).expect("out of range global");
        assert_eq!(reactor.global_count().expect("count"), 3);

        reactor.dispatch(0, b"", false, &[]).expect("no table");
        assert_eq!(reactor.global_count().expect("count"), 3);

        reactor
            .dispatch(0, b"", false, &[count_and_remove])
            .expect("dispatch");
        assert_eq!(reactor.global_count().expect("count"), 2);

        reactor.detach_global(kept).expect("detach");
        assert_eq!(reactor.global_count().expect("count"), 1);
        world.exit(false).expect("exit");
    }

    #[test]
    fn test_remote_delivery_and_dispatch_callback() {
        let device = Device::new();
        let master = enter(&device);
        let slave = enter(&device);
        let reactor = Reactor::new(&master, 16).expect("reactor");
        let remote = Reactor::open(&slave, reactor.id()).expect("open");

        let (seen, seen_rx) = crossbeam_channel::unbounded();
        remote
            .attach(3, move |message| {
                let _ = seen.send((message.sender, message.data.clone()));
                ReactionResult::Ok
            })
            .expect("attach");

        let (done, done_rx) = crossbeam_channel::unbounded();
        let callback = FusionCall::init(&master, move |ctx| {
            let _ = done.send(ctx.arg);
            CallHandlerResult::Return(0)
        })
        .expect("callback");
        reactor
            .set_dispatch_callback(Some(&callback), 11)
            .expect("set callback");

        reactor.dispatch(3, b"hello", false, &[]).expect("dispatch");
        assert_eq!(
            seen_rx.recv_timeout(Duration::from_secs(5)).expect("delivered"),
            (master.fusion_id(), b"hello".to_vec())
        );
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).expect("callback"), 11);

        slave.exit(false).expect("slave exit");
        master.exit(false).expect("master exit");
    }

    #[test]
    fn test_peer_drops_callbacks_of_destroyed_reactor() {
        let device = Device::new();
        let master = enter(&device);
        let slave = enter(&device);
        let reactor = Reactor::new(&master, 8).expect("reactor");
        let remote = Reactor::open(&slave, reactor.id()).expect("open");
        let reaction = remote.attach(0, |_| ReactionResult::Ok).expect("attach");
        assert!(slave.existing_listeners(reactor.id()).is_some());

        reactor.destroy().expect("destroy");
        assert!(slave.existing_listeners(reactor.id()).is_some());

        assert!(matches!(
            remote.dispatch(0, b"late", false, &[]),
            Err(FusionError::Destroyed)
        ));
        assert!(slave.existing_listeners(reactor.id()).is_none());
        remote.detach(reaction).expect("detach after destroy");
        assert!(matches!(
            remote.attach(0, |_| ReactionResult::Ok),
            Err(FusionError::Destroyed)
        ));
        assert!(slave.existing_listeners(reactor.id()).is_none());
        remote.free().expect("free");

        slave.exit(false).expect("slave exit");
        master.exit(false).expect("master exit");
    }

    #[test]
    fn test_set_lock_switches_guard() {
        let device = Device::new();
        let world = enter(&device);
        let reactor = Reactor::new(&world, 4).expect("reactor");
        let shared = Skirmish::new(&world, "shared").expect("lock");

        reactor.set_lock(&shared).expect("set lock");
        {
            let _guard = shared.lock().expect("outer lock");
            reactor.attach_global(0, 0).expect("nested under same owner");
        }
        reactor.destroy().expect("destroy");
        assert!(matches!(Reactor::open(&world, reactor.id()), Err(FusionError::Destroyed)));
        world.exit(false).expect("exit");
    }
}
