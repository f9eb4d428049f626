//! In-process authority modelling a privileged device
//!
//! A [`Device`] owns the complete state of every world created through it,
//! the way a kernel module would. Each fusionee entering through the device
//! gets a [`DeviceBackend`]: a control handle plus an inbound frame queue
//! consumed by its dispatch thread. All blocking operations wait on one
//! device-wide condition variable.
//!
//! Process death is modelled by [`Device::kill`], which reclaims the
//! fusionee's local reference counts, listeners and calls exactly as the
//! device would when a process holding its handle exits. Skirmishes held by
//! a killed fusionee stay locked until another fusionee's contended acquire
//! notices the owner is gone.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use fusion_wire::{
    CallFrame, CallId, CallReply, Frame, FusionId, LeaveFrame, PoolId, ReactorId, RefId,
    SkirmishId, WakeupFrame,
};

use super::{Backend, Owner, WorldHeader, unix_millis, watch_frame};
use crate::config::{Role, WorldConfig};
use crate::{FusionError, Result};

static NEXT_DEVICE: AtomicU64 = AtomicU64::new(1);

/// Handle to an in-process device; clones share the same state
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    id: u64,
    state: Mutex<DeviceState>,
    changed: Condvar,
}

#[derive(Default)]
struct DeviceState {
    worlds: BTreeMap<u32, DeviceWorld>,
}

impl DeviceState {
    fn member_world(&mut self, index: u32, fusion_id: FusionId) -> Result<&mut DeviceWorld> {
        self.worlds
            .get_mut(&index)
            .filter(|world| world.fusionees.contains_key(&fusion_id))
            .ok_or(FusionError::Destroyed)
    }
}

struct Member {
    sender: Sender<Frame>,
    pending: u32,
}

#[derive(Default)]
struct LockState {
    owner: Option<Owner>,
    count: u32,
    notify_seq: u64,
}

struct RefState {
    creator: FusionId,
    catcher: Option<FusionId>,
    global: i32,
    local: HashMap<FusionId, i32>,
    zero_locker: Option<FusionId>,
    watch: Option<(CallId, i32)>,
}

impl RefState {
    fn new(creator: FusionId) -> Self {
        Self {
            creator,
            catcher: None,
            global: 0,
            local: HashMap::new(),
            zero_locker: None,
            watch: None,
        }
    }

    fn count(&self) -> i32 {
        self.global + self.local.values().sum::<i32>()
    }
}

struct Countdown {
    remaining: u32,
    call: CallId,
    arg: i32,
}

enum Reply {
    Waiting { call: CallId, owner: FusionId },
    Done(CallReply),
}

struct DeviceWorld {
    header: WorldHeader,
    next_fusion: u64,
    next_id: u32,
    fusionees: BTreeMap<FusionId, Member>,
    skirmishes: HashMap<SkirmishId, LockState>,
    refs: HashMap<RefId, RefState>,
    reactors: HashMap<ReactorId, HashMap<(i32, FusionId), u32>>,
    calls: HashMap<CallId, FusionId>,
    countdowns: HashMap<u32, Countdown>,
    replies: HashMap<u32, Reply>,
    records: HashMap<(String, String), Vec<u8>>,
}

impl DeviceWorld {
    fn create(index: u32, abi_version: u32, master: Sender<Frame>) -> Self {
        let mut world = Self {
            header: WorldHeader {
                index,
                abi_version,
                start_millis: unix_millis(),
                pool: PoolId(0),
                pool_lock: SkirmishId(0),
                arena_lock: SkirmishId(0),
            },
            next_fusion: FusionId::MASTER.0 + 1,
            next_id: 0,
            fusionees: BTreeMap::new(),
            skirmishes: HashMap::new(),
            refs: HashMap::new(),
            reactors: HashMap::new(),
            calls: HashMap::new(),
            countdowns: HashMap::new(),
            replies: HashMap::new(),
            records: HashMap::new(),
        };

        let arena_lock = SkirmishId(world.mint());
        let pool_lock = SkirmishId(world.mint());
        world.skirmishes.insert(arena_lock, LockState::default());
        world.skirmishes.insert(pool_lock, LockState::default());
        world.header.arena_lock = arena_lock;
        world.header.pool_lock = pool_lock;
        world.header.pool = PoolId(world.mint());
        world.fusionees.insert(
            FusionId::MASTER,
            Member {
                sender: master,
                pending: 0,
            },
        );
        world
    }

    fn mint(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn deliver(&mut self, to: FusionId, frame: Frame) -> Result<()> {
        let member = self.fusionees.get_mut(&to).ok_or(FusionError::Destroyed)?;
        member
            .sender
            .send(frame)
            .map_err(|_| FusionError::Destroyed)?;
        member.pending += 1;
        Ok(())
    }

    fn fire_watch(&mut self, call: CallId, arg: i32) {
        let Some(owner) = self.calls.get(&call).copied() else {
            debug!("watch {call} no longer exists, zero notification dropped");
            return;
        };
        if let Err(e) = self.deliver(owner, Frame::Call(watch_frame(call, arg))) {
            debug!("watch {call} owner {owner} unreachable: {e}");
        }
    }

    fn ref_mut(&mut self, id: RefId) -> Result<&mut RefState> {
        self.refs.get_mut(&id).ok_or(FusionError::Destroyed)
    }

    fn lock_mut(&mut self, id: SkirmishId) -> Result<&mut LockState> {
        self.skirmishes.get_mut(&id).ok_or(FusionError::Destroyed)
    }

    fn take(&mut self, id: SkirmishId, owner: Owner) -> Result<bool> {
        let holder = self
            .skirmishes
            .get(&id)
            .ok_or(FusionError::Destroyed)?
            .owner;
        let abandoned =
            holder.is_some_and(|h| h != owner && !self.fusionees.contains_key(&h.fusion_id));

        let lock = self.lock_mut(id)?;
        match lock.owner {
            None => {
                lock.owner = Some(owner);
                lock.count = 1;
                Ok(true)
            }
            Some(h) if h == owner => {
                lock.count += 1;
                Ok(true)
            }
            Some(h) if abandoned => {
                warn!("{id} abandoned by {}, taken over by {}", h.fusion_id, owner.fusion_id);
                lock.owner = Some(owner);
                lock.count = 1;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Remove a fusionee and reclaim everything it held locally
    fn remove_member(&mut self, fusion_id: FusionId) {
        self.fusionees.remove(&fusion_id);

        let mut fired = Vec::new();
        for (id, state) in &mut self.refs {
            if let Some(held) = state.local.remove(&fusion_id) {
                debug!("{id}: reclaimed {held} local count(s) of {fusion_id}");
                if held > 0 && state.count() == 0 {
                    if let Some(watch) = state.watch {
                        fired.push(watch);
                    }
                }
            }
            if state.zero_locker == Some(fusion_id) {
                state.zero_locker = None;
            }
            if state.creator == fusion_id {
                if let Some(catcher) = state.catcher.take() {
                    state.creator = catcher;
                }
            }
        }

        for listeners in self.reactors.values_mut() {
            listeners.retain(|(_, owner), _| *owner != fusion_id);
        }

        let owned: Vec<CallId> = self
            .calls
            .iter()
            .filter(|(_, owner)| **owner == fusion_id)
            .map(|(id, _)| *id)
            .collect();
        for call in &owned {
            self.calls.remove(call);
        }
        for (serial, reply) in &mut self.replies {
            if let Reply::Waiting { call, owner } = *reply {
                if owner == fusion_id || owned.contains(&call) {
                    *reply = Reply::Done(CallReply::destroyed(call, *serial));
                }
            }
        }

        for (call, arg) in fired {
            self.fire_watch(call, arg);
        }
    }

    fn fail_replies(&mut self, call_id: CallId) {
        for (serial, reply) in &mut self.replies {
            if let Reply::Waiting { call, .. } = *reply {
                if call == call_id {
                    *reply = Reply::Done(CallReply::destroyed(call, *serial));
                }
            }
        }
    }
}

impl Device {
    /// Create a device with no worlds
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                id: NEXT_DEVICE.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(DeviceState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Process-unique device number
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Indices of live worlds
    pub fn worlds(&self) -> Vec<u32> {
        self.inner.state.lock().worlds.keys().copied().collect()
    }

    /// Fusionees joined to world `index`
    pub fn fusionees(&self, index: u32) -> Vec<FusionId> {
        self.inner
            .state
            .lock()
            .worlds
            .get(&index)
            .map(|world| world.fusionees.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Simulate the death of a fusionee's process.
    ///
    /// Its local state is reclaimed and the master receives a leave frame.
    /// Killing the master destroys the world.
    pub fn kill(&self, index: u32, fusion_id: FusionId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let world = state
            .worlds
            .get_mut(&index)
            .ok_or_else(|| FusionError::NotFound(format!("world {index}")))?;
        if !world.fusionees.contains_key(&fusion_id) {
            return Err(FusionError::NotFound(format!("{fusion_id} in world {index}")));
        }

        if fusion_id.is_master() {
            warn!("master of world {index} killed, destroying world");
            state.worlds.remove(&index);
        } else {
            warn!("{fusion_id} of world {index} killed");
            world.remove_member(fusion_id);
            if let Err(e) = world.deliver(FusionId::MASTER, Frame::Leave(LeaveFrame { fusion_id })) {
                debug!("leave of {fusion_id} not delivered: {e}");
            }
        }
        drop(state);
        self.inner.changed.notify_all();
        Ok(())
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("id", &self.inner.id).finish()
    }
}

/// Control handle of one fusionee on a [`Device`]
#[derive(Debug)]
pub struct DeviceBackend {
    device: Device,
    index: u32,
    fusion_id: FusionId,
    header: WorldHeader,
    receiver: Receiver<Frame>,
    liveness: Duration,
}

impl DeviceBackend {
    /// Enter (or create) a world on `device`
    pub fn enter(device: &Device, config: &WorldConfig) -> Result<Arc<Self>> {
        let mut state = device.inner.state.lock();
        let index = match config.index {
            Some(index) => index,
            None => (0..u32::MAX)
                .find(|index| !state.worlds.contains_key(index))
                .ok_or_else(|| FusionError::LimitExceeded("world indices".to_string()))?,
        };

        let (sender, receiver) = unbounded();
        let (fusion_id, header) = if let Some(world) = state.worlds.get_mut(&index) {
            if config.role == Role::Master {
                return Err(FusionError::Busy);
            }
            if world.header.abi_version != config.abi_version {
                return Err(FusionError::VersionMismatch {
                    expected: config.abi_version,
                    found: world.header.abi_version,
                });
            }
            let fusion_id = FusionId(world.next_fusion);
            world.next_fusion += 1;
            world.fusionees.insert(
                fusion_id,
                Member {
                    sender,
                    pending: 0,
                },
            );
            (fusion_id, world.header)
        } else {
            if config.role == Role::Slave {
                return Err(FusionError::NotFound(format!("world {index}")));
            }
            let world = DeviceWorld::create(index, config.abi_version, sender);
            let header = world.header;
            state.worlds.insert(index, world);
            info!("device {}: created world {index}", device.id());
            (FusionId::MASTER, header)
        };
        drop(state);

        info!("device {}: {fusion_id} entered world {index}", device.id());
        Ok(Arc::new(Self {
            device: device.clone(),
            index,
            fusion_id,
            header,
            receiver,
            liveness: config.liveness_interval(),
        }))
    }

    fn with_world<T>(&self, f: impl FnOnce(&mut DeviceWorld) -> Result<T>) -> Result<T> {
        let mut state = self.device.inner.state.lock();
        let result = f(state.member_world(self.index, self.fusion_id)?);
        drop(state);
        self.device.inner.changed.notify_all();
        result
    }

    /// Re-run `poll` whenever device state changes until it yields a value.
    fn block_on<T>(
        &self,
        deadline: Option<Instant>,
        mut poll: impl FnMut(&mut DeviceWorld) -> Result<Option<T>>,
    ) -> Result<T> {
        let inner = &self.device.inner;
        let mut state = inner.state.lock();
        loop {
            if let Some(value) = poll(state.member_world(self.index, self.fusion_id)?)? {
                drop(state);
                inner.changed.notify_all();
                return Ok(value);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(FusionError::Timeout);
                    }
                    inner.changed.wait_until(&mut state, deadline);
                }
                None => {
                    inner.changed.wait_for(&mut state, self.liveness);
                }
            }
        }
    }
}

impl Backend for DeviceBackend {
    fn kind(&self) -> &'static str {
        "device"
    }

    fn fusion_id(&self) -> FusionId {
        self.fusion_id
    }

    fn header(&self) -> WorldHeader {
        self.header
    }

    fn mint(&self) -> Result<u32> {
        self.with_world(|world| Ok(world.mint()))
    }

    fn fusionees(&self) -> Result<Vec<FusionId>> {
        self.with_world(|world| Ok(world.fusionees.keys().copied().collect()))
    }

    fn is_alive(&self, fusion_id: FusionId) -> bool {
        self.device
            .inner
            .state
            .lock()
            .worlds
            .get(&self.index)
            .is_some_and(|world| world.fusionees.contains_key(&fusion_id))
    }

    fn reap(&self) -> Result<Vec<FusionId>> {
        // The device reclaims a fusionee the moment its handle goes away.
        Ok(Vec::new())
    }

    fn fork(&self) -> Result<Arc<dyn Backend>> {
        let (sender, receiver) = unbounded();
        let me = self.fusion_id;
        let child = self.with_world(|world| {
            let child = FusionId(world.next_fusion);
            world.next_fusion += 1;
            world.fusionees.insert(
                child,
                Member {
                    sender,
                    pending: 0,
                },
            );
            for state in world.refs.values_mut() {
                if let Some(held) = state.local.get(&me).copied() {
                    state.local.insert(child, held);
                }
            }
            Ok(child)
        })?;

        info!("device {}: {me} forked into {child}", self.device.id());
        Ok(Arc::new(Self {
            device: self.device.clone(),
            index: self.index,
            fusion_id: child,
            header: self.header,
            receiver,
            liveness: self.liveness,
        }))
    }

    fn leave(&self, emergency: bool) -> Result<()> {
        let mut state = self.device.inner.state.lock();
        let world = state.member_world(self.index, self.fusion_id)?;
        if self.fusion_id.is_master() {
            state.worlds.remove(&self.index);
            info!(
                "device {}: master left, world {} destroyed (emergency: {emergency})",
                self.device.id(),
                self.index
            );
        } else {
            world.remove_member(self.fusion_id);
            let leave = Frame::Leave(LeaveFrame {
                fusion_id: self.fusion_id,
            });
            if let Err(e) = world.deliver(FusionId::MASTER, leave) {
                debug!("leave of {} not delivered: {e}", self.fusion_id);
            }
            info!(
                "device {}: {} left world {}",
                self.device.id(),
                self.fusion_id,
                self.index
            );
        }
        drop(state);
        self.device.inner.changed.notify_all();
        Ok(())
    }

    fn send(&self, to: FusionId, frame: &Frame) -> Result<()> {
        self.with_world(|world| world.deliver(to, frame.clone()))
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(FusionError::Destroyed),
        }
    }

    fn processed(&self) -> Result<()> {
        self.with_world(|world| {
            if let Some(member) = world.fusionees.get_mut(&self.fusion_id) {
                member.pending = member.pending.saturating_sub(1);
            }
            Ok(())
        })
    }

    fn wake(&self) -> Result<()> {
        self.send(
            self.fusion_id,
            &Frame::Wakeup(WakeupFrame {
                fusion_id: self.fusion_id,
            }),
        )
    }

    fn sync(&self, include_self: bool, timeout: Duration) -> Result<()> {
        let me = self.fusion_id;
        self.block_on(Some(Instant::now() + timeout), |world| {
            let drained = world
                .fusionees
                .iter()
                .all(|(id, member)| (!include_self && *id == me) || member.pending == 0);
            Ok(drained.then_some(()))
        })
    }

    fn skirmish_new(&self) -> Result<SkirmishId> {
        self.with_world(|world| {
            let id = SkirmishId(world.mint());
            world.skirmishes.insert(id, LockState::default());
            Ok(id)
        })
    }

    fn skirmish_prevail(&self, id: SkirmishId, owner: Owner) -> Result<()> {
        self.block_on(None, |world| Ok(world.take(id, owner)?.then_some(())))
    }

    fn skirmish_swoop(&self, id: SkirmishId, owner: Owner) -> Result<()> {
        self.with_world(|world| {
            if world.take(id, owner)? {
                Ok(())
            } else {
                Err(FusionError::Busy)
            }
        })
    }

    fn skirmish_dismiss(&self, id: SkirmishId, owner: Owner) -> Result<()> {
        self.with_world(|world| {
            let lock = world.lock_mut(id)?;
            if lock.owner != Some(owner) {
                return Err(FusionError::bug(format!(
                    "{id} released by {} which does not hold it",
                    owner.fusion_id
                )));
            }
            lock.count -= 1;
            if lock.count == 0 {
                lock.owner = None;
            }
            Ok(())
        })
    }

    fn skirmish_lock_count(&self, id: SkirmishId, owner: Owner) -> Result<u32> {
        self.with_world(|world| {
            let lock = world.lock_mut(id)?;
            Ok(if lock.owner == Some(owner) { lock.count } else { 0 })
        })
    }

    fn skirmish_wait(
        &self,
        id: SkirmishId,
        owner: Owner,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let (depth, seq) = self.with_world(|world| {
            let lock = world.lock_mut(id)?;
            if lock.owner != Some(owner) {
                return Err(FusionError::bug(format!(
                    "wait on {id} by {} which does not hold it",
                    owner.fusion_id
                )));
            }
            let depth = lock.count;
            lock.owner = None;
            lock.count = 0;
            Ok((depth, lock.notify_seq))
        })?;

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let waited = self.block_on(deadline, |world| {
            let lock = world.lock_mut(id)?;
            Ok((lock.notify_seq != seq).then_some(()))
        });
        match waited {
            Ok(()) | Err(FusionError::Timeout) => {}
            Err(e) => return Err(e),
        }

        self.block_on(None, |world| Ok(world.take(id, owner)?.then_some(())))?;
        self.with_world(|world| {
            world.lock_mut(id)?.count = depth;
            Ok(())
        })?;
        waited
    }

    fn skirmish_notify(&self, id: SkirmishId) -> Result<()> {
        self.with_world(|world| {
            world.lock_mut(id)?.notify_seq += 1;
            Ok(())
        })
    }

    fn skirmish_destroy(&self, id: SkirmishId) -> Result<()> {
        self.with_world(|world| {
            world
                .skirmishes
                .remove(&id)
                .map(|_| ())
                .ok_or(FusionError::Destroyed)
        })
    }

    fn ref_new(&self) -> Result<RefId> {
        let me = self.fusion_id;
        self.with_world(|world| {
            let id = RefId(world.mint());
            world.refs.insert(id, RefState::new(me));
            Ok(id)
        })
    }

    fn ref_up(&self, id: RefId, global: bool) -> Result<()> {
        let me = self.fusion_id;
        self.with_world(|world| {
            let state = world.ref_mut(id)?;
            if state.zero_locker.is_some_and(|locker| locker != me) {
                return Err(FusionError::Locked);
            }
            if global {
                state.global += 1;
            } else {
                *state.local.entry(me).or_insert(0) += 1;
            }
            Ok(())
        })
    }

    fn ref_down(&self, id: RefId, global: bool) -> Result<()> {
        let me = self.fusion_id;
        self.with_world(|world| {
            let state = world.ref_mut(id)?;
            if global {
                if state.global <= 0 {
                    return Err(FusionError::bug(format!("global down on {id} at zero")));
                }
                state.global -= 1;
            } else {
                let held = state.local.get(&me).copied().unwrap_or(0);
                if held <= 0 {
                    return Err(FusionError::bug(format!(
                        "local down on {id} by {me} which holds none"
                    )));
                }
                if held == 1 {
                    state.local.remove(&me);
                } else {
                    state.local.insert(me, held - 1);
                }
            }

            if state.count() == 0 {
                if let Some((call, arg)) = state.watch {
                    world.fire_watch(call, arg);
                }
            }
            Ok(())
        })
    }

    fn ref_stat(&self, id: RefId) -> Result<i32> {
        self.with_world(|world| Ok(world.ref_mut(id)?.count()))
    }

    fn ref_zero_lock(&self, id: RefId) -> Result<()> {
        let me = self.fusion_id;
        self.block_on(None, |world| {
            let state = world.ref_mut(id)?;
            if state.zero_locker.is_some_and(|locker| locker != me) || state.count() != 0 {
                return Ok(None);
            }
            state.zero_locker = Some(me);
            Ok(Some(()))
        })
    }

    fn ref_zero_trylock(&self, id: RefId) -> Result<()> {
        let me = self.fusion_id;
        self.with_world(|world| {
            let state = world.ref_mut(id)?;
            if state.zero_locker.is_some_and(|locker| locker != me) || state.count() != 0 {
                return Err(FusionError::Busy);
            }
            state.zero_locker = Some(me);
            Ok(())
        })
    }

    fn ref_unlock(&self, id: RefId) -> Result<()> {
        let me = self.fusion_id;
        self.with_world(|world| {
            let state = world.ref_mut(id)?;
            if state.zero_locker != Some(me) {
                return Err(FusionError::bug(format!("unlock of {id} by {me} without zero lock")));
            }
            state.zero_locker = None;
            Ok(())
        })
    }

    fn ref_watch(&self, id: RefId, call: CallId, arg: i32) -> Result<()> {
        self.with_world(|world| {
            let state = world.ref_mut(id)?;
            if state.watch.is_some() {
                return Err(FusionError::Busy);
            }
            if state.count() == 0 {
                return Err(FusionError::bug(format!("watch on {id} at zero")));
            }
            state.watch = Some((call, arg));
            Ok(())
        })
    }

    fn ref_catch(&self, id: RefId) -> Result<()> {
        let me = self.fusion_id;
        self.with_world(|world| {
            let state = world.ref_mut(id)?;
            if state.catcher != Some(me) {
                return Err(FusionError::bug(format!("catch of {id} by {me} without throw")));
            }
            state.creator = me;
            state.catcher = None;
            Ok(())
        })
    }

    fn ref_throw(&self, id: RefId, target: FusionId) -> Result<()> {
        self.with_world(|world| {
            world.ref_mut(id)?.catcher = Some(target);
            Ok(())
        })
    }

    fn ref_destroy(&self, id: RefId) -> Result<()> {
        self.with_world(|world| {
            world
                .refs
                .remove(&id)
                .map(|_| ())
                .ok_or(FusionError::Destroyed)
        })
    }

    fn reactor_new(&self) -> Result<ReactorId> {
        self.with_world(|world| {
            let id = ReactorId(world.mint());
            world.reactors.insert(id, HashMap::new());
            Ok(id)
        })
    }

    fn reactor_attach(&self, id: ReactorId, channel: i32) -> Result<()> {
        let me = self.fusion_id;
        self.with_world(|world| {
            let listeners = world.reactors.get_mut(&id).ok_or(FusionError::Destroyed)?;
            *listeners.entry((channel, me)).or_insert(0) += 1;
            Ok(())
        })
    }

    fn reactor_detach(&self, id: ReactorId, channel: i32) -> Result<()> {
        let me = self.fusion_id;
        self.with_world(|world| {
            let listeners = world.reactors.get_mut(&id).ok_or(FusionError::Destroyed)?;
            match listeners.get_mut(&(channel, me)) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    listeners.remove(&(channel, me));
                }
                None => {
                    return Err(FusionError::bug(format!(
                        "detach from {id} channel {channel} by {me} without listener"
                    )));
                }
            }
            Ok(())
        })
    }

    fn reactor_listeners(&self, id: ReactorId, channel: i32) -> Result<Vec<FusionId>> {
        self.with_world(|world| {
            let listeners = world.reactors.get(&id).ok_or(FusionError::Destroyed)?;
            let mut fusionees: Vec<FusionId> = listeners
                .iter()
                .filter(|((ch, _), count)| *ch == channel && **count > 0)
                .map(|((_, fusion_id), _)| *fusion_id)
                .collect();
            fusionees.sort_unstable();
            Ok(fusionees)
        })
    }

    fn reactor_destroy(&self, id: ReactorId) -> Result<()> {
        self.with_world(|world| {
            world
                .reactors
                .remove(&id)
                .map(|_| ())
                .ok_or(FusionError::Destroyed)
        })
    }

    fn countdown_new(&self, count: u32, call: CallId, arg: i32) -> Result<u32> {
        self.with_world(|world| {
            let id = world.mint();
            world.countdowns.insert(
                id,
                Countdown {
                    remaining: count,
                    call,
                    arg,
                },
            );
            Ok(id)
        })
    }

    fn countdown_tick(&self, id: u32) -> Result<Option<(CallId, i32)>> {
        self.with_world(|world| {
            let Some(countdown) = world.countdowns.get_mut(&id) else {
                debug!("countdown {id} already finished");
                return Ok(None);
            };
            countdown.remaining = countdown.remaining.saturating_sub(1);
            if countdown.remaining > 0 {
                return Ok(None);
            }
            Ok(world
                .countdowns
                .remove(&id)
                .map(|countdown| (countdown.call, countdown.arg)))
        })
    }

    fn call_new(&self) -> Result<CallId> {
        let me = self.fusion_id;
        self.with_world(|world| {
            let id = CallId(world.mint());
            world.calls.insert(id, me);
            Ok(id)
        })
    }

    fn call_owner(&self, id: CallId) -> Result<FusionId> {
        self.with_world(|world| world.calls.get(&id).copied().ok_or(FusionError::Destroyed))
    }

    fn call_execute(&self, owner: FusionId, frame: CallFrame) -> Result<Option<CallReply>> {
        let serial = frame.serial;
        let call = frame.call_id;
        let expects_reply = frame.expects_reply();

        self.with_world(|world| {
            if !world.calls.contains_key(&call) {
                return Err(FusionError::Destroyed);
            }
            if expects_reply {
                world.replies.insert(serial, Reply::Waiting { call, owner });
            }
            if let Err(e) = world.deliver(owner, Frame::Call(frame)) {
                world.replies.remove(&serial);
                return Err(e);
            }
            Ok(())
        })?;

        if !expects_reply {
            return Ok(None);
        }

        self.block_on(None, |world| match world.replies.remove(&serial) {
            Some(Reply::Done(reply)) => Ok(Some(Some(reply))),
            Some(waiting) => {
                world.replies.insert(serial, waiting);
                Ok(None)
            }
            None => Err(FusionError::Destroyed),
        })
    }

    fn call_return(&self, reply: CallReply) -> Result<()> {
        self.with_world(|world| {
            match world.replies.get(&reply.serial) {
                Some(Reply::Waiting { .. }) => {
                    world.replies.insert(reply.serial, Reply::Done(reply));
                }
                _ => debug!(
                    "reply to {} serial {} has no waiting caller",
                    reply.call_id, reply.serial
                ),
            }
            Ok(())
        })
    }

    fn call_destroy(&self, id: CallId) -> Result<()> {
        self.with_world(|world| {
            world.calls.remove(&id).ok_or(FusionError::Destroyed)?;
            world.fail_replies(id);
            Ok(())
        })
    }

    fn record_get(&self, kind: &str, name: &str) -> Result<Option<Vec<u8>>> {
        self.with_world(|world| {
            Ok(world
                .records
                .get(&(kind.to_string(), name.to_string()))
                .cloned())
        })
    }

    fn record_put(&self, kind: &str, name: &str, data: &[u8]) -> Result<()> {
        self.with_world(|world| {
            world
                .records
                .insert((kind.to_string(), name.to_string()), data.to_vec());
            Ok(())
        })
    }

    fn record_remove(&self, kind: &str, name: &str) -> Result<bool> {
        self.with_world(|world| {
            Ok(world
                .records
                .remove(&(kind.to_string(), name.to_string()))
                .is_some())
        })
    }

    fn record_list(&self, kind: &str) -> Result<Vec<String>> {
        self.with_world(|world| {
            let mut names: Vec<String> = world
                .records
                .keys()
                .filter(|(k, _)| k == kind)
                .map(|(_, name)| name.clone())
                .collect();
            names.sort();
            Ok(names)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn enter(device: &Device, role: Role) -> Arc<DeviceBackend> {
        let config = WorldConfig::device(device).with_role(role);
        DeviceBackend::enter(device, &config).unwrap()
    }

    #[test]
    fn test_first_joiner_is_master() {
        let device = Device::new();
        let master = enter(&device, Role::Any);
        let slave = enter(&device, Role::Any);

        assert_eq!(master.fusion_id(), FusionId::MASTER);
        assert_eq!(slave.fusion_id(), FusionId(2));
        assert_eq!(master.header(), slave.header());
        assert_eq!(device.fusionees(0), vec![FusionId(1), FusionId(2)]);
    }

    #[test]
    fn test_role_checks() {
        let device = Device::new();
        let config = WorldConfig::device(&device).with_role(Role::Slave);
        assert!(matches!(
            DeviceBackend::enter(&device, &config),
            Err(FusionError::NotFound(_))
        ));

        let _master = enter(&device, Role::Master);
        let config = WorldConfig::device(&device).with_role(Role::Master);
        assert!(matches!(
            DeviceBackend::enter(&device, &config),
            Err(FusionError::Busy)
        ));
    }

    #[test]
    fn test_abi_mismatch() {
        let device = Device::new();
        let _master = enter(&device, Role::Any);
        let config = WorldConfig::device(&device).with_abi_version(7);

        assert!(matches!(
            DeviceBackend::enter(&device, &config),
            Err(FusionError::VersionMismatch {
                expected: 7,
                found: 1
            })
        ));
    }

    #[test]
    fn test_auto_index_creates_fresh_world() {
        let device = Device::new();
        let _first = enter(&device, Role::Any);
        let config = WorldConfig::device(&device).with_auto_index();
        let second = DeviceBackend::enter(&device, &config).unwrap();

        assert_eq!(second.header().index, 1);
        assert_eq!(second.fusion_id(), FusionId::MASTER);
        assert_eq!(device.worlds(), vec![0, 1]);
    }

    #[test]
    fn test_kill_reclaims_local_counts() {
        let device = Device::new();
        let master = enter(&device, Role::Any);
        let slave = enter(&device, Role::Any);

        let id = master.ref_new().unwrap();
        master.ref_up(id, true).unwrap();
        slave.ref_up(id, false).unwrap();
        slave.ref_up(id, false).unwrap();
        assert_eq!(master.ref_stat(id).unwrap(), 3);

        device.kill(0, slave.fusion_id()).unwrap();
        assert_eq!(master.ref_stat(id).unwrap(), 1);
        assert!(matches!(slave.ref_stat(id), Err(FusionError::Destroyed)));

        let frame = master.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(
            frame,
            Some(Frame::Leave(LeaveFrame {
                fusion_id: FusionId(2)
            }))
        );
    }

    #[test]
    fn test_kill_fails_pending_reply() {
        let device = Device::new();
        let master = enter(&device, Role::Any);
        let slave = enter(&device, Role::Any);
        let call = slave.call_new().unwrap();

        let waiter = {
            let master = Arc::clone(&master);
            std::thread::spawn(move || {
                let mut frame = watch_frame(call, 1);
                frame.flags = fusion_wire::CallFlags::NONE;
                frame.serial = 99;
                master.call_execute(FusionId(2), frame)
            })
        };

        // the invocation is queued for the slave, which dies before answering
        let queued = slave.recv(Duration::from_secs(1)).unwrap();
        assert!(matches!(queued, Some(Frame::Call(_))));
        device.kill(0, FusionId(2)).unwrap();

        let reply = waiter.join().unwrap().unwrap().unwrap();
        assert_eq!(reply.status, fusion_wire::ReplyStatus::Destroyed);
    }

    #[test]
    fn test_sync_waits_for_processing() {
        let device = Device::new();
        let master = enter(&device, Role::Any);
        let slave = enter(&device, Role::Any);

        master
            .send(
                slave.fusion_id(),
                &Frame::Wakeup(WakeupFrame {
                    fusion_id: slave.fusion_id(),
                }),
            )
            .unwrap();
        assert!(matches!(
            master.sync(true, Duration::from_millis(20)),
            Err(FusionError::Timeout)
        ));

        assert!(slave.recv(Duration::from_secs(1)).unwrap().is_some());
        slave.processed().unwrap();
        master.sync(true, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_master_leave_disconnects_slaves() {
        let device = Device::new();
        let master = enter(&device, Role::Any);
        let slave = enter(&device, Role::Any);

        master.leave(false).unwrap();
        assert!(device.worlds().is_empty());
        assert!(matches!(
            slave.recv(Duration::from_millis(10)),
            Err(FusionError::Destroyed)
        ));
        assert!(matches!(slave.processed(), Err(FusionError::Destroyed)));
    }

    #[test]
    fn test_mint_is_unique_across_members() {
        let device = Device::new();
        let master = enter(&device, Role::Any);
        let slave = enter(&device, Role::Any);

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..16 {
            assert!(seen.insert(master.mint().unwrap()));
            assert!(seen.insert(slave.mint().unwrap()));
        }
        assert!(!seen.contains(&0));
    }
}
