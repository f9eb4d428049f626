//! Shared objects destructed when their last reference goes away.
//!
//! Each [`FusionObject`] embeds a [`FusionRef`] watched by its pool's
//! watcher call, and a [`Reactor`] sharing the pool's lock. When the
//! reference drops to zero anywhere in the world, the watcher runs on the
//! pool creator's dispatch thread, zero-locks the reference and hands the
//! object to the pool's destructor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fusion_wire::{CallId, FusionId, ObjectId, PoolId, ReactorId, RefId, SharedPtr, SkirmishId};

use crate::call::{CallHandlerResult, FusionCall};
use crate::reactor::{GlobalReactionFn, Reaction, ReactionResult, Reactor, ReactorMessage};
use crate::reference::FusionRef;
use crate::skirmish::Skirmish;
use crate::world::World;
use crate::{FusionError, Result};

const POOL_KIND: &str = "pool";
const OBJECT_KIND: &str = "object";

/// Lifecycle of a shared object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectState {
    /// Created, not yet activated
    Init,
    /// Complete and usable by every fusionee
    Active,
    /// Being destructed
    Deinit,
}

type Destructor = dyn Fn(&FusionObject, bool) + Send + Sync;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolRecord {
    name: String,
    object_size: usize,
    message_size: usize,
    lock: SkirmishId,
    watcher: CallId,
    creator: FusionId,
    next_object: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectRecord {
    state: ObjectState,
    reference: RefId,
    reactor: ReactorId,
    storage: SharedPtr,
    properties: BTreeMap<String, SharedPtr>,
}

struct PoolCore {
    world: World,
    id: PoolId,
    name: String,
    lock: Skirmish,
    object_size: usize,
    message_size: usize,
    destructor: Option<Arc<Destructor>>,
}

impl PoolCore {
    fn object_name(&self, id: ObjectId) -> String {
        format!("{}.{}", self.id.get(), id.get())
    }

    fn load_pool(&self) -> Result<PoolRecord> {
        load_pool(&self.world, self.id)
    }

    fn store_pool(&self, record: &PoolRecord) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        self.world
            .backend()
            .record_put(POOL_KIND, &self.id.get().to_string(), &data)
    }

    fn load_object(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        match self
            .world
            .backend()
            .record_get(OBJECT_KIND, &self.object_name(id))?
        {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn store_object(&self, id: ObjectId, record: &ObjectRecord) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        self.world
            .backend()
            .record_put(OBJECT_KIND, &self.object_name(id), &data)
    }

    fn object(self: &Arc<Self>, id: ObjectId, record: &ObjectRecord) -> FusionObject {
        FusionObject {
            pool: Arc::clone(self),
            id,
            reference: FusionRef::from_id(&self.world, record.reference),
            reactor: Reactor::from_parts(&self.world, record.reactor, self.message_size),
            storage: record.storage,
        }
    }

    /// Watcher call body: the object's reference reached zero.
    fn reference_zero(self: &Arc<Self>, id: ObjectId) -> Result<()> {
        let guard = self.lock.lock()?;
        let Some(mut record) = self.load_object(id)? else {
            debug!("{} of pool '{}' already gone", id, self.name);
            return Ok(());
        };
        let object = self.object(id, &record);

        match object.reference.zero_try_lock() {
            Ok(()) => {}
            Err(FusionError::Busy) => {
                debug!("{id} of pool '{}' was revived", self.name);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match record.state {
            ObjectState::Init => {
                object.reference.unlock()?;
                return Err(FusionError::bug(format!(
                    "{id} of pool '{}' lost its last reference before activation",
                    self.name
                )));
            }
            ObjectState::Deinit => {
                debug!("{id} of pool '{}' is already being destructed", self.name);
                return Ok(());
            }
            ObjectState::Active => {}
        }

        record.state = ObjectState::Deinit;
        self.store_object(id, &record)?;
        drop(guard);

        debug!("destructing {id} of pool '{}'", self.name);
        if let Some(destructor) = &self.destructor {
            destructor(&object, false);
        }
        if self.load_object(id)?.is_some() {
            object.destroy()?;
        }
        Ok(())
    }
}

/// Pool of shared objects of one kind
pub struct ObjectPool {
    core: Arc<PoolCore>,
    watcher: FusionCall,
}

impl ObjectPool {
    /// Create a pool. `destructor` runs in this process for every object
    /// whose last reference goes away, with `zombie` set when the object
    /// is torn down by [`ObjectPool::destroy`] while still referenced.
    #[doc(alias = "pool_create")]
    pub fn create<F>(
        world: &World,
        name: &str,
        object_size: usize,
        message_size: usize,
        destructor: F,
    ) -> Result<Self>
    where
        F: Fn(&FusionObject, bool) + Send + Sync + 'static,
    {
        let id = PoolId(world.backend().mint()?);
        let core = Arc::new(PoolCore {
            world: world.clone(),
            id,
            name: name.to_string(),
            lock: Skirmish::new(world, format!("pool {name}"))?,
            object_size,
            message_size,
            destructor: Some(Arc::new(destructor)),
        });

        let watcher = {
            let core = Arc::clone(&core);
            FusionCall::init(world, move |ctx| {
                let id = ObjectId(ctx.arg as u32);
                if let Err(e) = core.reference_zero(id) {
                    warn!("watcher of pool '{}' failed for {id}: {e}", core.name);
                }
                CallHandlerResult::Return(0)
            })?
        };

        core.store_pool(&PoolRecord {
            name: name.to_string(),
            object_size,
            message_size,
            lock: core.lock.id(),
            watcher: watcher.id(),
            creator: world.fusion_id(),
            next_object: 0,
        })?;
        info!("{} created object pool '{name}' ({id})", world.fusion_id());
        Ok(Self { core, watcher })
    }

    /// Join a pool created by another fusionee. Destruction still happens
    /// in the creator.
    pub fn open(world: &World, id: PoolId) -> Result<Self> {
        let record = load_pool(world, id)?;
        let watcher = FusionCall::open(world, record.watcher)?;
        Ok(Self {
            core: Arc::new(PoolCore {
                world: world.clone(),
                id,
                name: record.name,
                lock: Skirmish::open(world, record.lock),
                object_size: record.object_size,
                message_size: record.message_size,
                destructor: None,
            }),
            watcher,
        })
    }

    /// Pool id
    pub fn id(&self) -> PoolId {
        self.core.id
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Create an object in [`ObjectState::Init`] holding one local reference
    #[doc(alias = "object_create")]
    pub fn create_object(&self) -> Result<FusionObject> {
        let core = &self.core;
        let world = &core.world;
        let _guard = core.lock.lock()?;

        let mut pool = core.load_pool()?;
        pool.next_object += 1;
        let id = ObjectId(pool.next_object);
        core.store_pool(&pool)?;

        let reference = FusionRef::init(world)?;
        reference.up(false)?;
        reference.watch(&self.watcher, id.get() as i32)?;
        let reactor = Reactor::with_lock(world, core.message_size, &core.lock)?;
        let storage = if core.object_size == 0 {
            SharedPtr::NULL
        } else {
            world.pool().allocate(core.object_size)?
        };

        core.store_object(
            id,
            &ObjectRecord {
                state: ObjectState::Init,
                reference: reference.id(),
                reactor: reactor.id(),
                storage,
                properties: BTreeMap::new(),
            },
        )?;
        debug!("{} created {id} in pool '{}'", world.fusion_id(), core.name);
        Ok(FusionObject {
            pool: Arc::clone(core),
            id,
            reference,
            reactor,
            storage,
        })
    }

    /// Look up a live object
    pub fn lookup(&self, id: ObjectId) -> Result<FusionObject> {
        let record = self
            .core
            .load_object(id)?
            .ok_or_else(|| FusionError::NotFound(format!("{id} in pool '{}'", self.core.name)))?;
        Ok(self.core.object(id, &record))
    }

    /// Every live object, by id
    pub fn enumerate(&self) -> Result<Vec<FusionObject>> {
        let prefix = format!("{}.", self.core.id.get());
        let mut ids: Vec<ObjectId> = self
            .core
            .world
            .backend()
            .record_list(OBJECT_KIND)?
            .iter()
            .filter_map(|name| name.strip_prefix(&prefix)?.parse().ok())
            .map(ObjectId)
            .collect();
        ids.sort_unstable();

        let mut objects = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.core.load_object(id)? {
                objects.push(self.core.object(id, &record));
            }
        }
        Ok(objects)
    }

    /// Destroy the pool: wait for in-flight messages, then destruct every
    /// remaining object as a zombie. Only the creator may destroy a pool.
    #[doc(alias = "pool_destroy")]
    pub fn destroy(self) -> Result<()> {
        let core = &self.core;
        let world = &core.world;
        let record = core.load_pool()?;
        if record.creator != world.fusion_id() {
            return Err(FusionError::bug(format!(
                "pool '{}' destroyed by {} instead of its creator",
                core.name,
                world.fusion_id()
            )));
        }

        world.sync()?;
        let guard = core.lock.lock()?;
        for object in self.enumerate()? {
            warn!(
                "destructing zombie {} of pool '{}' ({} references)",
                object.id,
                core.name,
                object.ref_stat().unwrap_or(-1)
            );
            if let Some(mut record) = core.load_object(object.id)? {
                record.state = ObjectState::Deinit;
                core.store_object(object.id, &record)?;
            }
            if let Some(destructor) = &core.destructor {
                destructor(&object, true);
            }
            if core.load_object(object.id)?.is_some() {
                object.destroy()?;
            }
        }

        self.watcher.destroy()?;
        world
            .backend()
            .record_remove(POOL_KIND, &core.id.get().to_string())?;
        drop(guard);
        core.lock.destroy()?;
        info!("object pool '{}' destroyed", core.name);
        Ok(())
    }
}

impl fmt::Debug for ObjectPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

/// A shared object
#[derive(Clone)]
pub struct FusionObject {
    pool: Arc<PoolCore>,
    id: ObjectId,
    reference: FusionRef,
    reactor: Reactor,
    storage: SharedPtr,
}

impl FusionObject {
    /// Object id, unique within its pool
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Owning pool
    pub fn pool_id(&self) -> PoolId {
        self.pool.id
    }

    /// Object storage in the world's shared memory pool; null for pools
    /// with zero sized objects
    pub const fn storage(&self) -> SharedPtr {
        self.storage
    }

    /// Embedded reactor
    pub const fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    fn load(&self) -> Result<ObjectRecord> {
        self.pool.load_object(self.id)?.ok_or(FusionError::Destroyed)
    }

    /// Current state
    pub fn state(&self) -> Result<ObjectState> {
        Ok(self.load()?.state)
    }

    /// Mark the object complete
    pub fn activate(&self) -> Result<()> {
        let _guard = self.pool.lock.lock()?;
        let mut record = self.load()?;
        if record.state != ObjectState::Init {
            return Err(FusionError::bug(format!(
                "activating {} in state {:?}",
                self.id, record.state
            )));
        }
        record.state = ObjectState::Active;
        self.pool.store_object(self.id, &record)
    }

    /// Unlink the object and destroy its reference, reactor, storage and
    /// properties. An active object must lose its references first.
    #[doc(alias = "object_destroy")]
    pub fn destroy(&self) -> Result<()> {
        let world = &self.pool.world;
        let _guard = self.pool.lock.lock()?;
        let record = self.load()?;
        if record.state == ObjectState::Active {
            return Err(FusionError::bug(format!(
                "destroying active {} of pool '{}'",
                self.id, self.pool.name
            )));
        }

        world
            .backend()
            .record_remove(OBJECT_KIND, &self.pool.object_name(self.id))?;
        match self.reference.destroy() {
            Ok(()) | Err(FusionError::Destroyed) => {}
            Err(e) => return Err(e),
        }
        match self.reactor.destroy() {
            Ok(()) | Err(FusionError::Destroyed) => {}
            Err(e) => return Err(e),
        }
        if !record.storage.is_null() {
            world.pool().free(record.storage)?;
        }
        debug!("{} of pool '{}' destroyed", self.id, self.pool.name);
        Ok(())
    }

    /// Take a local reference
    pub fn reference(&self) -> Result<()> {
        self.reference.up(false)
    }

    /// Drop a local reference
    pub fn unreference(&self) -> Result<()> {
        self.reference.down(false)
    }

    /// Take a global reference
    pub fn reference_global(&self) -> Result<()> {
        self.reference.up(true)
    }

    /// Drop a global reference
    pub fn unreference_global(&self) -> Result<()> {
        self.reference.down(true)
    }

    /// Total reference count
    pub fn ref_stat(&self) -> Result<i32> {
        self.reference.stat()
    }

    /// Attach a local callback to the object's reactor
    pub fn attach<F>(&self, channel: i32, callback: F) -> Result<Reaction>
    where
        F: Fn(&ReactorMessage) -> ReactionResult + Send + Sync + 'static,
    {
        self.reactor.attach(channel, callback)
    }

    /// Detach a local callback
    pub fn detach(&self, reaction: Reaction) -> Result<()> {
        self.reactor.detach(reaction)
    }

    /// Dispatch on the object's reactor
    pub fn dispatch(
        &self,
        channel: i32,
        data: &[u8],
        include_self: bool,
        globals: &[GlobalReactionFn],
    ) -> Result<()> {
        self.reactor.dispatch(channel, data, include_self, globals)
    }

    /// Set a property, returning the previous value
    pub fn set_property(&self, key: &str, value: SharedPtr) -> Result<Option<SharedPtr>> {
        let _guard = self.pool.lock.lock()?;
        let mut record = self.load()?;
        let previous = record.properties.insert(key.to_string(), value);
        self.pool.store_object(self.id, &record)?;
        Ok(previous)
    }

    /// Read a property
    pub fn get_property(&self, key: &str) -> Result<Option<SharedPtr>> {
        let _guard = self.pool.lock.lock()?;
        Ok(self.load()?.properties.get(key).copied())
    }

    /// Remove a property, returning its value
    pub fn remove_property(&self, key: &str) -> Result<Option<SharedPtr>> {
        let _guard = self.pool.lock.lock()?;
        let mut record = self.load()?;
        let previous = record.properties.remove(key);
        if previous.is_some() {
            self.pool.store_object(self.id, &record)?;
        }
        Ok(previous)
    }
}

impl fmt::Debug for FusionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionObject")
            .field("pool", &self.pool.id)
            .field("id", &self.id)
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

fn load_pool(world: &World, id: PoolId) -> Result<PoolRecord> {
    match world.backend().record_get(POOL_KIND, &id.get().to_string())? {
        Some(data) => Ok(serde_json::from_slice(&data)?),
        None => Err(FusionError::NotFound(format!("object pool {id}"))),
    }
}
