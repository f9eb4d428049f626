//! Shared reference counter.
//!
//! The count is the sum of one global count and a local count per fusionee.
//! Local counts are released automatically when their fusionee leaves or
//! dies; global counts survive their incrementer. A registered watch call is
//! executed one-way, exactly once per transition to zero.

use std::fmt;

use tracing::trace;

use fusion_wire::{FusionId, RefId};

use crate::call::FusionCall;
use crate::world::World;
use crate::Result;

/// Handle on a shared reference counter
#[derive(Clone)]
pub struct FusionRef {
    world: World,
    id: RefId,
}

impl FusionRef {
    /// Create a reference at count zero, created by this fusionee
    pub fn init(world: &World) -> Result<Self> {
        let id = world.backend().ref_new()?;
        trace!("{} created {id}", world.fusion_id());
        Ok(Self {
            world: world.clone(),
            id,
        })
    }

    /// Attach to a reference created by any fusionee
    pub fn open(world: &World, id: RefId) -> Result<Self> {
        world.backend().ref_stat(id)?;
        Ok(Self {
            world: world.clone(),
            id,
        })
    }

    pub(crate) fn from_id(world: &World, id: RefId) -> Self {
        Self {
            world: world.clone(),
            id,
        }
    }

    /// Reference id
    pub const fn id(&self) -> RefId {
        self.id
    }

    /// Increment; fails Locked while another party holds the zero lock
    pub fn up(&self, global: bool) -> Result<()> {
        self.world.backend().ref_up(self.id, global)
    }

    /// Decrement; fails Bug when there is nothing to decrement
    pub fn down(&self, global: bool) -> Result<()> {
        self.world.backend().ref_down(self.id, global)
    }

    /// Current total count
    pub fn stat(&self) -> Result<i32> {
        self.world.backend().ref_stat(self.id)
    }

    /// Wait for in-flight messages, block until the count is zero, then hold
    /// it there until [`FusionRef::unlock`]
    pub fn zero_lock(&self) -> Result<()> {
        self.world.sync()?;
        self.world.backend().ref_zero_lock(self.id)
    }

    /// Non-blocking [`FusionRef::zero_lock`], failing Busy
    pub fn zero_try_lock(&self) -> Result<()> {
        self.world.backend().ref_zero_trylock(self.id)
    }

    /// Release the zero lock
    pub fn unlock(&self) -> Result<()> {
        self.world.backend().ref_unlock(self.id)
    }

    /// Execute `call` one-way with `arg` whenever the count drops to zero.
    /// Fails Busy if already watched and Bug if the count is zero.
    pub fn watch(&self, call: &FusionCall, arg: i32) -> Result<()> {
        self.world.backend().ref_watch(self.id, call.id(), arg)
    }

    /// Complete a creator transfer nominated by [`FusionRef::throw`]
    pub fn catch(&self) -> Result<()> {
        self.world.backend().ref_catch(self.id)
    }

    /// Nominate `target` as the next creator
    pub fn throw(&self, target: FusionId) -> Result<()> {
        self.world.backend().ref_throw(self.id, target)
    }

    /// Destroy; later operations fail Destroyed
    pub fn destroy(&self) -> Result<()> {
        self.world.backend().ref_destroy(self.id)
    }
}

impl fmt::Debug for FusionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FusionRef").field(&self.id).finish()
    }
}
