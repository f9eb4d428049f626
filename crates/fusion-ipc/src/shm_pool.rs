//! Shared memory pool contract.
//!
//! Blocks are addressed by opaque [`SharedPtr`] handles valid in every
//! process of the world: the pool id in the high half, the block id in the
//! low half. Block contents are kept in the backend record store; writes are
//! serialized by the pool's lock.

use std::fmt;

use tracing::trace;

use fusion_wire::{PoolId, SharedPtr};

use crate::skirmish::Skirmish;
use crate::world::World;
use crate::{FusionError, Result};

const RECORD_KIND: &str = "block";

/// Handle on a shared memory pool
#[derive(Clone)]
pub struct ShmPool {
    world: World,
    id: PoolId,
    lock: Skirmish,
}

impl ShmPool {
    /// The pool created with the world
    pub(crate) fn master(world: &World) -> Self {
        let header = world.header();
        Self {
            world: world.clone(),
            id: header.pool,
            lock: Skirmish::open(world, header.pool_lock),
        }
    }

    /// Pool id
    pub const fn id(&self) -> PoolId {
        self.id
    }

    fn record_name(&self, ptr: SharedPtr) -> Result<String> {
        let pool = (ptr.get() >> 32) as u32;
        let block = ptr.get() as u32;
        if ptr.is_null() || pool != self.id.get() || block == 0 {
            return Err(FusionError::InvalidArgument(format!(
                "{ptr} does not belong to {}",
                self.id
            )));
        }
        Ok(format!("{pool}.{block}"))
    }

    /// Allocate `size` zeroed bytes
    pub fn allocate(&self, size: usize) -> Result<SharedPtr> {
        if size == 0 {
            return Err(FusionError::InvalidArgument("zero sized allocation".to_string()));
        }
        let block = self.world.backend().mint()?;
        let ptr = SharedPtr((u64::from(self.id.get()) << 32) | u64::from(block));
        self.world
            .backend()
            .record_put(RECORD_KIND, &self.record_name(ptr)?, &vec![0; size])?;
        trace!("{} allocated {size} bytes at {ptr}", self.id);
        Ok(ptr)
    }

    /// Free a block; freeing twice is a Bug
    pub fn free(&self, ptr: SharedPtr) -> Result<()> {
        let name = self.record_name(ptr)?;
        if self.world.backend().record_remove(RECORD_KIND, &name)? {
            Ok(())
        } else {
            Err(FusionError::bug(format!("{ptr} freed twice")))
        }
    }

    /// Block contents
    pub fn read(&self, ptr: SharedPtr) -> Result<Vec<u8>> {
        let name = self.record_name(ptr)?;
        self.world
            .backend()
            .record_get(RECORD_KIND, &name)?
            .ok_or(FusionError::Destroyed)
    }

    /// Block size in bytes
    pub fn size(&self, ptr: SharedPtr) -> Result<usize> {
        self.read(ptr).map(|data| data.len())
    }

    /// Overwrite part of a block
    pub fn write(&self, ptr: SharedPtr, offset: usize, data: &[u8]) -> Result<()> {
        let name = self.record_name(ptr)?;
        let _guard = self.lock.lock()?;
        let mut block = self.read(ptr)?;
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= block.len())
            .ok_or_else(|| {
                FusionError::InvalidArgument(format!(
                    "write of {} bytes at {offset} overruns {ptr} ({} bytes)",
                    data.len(),
                    block.len()
                ))
            })?;
        block[offset..end].copy_from_slice(data);
        self.world.backend().record_put(RECORD_KIND, &name, &block)
    }

    /// Number of live blocks
    pub fn blocks(&self) -> Result<usize> {
        let prefix = format!("{}.", self.id.get());
        Ok(self
            .world
            .backend()
            .record_list(RECORD_KIND)?
            .iter()
            .filter(|name| name.starts_with(&prefix))
            .count())
    }
}

impl fmt::Debug for ShmPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmPool").field("id", &self.id).finish_non_exhaustive()
    }
}
