//! Named bootstrap records.
//!
//! The first fusionee to enter an arena runs its initializer, everyone after
//! runs the join path, and the last one out runs the shutdown path and
//! removes the arena. The arena list is guarded by the world's arena lock and
//! each arena's fields by its own [`Skirmish`]. Membership is a local count
//! on the arena's [`FusionRef`], so a fusionee that dies inside an arena is
//! released automatically.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fusion_wire::{RefId, SharedPtr, SkirmishId};

use crate::reference::FusionRef;
use crate::skirmish::Skirmish;
use crate::world::World;
use crate::{FusionError, Result};

const RECORD_KIND: &str = "arena";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArenaRecord {
    reference: RefId,
    lock: SkirmishId,
    fields: Vec<(String, SharedPtr)>,
}

/// Membership in a named arena
pub struct Arena {
    world: World,
    name: String,
    reference: FusionRef,
    lock: Skirmish,
}

impl Arena {
    /// Enter the arena `name`, creating it if needed.
    ///
    /// `initialize` runs for the first member and `join` for every later
    /// one, both while holding the arena lock. If `initialize` fails the
    /// arena is removed again and the error returned; if `join` fails the
    /// arena is left as it was.
    pub fn enter<I, J>(world: &World, name: &str, initialize: I, join: J) -> Result<Self>
    where
        I: FnOnce(&Self) -> Result<()>,
        J: FnOnce(&Self) -> Result<()>,
    {
        let list = Skirmish::open(world, world.header().arena_lock);
        let _list_guard = list.lock()?;

        let arena = Self::find_or_create(world, name)?;
        let guard = arena.lock.lock()?;
        arena.reference.up(false)?;

        if arena.reference.stat()? == 1 {
            debug!("{} initializes arena '{name}'", world.fusion_id());
            if let Err(e) = initialize(&arena) {
                warn!("initializing arena '{name}' failed: {e}");
                arena.reference.down(false)?;
                arena.remove()?;
                drop(guard);
                arena.lock.destroy()?;
                return Err(e);
            }
            info!("arena '{name}' initialized by {}", world.fusion_id());
        } else {
            debug!("{} joins arena '{name}'", world.fusion_id());
            if let Err(e) = join(&arena) {
                arena.reference.down(false)?;
                return Err(e);
            }
        }
        drop(guard);
        Ok(arena)
    }

    /// Look up the arena, replacing a record whose primitives are gone.
    fn find_or_create(world: &World, name: &str) -> Result<Self> {
        if let Some(data) = world.backend().record_get(RECORD_KIND, name)? {
            let record: ArenaRecord = serde_json::from_slice(&data)?;
            match FusionRef::open(world, record.reference) {
                Ok(reference) => {
                    return Ok(Self {
                        world: world.clone(),
                        name: name.to_string(),
                        reference,
                        lock: Skirmish::open(world, record.lock),
                    });
                }
                Err(FusionError::Destroyed) => {
                    warn!("arena '{name}' refers to a destroyed reference, recreating");
                }
                Err(e) => return Err(e),
            }
        }

        let arena = Self {
            world: world.clone(),
            name: name.to_string(),
            reference: FusionRef::init(world)?,
            lock: Skirmish::new(world, format!("arena {name}"))?,
        };
        arena.store(&ArenaRecord {
            reference: arena.reference.id(),
            lock: arena.lock.id(),
            fields: Vec::new(),
        })?;
        Ok(arena)
    }

    fn load(&self) -> Result<ArenaRecord> {
        match self.world.backend().record_get(RECORD_KIND, &self.name)? {
            Some(data) => Ok(serde_json::from_slice(&data)?),
            None => Err(FusionError::Destroyed),
        }
    }

    fn store(&self, record: &ArenaRecord) -> Result<()> {
        let data = serde_json::to_vec(record)?;
        self.world.backend().record_put(RECORD_KIND, &self.name, &data)
    }

    /// Drop the record and its primitives; the arena lock is held.
    fn remove(&self) -> Result<()> {
        self.world.backend().record_remove(RECORD_KIND, &self.name)?;
        self.reference.destroy()?;
        Ok(())
    }

    /// Arena name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current number of members
    pub fn members(&self) -> Result<i32> {
        self.reference.stat()
    }

    /// Publish `ptr` under `field`, replacing an earlier value
    pub fn add_shared_field(&self, field: &str, ptr: SharedPtr) -> Result<()> {
        let _guard = self.lock.lock()?;
        let mut record = self.load()?;
        match record.fields.iter_mut().find(|(name, _)| name == field) {
            Some(entry) => entry.1 = ptr,
            None => record.fields.push((field.to_string(), ptr)),
        }
        self.store(&record)
    }

    /// Look up a published field
    pub fn get_shared_field(&self, field: &str) -> Result<SharedPtr> {
        let _guard = self.lock.lock()?;
        self.load()?
            .fields
            .into_iter()
            .find(|(name, _)| name == field)
            .map(|(_, ptr)| ptr)
            .ok_or_else(|| FusionError::NotFound(format!("field '{field}' of arena '{}'", self.name)))
    }

    /// Leave the arena.
    ///
    /// The last member runs `shutdown` and removes the arena; earlier ones
    /// run `leave`. Without a `leave` path an earlier member fails Busy,
    /// keeps its membership and may call `exit` again once the others are
    /// gone. Both paths receive `emergency`.
    pub fn exit<S, L>(&self, shutdown: S, leave: Option<L>, emergency: bool) -> Result<()>
    where
        S: FnOnce(&Self, bool) -> Result<()>,
        L: FnOnce(&Self, bool) -> Result<()>,
    {
        let list = Skirmish::open(&self.world, self.world.header().arena_lock);
        let _list_guard = list.lock()?;
        let guard = self.lock.lock()?;

        if self.reference.stat()? > 1 {
            let Some(leave) = leave else {
                return Err(FusionError::Busy);
            };
            self.reference.down(false)?;
            debug!("{} leaves arena '{}'", self.world.fusion_id(), self.name);
            return leave(self, emergency);
        }

        self.reference.down(false)?;
        let result = shutdown(self, emergency);
        self.remove()?;
        drop(guard);
        self.lock.destroy()?;
        info!("arena '{}' shut down by {}", self.name, self.world.fusion_id());
        result
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::Device;
    use crate::config::WorldConfig;
    use crate::world::Host;

    type Path = fn(&Arena, bool) -> Result<()>;

    fn no_op(_: &Arena, _: bool) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_initialize_then_join() {
        let device = Device::new();
        let master = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("master");
        let slave = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("slave");

        let first = Arena::enter(
            &master,
            "core",
            |arena| arena.add_shared_field("root", SharedPtr(7)),
            |_| Err(FusionError::Bug("join on first enter".to_string())),
        )
        .expect("first");
        let second = Arena::enter(
            &slave,
            "core",
            |_| Err(FusionError::Bug("initialize on second enter".to_string())),
            |arena| {
                assert_eq!(arena.get_shared_field("root")?, SharedPtr(7));
                Ok(())
            },
        )
        .expect("second");
        assert_eq!(second.members().expect("members"), 2);
        assert!(matches!(
            second.get_shared_field("missing"),
            Err(FusionError::NotFound(_))
        ));

        first.exit(no_op, Some(no_op as Path), false).expect("first exit");
        second.exit(no_op, None::<Path>, false).expect("last exit");
        assert!(master
            .backend()
            .record_get(RECORD_KIND, "core")
            .expect("record")
            .is_none());

        slave.exit(false).expect("slave exit");
        master.exit(false).expect("master exit");
    }

    #[test]
    fn test_busy_exit_can_be_retried() {
        let device = Device::new();
        let master = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("master");
        let slave = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("slave");

        let first = Arena::enter(&master, "busy", |_| Ok(()), |_| Ok(())).expect("first");
        let second = Arena::enter(&slave, "busy", |_| Ok(()), |_| Ok(())).expect("second");

        let members = first.reference.stat().expect("stat");
        assert!(matches!(
            first.exit(no_op, None::<Path>, false),
            Err(FusionError::Busy)
        ));
        assert_eq!(first.reference.stat().expect("stat"), members);

        second.exit(no_op, Some(no_op as Path), false).expect("second leaves");
        let shut_down = std::cell::Cell::new(false);
        first
            .exit(
                |arena: &Arena, _| {
                    assert_eq!(arena.name(), "busy");
                    shut_down.set(true);
                    Ok(())
                },
                None::<Path>,
                false,
            )
            .expect("retry after others left");
        assert!(shut_down.get());
        assert!(master
            .backend()
            .record_get(RECORD_KIND, "busy")
            .expect("record")
            .is_none());

        slave.exit(false).expect("slave exit");
        master.exit(false).expect("master exit");
    }

    #[test]
    fn test_failed_initialize_removes_arena() {
        let device = Device::new();
        let world = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("enter");

        let failed = Arena::enter(
            &world,
            "broken",
            |arena| {
                arena.add_shared_field("half", SharedPtr(1))?;
                Err(FusionError::Busy)
            },
            |_| Ok(()),
        );
        assert!(matches!(failed, Err(FusionError::Busy)));
        assert!(world
            .backend()
            .record_get(RECORD_KIND, "broken")
            .expect("record")
            .is_none());

        let retry = Arena::enter(&world, "broken", |_| Ok(()), |_| Ok(())).expect("retry");
        assert!(matches!(
            retry.get_shared_field("half"),
            Err(FusionError::NotFound(_))
        ));
        retry.exit(no_op, None::<Path>, false).expect("exit");
        world.exit(false).expect("exit");
    }
}
