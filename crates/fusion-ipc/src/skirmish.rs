//! Cross-process recursive lock.
//!
//! Ownership is per thread of a fusionee. A contended acquire periodically
//! checks whether the recorded owner is still alive and takes over the lock
//! of a fusionee that vanished without releasing it.

use std::fmt;
use std::time::Duration;

use tracing::trace;

use fusion_wire::SkirmishId;

use crate::backend::Owner;
use crate::world::World;
use crate::Result;

/// Handle on a skirmish
#[derive(Clone)]
pub struct Skirmish {
    world: World,
    id: SkirmishId,
    name: String,
}

impl Skirmish {
    /// Create an unlocked skirmish
    pub fn new(world: &World, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let id = world.backend().skirmish_new()?;
        trace!("{} created {id} '{name}'", world.fusion_id());
        Ok(Self {
            world: world.clone(),
            id,
            name,
        })
    }

    /// Attach to a skirmish created by any fusionee
    pub fn open(world: &World, id: SkirmishId) -> Self {
        Self {
            world: world.clone(),
            id,
            name: id.to_string(),
        }
    }

    /// Skirmish id
    pub const fn id(&self) -> SkirmishId {
        self.id
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn owner(&self) -> Owner {
        Owner::current(self.world.fusion_id())
    }

    /// Block until acquired; nests for the current owner
    pub fn acquire(&self) -> Result<()> {
        self.world.backend().skirmish_prevail(self.id, self.owner())
    }

    /// Acquire without blocking, failing Busy when held by someone else
    pub fn try_acquire(&self) -> Result<()> {
        self.world.backend().skirmish_swoop(self.id, self.owner())
    }

    /// Release one nesting level
    pub fn release(&self) -> Result<()> {
        self.world.backend().skirmish_dismiss(self.id, self.owner())
    }

    /// [`Skirmish::acquire`] returning a guard that releases on drop
    pub fn lock(&self) -> Result<SkirmishGuard<'_>> {
        self.acquire()?;
        Ok(SkirmishGuard { skirmish: self })
    }

    /// [`Skirmish::try_acquire`] returning a guard that releases on drop
    pub fn try_lock(&self) -> Result<SkirmishGuard<'_>> {
        self.try_acquire()?;
        Ok(SkirmishGuard { skirmish: self })
    }

    /// Nesting depth held by the calling thread; zero when not the owner
    pub fn lock_count(&self) -> Result<u32> {
        self.world.backend().skirmish_lock_count(self.id, self.owner())
    }

    /// Release completely, wait for [`Skirmish::notify`] or the timeout, then
    /// reacquire at the same depth. Returns Timeout after reacquiring when the
    /// deadline passed first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.world
            .backend()
            .skirmish_wait(self.id, self.owner(), timeout)
    }

    /// Wake every waiter
    pub fn notify(&self) -> Result<()> {
        self.world.backend().skirmish_notify(self.id)
    }

    /// Destroy; later operations fail Destroyed
    pub fn destroy(&self) -> Result<()> {
        self.world.backend().skirmish_destroy(self.id)
    }
}

impl fmt::Debug for Skirmish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skirmish")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Holds one nesting level of a [`Skirmish`]
#[must_use = "the skirmish is released when the guard is dropped"]
pub struct SkirmishGuard<'a> {
    skirmish: &'a Skirmish,
}

impl SkirmishGuard<'_> {
    /// Wait on the guarded skirmish, see [`Skirmish::wait`]
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.skirmish.wait(timeout)
    }
}

impl Drop for SkirmishGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.skirmish.release() {
            tracing::warn!("releasing {} on drop failed: {e}", self.skirmish.id);
        }
    }
}

impl fmt::Debug for SkirmishGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SkirmishGuard").field(&self.skirmish.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::Device;
    use crate::config::WorldConfig;
    use crate::world::Host;
    use crate::FusionError;

    #[test]
    fn test_recursive_acquire() {
        let device = Device::new();
        let world = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("enter");
        let lock = Skirmish::new(&world, "test").expect("new");

        lock.acquire().expect("first");
        lock.acquire().expect("second");
        assert_eq!(lock.lock_count().expect("count"), 2);

        let other = {
            let lock = lock.clone();
            std::thread::spawn(move || matches!(lock.try_acquire(), Err(FusionError::Busy)))
        };
        assert!(other.join().expect("thread"));

        lock.release().expect("release");
        lock.release().expect("release");
        assert_eq!(lock.lock_count().expect("count"), 0);
        assert!(matches!(lock.release(), Err(FusionError::Bug(_))));

        lock.destroy().expect("destroy");
        assert!(matches!(lock.acquire(), Err(FusionError::Destroyed)));
        world.exit(false).expect("exit");
    }

    #[test]
    fn test_guard_releases() {
        let device = Device::new();
        let world = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("enter");
        let lock = Skirmish::new(&world, "guarded").expect("new");
        {
            let _guard = lock.lock().expect("lock");
            assert_eq!(lock.lock_count().expect("count"), 1);
        }
        assert_eq!(lock.lock_count().expect("count"), 0);
        world.exit(false).expect("exit");
    }

    #[test]
    fn test_wait_timeout_keeps_depth() {
        let device = Device::new();
        let world = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("enter");
        let lock = Skirmish::new(&world, "cond").expect("new");

        lock.acquire().expect("acquire");
        lock.acquire().expect("acquire");
        assert!(matches!(
            lock.wait(Some(Duration::from_millis(20))),
            Err(FusionError::Timeout)
        ));
        assert_eq!(lock.lock_count().expect("count"), 2);
        world.exit(false).expect("exit");
    }

    #[test]
    fn test_wait_notify_handoff() {
        let device = Device::new();
        let world = Host::new()
            .enter(WorldConfig::device(&device))
            .expect("enter");
        let lock = Skirmish::new(&world, "handoff").expect("new");

        let guard = lock.lock().expect("lock");
        let notifier = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let _guard = lock.lock().expect("notifier lock");
                lock.notify().expect("notify");
            })
        };
        guard.wait(Some(Duration::from_secs(5))).expect("notified");
        drop(guard);
        notifier.join().expect("notifier");
        world.exit(false).expect("exit");
    }
}
