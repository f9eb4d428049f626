//! Per-process table of joined worlds

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::debug;

use super::World;
use crate::backend::{connect, host_key};
use crate::config::{Role, WorldConfig};
use crate::{FusionError, Result};

/// Backend key plus world index
pub(crate) type HostKey = (String, u32);

static GLOBAL: LazyLock<Host> = LazyLock::new(Host::new);

/// Worlds joined by one process.
///
/// Entering an index this host already joined returns the same [`World`]
/// and raises its local count instead of joining again. Tests create
/// several hosts to stand in for separate processes.
#[derive(Clone, Default)]
pub struct Host {
    worlds: Arc<Mutex<HashMap<HostKey, World>>>,
}

impl Host {
    /// An empty host
    pub fn new() -> Self {
        Self::default()
    }

    /// The host of this process
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Join or create the world described by `config`.
    ///
    /// An automatic index always creates a fresh world, so it cannot be
    /// combined with [`Role::Slave`].
    pub fn enter(&self, config: WorldConfig) -> Result<World> {
        if config.index.is_none() && config.role == Role::Slave {
            return Err(FusionError::InvalidArgument(
                "automatic world index always creates a world".to_string(),
            ));
        }

        let backend_key = host_key(&config.backend);
        let mut worlds = self.worlds.lock();
        if let Some(index) = config.index {
            if let Some(world) = worlds.get(&(backend_key.clone(), index)) {
                if config.role == Role::Master && !world.is_master() {
                    return Err(FusionError::InvalidArgument(format!(
                        "world {index} already joined as slave"
                    )));
                }
                let found = world.header().abi_version;
                if found != config.abi_version {
                    return Err(FusionError::VersionMismatch {
                        expected: config.abi_version,
                        found,
                    });
                }
                let mut count = world.inner.local_count.lock();
                *count += 1;
                debug!("world {index} joined locally {} times", *count);
                return Ok(world.clone());
            }
        }

        let backend = connect(&config)?;
        let key = (backend_key, backend.header().index);
        let world = World::start(backend, config, Some((self.clone(), key.clone())))?;
        worlds.insert(key, world.clone());
        Ok(world)
    }

    /// Indices of the worlds currently joined through this host
    pub fn joined(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.worlds.lock().keys().map(|(_, index)| *index).collect();
        indices.sort_unstable();
        indices
    }

    /// Drop one local join; true when it was the last one.
    pub(crate) fn release(&self, key: &HostKey, world: &World) -> Result<bool> {
        let mut worlds = self.worlds.lock();
        let mut count = world.inner.local_count.lock();
        if *count == 0 {
            return Err(FusionError::Destroyed);
        }
        *count -= 1;
        if *count > 0 {
            return Ok(false);
        }
        worlds.remove(key);
        Ok(true)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("worlds", &self.joined())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::Device;

    #[test]
    fn test_auto_index_with_slave_role() {
        let device = Device::new();
        let config = WorldConfig::device(&device)
            .with_auto_index()
            .with_role(Role::Slave);
        assert!(matches!(
            Host::new().enter(config),
            Err(FusionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_auto_index_creates_fresh_worlds() {
        let device = Device::new();
        let host = Host::new();
        let first = host
            .enter(WorldConfig::device(&device).with_auto_index())
            .expect("first");
        let second = host
            .enter(WorldConfig::device(&device).with_auto_index())
            .expect("second");

        assert_ne!(first.index(), second.index());
        assert!(first.is_master() && second.is_master());
        assert_eq!(host.joined(), vec![0, 1]);

        first.exit(false).expect("exit");
        second.exit(false).expect("exit");
        assert!(host.joined().is_empty());
    }

    #[test]
    fn test_abi_mismatch_on_local_join() {
        let device = Device::new();
        let host = Host::new();
        let world = host.enter(WorldConfig::device(&device)).expect("enter");
        assert!(matches!(
            host.enter(WorldConfig::device(&device).with_abi_version(7)),
            Err(FusionError::VersionMismatch { expected: 7, found: 1 })
        ));
        world.exit(false).expect("exit");
    }
}
