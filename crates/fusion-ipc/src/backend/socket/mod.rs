//! Non-privileged backend built from a shared file and local datagram sockets
//!
//! Each world is a directory `<root>/world.<index>/` holding:
//!
//! - `world.shm`: the memory-mapped header and primitive tables
//! - `fusionee.<id>`: one bound datagram socket per fusionee, read by its
//!   dispatch thread
//! - `call.<call>.<serial>`: an ephemeral socket per blocking invocation,
//!   bound by the caller to receive exactly one reply
//! - `records/`: the record store
//!
//! Creation and joining are serialized by `<root>/world.<index>.lock`. A
//! world whose fusionees are all dead is treated as stale and recreated by
//! the next joiner, which becomes its master. Liveness of a fusionee is
//! probed with `kill(pid, 0)`.

mod layout;
mod lock;
mod records;

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use fusion_wire::{
    CallFrame, CallId, CallReply, Frame, FusionId, LeaveFrame, MAX_FRAME_SIZE, PoolId, ReactorId,
    RefId, SkirmishId, WakeupFrame,
};

use self::layout::{
    C_OWNER, D_ARG, D_CALL, D_REMAINING, F_PENDING, F_PID, H_ABI, H_ARENA_LOCK, H_INDEX,
    H_LIMITS, H_LOCK_CALLS, H_LOCK_COUNTDOWNS, H_LOCK_FUSIONEES, H_LOCK_REACTORS, H_LOCK_REFS,
    H_LOCK_SKIRMISHES, H_MAGIC, H_MASTER_PID, H_NEXT_FUSION, H_NEXT_ID, H_POOL, H_POOL_LOCK,
    H_START_MILLIS, H_STATE, H_VERSION, HO_COUNT, HO_FUSION, L_CHANNEL, L_COUNT, L_FUSION,
    LAYOUT_VERSION, Layout, R_CATCHER, R_CREATOR, R_GLOBAL, R_LOCKER, R_WATCH_ARG, R_WATCH_CALL,
    S_COUNT, S_SEQ, S_TOKEN, STATE_DESTROYED, STATE_INIT, STATE_READY, Table, WORLD_MAGIC,
    WorldFile, limits_to_words,
};
use self::lock::{Backoff, EnterLock, TableLock, current_pid, process_alive};
use self::records::RecordStore;
use super::{Backend, Owner, WorldHeader, unix_millis, watch_frame};
use crate::config::{Role, WorldConfig};
use crate::{FusionError, Result};

/// Highest world index probed when entering with an automatic index
const MAX_WORLDS: u32 = 256;

fn world_dir(root: &Path, index: u32) -> PathBuf {
    root.join(format!("world.{index}"))
}

fn enter_lock_path(root: &Path, index: u32) -> PathBuf {
    root.join(format!("world.{index}.lock"))
}

fn fusionee_path(dir: &Path, fusion_id: FusionId) -> PathBuf {
    dir.join(format!("fusionee.{}", fusion_id.0))
}

fn reply_path(dir: &Path, call: CallId, serial: u32) -> PathBuf {
    dir.join(format!("call.{}.{serial}", call.0))
}

fn is_timeout(error: &std::io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn is_gone(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused
    )
}

fn find_slot(file: &WorldFile, table: &Table, key: u64) -> Option<usize> {
    (0..table.slots).find(|&slot| file.load(table.word(slot, 0)) == key)
}

fn free_slot(file: &WorldFile, table: &Table, what: &str) -> Result<usize> {
    find_slot(file, table, 0)
        .ok_or_else(|| FusionError::LimitExceeded(format!("{what} table full")))
}

/// Write a slot's fields, key last so scanners never see a half-filled slot.
fn fill_slot(file: &WorldFile, table: &Table, slot: usize, fields: &[u64]) {
    for (field, value) in fields.iter().enumerate().skip(1) {
        file.store(table.word(slot, field), *value);
    }
    file.store(table.word(slot, 0), fields[0]);
}

/// Free a slot, key first so scanners stop matching it immediately.
fn clear_slot(file: &WorldFile, table: &Table, slot: usize) {
    file.store(table.word(slot, 0), 0);
    for field in 1..table.width {
        file.store(table.word(slot, field), 0);
    }
}

fn decrement(word: &AtomicU64) {
    let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

fn read_header(file: &WorldFile) -> WorldHeader {
    WorldHeader {
        index: file.load(H_INDEX) as u32,
        abi_version: file.load(H_ABI) as u32,
        start_millis: file.load(H_START_MILLIS),
        pool: PoolId(file.load(H_POOL) as u32),
        pool_lock: SkirmishId(file.load(H_POOL_LOCK) as u32),
        arena_lock: SkirmishId(file.load(H_ARENA_LOCK) as u32),
    }
}

/// Removes a path when dropped
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// One fusionee's view of a socket-backend world
#[derive(Debug)]
pub struct SocketBackend {
    dir: PathBuf,
    file: Arc<WorldFile>,
    layout: Layout,
    fusion_id: FusionId,
    header: WorldHeader,
    socket: UnixDatagram,
    sender: UnixDatagram,
    records: RecordStore,
    liveness: Duration,
}

impl SocketBackend {
    /// Enter (or create) a world under `root`
    pub fn enter(root: &Path, config: &WorldConfig) -> Result<Arc<Self>> {
        fs::create_dir_all(root)?;

        if let Some(index) = config.index {
            let _lock = EnterLock::acquire(&enter_lock_path(root, index))?;
            return match Self::open_live(&world_dir(root, index))? {
                Some(file) => {
                    if config.role == Role::Master {
                        return Err(FusionError::Busy);
                    }
                    Self::join(&world_dir(root, index), file, config)
                }
                None => {
                    if config.role == Role::Slave {
                        return Err(FusionError::NotFound(format!("world {index}")));
                    }
                    Self::create(&world_dir(root, index), index, config)
                }
            };
        }

        for index in 0..MAX_WORLDS {
            let _lock = EnterLock::acquire(&enter_lock_path(root, index))?;
            if Self::open_live(&world_dir(root, index))?.is_none() {
                return Self::create(&world_dir(root, index), index, config);
            }
        }
        Err(FusionError::LimitExceeded("world indices".to_string()))
    }

    /// Map the world in `dir` if it is initialized and has a live fusionee.
    fn open_live(dir: &Path) -> Result<Option<WorldFile>> {
        let path = dir.join("world.shm");
        if !path.exists() {
            return Ok(None);
        }

        let file = match WorldFile::open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("discarding unreadable world file {}: {e}", path.display());
                return Ok(None);
            }
        };
        if file.load(H_MAGIC) != WORLD_MAGIC {
            warn!("discarding world file {} with bad magic", path.display());
            return Ok(None);
        }
        if file.load(H_VERSION) != LAYOUT_VERSION {
            return Err(FusionError::Fusion(format!(
                "world file {} has layout version {} (expected {LAYOUT_VERSION})",
                path.display(),
                file.load(H_VERSION)
            )));
        }
        match file.load(H_STATE) {
            STATE_READY => {}
            STATE_INIT => {
                warn!("world file {} was never initialized", path.display());
                return Ok(None);
            }
            _ => {
                debug!("world file {} belongs to a destroyed world", path.display());
                return Ok(None);
            }
        }

        let layout = Layout::new(&file.limits());
        if file.words().len() < layout.total_words() {
            warn!("discarding truncated world file {}", path.display());
            return Ok(None);
        }
        let table = layout.fusionees;
        let live = (0..table.slots).any(|slot| {
            file.load(table.word(slot, 0)) != 0
                && process_alive(file.load(table.word(slot, F_PID)) as u32)
        });
        if !live {
            info!("world in {} has no live fusionees, recreating", dir.display());
            return Ok(None);
        }
        Ok(Some(file))
    }

    fn create(dir: &Path, index: u32, config: &WorldConfig) -> Result<Arc<Self>> {
        if config.limits.fusionees == 0 {
            return Err(FusionError::InvalidArgument(
                "world needs at least one fusionee slot".to_string(),
            ));
        }
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;

        let layout = Layout::new(&config.limits);
        let file = WorldFile::create(&dir.join("world.shm"), layout.file_size())?;
        file.store(H_MAGIC, WORLD_MAGIC);
        file.store(H_VERSION, LAYOUT_VERSION);
        file.store(H_INDEX, u64::from(index));
        file.store(H_ABI, u64::from(config.abi_version));
        file.store(H_START_MILLIS, unix_millis());
        file.store(H_MASTER_PID, u64::from(current_pid()));
        for (i, word) in limits_to_words(&config.limits).into_iter().enumerate() {
            file.store(H_LIMITS + i, word);
        }
        file.store(H_NEXT_FUSION, FusionId::MASTER.0 + 1);

        // world-level locks and the master pool exist before anyone can join
        let mint = || file.word(H_NEXT_ID).fetch_add(1, Ordering::AcqRel) + 1;
        let arena_lock = mint();
        let pool_lock = mint();
        let pool = mint();
        if layout.skirmishes.slots < 2 {
            return Err(FusionError::InvalidArgument(
                "world needs at least two skirmish slots".to_string(),
            ));
        }
        fill_slot(&file, &layout.skirmishes, 0, &[arena_lock, 0, 0, 0]);
        fill_slot(&file, &layout.skirmishes, 1, &[pool_lock, 0, 0, 0]);
        file.store(H_ARENA_LOCK, arena_lock);
        file.store(H_POOL_LOCK, pool_lock);
        file.store(H_POOL, pool);

        let backend = Self::attach(
            dir,
            Arc::new(file),
            FusionId::MASTER,
            config.liveness_interval(),
        )?;
        backend.file.store(H_STATE, STATE_READY);
        info!("created world {index} in {}", backend.file.path().display());
        Ok(backend)
    }

    fn join(dir: &Path, file: WorldFile, config: &WorldConfig) -> Result<Arc<Self>> {
        let found = file.load(H_ABI) as u32;
        if found != config.abi_version {
            return Err(FusionError::VersionMismatch {
                expected: config.abi_version,
                found,
            });
        }
        let fusion_id = FusionId(file.word(H_NEXT_FUSION).fetch_add(1, Ordering::AcqRel));
        Self::attach(dir, Arc::new(file), fusion_id, config.liveness_interval())
    }

    /// Register `fusion_id` in the fusionee table and bind its socket.
    fn attach(
        dir: &Path,
        file: Arc<WorldFile>,
        fusion_id: FusionId,
        liveness: Duration,
    ) -> Result<Arc<Self>> {
        let layout = Layout::new(&file.limits());
        let table = layout.fusionees;
        let slot = {
            let _lock = TableLock::acquire(file.word(H_LOCK_FUSIONEES));
            let slot = free_slot(&file, &table, "fusionee")?;
            fill_slot(&file, &table, slot, &[fusion_id.0, u64::from(current_pid()), 0]);
            slot
        };

        let path = fusionee_path(dir, fusion_id);
        let _ = fs::remove_file(&path);
        let bound = UnixDatagram::bind(&path).and_then(|socket| {
            let sender = UnixDatagram::unbound()?;
            Ok((socket, sender))
        });
        let (socket, sender) = match bound {
            Ok(sockets) => sockets,
            Err(e) => {
                let _lock = TableLock::acquire(file.word(H_LOCK_FUSIONEES));
                clear_slot(&file, &table, slot);
                return Err(e.into());
            }
        };

        let header = read_header(&file);
        info!("{fusion_id} entered world {} (pid {})", header.index, current_pid());
        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            records: RecordStore::new(dir),
            file,
            layout,
            fusion_id,
            header,
            socket,
            sender,
            liveness,
        }))
    }

    fn load(&self, index: usize) -> u64 {
        self.file.load(index)
    }

    fn store(&self, index: usize, value: u64) {
        self.file.store(index, value);
    }

    fn word(&self, index: usize) -> &AtomicU64 {
        self.file.word(index)
    }

    fn table_lock(&self, header_word: usize) -> TableLock<'_> {
        TableLock::acquire(self.file.word(header_word))
    }

    fn check_world(&self) -> Result<()> {
        if self.load(H_STATE) == STATE_DESTROYED {
            return Err(FusionError::Destroyed);
        }
        Ok(())
    }

    fn mint_id(&self) -> u32 {
        (self.word(H_NEXT_ID).fetch_add(1, Ordering::AcqRel) + 1) as u32
    }

    fn fusionee_slot(&self, fusion_id: FusionId) -> Option<usize> {
        find_slot(&self.file, &self.layout.fusionees, fusion_id.0)
    }

    fn unregister(&self) {
        let table = self.layout.fusionees;
        let _lock = self.table_lock(H_LOCK_FUSIONEES);
        if let Some(slot) = self.fusionee_slot(self.fusion_id) {
            clear_slot(&self.file, &table, slot);
        }
    }

    /// Copy this fusionee's local counts to `child`. A full holder table
    /// clears the copies made so far. Caller holds the refs lock.
    fn inherit_holders(&self, child: FusionId) -> Result<()> {
        let holders = self.layout.holders;
        let inherited: Vec<(u64, u64)> = (0..holders.slots)
            .filter(|&slot| {
                self.load(holders.word(slot, 0)) != 0
                    && self.load(holders.word(slot, HO_FUSION)) == self.fusion_id.0
            })
            .map(|slot| {
                (
                    self.load(holders.word(slot, 0)),
                    self.load(holders.word(slot, HO_COUNT)),
                )
            })
            .collect();

        let mut filled = Vec::with_capacity(inherited.len());
        for (ref_id, count) in inherited {
            match free_slot(&self.file, &holders, "holder") {
                Ok(slot) => {
                    fill_slot(&self.file, &holders, slot, &[ref_id, child.0, count]);
                    filled.push(slot);
                }
                Err(e) => {
                    for slot in filled {
                        clear_slot(&self.file, &holders, slot);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn owner_abandoned(&self, token: u64) -> bool {
        Owner::from_token(token).is_some_and(|owner| !self.is_alive(owner.fusion_id))
    }

    /// Release everything `fusion_id` held locally.
    fn reclaim(&self, fusion_id: FusionId) {
        let mut fired = Vec::new();
        {
            let _lock = self.table_lock(H_LOCK_REFS);
            let holders = self.layout.holders;
            let mut touched = Vec::new();
            for slot in 0..holders.slots {
                let ref_id = self.load(holders.word(slot, 0));
                if ref_id != 0 && self.load(holders.word(slot, HO_FUSION)) == fusion_id.0 {
                    let held = self.load(holders.word(slot, HO_COUNT));
                    clear_slot(&self.file, &holders, slot);
                    debug!("ref#{ref_id}: reclaimed {held} local count(s) of {fusion_id}");
                    touched.push(ref_id);
                }
            }

            let refs = self.layout.refs;
            for slot in 0..refs.slots {
                let id = self.load(refs.word(slot, 0));
                if id == 0 {
                    continue;
                }
                if self.load(refs.word(slot, R_LOCKER)) == fusion_id.0 {
                    self.store(refs.word(slot, R_LOCKER), 0);
                }
                if self.load(refs.word(slot, R_CREATOR)) == fusion_id.0 {
                    let catcher = self.load(refs.word(slot, R_CATCHER));
                    if catcher != 0 {
                        self.store(refs.word(slot, R_CREATOR), catcher);
                        self.store(refs.word(slot, R_CATCHER), 0);
                    }
                }
                if touched.contains(&id) && self.ref_count(slot, id) == 0 {
                    fired.extend(self.ref_watch_of(slot));
                }
            }
        }
        {
            let _lock = self.table_lock(H_LOCK_REACTORS);
            let listeners = self.layout.listeners;
            for slot in 0..listeners.slots {
                if self.load(listeners.word(slot, 0)) != 0
                    && self.load(listeners.word(slot, L_FUSION)) == fusion_id.0
                {
                    clear_slot(&self.file, &listeners, slot);
                }
            }
        }
        {
            let _lock = self.table_lock(H_LOCK_CALLS);
            let calls = self.layout.calls;
            for slot in 0..calls.slots {
                if self.load(calls.word(slot, 0)) != 0
                    && self.load(calls.word(slot, C_OWNER)) == fusion_id.0
                {
                    clear_slot(&self.file, &calls, slot);
                }
            }
        }

        for (call, arg) in fired {
            self.fire_watch(call, arg);
        }
    }

    fn fire_watch(&self, call: CallId, arg: i32) {
        let owner = match self.call_owner(call) {
            Ok(owner) => owner,
            Err(_) => {
                debug!("watch {call} no longer exists, zero notification dropped");
                return;
            }
        };
        if let Err(e) = self.send(owner, &Frame::Call(watch_frame(call, arg))) {
            debug!("watch {call} owner {owner} unreachable: {e}");
        }
    }

    fn skirmish_slot(&self, id: SkirmishId) -> Result<usize> {
        find_slot(&self.file, &self.layout.skirmishes, u64::from(id.0)).ok_or(FusionError::Destroyed)
    }

    /// One acquisition attempt; probes the holder's liveness when `probe` is set.
    fn try_take(&self, slot: usize, id: SkirmishId, owner: Owner, probe: bool) -> Result<bool> {
        let table = self.layout.skirmishes;
        if self.load(table.word(slot, 0)) != u64::from(id.0) {
            return Err(FusionError::Destroyed);
        }

        let token = self.word(table.word(slot, S_TOKEN));
        let count = self.word(table.word(slot, S_COUNT));
        let mine = owner.token();
        match token.compare_exchange(0, mine, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                count.store(1, Ordering::Release);
                Ok(true)
            }
            Err(current) if current == mine => {
                count.fetch_add(1, Ordering::AcqRel);
                Ok(true)
            }
            Err(current) => {
                if probe
                    && self.owner_abandoned(current)
                    && token
                        .compare_exchange(current, mine, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    let previous = Owner::from_token(current).map(|o| o.fusion_id);
                    warn!(
                        "{id} abandoned by {}, taken over by {}",
                        previous.unwrap_or(FusionId::WORLD),
                        owner.fusion_id
                    );
                    count.store(1, Ordering::Release);
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    fn ref_slot(&self, id: RefId) -> Result<usize> {
        find_slot(&self.file, &self.layout.refs, u64::from(id.0)).ok_or(FusionError::Destroyed)
    }

    fn holder_slot(&self, ref_id: u64, fusion_id: FusionId) -> Option<usize> {
        let holders = self.layout.holders;
        (0..holders.slots).find(|&slot| {
            self.load(holders.word(slot, 0)) == ref_id
                && self.load(holders.word(slot, HO_FUSION)) == fusion_id.0
        })
    }

    /// Global plus every local count; caller holds the refs lock.
    fn ref_count(&self, slot: usize, ref_id: u64) -> i64 {
        let holders = self.layout.holders;
        let local: u64 = (0..holders.slots)
            .filter(|&h| self.load(holders.word(h, 0)) == ref_id)
            .map(|h| self.load(holders.word(h, HO_COUNT)))
            .sum();
        (self.load(self.layout.refs.word(slot, R_GLOBAL)) + local) as i64
    }

    fn ref_watch_of(&self, slot: usize) -> Option<(CallId, i32)> {
        let refs = self.layout.refs;
        let call = self.load(refs.word(slot, R_WATCH_CALL));
        (call != 0).then(|| {
            (
                CallId(call as u32),
                self.load(refs.word(slot, R_WATCH_ARG)) as u32 as i32,
            )
        })
    }

    fn ref_try_zero_lock(&self, id: RefId) -> Result<bool> {
        let _lock = self.table_lock(H_LOCK_REFS);
        let slot = self.ref_slot(id)?;
        let refs = self.layout.refs;
        let locker = self.load(refs.word(slot, R_LOCKER));
        if (locker != 0 && locker != self.fusion_id.0) || self.ref_count(slot, u64::from(id.0)) != 0
        {
            return Ok(false);
        }
        self.store(refs.word(slot, R_LOCKER), self.fusion_id.0);
        Ok(true)
    }

    fn reactor_slot(&self, id: ReactorId) -> Result<usize> {
        find_slot(&self.file, &self.layout.reactors, u64::from(id.0)).ok_or(FusionError::Destroyed)
    }

    fn listener_slot(&self, id: ReactorId, channel: i32, fusion_id: FusionId) -> Option<usize> {
        let listeners = self.layout.listeners;
        (0..listeners.slots).find(|&slot| {
            self.load(listeners.word(slot, 0)) == u64::from(id.0)
                && self.load(listeners.word(slot, L_CHANNEL)) == u64::from(channel as u32)
                && self.load(listeners.word(slot, L_FUSION)) == fusion_id.0
        })
    }

    fn call_slot(&self, id: CallId) -> Option<usize> {
        find_slot(&self.file, &self.layout.calls, u64::from(id.0))
    }
}

impl Backend for SocketBackend {
    fn kind(&self) -> &'static str {
        "socket"
    }

    fn fusion_id(&self) -> FusionId {
        self.fusion_id
    }

    fn header(&self) -> WorldHeader {
        self.header
    }

    fn mint(&self) -> Result<u32> {
        self.check_world()?;
        Ok(self.mint_id())
    }

    fn fusionees(&self) -> Result<Vec<FusionId>> {
        self.check_world()?;
        let table = self.layout.fusionees;
        let mut fusionees: Vec<FusionId> = (0..table.slots)
            .map(|slot| self.load(table.word(slot, 0)))
            .filter(|id| *id != 0)
            .map(FusionId)
            .collect();
        fusionees.sort_unstable();
        Ok(fusionees)
    }

    fn is_alive(&self, fusion_id: FusionId) -> bool {
        self.fusionee_slot(fusion_id).is_some_and(|slot| {
            process_alive(self.load(self.layout.fusionees.word(slot, F_PID)) as u32)
        })
    }

    fn reap(&self) -> Result<Vec<FusionId>> {
        self.check_world()?;
        let table = self.layout.fusionees;
        let dead: Vec<FusionId> = {
            let _lock = self.table_lock(H_LOCK_FUSIONEES);
            let mut dead = Vec::new();
            for slot in 0..table.slots {
                let id = self.load(table.word(slot, 0));
                if id == 0 || id == self.fusion_id.0 {
                    continue;
                }
                if !process_alive(self.load(table.word(slot, F_PID)) as u32) {
                    clear_slot(&self.file, &table, slot);
                    dead.push(FusionId(id));
                }
            }
            dead
        };

        for fusion_id in &dead {
            warn!("reaping dead {fusion_id} of world {}", self.header.index);
            self.reclaim(*fusion_id);
            let _ = fs::remove_file(fusionee_path(&self.dir, *fusion_id));
        }
        Ok(dead)
    }

    fn fork(&self) -> Result<Arc<dyn Backend>> {
        self.check_world()?;
        let child = FusionId(self.word(H_NEXT_FUSION).fetch_add(1, Ordering::AcqRel));
        let backend = Self::attach(&self.dir, Arc::clone(&self.file), child, self.liveness)?;

        let inherited = {
            let _lock = self.table_lock(H_LOCK_REFS);
            self.inherit_holders(child)
        };
        if let Err(e) = inherited {
            if let Err(leave) = backend.leave(false) {
                debug!("{child} could not leave after failed fork: {leave}");
            }
            return Err(e);
        }

        info!("{} forked into {child}", self.fusion_id);
        Ok(backend)
    }

    fn leave(&self, emergency: bool) -> Result<()> {
        if self.fusion_id.is_master() {
            self.store(H_STATE, STATE_DESTROYED);
            self.unregister();
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!("failed to remove world directory {}: {e}", self.dir.display());
            }
            info!(
                "master left, world {} destroyed (emergency: {emergency})",
                self.header.index
            );
            return Ok(());
        }

        self.reclaim(self.fusion_id);
        self.unregister();
        let leave = Frame::Leave(LeaveFrame {
            fusion_id: self.fusion_id,
        });
        if let Err(e) = self.send(FusionId::MASTER, &leave) {
            debug!("leave of {} not delivered: {e}", self.fusion_id);
        }
        let _ = fs::remove_file(fusionee_path(&self.dir, self.fusion_id));
        info!("{} left world {}", self.fusion_id, self.header.index);
        Ok(())
    }

    fn send(&self, to: FusionId, frame: &Frame) -> Result<()> {
        self.check_world()?;
        let bytes = frame.encode()?;
        let slot = self.fusionee_slot(to).ok_or(FusionError::Destroyed)?;
        let pending = self.word(self.layout.fusionees.word(slot, F_PENDING));
        pending.fetch_add(1, Ordering::AcqRel);

        match self.sender.send_to(&bytes, fusionee_path(&self.dir, to)) {
            Ok(_) => Ok(()),
            Err(e) => {
                decrement(pending);
                if is_gone(&e) {
                    debug!("{} frame to {to} not delivered: {e}", frame.name());
                    Err(FusionError::Destroyed)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buffer = vec![0u8; MAX_FRAME_SIZE];
        match self.socket.recv(&mut buffer) {
            Ok(len) => match Frame::decode(&buffer[..len]) {
                Ok(frame) => Ok(Some(frame)),
                Err(e) => {
                    warn!("{} dropped undecodable frame: {e}", self.fusion_id);
                    self.processed()?;
                    Ok(None)
                }
            },
            Err(e) if is_timeout(&e) || e.kind() == ErrorKind::Interrupted => {
                self.check_world()?;
                if self.fusionee_slot(self.fusion_id).is_none() {
                    return Err(FusionError::Destroyed);
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn processed(&self) -> Result<()> {
        self.check_world()?;
        let slot = self
            .fusionee_slot(self.fusion_id)
            .ok_or(FusionError::Destroyed)?;
        decrement(self.word(self.layout.fusionees.word(slot, F_PENDING)));
        Ok(())
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
        let deadline = Instant::now() + timeout;
        let table = self.layout.fusionees;
        let mut backoff = Backoff::new();
        loop {
            self.check_world()?;
            let busy = (0..table.slots).any(|slot| {
                let id = self.load(table.word(slot, 0));
                id != 0
                    && (include_self || id != self.fusion_id.0)
                    && self.load(table.word(slot, F_PENDING)) > 0
                    && process_alive(self.load(table.word(slot, F_PID)) as u32)
            });
            if !busy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FusionError::Timeout);
            }
            backoff.snooze();
        }
    }

    fn skirmish_new(&self) -> Result<SkirmishId> {
        self.check_world()?;
        let table = self.layout.skirmishes;
        let _lock = self.table_lock(H_LOCK_SKIRMISHES);
        let slot = free_slot(&self.file, &table, "skirmish")?;
        let id = self.mint_id();
        fill_slot(&self.file, &table, slot, &[u64::from(id), 0, 0, 0]);
        Ok(SkirmishId(id))
    }

    fn skirmish_prevail(&self, id: SkirmishId, owner: Owner) -> Result<()> {
        let slot = self.skirmish_slot(id)?;
        let mut backoff = Backoff::new();
        let mut last_probe = Instant::now();
        loop {
            let probe = last_probe.elapsed() >= self.liveness;
            if probe {
                last_probe = Instant::now();
                self.check_world()?;
            }
            if self.try_take(slot, id, owner, probe)? {
                return Ok(());
            }
            backoff.snooze();
        }
    }

    fn skirmish_swoop(&self, id: SkirmishId, owner: Owner) -> Result<()> {
        let slot = self.skirmish_slot(id)?;
        if self.try_take(slot, id, owner, true)? {
            Ok(())
        } else {
            Err(FusionError::Busy)
        }
    }

    fn skirmish_dismiss(&self, id: SkirmishId, owner: Owner) -> Result<()> {
        let slot = self.skirmish_slot(id)?;
        let table = self.layout.skirmishes;
        if self.load(table.word(slot, S_TOKEN)) != owner.token() {
            return Err(FusionError::bug(format!(
                "{id} released by {} which does not hold it",
                owner.fusion_id
            )));
        }
        let count = self.load(table.word(slot, S_COUNT));
        if count <= 1 {
            self.store(table.word(slot, S_COUNT), 0);
            self.store(table.word(slot, S_TOKEN), 0);
        } else {
            self.store(table.word(slot, S_COUNT), count - 1);
        }
        Ok(())
    }

    fn skirmish_lock_count(&self, id: SkirmishId, owner: Owner) -> Result<u32> {
        let slot = self.skirmish_slot(id)?;
        let table = self.layout.skirmishes;
        if self.load(table.word(slot, S_TOKEN)) == owner.token() {
            Ok(self.load(table.word(slot, S_COUNT)) as u32)
        } else {
            Ok(0)
        }
    }

    fn skirmish_wait(
        &self,
        id: SkirmishId,
        owner: Owner,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let slot = self.skirmish_slot(id)?;
        let table = self.layout.skirmishes;
        if self.load(table.word(slot, S_TOKEN)) != owner.token() {
            return Err(FusionError::bug(format!(
                "wait on {id} by {} which does not hold it",
                owner.fusion_id
            )));
        }
        let depth = self.load(table.word(slot, S_COUNT));
        let seq = self.load(table.word(slot, S_SEQ));
        self.store(table.word(slot, S_COUNT), 0);
        self.store(table.word(slot, S_TOKEN), 0);

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut backoff = Backoff::new();
        let waited = loop {
            if self.load(table.word(slot, 0)) != u64::from(id.0) {
                return Err(FusionError::Destroyed);
            }
            if self.load(table.word(slot, S_SEQ)) != seq {
                break Ok(());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break Err(FusionError::Timeout);
            }
            backoff.snooze();
        };

        self.skirmish_prevail(id, owner)?;
        self.store(table.word(slot, S_COUNT), depth);
        waited
    }

    fn skirmish_notify(&self, id: SkirmishId) -> Result<()> {
        let slot = self.skirmish_slot(id)?;
        self.word(self.layout.skirmishes.word(slot, S_SEQ))
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn skirmish_destroy(&self, id: SkirmishId) -> Result<()> {
        let _lock = self.table_lock(H_LOCK_SKIRMISHES);
        let slot = self.skirmish_slot(id)?;
        clear_slot(&self.file, &self.layout.skirmishes, slot);
        Ok(())
    }

    fn ref_new(&self) -> Result<RefId> {
        self.check_world()?;
        let table = self.layout.refs;
        let _lock = self.table_lock(H_LOCK_REFS);
        let slot = free_slot(&self.file, &table, "ref")?;
        let id = self.mint_id();
        fill_slot(
            &self.file,
            &table,
            slot,
            &[u64::from(id), self.fusion_id.0, 0, 0, 0, 0, 0, 0],
        );
        Ok(RefId(id))
    }

    fn ref_up(&self, id: RefId, global: bool) -> Result<()> {
        let refs = self.layout.refs;
        let holders = self.layout.holders;
        let _lock = self.table_lock(H_LOCK_REFS);
        let slot = self.ref_slot(id)?;

        let locker = self.load(refs.word(slot, R_LOCKER));
        if locker != 0 && locker != self.fusion_id.0 {
            return Err(FusionError::Locked);
        }
        if global {
            self.word(refs.word(slot, R_GLOBAL))
                .fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        let ref_id = u64::from(id.0);
        if let Some(holder) = self.holder_slot(ref_id, self.fusion_id) {
            self.word(holders.word(holder, HO_COUNT))
                .fetch_add(1, Ordering::AcqRel);
        } else {
            let holder = free_slot(&self.file, &holders, "holder")?;
            fill_slot(&self.file, &holders, holder, &[ref_id, self.fusion_id.0, 1]);
        }
        Ok(())
    }

    fn ref_down(&self, id: RefId, global: bool) -> Result<()> {
        let refs = self.layout.refs;
        let holders = self.layout.holders;
        let ref_id = u64::from(id.0);
        let watch = {
            let _lock = self.table_lock(H_LOCK_REFS);
            let slot = self.ref_slot(id)?;

            if global {
                let count = self.load(refs.word(slot, R_GLOBAL));
                if count == 0 {
                    return Err(FusionError::bug(format!("global down on {id} at zero")));
                }
                self.store(refs.word(slot, R_GLOBAL), count - 1);
            } else {
                let holder = self.holder_slot(ref_id, self.fusion_id).ok_or_else(|| {
                    FusionError::bug(format!(
                        "local down on {id} by {} which holds none",
                        self.fusion_id
                    ))
                })?;
                let count = self.load(holders.word(holder, HO_COUNT));
                if count <= 1 {
                    clear_slot(&self.file, &holders, holder);
                } else {
                    self.store(holders.word(holder, HO_COUNT), count - 1);
                }
            }

            if self.ref_count(slot, ref_id) == 0 {
                self.ref_watch_of(slot)
            } else {
                None
            }
        };

        if let Some((call, arg)) = watch {
            self.fire_watch(call, arg);
        }
        Ok(())
    }

    fn ref_stat(&self, id: RefId) -> Result<i32> {
        let _lock = self.table_lock(H_LOCK_REFS);
        let slot = self.ref_slot(id)?;
        Ok(self.ref_count(slot, u64::from(id.0)) as i32)
    }

    fn ref_zero_lock(&self, id: RefId) -> Result<()> {
        let mut backoff = Backoff::new();
        while !self.ref_try_zero_lock(id)? {
            self.check_world()?;
            backoff.snooze();
        }
        Ok(())
    }

    fn ref_zero_trylock(&self, id: RefId) -> Result<()> {
        if self.ref_try_zero_lock(id)? {
            Ok(())
        } else {
            Err(FusionError::Busy)
        }
    }

    fn ref_unlock(&self, id: RefId) -> Result<()> {
        let refs = self.layout.refs;
        let _lock = self.table_lock(H_LOCK_REFS);
        let slot = self.ref_slot(id)?;
        if self.load(refs.word(slot, R_LOCKER)) != self.fusion_id.0 {
            return Err(FusionError::bug(format!(
                "unlock of {id} by {} without zero lock",
                self.fusion_id
            )));
        }
        self.store(refs.word(slot, R_LOCKER), 0);
        Ok(())
    }

    fn ref_watch(&self, id: RefId, call: CallId, arg: i32) -> Result<()> {
        let refs = self.layout.refs;
        let _lock = self.table_lock(H_LOCK_REFS);
        let slot = self.ref_slot(id)?;
        if self.load(refs.word(slot, R_WATCH_CALL)) != 0 {
            return Err(FusionError::Busy);
        }
        if self.ref_count(slot, u64::from(id.0)) == 0 {
            return Err(FusionError::bug(format!("watch on {id} at zero")));
        }
        self.store(refs.word(slot, R_WATCH_ARG), u64::from(arg as u32));
        self.store(refs.word(slot, R_WATCH_CALL), u64::from(call.0));
        Ok(())
    }

    fn ref_catch(&self, id: RefId) -> Result<()> {
        let refs = self.layout.refs;
        let _lock = self.table_lock(H_LOCK_REFS);
        let slot = self.ref_slot(id)?;
        if self.load(refs.word(slot, R_CATCHER)) != self.fusion_id.0 {
            return Err(FusionError::bug(format!(
                "catch of {id} by {} without throw",
                self.fusion_id
            )));
        }
        self.store(refs.word(slot, R_CREATOR), self.fusion_id.0);
        self.store(refs.word(slot, R_CATCHER), 0);
        Ok(())
    }

    fn ref_throw(&self, id: RefId, target: FusionId) -> Result<()> {
        let _lock = self.table_lock(H_LOCK_REFS);
        let slot = self.ref_slot(id)?;
        self.store(self.layout.refs.word(slot, R_CATCHER), target.0);
        Ok(())
    }

    fn ref_destroy(&self, id: RefId) -> Result<()> {
        let holders = self.layout.holders;
        let _lock = self.table_lock(H_LOCK_REFS);
        let slot = self.ref_slot(id)?;
        clear_slot(&self.file, &self.layout.refs, slot);
        for holder in 0..holders.slots {
            if self.load(holders.word(holder, 0)) == u64::from(id.0) {
                clear_slot(&self.file, &holders, holder);
            }
        }
        Ok(())
    }

    fn reactor_new(&self) -> Result<ReactorId> {
        self.check_world()?;
        let table = self.layout.reactors;
        let _lock = self.table_lock(H_LOCK_REACTORS);
        let slot = free_slot(&self.file, &table, "reactor")?;
        let id = self.mint_id();
        fill_slot(&self.file, &table, slot, &[u64::from(id), 0]);
        Ok(ReactorId(id))
    }

    fn reactor_attach(&self, id: ReactorId, channel: i32) -> Result<()> {
        let listeners = self.layout.listeners;
        let _lock = self.table_lock(H_LOCK_REACTORS);
        self.reactor_slot(id)?;
        if let Some(slot) = self.listener_slot(id, channel, self.fusion_id) {
            self.word(listeners.word(slot, L_COUNT))
                .fetch_add(1, Ordering::AcqRel);
        } else {
            let slot = free_slot(&self.file, &listeners, "listener")?;
            fill_slot(
                &self.file,
                &listeners,
                slot,
                &[
                    u64::from(id.0),
                    u64::from(channel as u32),
                    self.fusion_id.0,
                    1,
                ],
            );
        }
        Ok(())
    }

    fn reactor_detach(&self, id: ReactorId, channel: i32) -> Result<()> {
        let listeners = self.layout.listeners;
        let _lock = self.table_lock(H_LOCK_REACTORS);
        self.reactor_slot(id)?;
        let slot = self.listener_slot(id, channel, self.fusion_id).ok_or_else(|| {
            FusionError::bug(format!(
                "detach from {id} channel {channel} by {} without listener",
                self.fusion_id
            ))
        })?;
        let count = self.load(listeners.word(slot, L_COUNT));
        if count <= 1 {
            clear_slot(&self.file, &listeners, slot);
        } else {
            self.store(listeners.word(slot, L_COUNT), count - 1);
        }
        Ok(())
    }

    fn reactor_listeners(&self, id: ReactorId, channel: i32) -> Result<Vec<FusionId>> {
        let listeners = self.layout.listeners;
        let _lock = self.table_lock(H_LOCK_REACTORS);
        self.reactor_slot(id)?;
        let mut fusionees: Vec<FusionId> = (0..listeners.slots)
            .filter(|&slot| {
                self.load(listeners.word(slot, 0)) == u64::from(id.0)
                    && self.load(listeners.word(slot, L_CHANNEL)) == u64::from(channel as u32)
                    && self.load(listeners.word(slot, L_COUNT)) > 0
            })
            .map(|slot| FusionId(self.load(listeners.word(slot, L_FUSION))))
            .collect();
        fusionees.sort_unstable();
        fusionees.dedup();
        Ok(fusionees)
    }

    fn reactor_destroy(&self, id: ReactorId) -> Result<()> {
        let listeners = self.layout.listeners;
        let _lock = self.table_lock(H_LOCK_REACTORS);
        let slot = self.reactor_slot(id)?;
        clear_slot(&self.file, &self.layout.reactors, slot);
        for listener in 0..listeners.slots {
            if self.load(listeners.word(listener, 0)) == u64::from(id.0) {
                clear_slot(&self.file, &listeners, listener);
            }
        }
        Ok(())
    }

    fn countdown_new(&self, count: u32, call: CallId, arg: i32) -> Result<u32> {
        self.check_world()?;
        let table = self.layout.countdowns;
        let _lock = self.table_lock(H_LOCK_COUNTDOWNS);
        let slot = free_slot(&self.file, &table, "countdown")?;
        let id = self.mint_id();
        fill_slot(
            &self.file,
            &table,
            slot,
            &[
                u64::from(id),
                u64::from(count),
                u64::from(call.0),
                u64::from(arg as u32),
            ],
        );
        Ok(id)
    }

    fn countdown_tick(&self, id: u32) -> Result<Option<(CallId, i32)>> {
        let table = self.layout.countdowns;
        let _lock = self.table_lock(H_LOCK_COUNTDOWNS);
        let Some(slot) = find_slot(&self.file, &table, u64::from(id)) else {
            debug!("countdown {id} already finished");
            return Ok(None);
        };
        let remaining = self.load(table.word(slot, D_REMAINING)).saturating_sub(1);
        if remaining > 0 {
            self.store(table.word(slot, D_REMAINING), remaining);
            return Ok(None);
        }
        let call = CallId(self.load(table.word(slot, D_CALL)) as u32);
        let arg = self.load(table.word(slot, D_ARG)) as u32 as i32;
        clear_slot(&self.file, &table, slot);
        Ok(Some((call, arg)))
    }

    fn call_new(&self) -> Result<CallId> {
        self.check_world()?;
        let table = self.layout.calls;
        let _lock = self.table_lock(H_LOCK_CALLS);
        let slot = free_slot(&self.file, &table, "call")?;
        let id = self.mint_id();
        fill_slot(&self.file, &table, slot, &[u64::from(id), self.fusion_id.0]);
        Ok(CallId(id))
    }

    fn call_owner(&self, id: CallId) -> Result<FusionId> {
        let slot = self.call_slot(id).ok_or(FusionError::Destroyed)?;
        match self.load(self.layout.calls.word(slot, C_OWNER)) {
            0 => Err(FusionError::Destroyed),
            owner => Ok(FusionId(owner)),
        }
    }

    fn call_execute(&self, owner: FusionId, frame: CallFrame) -> Result<Option<CallReply>> {
        let call = frame.call_id;
        let serial = frame.serial;
        if self.call_slot(call).is_none() {
            return Err(FusionError::Destroyed);
        }
        if !frame.expects_reply() {
            self.send(owner, &Frame::Call(frame))?;
            return Ok(None);
        }

        let path = reply_path(&self.dir, call, serial);
        let _ = fs::remove_file(&path);
        let reply_socket = UnixDatagram::bind(&path)?;
        let _cleanup = RemoveOnDrop(path);
        reply_socket.set_read_timeout(Some(self.liveness.max(Duration::from_millis(1))))?;

        self.send(owner, &Frame::Call(frame))?;

        let mut buffer = vec![0u8; MAX_FRAME_SIZE];
        loop {
            match reply_socket.recv(&mut buffer) {
                Ok(len) => match Frame::decode(&buffer[..len]) {
                    Ok(Frame::CallReply(reply)) if reply.serial == serial => {
                        return Ok(Some(reply));
                    }
                    Ok(other) => {
                        warn!("unexpected {} frame on reply socket of {call}", other.name());
                    }
                    Err(e) => warn!("undecodable reply for {call}: {e}"),
                },
                Err(e) if is_timeout(&e) => {
                    self.check_world()?;
                    if !self.is_alive(owner) || self.call_slot(call).is_none() {
                        debug!("{call} owner {owner} gone while serial {serial} was pending");
                        return Ok(Some(CallReply::destroyed(call, serial)));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn call_return(&self, reply: CallReply) -> Result<()> {
        let call = reply.call_id;
        let serial = reply.serial;
        let bytes = Frame::CallReply(reply).encode()?;
        match self.sender.send_to(&bytes, reply_path(&self.dir, call, serial)) {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e) => {
                debug!("caller of {call} serial {serial} is gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn call_destroy(&self, id: CallId) -> Result<()> {
        let table = self.layout.calls;
        let _lock = self.table_lock(H_LOCK_CALLS);
        let slot = self.call_slot(id).ok_or(FusionError::Destroyed)?;
        clear_slot(&self.file, &table, slot);
        Ok(())
    }

    fn record_get(&self, kind: &str, name: &str) -> Result<Option<Vec<u8>>> {
        self.check_world()?;
        self.records.get(kind, name)
    }

    fn record_put(&self, kind: &str, name: &str, data: &[u8]) -> Result<()> {
        self.check_world()?;
        self.records.put(kind, name, data)
    }

    fn record_remove(&self, kind: &str, name: &str) -> Result<bool> {
        self.check_world()?;
        self.records.remove(kind, name)
    }

    fn record_list(&self, kind: &str) -> Result<Vec<String>> {
        self.check_world()?;
        self.records.list(kind)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::SocketLimits;
    use fusion_wire::CallFlags;

    fn config(root: &Path) -> WorldConfig {
        WorldConfig::socket(root).with_liveness_interval(10)
    }

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    /// Make `fusion_id` look like it belongs to a process that exited.
    fn bury(backend: &SocketBackend, fusion_id: FusionId) {
        let slot = backend.fusionee_slot(fusion_id).unwrap();
        backend.store(
            backend.layout.fusionees.word(slot, F_PID),
            u64::from(dead_pid()),
        );
    }

    #[test]
    fn test_create_and_join() {
        let dir = tempfile::tempdir().unwrap();
        let master = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let slave = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();

        assert_eq!(master.fusion_id(), FusionId::MASTER);
        assert_eq!(slave.fusion_id(), FusionId(2));
        assert_eq!(master.header(), slave.header());
        assert_ne!(master.header().arena_lock, master.header().pool_lock);
        assert_eq!(
            slave.fusionees().unwrap(),
            vec![FusionId::MASTER, FusionId(2)]
        );
        assert!(dir.path().join("world.0/fusionee.2").exists());
    }

    #[test]
    fn test_role_and_abi_checks() {
        let dir = tempfile::tempdir().unwrap();
        let slave = config(dir.path()).with_role(Role::Slave);
        assert!(matches!(
            SocketBackend::enter(dir.path(), &slave),
            Err(FusionError::NotFound(_))
        ));

        let _master = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let master = config(dir.path()).with_role(Role::Master);
        assert!(matches!(
            SocketBackend::enter(dir.path(), &master),
            Err(FusionError::Busy)
        ));

        let other_abi = config(dir.path()).with_abi_version(9);
        assert!(matches!(
            SocketBackend::enter(dir.path(), &other_abi),
            Err(FusionError::VersionMismatch {
                expected: 9,
                found: 1
            })
        ));
    }

    #[test]
    fn test_auto_index_skips_live_world() {
        let dir = tempfile::tempdir().unwrap();
        let _first = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let second =
            SocketBackend::enter(dir.path(), &config(dir.path()).with_auto_index()).unwrap();

        assert_eq!(second.header().index, 1);
        assert_eq!(second.fusion_id(), FusionId::MASTER);
    }

    #[test]
    fn test_stale_world_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let crashed = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let start = crashed.header().start_millis;
        bury(&crashed, FusionId::MASTER);
        drop(crashed);

        let fresh = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        assert_eq!(fresh.fusion_id(), FusionId::MASTER);
        assert!(fresh.header().start_millis >= start);
        assert_eq!(fresh.fusionees().unwrap(), vec![FusionId::MASTER]);
    }

    #[test]
    fn test_abandoned_skirmish_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let master = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let slave = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();

        let lock = master.skirmish_new().unwrap();
        let slave_owner = Owner::current(slave.fusion_id());
        let master_owner = Owner::current(master.fusion_id());
        slave.skirmish_prevail(lock, slave_owner).unwrap();
        assert!(matches!(
            master.skirmish_swoop(lock, master_owner),
            Err(FusionError::Busy)
        ));

        bury(&master, slave.fusion_id());
        master.skirmish_prevail(lock, master_owner).unwrap();
        assert_eq!(master.skirmish_lock_count(lock, master_owner).unwrap(), 1);
    }

    #[test]
    fn test_reap_reclaims_local_counts() {
        let dir = tempfile::tempdir().unwrap();
        let master = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let slave = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();

        let id = master.ref_new().unwrap();
        master.ref_up(id, true).unwrap();
        slave.ref_up(id, false).unwrap();
        slave.ref_up(id, false).unwrap();
        assert_eq!(master.ref_stat(id).unwrap(), 3);

        bury(&master, slave.fusion_id());
        assert_eq!(master.reap().unwrap(), vec![FusionId(2)]);
        assert_eq!(master.ref_stat(id).unwrap(), 1);
        assert_eq!(master.fusionees().unwrap(), vec![FusionId::MASTER]);
    }

    #[test]
    fn test_frames_and_sync() {
        let dir = tempfile::tempdir().unwrap();
        let master = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let slave = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();

        let frame = Frame::Wakeup(WakeupFrame {
            fusion_id: FusionId(2),
        });
        master.send(slave.fusion_id(), &frame).unwrap();
        assert!(matches!(
            master.sync(true, Duration::from_millis(20)),
            Err(FusionError::Timeout)
        ));

        assert_eq!(slave.recv(Duration::from_secs(1)).unwrap(), Some(frame));
        slave.processed().unwrap();
        master.sync(true, Duration::from_secs(1)).unwrap();
        assert_eq!(slave.recv(Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn test_blocking_call_reply() {
        let dir = tempfile::tempdir().unwrap();
        let master = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let slave = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let call = slave.call_new().unwrap();

        let owner = {
            let slave = Arc::clone(&slave);
            std::thread::spawn(move || {
                let Some(Frame::Call(frame)) = slave.recv(Duration::from_secs(5)).unwrap() else {
                    return;
                };
                slave.processed().unwrap();
                let reply = CallReply::ok(frame.call_id, frame.serial, frame.arg * 2, frame.data);
                slave.call_return(reply).unwrap();
            })
        };

        let frame = CallFrame {
            call_id: call,
            serial: master.mint().unwrap(),
            caller: master.fusion_id(),
            flags: CallFlags::NONE,
            arg: 21,
            ptr: fusion_wire::SharedPtr::NULL,
            ret_size: 16,
            data: b"echo".to_vec(),
        };
        let reply = master.call_execute(slave.fusion_id(), frame).unwrap().unwrap();
        owner.join().unwrap();

        assert_eq!(reply.value, 42);
        assert_eq!(reply.data, b"echo");
    }

    #[test]
    fn test_blocking_call_to_dead_owner() {
        let dir = tempfile::tempdir().unwrap();
        let master = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let slave = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let call = slave.call_new().unwrap();
        bury(&master, slave.fusion_id());

        let frame = CallFrame {
            call_id: call,
            serial: 1,
            caller: master.fusion_id(),
            flags: CallFlags::NONE,
            arg: 0,
            ptr: fusion_wire::SharedPtr::NULL,
            ret_size: 0,
            data: Vec::new(),
        };
        let reply = master.call_execute(slave.fusion_id(), frame).unwrap().unwrap();
        assert_eq!(reply.status, fusion_wire::ReplyStatus::Destroyed);
    }

    #[test]
    fn test_master_leave_destroys_world() {
        let dir = tempfile::tempdir().unwrap();
        let master = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();
        let slave = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();

        master.leave(false).unwrap();
        assert!(!dir.path().join("world.0").exists());
        assert!(matches!(
            slave.recv(Duration::from_millis(5)),
            Err(FusionError::Destroyed)
        ));
        assert!(matches!(slave.ref_new(), Err(FusionError::Destroyed)));
    }

    #[test]
    fn test_fork_inherits_local_counts() {
        let dir = tempfile::tempdir().unwrap();
        let master = SocketBackend::enter(dir.path(), &config(dir.path())).unwrap();

        let id = master.ref_new().unwrap();
        master.ref_up(id, false).unwrap();
        master.ref_up(id, false).unwrap();
        let child = master.fork().unwrap();
        assert_eq!(master.fusionees().unwrap(), vec![FusionId::MASTER, child.fusion_id()]);
        assert_eq!(master.ref_stat(id).unwrap(), 4);

        child.ref_down(id, false).unwrap();
        assert_eq!(master.ref_stat(id).unwrap(), 3);
    }

    #[test]
    fn test_fork_rolls_back_on_full_holder_table() {
        let dir = tempfile::tempdir().unwrap();
        let limits = SocketLimits {
            holders: 3,
            ..SocketLimits::default()
        };
        let config = config(dir.path()).with_limits(limits);
        let master = SocketBackend::enter(dir.path(), &config).unwrap();

        let refs: Vec<RefId> = (0..2).map(|_| master.ref_new().unwrap()).collect();
        for id in &refs {
            master.ref_up(*id, false).unwrap();
        }
        assert!(matches!(master.fork(), Err(FusionError::LimitExceeded(_))));
        assert_eq!(master.fusionees().unwrap(), vec![FusionId::MASTER]);
        for id in &refs {
            assert_eq!(master.ref_stat(*id).unwrap(), 1);
        }

        master.ref_down(refs[0], false).unwrap();
        let child = master.fork().unwrap();
        assert_eq!(master.ref_stat(refs[1]).unwrap(), 2);
        assert_eq!(master.fusionees().unwrap(), vec![FusionId::MASTER, child.fusion_id()]);
    }
}
