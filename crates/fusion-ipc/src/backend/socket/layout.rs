//! Word layout of the shared world file
//!
//! The file is an array of little 64-bit words accessed atomically. A fixed
//! header is followed by one table per primitive kind; each table is an
//! array of fixed-width slots whose first word is zero when the slot is free.
//!
//! ```text
//! header   : 32 words (magic, version, state, identity, limits, counters, table locks)
//! fusionee : [id, pid, pending]
//! skirmish : [id, owner token, count, notify seq]
//! ref      : [id, creator, catcher, global, zero locker, watch call, watch arg, reserved]
//! holder   : [ref id, fusion id, local count]
//! reactor  : [id, reserved]
//! listener : [reactor id, channel, fusion id, count]
//! call     : [id, owner]
//! countdown: [id, remaining, call, arg]
//! ```

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::config::SocketLimits;
use crate::{FusionError, Result};

/// "FUSNWRLD" as a little-endian word
pub const WORLD_MAGIC: u64 = u64::from_le_bytes(*b"FUSNWRLD");

/// Layout version; bumped on any incompatible change
pub const LAYOUT_VERSION: u64 = 1;

/// Header words
pub const HEADER_WORDS: usize = 32;

// Header word indices
pub const H_MAGIC: usize = 0;
pub const H_VERSION: usize = 1;
pub const H_STATE: usize = 2;
pub const H_INDEX: usize = 3;
pub const H_ABI: usize = 4;
pub const H_START_MILLIS: usize = 5;
pub const H_MASTER_PID: usize = 6;
pub const H_POOL: usize = 7;
pub const H_POOL_LOCK: usize = 8;
pub const H_ARENA_LOCK: usize = 9;
/// First of eight limit words, in [`SocketLimits`] field order
pub const H_LIMITS: usize = 10;
pub const H_NEXT_FUSION: usize = 18;
pub const H_NEXT_ID: usize = 19;
pub const H_LOCK_FUSIONEES: usize = 20;
pub const H_LOCK_SKIRMISHES: usize = 21;
pub const H_LOCK_REFS: usize = 22;
pub const H_LOCK_REACTORS: usize = 23;
pub const H_LOCK_CALLS: usize = 24;
pub const H_LOCK_COUNTDOWNS: usize = 25;

/// World file is being initialized by its creator
pub const STATE_INIT: u64 = 0;
/// World is open for joining
pub const STATE_READY: u64 = 1;
/// Master left; the world is gone
pub const STATE_DESTROYED: u64 = 2;

// Slot fields; word 0 of every slot is its key and zero marks a free slot
pub const F_PID: usize = 1;
pub const F_PENDING: usize = 2;

pub const S_TOKEN: usize = 1;
pub const S_COUNT: usize = 2;
pub const S_SEQ: usize = 3;

pub const R_CREATOR: usize = 1;
pub const R_CATCHER: usize = 2;
pub const R_GLOBAL: usize = 3;
pub const R_LOCKER: usize = 4;
pub const R_WATCH_CALL: usize = 5;
pub const R_WATCH_ARG: usize = 6;

pub const HO_FUSION: usize = 1;
pub const HO_COUNT: usize = 2;

pub const L_CHANNEL: usize = 1;
pub const L_FUSION: usize = 2;
pub const L_COUNT: usize = 3;

pub const C_OWNER: usize = 1;

pub const D_REMAINING: usize = 1;
pub const D_CALL: usize = 2;
pub const D_ARG: usize = 3;

/// One fixed-width slot array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    /// First word of the table
    pub offset: usize,
    /// Number of slots
    pub slots: usize,
    /// Words per slot
    pub width: usize,
}

impl Table {
    /// Word index of `field` in `slot`
    pub const fn word(&self, slot: usize, field: usize) -> usize {
        self.offset + slot * self.width + field
    }

    const fn end(&self) -> usize {
        self.offset + self.slots * self.width
    }
}

/// Table placement derived from the world's limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub fusionees: Table,
    pub skirmishes: Table,
    pub refs: Table,
    pub holders: Table,
    pub reactors: Table,
    pub listeners: Table,
    pub calls: Table,
    pub countdowns: Table,
}

impl Layout {
    /// Place every table after the header
    pub fn new(limits: &SocketLimits) -> Self {
        let mut offset = HEADER_WORDS;
        let mut table = |slots: u32, width: usize| {
            let table = Table {
                offset,
                slots: slots as usize,
                width,
            };
            offset = table.end();
            table
        };

        Self {
            fusionees: table(limits.fusionees, 3),
            skirmishes: table(limits.skirmishes, 4),
            refs: table(limits.refs, 8),
            holders: table(limits.holders, 3),
            reactors: table(limits.reactors, 2),
            listeners: table(limits.listeners, 4),
            calls: table(limits.calls, 2),
            countdowns: table(limits.countdowns, 4),
        }
    }

    /// Total words including the header
    pub const fn total_words(&self) -> usize {
        self.countdowns.end()
    }

    /// File size in bytes
    pub const fn file_size(&self) -> usize {
        self.total_words() * 8
    }
}

/// Limits stored in the header words
pub fn limits_to_words(limits: &SocketLimits) -> [u64; 8] {
    [
        u64::from(limits.fusionees),
        u64::from(limits.skirmishes),
        u64::from(limits.refs),
        u64::from(limits.holders),
        u64::from(limits.reactors),
        u64::from(limits.listeners),
        u64::from(limits.calls),
        u64::from(limits.countdowns),
    ]
}

/// Inverse of [`limits_to_words`]
pub fn limits_from_words(words: [u64; 8]) -> SocketLimits {
    SocketLimits {
        fusionees: words[0] as u32,
        skirmishes: words[1] as u32,
        refs: words[2] as u32,
        holders: words[3] as u32,
        reactors: words[4] as u32,
        listeners: words[5] as u32,
        calls: words[6] as u32,
        countdowns: words[7] as u32,
    }
}

/// Memory-mapped world file viewed as atomic words.
///
/// The mapping is only ever accessed through the atomic view, never as bytes.
#[allow(unsafe_code)]
pub struct WorldFile {
    _file: File,
    _map: MmapMut,
    words: *const AtomicU64,
    len: usize,
    path: PathBuf,
}

impl WorldFile {
    /// Create a zeroed world file of `size` bytes; fails if it exists
    pub fn create(path: &Path, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size as u64)?;
        Self::map(file, path)
    }

    /// Map an existing world file
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let world = Self::map(file, path)?;
        if world.len < HEADER_WORDS {
            return Err(FusionError::Fusion(format!(
                "world file {} too small: {} words",
                path.display(),
                world.len
            )));
        }
        Ok(world)
    }

    #[allow(unsafe_code)]
    fn map(file: File, path: &Path) -> Result<Self> {
        // SAFETY: the file is shared with other fusionees which only ever
        // access it through atomic word operations, same as this process.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
        let len = map.len() / 8;
        let words = map.as_mut_ptr().cast::<AtomicU64>().cast_const();
        Ok(Self {
            _file: file,
            _map: map,
            words,
            len,
            path: path.to_path_buf(),
        })
    }

    /// The whole file as atomic words
    #[allow(unsafe_code)]
    pub fn words(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is page aligned, lives as long as `self`, and
        // every access goes through AtomicU64 so concurrent mutation from
        // other processes is well defined.
        unsafe { slice::from_raw_parts(self.words, self.len) }
    }

    /// One word
    pub fn word(&self, index: usize) -> &AtomicU64 {
        &self.words()[index]
    }

    /// Load one word
    pub fn load(&self, index: usize) -> u64 {
        self.word(index).load(Ordering::Acquire)
    }

    /// Store one word
    pub fn store(&self, index: usize, value: u64) {
        self.word(index).store(value, Ordering::Release);
    }

    /// Path of the mapped file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Limits recorded by the creator
    pub fn limits(&self) -> SocketLimits {
        let mut words = [0u64; 8];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.load(H_LIMITS + i);
        }
        limits_from_words(words)
    }
}

impl fmt::Debug for WorldFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldFile")
            .field("path", &self.path)
            .field("words", &self.len)
            .finish_non_exhaustive()
    }
}

// SAFETY: the raw pointer targets the mapping owned by this struct and is
// only dereferenced as AtomicU64, which is Sync.
#[allow(unsafe_code)]
unsafe impl Send for WorldFile {}

// SAFETY: see Send; all shared access is atomic.
#[allow(unsafe_code)]
unsafe impl Sync for WorldFile {}
