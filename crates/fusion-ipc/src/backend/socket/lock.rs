//! Process liveness, spin locks over shared words and the world enter lock.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{FusionError, Result};

/// Enter lock timeout in seconds.
const ENTER_LOCK_TIMEOUT_SECS: u64 = 10;

/// Enter lock retry interval in milliseconds.
const ENTER_LOCK_RETRY_MS: u64 = 5;

/// Spins between liveness probes of a table lock holder.
const STEAL_PROBE_SPINS: u32 = 256;

/// Whether a process with this pid exists.
///
/// Best effort: a pid can be recycled between the owner exiting and the probe.
#[allow(unsafe_code)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Pid of the calling process
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Escalating pause for polling loops: spin, then yield, then sleep.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    /// Fresh backoff
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Pause once, a little longer than last time
    pub fn snooze(&mut self) {
        if self.step < 16 {
            std::hint::spin_loop();
        } else if self.step < 32 {
            std::thread::yield_now();
        } else {
            let micros = u64::from((self.step - 31).min(20)) * 50;
            std::thread::sleep(Duration::from_micros(micros));
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Short-term lock over one shared word holding the owner's pid.
///
/// Never held across a blocking operation. A holder whose process died is
/// displaced after a liveness probe.
pub struct TableLock<'a> {
    word: &'a AtomicU64,
}

impl<'a> TableLock<'a> {
    /// Spin until the word is ours
    pub fn acquire(word: &'a AtomicU64) -> Self {
        let pid = u64::from(current_pid());
        let mut backoff = Backoff::new();
        let mut spins = 0u32;
        loop {
            match word.compare_exchange_weak(0, pid, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return Self { word },
                Err(holder) => {
                    spins = spins.wrapping_add(1);
                    if spins % STEAL_PROBE_SPINS == 0
                        && holder != 0
                        && holder != pid
                        && !process_alive(holder as u32)
                        && word
                            .compare_exchange(holder, pid, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                    {
                        warn!("table lock taken over from dead process {holder}");
                        return Self { word };
                    }
                    backoff.snooze();
                }
            }
        }
    }
}

impl Drop for TableLock<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

/// Exclusive right to create or join one world directory.
///
/// A lock file created with `create_new` holding the owner's pid; a lock
/// left behind by a dead process is removed.
pub struct EnterLock {
    path: PathBuf,
}

impl EnterLock {
    /// Acquire the lock file, retrying for up to ten seconds.
    pub fn acquire(path: &Path) -> Result<Self> {
        let timeout = Duration::from_secs(ENTER_LOCK_TIMEOUT_SECS);
        let retry_interval = Duration::from_millis(ENTER_LOCK_RETRY_MS);
        let start = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", current_pid())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(holder) = Self::holder(path) {
                        if !process_alive(holder) {
                            debug!("removing enter lock {} of dead process {holder}", path.display());
                            let _ = fs::remove_file(path);
                            continue;
                        }
                    }
                    if start.elapsed() >= timeout {
                        warn!(
                            "enter lock timeout after {}s: {}",
                            ENTER_LOCK_TIMEOUT_SECS,
                            path.display()
                        );
                        return Err(FusionError::Timeout);
                    }
                    std::thread::sleep(retry_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn holder(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EnterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait true");
        pid
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(current_pid()));
        assert!(!process_alive(0));
        assert!(!process_alive(dead_pid()));
    }

    #[test]
    fn test_table_lock_excludes() {
        let word = AtomicU64::new(0);
        {
            let _lock = TableLock::acquire(&word);
            assert_eq!(word.load(Ordering::Relaxed), u64::from(current_pid()));
        }
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_table_lock_steals_from_dead_holder() {
        let word = AtomicU64::new(u64::from(dead_pid()));
        let _lock = TableLock::acquire(&word);
        assert_eq!(word.load(Ordering::Relaxed), u64::from(current_pid()));
    }

    #[test]
    fn test_enter_lock_acquire_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("world.0.lock");

        let lock = EnterLock::acquire(&path).expect("lock");
        assert!(lock.path().exists());
        assert_eq!(EnterLock::holder(&path), Some(current_pid()));

        let lock_path = lock.path().to_path_buf();
        drop(lock);
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_enter_lock_replaces_stale_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("world.1.lock");
        fs::write(&path, dead_pid().to_string()).expect("write");

        let lock = EnterLock::acquire(&path).expect("lock");
        assert_eq!(EnterLock::holder(lock.path()), Some(current_pid()));
    }
}
