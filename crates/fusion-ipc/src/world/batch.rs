//! Per-thread queues of one-way calls.
//!
//! Queued calls from one thread accumulate until the batch limit is reached,
//! the batch window expires, the thread targets a different owner, or the
//! thread makes a non-queued call. A flusher thread sends batches whose
//! window expired while their thread went quiet.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use fusion_wire::{CallBatch, CallFrame, Frame, FusionId, MAX_FRAME_SIZE};

use crate::backend::Backend;
use crate::Result;

/// Encoded size of a call entry without its data
const ENTRY_OVERHEAD: usize = 40;

#[derive(Debug)]
struct PendingBatch {
    owner: FusionId,
    entries: Vec<CallFrame>,
    bytes: usize,
    started: Instant,
}

impl PendingBatch {
    fn into_frame(self) -> (FusionId, Frame) {
        (
            self.owner,
            Frame::CallBatch(CallBatch {
                entries: self.entries,
            }),
        )
    }
}

#[derive(Debug)]
pub(crate) struct CallBatcher {
    limit: usize,
    window: Duration,
    pending: Mutex<HashMap<ThreadId, PendingBatch>>,
    queued: Condvar,
    stopping: AtomicBool,
}

impl CallBatcher {
    pub(crate) fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            pending: Mutex::new(HashMap::new()),
            queued: Condvar::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Queue `frame` for `owner` on behalf of the calling thread.
    pub(crate) fn push(&self, backend: &dyn Backend, owner: FusionId, frame: CallFrame) -> Result<()> {
        let thread = thread::current().id();
        let size = ENTRY_OVERHEAD + frame.data.len();
        let mut ready = Vec::new();
        {
            let mut pending = self.pending.lock();
            let switch = pending.get(&thread).is_some_and(|batch| {
                batch.owner != owner || batch.bytes + size > MAX_FRAME_SIZE / 2
            });
            if switch {
                ready.extend(pending.remove(&thread));
            }

            let batch = pending.entry(thread).or_insert_with(|| PendingBatch {
                owner,
                entries: Vec::new(),
                bytes: 0,
                started: Instant::now(),
            });
            batch.entries.push(frame);
            batch.bytes += size;

            if batch.entries.len() >= self.limit || batch.started.elapsed() >= self.window {
                ready.extend(pending.remove(&thread));
            }
        }
        self.queued.notify_all();

        for batch in ready {
            send(backend, batch)?;
        }
        Ok(())
    }

    /// Send the calling thread's queue, if any
    pub(crate) fn flush_current(&self, backend: &dyn Backend) -> Result<()> {
        let batch = self.pending.lock().remove(&thread::current().id());
        match batch {
            Some(batch) => send(backend, batch),
            None => Ok(()),
        }
    }

    /// Send every queue
    pub(crate) fn flush_all(&self, backend: &dyn Backend) -> Result<()> {
        let mut pending = self.pending.lock();
        let mut result = Ok(());
        for (_, batch) in pending.drain() {
            if let Err(e) = send(backend, batch) {
                result = Err(e);
            }
        }
        result
    }

    /// Number of calls waiting in queues
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.pending.lock().values().map(|b| b.entries.len()).sum()
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let _guard = self.pending.lock();
        self.queued.notify_all();
    }

    /// Flusher loop: sleeps while nothing is queued
    fn run(&self, backend: &dyn Backend) {
        let mut pending = self.pending.lock();
        while !self.stopping.load(Ordering::Acquire) {
            let Some(oldest) = pending.values().map(|batch| batch.started).min() else {
                self.queued.wait(&mut pending);
                continue;
            };

            let deadline = oldest + self.window;
            if Instant::now() < deadline {
                self.queued.wait_until(&mut pending, deadline);
                continue;
            }

            let stale: Vec<ThreadId> = pending
                .iter()
                .filter(|(_, batch)| batch.started.elapsed() >= self.window)
                .map(|(thread, _)| *thread)
                .collect();
            // sent under the lock so a thread's next call cannot overtake its batch
            for thread in stale {
                if let Some(batch) = pending.remove(&thread) {
                    if let Err(e) = send(backend, batch) {
                        warn!("queued one-way calls lost: {e}");
                    }
                }
            }
        }
    }
}

fn send(backend: &dyn Backend, batch: PendingBatch) -> Result<()> {
    let count = batch.entries.len();
    let (owner, frame) = batch.into_frame();
    trace!("flushing {count} queued calls to {owner}");
    backend.send(owner, &frame)
}

pub(super) fn spawn_flusher(
    batcher: Arc<CallBatcher>,
    backend: Arc<dyn Backend>,
    fusion_id: FusionId,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("fusion-flush-{}", fusion_id.get()))
        .spawn(move || {
            debug!("call flusher of {fusion_id} started");
            batcher.run(backend.as_ref());
            debug!("call flusher of {fusion_id} stopped");
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::{Device, DeviceBackend};
    use crate::config::WorldConfig;
    use fusion_wire::{CallFlags, CallId, SharedPtr};

    fn one_way(arg: i32) -> CallFrame {
        CallFrame {
            call_id: CallId(1),
            serial: 0,
            caller: FusionId::MASTER,
            flags: CallFlags::ONE_WAY | CallFlags::QUEUE,
            arg,
            ptr: SharedPtr::NULL,
            ret_size: 0,
            data: Vec::new(),
        }
    }

    #[test]
    fn test_limit_flushes_one_frame() {
        let device = Device::new();
        let master = DeviceBackend::enter(&device, &WorldConfig::device(&device)).expect("master");
        let slave = DeviceBackend::enter(&device, &WorldConfig::device(&device)).expect("slave");
        let batcher = CallBatcher::new(3, Duration::from_secs(60));

        for arg in 0..3 {
            batcher
                .push(master.as_ref(), slave.fusion_id(), one_way(arg))
                .expect("push");
        }
        assert_eq!(batcher.queued(), 0);

        let frame = slave
            .recv(Duration::from_secs(1))
            .expect("recv")
            .expect("batch frame");
        let Frame::CallBatch(batch) = frame else {
            panic!("expected a batch, got {}", frame.name());
        };
        let args: Vec<i32> = batch.entries.iter().map(|entry| entry.arg).collect();
        assert_eq!(args, vec![0, 1, 2]);
    }

    #[test]
    fn test_flush_current_sends_partial_batch() {
        let device = Device::new();
        let master = DeviceBackend::enter(&device, &WorldConfig::device(&device)).expect("master");
        let slave = DeviceBackend::enter(&device, &WorldConfig::device(&device)).expect("slave");
        let batcher = CallBatcher::new(16, Duration::from_secs(60));

        batcher
            .push(master.as_ref(), slave.fusion_id(), one_way(7))
            .expect("push");
        assert_eq!(batcher.queued(), 1);
        assert_eq!(slave.recv(Duration::from_millis(10)).expect("recv"), None);

        batcher.flush_current(master.as_ref()).expect("flush");
        assert!(matches!(
            slave.recv(Duration::from_secs(1)).expect("recv"),
            Some(Frame::CallBatch(_))
        ));
    }

    #[test]
    fn test_flusher_sends_stale_batch() {
        let device = Device::new();
        let master: Arc<dyn Backend> =
            DeviceBackend::enter(&device, &WorldConfig::device(&device)).expect("master");
        let slave = DeviceBackend::enter(&device, &WorldConfig::device(&device)).expect("slave");
        let batcher = Arc::new(CallBatcher::new(16, Duration::from_millis(5)));
        let flusher = spawn_flusher(Arc::clone(&batcher), Arc::clone(&master), FusionId::MASTER)
            .expect("flusher");

        batcher
            .push(master.as_ref(), slave.fusion_id(), one_way(1))
            .expect("push");
        assert!(matches!(
            slave.recv(Duration::from_secs(2)).expect("recv"),
            Some(Frame::CallBatch(_))
        ));

        batcher.stop();
        flusher.join().expect("join flusher");
    }
}
