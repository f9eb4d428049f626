//! The dispatch thread: routes inbound frames to calls and reactors.

use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use fusion_wire::{Frame, ReactorFrame};

use super::World;
use crate::call;
use crate::reactor;
use crate::{FusionError, Result};

pub(super) fn spawn(world: &World) -> Result<JoinHandle<()>> {
    let world = world.clone();
    let name = format!("fusion-dispatch-{}-{}", world.index(), world.fusion_id().get());
    let handle = thread::Builder::new().name(name).spawn(move || {
        let _ = world.inner.dispatch_thread.set(thread::current().id());
        run(&world);
    })?;
    Ok(handle)
}

fn run(world: &World) {
    let backend = world.backend();
    let interval = world.config().liveness_interval();
    debug!("dispatch thread of {} started", world.fusion_id());

    while !world.stopping() {
        match backend.recv(interval) {
            Ok(Some(frame)) => {
                trace!("{} received {} frame", world.fusion_id(), frame.name());
                handle(world, frame);
                if let Err(e) = backend.processed() {
                    debug!("{} could not mark frame processed: {e}", world.fusion_id());
                }
            }
            Ok(None) => {
                if world.is_master() {
                    reap(world);
                }
            }
            Err(FusionError::Destroyed) => {
                info!("world {} is gone, dispatch thread of {} stops", world.index(), world.fusion_id());
                break;
            }
            Err(e) => {
                warn!("dispatch thread of {} failed to receive: {e}", world.fusion_id());
                thread::sleep(interval);
            }
        }
    }

    debug!("dispatch thread of {} stopped", world.fusion_id());
}

fn handle(world: &World, frame: Frame) {
    match frame {
        Frame::Call(call) => call::serve(world, call, false),
        Frame::CallBatch(batch) => {
            for call in batch.entries {
                call::serve(world, call, false);
            }
        }
        Frame::Reactor(message) => deliver(world, message),
        Frame::Leave(leave) => {
            if world.is_master() {
                world.notify_leave(leave.fusion_id);
            }
        }
        Frame::Wakeup(_) => {}
        Frame::CallReply(reply) => {
            warn!(
                "{} received a stray reply for {} serial {}",
                world.fusion_id(),
                reply.call_id,
                reply.serial
            );
        }
    }
}

fn deliver(world: &World, frame: ReactorFrame) {
    let countdown = frame.countdown;
    reactor::deliver_remote(world, frame);

    if countdown == 0 {
        return;
    }
    match world.backend().countdown_tick(countdown) {
        Ok(Some((call, arg))) => {
            if let Err(e) = world.invoke_one_way(call, arg) {
                debug!("dispatch callback {call} not run: {e}");
            }
        }
        Ok(None) => {}
        Err(e) => debug!("countdown {countdown} tick failed: {e}"),
    }
}

fn reap(world: &World) {
    match world.backend().reap() {
        Ok(dead) => {
            for fusion_id in dead {
                world.notify_leave(fusion_id);
            }
        }
        Err(e) => debug!("reaping in world {} failed: {e}", world.index()),
    }
}
