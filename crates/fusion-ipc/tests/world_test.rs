//! Calls, reactors, arenas and object pools shared between fusionees of
//! one device world.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use fusion_ipc::backend::device::Device;
use fusion_ipc::{
    Arena, CallFlags, CallHandlerResult, FusionCall, FusionError, FusionId, Host, ObjectPool,
    ObjectState, ReactionResult, Reactor, Result, SharedPtr, World, WorldConfig,
};

fn join(device: &Device) -> World {
    Host::new()
        .enter(WorldConfig::device(device).with_index(0))
        .expect("Failed to join world")
}

#[test]
fn remote_calls_reach_the_owner() {
    let device = Device::new();
    let master = join(&device);
    let slave = join(&device);

    let sum = FusionCall::init(&master, |ctx| {
        let total: i32 = ctx.data.iter().map(|b| i32::from(*b)).sum();
        CallHandlerResult::Return(total + ctx.arg)
    })
    .expect("init");
    let reverse = FusionCall::init3(&master, |ctx, output| {
        let reversed: Vec<u8> = ctx.data.iter().rev().copied().collect();
        output.write(&reversed);
        CallHandlerResult::Return(0)
    })
    .expect("init3");

    let remote_sum = FusionCall::open(&slave, sum.id()).expect("open");
    assert_eq!(remote_sum.owner(), FusionId::MASTER);
    assert_eq!(
        remote_sum
            .execute2(CallFlags::NONE, 10, &[1, 2, 3])
            .expect("execute2"),
        16
    );

    let remote_reverse = FusionCall::open(&slave, reverse.id()).expect("open");
    assert_eq!(
        remote_reverse
            .execute3(CallFlags::NONE, 0, b"fusion", 16)
            .expect("execute3"),
        b"noisuf"
    );

    sum.destroy().expect("destroy");
    assert!(matches!(
        FusionCall::open(&slave, remote_sum.id()),
        Err(FusionError::Destroyed)
    ));
    slave.exit(false).expect("slave exit");
    master.exit(false).expect("master exit");
}

#[test]
fn one_way_calls_arrive_in_order() {
    let device = Device::new();
    let master = join(&device);
    let slave = join(&device);
    let (sender, receiver) = crossbeam_channel::unbounded();
    let call = FusionCall::init(&master, move |ctx| {
        let _ = sender.send(ctx.arg);
        CallHandlerResult::Return(0)
    })
    .expect("init");
    let remote = FusionCall::open(&slave, call.id()).expect("open");

    for arg in 0..20 {
        let flags = if arg % 2 == 0 {
            CallFlags::ONE_WAY | CallFlags::QUEUE
        } else {
            CallFlags::ONE_WAY
        };
        remote
            .execute(flags, arg, SharedPtr::NULL)
            .expect("execute");
    }
    slave.flush_calls().expect("flush");
    slave.sync().expect("sync");

    let received: Vec<i32> = receiver.try_iter().collect();
    assert_eq!(received, (0..20).collect::<Vec<_>>());
    slave.exit(false).expect("slave exit");
    master.exit(false).expect("master exit");
}

#[test]
fn reactor_reaches_every_listener_once() {
    let device = Device::new();
    let master = join(&device);
    let slaves: Vec<World> = (0..3).map(|_| join(&device)).collect();
    let reactor = Reactor::new(&master, 16).expect("reactor");
    let delivered = Arc::new(AtomicUsize::new(0));

    let reactions: Vec<_> = slaves
        .iter()
        .map(|slave| {
            let delivered = Arc::clone(&delivered);
            let remote = Reactor::open(slave, reactor.id()).expect("open");
            let reaction = remote
                .attach(3, move |message| {
                    assert_eq!(message.sender, FusionId::MASTER);
                    assert_eq!(message.data, b"frame");
                    delivered.fetch_add(1, Ordering::SeqCst);
                    ReactionResult::Ok
                })
                .expect("attach");
            (remote, reaction)
        })
        .collect();

    reactor.dispatch(3, b"frame", false, &[]).expect("dispatch");
    reactor.dispatch(4, b"other", false, &[]).expect("dispatch");
    master.sync().expect("sync");
    assert_eq!(delivered.load(Ordering::SeqCst), 3);

    for (remote, reaction) in reactions {
        remote.detach(reaction).expect("detach");
    }
    reactor.dispatch(3, b"frame", false, &[]).expect("dispatch");
    master.sync().expect("sync");
    assert_eq!(delivered.load(Ordering::SeqCst), 3);

    reactor.destroy().expect("destroy");
    for slave in &slaves {
        slave.exit(false).expect("slave exit");
    }
    master.exit(false).expect("master exit");
}

#[test]
fn concurrent_arena_enter_initializes_once() {
    let device = Device::new();
    let master = join(&device);
    let initialized = Arc::new(AtomicUsize::new(0));
    let shut_down = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let world = join(&device);
            let initialized = Arc::clone(&initialized);
            let shut_down = Arc::clone(&shut_down);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let arena = Arena::enter(
                    &world,
                    "session",
                    |arena| {
                        initialized.fetch_add(1, Ordering::SeqCst);
                        arena.add_shared_field("root", SharedPtr(99))
                    },
                    |arena| {
                        assert_eq!(arena.get_shared_field("root")?, SharedPtr(99));
                        Ok(())
                    },
                )
                .expect("enter");
                barrier.wait();

                arena
                    .exit(
                        |_, _| {
                            shut_down.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                        Some(|_: &Arena, _: bool| -> Result<()> { Ok(()) }),
                        false,
                    )
                    .expect("exit arena");
                world.exit(false).expect("exit world");
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(initialized.load(Ordering::SeqCst), 1);
    assert_eq!(shut_down.load(Ordering::SeqCst), 1);
    master.exit(false).expect("master exit");
}

#[test]
fn arena_member_death_releases_membership() {
    let device = Device::new();
    let master = join(&device);
    let slave = join(&device);

    let first = Arena::enter(&master, "core", |_| Ok(()), |_| Ok(())).expect("master enter");
    let _second = Arena::enter(&slave, "core", |_| Ok(()), |_| Ok(())).expect("slave enter");
    assert_eq!(first.members().expect("members"), 2);

    device.kill(0, slave.fusion_id()).expect("kill");
    assert_eq!(first.members().expect("members"), 1);
    first
        .exit(|_, _| Ok(()), None::<fn(&Arena, bool) -> Result<()>>, false)
        .expect("last member shuts down");
    master.exit(false).expect("master exit");
}

#[test]
fn object_survives_until_remote_reference_dies() {
    let device = Device::new();
    let master = join(&device);
    let slave = join(&device);
    let (sender, receiver) = crossbeam_channel::unbounded();
    let pool = ObjectPool::create(&master, "windows", 32, 8, move |object, zombie| {
        let _ = sender.send((object.id(), zombie));
    })
    .expect("pool");

    let object = pool.create_object().expect("object");
    object.activate().expect("activate");

    let remote_pool = ObjectPool::open(&slave, pool.id()).expect("open pool");
    let remote = remote_pool.lookup(object.id()).expect("lookup");
    assert_eq!(remote.state().expect("state"), ObjectState::Active);
    remote.reference().expect("slave reference");

    object.unreference().expect("master unreference");
    master.sync().expect("sync");
    assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(object.ref_stat().expect("stat"), 1);

    device.kill(0, slave.fusion_id()).expect("kill");
    assert_eq!(
        receiver.recv_timeout(Duration::from_secs(5)).expect("destructed"),
        (object.id(), false)
    );
    master.sync().expect("sync");
    assert!(pool.enumerate().expect("enumerate").is_empty());

    pool.destroy().expect("destroy pool");
    master.exit(false).expect("master exit");
}

#[test]
fn only_the_creator_destroys_a_pool() {
    let device = Device::new();
    let master = join(&device);
    let slave = join(&device);
    let pool = ObjectPool::create(&master, "owned", 0, 8, |_, _| {}).expect("pool");

    let remote_pool = ObjectPool::open(&slave, pool.id()).expect("open pool");
    assert!(matches!(remote_pool.destroy(), Err(FusionError::Bug(_))));

    let id = pool.id();
    pool.destroy().expect("destroy pool");
    assert!(matches!(
        ObjectPool::open(&slave, id),
        Err(FusionError::NotFound(_))
    ));
    slave.exit(false).expect("slave exit");
    master.exit(false).expect("master exit");
}
