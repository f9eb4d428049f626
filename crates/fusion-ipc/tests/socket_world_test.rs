//! Worlds on the shared-file backend, joined twice from one process.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fusion_ipc::{
    CallFlags, CallHandlerResult, FusionCall, FusionError, FusionId, FusionRef, Host,
    ReactionResult, Reactor, Role, SharedPtr, Skirmish, World, WorldConfig,
};

fn config(root: &Path) -> WorldConfig {
    WorldConfig::socket(root)
        .with_index(0)
        .with_liveness_interval(20)
}

fn join(root: &Path) -> World {
    Host::new()
        .enter(config(root))
        .expect("Failed to join world")
}

#[test]
fn master_and_slave_share_primitives() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let master = join(dir.path());
    let slave = join(dir.path());
    assert!(master.is_master());
    assert!(!slave.is_master());
    assert_eq!(master.header(), slave.header());
    assert_eq!(
        master.fusionees().expect("fusionees"),
        vec![FusionId::MASTER, slave.fusion_id()]
    );

    let lock = Skirmish::new(&master, "shared").expect("skirmish");
    let remote_lock = Skirmish::open(&slave, lock.id());
    {
        let _guard = lock.lock().expect("lock");
        assert!(matches!(remote_lock.try_acquire(), Err(FusionError::Busy)));
    }
    remote_lock.acquire().expect("acquire after release");
    remote_lock.release().expect("release");

    let reference = FusionRef::init(&master).expect("ref");
    let remote_ref = FusionRef::open(&slave, reference.id()).expect("open ref");
    remote_ref.up(false).expect("up");
    reference.up(true).expect("global up");
    assert_eq!(reference.stat().expect("stat"), 2);
    remote_ref.down(false).expect("down");
    reference.down(true).expect("global down");

    slave.exit(false).expect("slave exit");
    master.exit(false).expect("master exit");
}

#[test]
fn calls_and_reactors_cross_the_socket() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let master = join(dir.path());
    let slave = join(dir.path());

    let double = FusionCall::init(&slave, |ctx| CallHandlerResult::Return(ctx.arg * 2))
        .expect("call");
    let remote = FusionCall::open(&master, double.id()).expect("open call");
    assert_eq!(
        remote
            .execute(CallFlags::NONE, 21, SharedPtr::NULL)
            .expect("execute"),
        42
    );

    let reactor = Reactor::new(&master, 8).expect("reactor");
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let remote_reactor = Reactor::open(&slave, reactor.id()).expect("open reactor");
    let _reaction = remote_reactor
        .attach(0, move |message| {
            assert_eq!(message.data, b"ping");
            counter.fetch_add(1, Ordering::SeqCst);
            ReactionResult::Ok
        })
        .expect("attach");
    reactor.dispatch(0, b"ping", false, &[]).expect("dispatch");
    master.sync().expect("sync");
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    slave.exit(false).expect("slave exit");
    master.exit(false).expect("master exit");
}

#[test]
fn slave_role_needs_a_live_world() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    assert!(Host::new()
        .enter(config(dir.path()).with_role(Role::Slave))
        .is_err());

    let master = join(dir.path());
    let slave = Host::new()
        .enter(config(dir.path()).with_role(Role::Slave))
        .expect("slave join");
    assert!(!slave.is_master());
    assert!(matches!(
        Host::new().enter(config(dir.path()).with_role(Role::Master)),
        Err(FusionError::Busy | FusionError::InvalidArgument(_))
    ));

    slave.exit(false).expect("slave exit");
    master.exit(false).expect("master exit");
}
