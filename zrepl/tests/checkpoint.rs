//! Checkpoint timer behavior: persist-then-advance of the io sequence
//! marker and interval updates waking the timer.

use std::time::Duration;

use zrepl::checkpoint;
use zrepl::core::VolumeStatus;

pub mod common;
use common::{mem_volume, wait_for};

const MIB: u64 = 1024 * 1024;

#[test]
fn healthy_volume_gets_its_ionum_persisted() {
    common::init_logging();
    checkpoint::start();

    let volume = mem_volume("ckpt-persist", MIB);
    volume.store().write(0, &[1u8; 512], 42, false).unwrap();
    volume.note_ionum(42);

    // nothing happens while the volume is degraded
    checkpoint::update_ionum_interval(&volume, Duration::from_millis(50));
    assert!(!wait_for(Duration::from_millis(300), || {
        volume.store().last_committed_io_num().unwrap() != 0
    }));

    volume.set_status(VolumeStatus::Healthy);
    // zero timeout: wake the timer without touching the interval
    checkpoint::update_ionum_interval(&volume, Duration::ZERO);

    // first due tick persists the stale marker and captures 42; the next
    // persists 42 itself. memory never runs ahead of disk.
    assert!(wait_for(Duration::from_secs(5), || {
        volume.store().last_committed_io_num().unwrap() == 42
    }));
    assert_eq!(volume.checkpointed_ionum(), 42);
    assert!(
        volume.store().last_committed_io_num().unwrap()
            <= volume.running_ionum()
    );
}

#[test]
fn later_writes_follow_into_the_checkpoint() {
    common::init_logging();
    checkpoint::start();

    let volume = mem_volume("ckpt-follow", MIB);
    volume.set_status(VolumeStatus::Healthy);
    checkpoint::update_ionum_interval(&volume, Duration::from_millis(50));

    volume.note_ionum(7);
    assert!(wait_for(Duration::from_secs(5), || {
        volume.store().last_committed_io_num().unwrap() == 7
    }));

    volume.note_ionum(19);
    assert!(wait_for(Duration::from_secs(5), || {
        volume.store().last_committed_io_num().unwrap() == 19
    }));
    assert_eq!(volume.checkpointed_ionum(), 19);
}
