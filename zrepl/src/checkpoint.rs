//! Checkpoint timer: one process-wide thread that periodically persists
//! each healthy volume's io sequence marker through the block store.
//!
//! A tick persists the *previous* in-memory checkpoint and only then
//! captures the running io number as the next one, so a crash between
//! capture and persist can never leave the in-memory checkpoint ahead of
//! what disk reflects.

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::core::{registry, Volume, VolumeStatus};
use crate::subsys::Config;

struct Timer {
    mtx: Mutex<()>,
    cv: Condvar,
}

static TIMER: Lazy<Timer> = Lazy::new(|| Timer {
    mtx: Mutex::new(()),
    cv: Condvar::new(),
});

/// Start the timer thread. Safe to call more than once; only the first
/// call spawns.
pub fn start() {
    static STARTED: Once = Once::new();
    STARTED.call_once(|| {
        let spawned = thread::Builder::new()
            .name("ionum-timer".into())
            .spawn(run);
        if let Err(e) = spawned {
            error!("failed to spawn checkpoint timer thread: {}", e);
        }
    });
}

fn run() {
    // intervals are re-examined at least this often, whatever the
    // per-volume settings say
    let scan_ceiling =
        Duration::from_secs(Config::get().checkpoint_scan_ceiling);
    info!(
        "checkpoint timer started, scan ceiling {:?}",
        scan_ceiling
    );
    let mut guard = TIMER.mtx.lock();
    loop {
        let mut wait = scan_ceiling;
        let now = Instant::now();

        for volume in registry::snapshot() {
            if volume.status() != VolumeStatus::Healthy {
                continue;
            }
            let (time, interval) = volume.checkpoint_mark();
            let mut next_check = time + interval;
            if next_check <= now {
                if persist(&volume) {
                    volume.advance_checkpoint(now);
                    next_check = now + interval;
                }
                // on a persist failure the stale mark stays put and the
                // volume is retried on the next tick
            }
            if next_check > now {
                wait = wait.min(next_check - now);
            }
        }

        TIMER.cv.wait_for(&mut guard, wait);
    }
}

fn persist(volume: &Volume) -> bool {
    let ionum = volume.checkpointed_ionum();
    debug!(
        "checkpointing io number {} on volume {}",
        ionum,
        volume.name()
    );
    match volume.store().store_last_committed_io_num(ionum) {
        Ok(()) => true,
        Err(e) => {
            error!(
                "failed to persist io number {} for volume {}: {}",
                ionum,
                volume.name(),
                e
            );
            false
        }
    }
}

/// Change a volume's checkpoint interval and wake the timer so it can
/// adjust to the new value. A zero timeout leaves the interval alone and
/// just wakes the timer, which is how a finished rebuild nudges it.
pub fn update_ionum_interval(volume: &Volume, timeout: Duration) {
    let _guard = TIMER.mtx.lock();
    {
        let mut mark = volume.checkpoint_lock();
        if mark.interval == timeout {
            return;
        }
        if timeout != Duration::ZERO {
            mark.interval = timeout;
        }
    }
    TIMER.cv.notify_one();
}
