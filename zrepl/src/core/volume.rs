use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::core::IoCmd;
use crate::store::BlockStore;
use crate::subsys::Config;

/// Whether the volume is accepting I/O at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Online,
    Offline,
}

/// Replica health as the target sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStatus {
    Degraded,
    Healthy,
}

/// Allowed states for a volume rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildState {
    /// No rebuild has been started on this volume yet.
    Init,
    /// One or more downstream sessions are pulling data.
    InProgress,
    /// Every session finished clean; the volume is promoted to healthy.
    Done,
    /// A session hit an error; remaining sessions abort at their next
    /// step boundary.
    Errored,
    /// All sessions finished but at least one had failed.
    Failed,
}

impl RebuildState {
    /// True once the rebuild reached a terminal state.
    pub fn done(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Failed)
    }
}

impl fmt::Display for RebuildState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RebuildState::Init => write!(f, "init"),
            RebuildState::InProgress => write!(f, "in_progress"),
            RebuildState::Done => write!(f, "done"),
            RebuildState::Errored => write!(f, "errored"),
            RebuildState::Failed => write!(f, "failed"),
        }
    }
}

/// Rebuild progress counters, one slot per downstream peer session.
#[derive(Debug)]
pub struct RebuildInfo {
    pub state: RebuildState,
    pub cnt: u64,
    pub done_cnt: u64,
    pub failed_cnt: u64,
}

/// Everything guarded by the per-volume ack lock.
pub(crate) struct AckState {
    pub queue: VecDeque<IoCmd>,
    pub waiting: bool,
    pub sender_alive: bool,
    /// Fd the ack sender is currently writing a response to.
    pub in_flight: Option<RawFd>,
}

pub(crate) struct CheckpointMark {
    pub time: Instant,
    pub interval: Duration,
}

/// Per-volume request counters.
#[derive(Debug, Default)]
pub struct IoStats {
    read_count: AtomicU64,
    write_count: AtomicU64,
    sync_count: AtomicU64,
}

impl IoStats {
    pub fn reads(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn syncs(&self) -> u64 {
        self.sync_count.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_reads(&self) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_writes(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_syncs(&self) {
        self.sync_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// One replicated volume: the block-store handle plus every piece of
/// state the data plane tracks for it.
///
/// Shared ownership is the refcount: components take a reference by
/// cloning the `Arc` and release it by dropping their clone.
pub struct Volume {
    name: String,
    store: Arc<dyn BlockStore>,
    state: Mutex<VolumeState>,
    status: Mutex<VolumeStatus>,
    rebuild: Mutex<RebuildInfo>,
    rebuild_notify: (Sender<RebuildState>, Receiver<RebuildState>),
    /// Highest io number any write on this volume has carried.
    running_ionum: AtomicU64,
    /// Io number captured at the last checkpoint tick.
    checkpointed_ionum: AtomicU64,
    checkpoint: Mutex<CheckpointMark>,
    pub(crate) ack: Mutex<AckState>,
    pub(crate) ack_cv: Condvar,
    pub(crate) in_flight_cv: Condvar,
    stats: IoStats,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .field("status", &*self.status.lock())
            .field("rebuild", &self.rebuild.lock().state)
            .finish()
    }
}

impl Volume {
    pub fn new(name: impl Into<String>, store: Arc<dyn BlockStore>) -> Arc<Self> {
        let name = name.into();
        let committed = match store.last_committed_io_num() {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    "volume {}: could not read last committed io number: {}",
                    name, e
                );
                0
            }
        };
        Arc::new(Self {
            name,
            store,
            state: Mutex::new(VolumeState::Online),
            status: Mutex::new(VolumeStatus::Degraded),
            rebuild: Mutex::new(RebuildInfo {
                state: RebuildState::Init,
                cnt: 0,
                done_cnt: 0,
                failed_cnt: 0,
            }),
            rebuild_notify: unbounded(),
            running_ionum: AtomicU64::new(committed),
            checkpointed_ionum: AtomicU64::new(committed),
            checkpoint: Mutex::new(CheckpointMark {
                time: Instant::now(),
                interval: Duration::from_secs(
                    Config::get().checkpoint_interval,
                ),
            }),
            ack: Mutex::new(AckState {
                queue: VecDeque::new(),
                waiting: false,
                sender_alive: false,
                in_flight: None,
            }),
            ack_cv: Condvar::new(),
            in_flight_cv: Condvar::new(),
            stats: IoStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &dyn BlockStore {
        &*self.store
    }

    pub fn size(&self) -> u64 {
        self.store.size()
    }

    pub fn state(&self) -> VolumeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: VolumeState) {
        let mut cur = self.state.lock();
        if *cur != state {
            info!("volume {}: {:?} -> {:?}", self.name, *cur, state);
            *cur = state;
        }
    }

    pub fn status(&self) -> VolumeStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: VolumeStatus) {
        let mut cur = self.status.lock();
        if *cur != status {
            info!("volume {}: {:?} -> {:?}", self.name, *cur, status);
            *cur = status;
        }
    }

    pub fn rebuild_state(&self) -> RebuildState {
        self.rebuild.lock().state
    }

    pub fn set_rebuild_state(&self, state: RebuildState) {
        let mut rb = self.rebuild.lock();
        if rb.state != state {
            info!(
                "volume {}: rebuild state {} -> {}",
                self.name, rb.state, state
            );
            rb.state = state;
        }
    }

    /// True once this replica has fully caught up; reads no longer need
    /// to fetch metadata unless a peer asks for it.
    pub fn is_rebuilt(&self) -> bool {
        matches!(self.rebuild.lock().state, RebuildState::Done)
    }

    /// Arm the rebuild counters for `peer_cnt` downstream sessions.
    pub fn begin_rebuild(&self, peer_cnt: u64) {
        let mut rb = self.rebuild.lock();
        info!(
            "volume {}: rebuild starting with {} peer(s), state {} -> {}",
            self.name,
            peer_cnt,
            rb.state,
            RebuildState::InProgress
        );
        rb.state = RebuildState::InProgress;
        rb.cnt = peer_cnt;
        rb.done_cnt = 0;
        rb.failed_cnt = 0;
    }

    pub(crate) fn rebuild_lock(&self) -> MutexGuard<RebuildInfo> {
        self.rebuild.lock()
    }

    /// Push a terminal rebuild state to anyone listening.
    pub(crate) fn notify_rebuild(&self, state: RebuildState) {
        if let Err(e) = self.rebuild_notify.0.send(state) {
            error!(
                "volume {}: failed to send rebuild notification: {}",
                self.name, e
            );
        }
    }

    /// Channel on which terminal rebuild states are published.
    pub fn rebuild_notify_channel(&self) -> Receiver<RebuildState> {
        self.rebuild_notify.1.clone()
    }

    pub fn running_ionum(&self) -> u64 {
        self.running_ionum.load(Ordering::SeqCst)
    }

    /// Fold `io_num` into the running maximum. Concurrent writers race
    /// here, which is why this is an atomic max rather than a store.
    pub fn note_ionum(&self, io_num: u64) {
        self.running_ionum.fetch_max(io_num, Ordering::SeqCst);
    }

    pub fn checkpointed_ionum(&self) -> u64 {
        self.checkpointed_ionum.load(Ordering::SeqCst)
    }

    pub fn checkpoint_mark(&self) -> (Instant, Duration) {
        let mark = self.checkpoint.lock();
        (mark.time, mark.interval)
    }

    pub(crate) fn checkpoint_lock(&self) -> MutexGuard<CheckpointMark> {
        self.checkpoint.lock()
    }

    /// Capture the running io number as the new in-memory checkpoint.
    /// Only called after the previous value was persisted, so a crash in
    /// between never advances memory past what disk reflects.
    pub(crate) fn advance_checkpoint(&self, now: Instant) {
        self.checkpointed_ionum
            .store(self.running_ionum.load(Ordering::SeqCst), Ordering::SeqCst);
        self.checkpoint.lock().time = now;
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Drop every queued completion destined for `fd` and wait out any
    /// response the ack sender is currently writing to it. After this
    /// returns the fd can be closed without racing the ack sender.
    pub fn purge_pending(&self, fd: RawFd) {
        let mut ack = self.ack.lock();
        let before = ack.queue.len();
        ack.queue.retain(|cmd| cmd.conn_fd != fd);
        let purged = before - ack.queue.len();
        if purged > 0 {
            debug!(
                "volume {}: purged {} pending completion(s) for fd {}",
                self.name, purged, fd
            );
        }
        while ack.in_flight == Some(fd) {
            self.in_flight_cv.wait(&mut ack);
        }
    }
}
