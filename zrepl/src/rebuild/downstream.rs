//! Downstream side of a rebuild: the degraded replica pulling data.
//!
//! One driver per healthy peer. The driver walks the volume in
//! `step_size` ranges; for each range the peer streams back the regions
//! written after our checkpoint as READ frames, which are rewritten into
//! rebuild WRITEs and applied synchronously through the worker. The
//! terminal bookkeeping is shared across drivers of the same volume:
//! only when the last one finishes is the volume promoted or failed.

use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::FromRawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::socket::{
    connect,
    shutdown,
    socket,
    AddressFamily,
    InetAddr,
    Shutdown,
    SockAddr,
    SockFlag,
    SockType,
};
use snafu::{ensure, ResultExt};

use super::{
    set_discard_linger,
    Checkpoint,
    Connect,
    PeerStatus,
    Poisoned,
    RebuildError,
    SocketSetup,
    UnexpectedOpcode,
    Wire,
    WriteFailed,
};
use crate::checkpoint;
use crate::core::{worker, IoCmd, RebuildState, Volume, VolumeStatus};
use crate::protocol::{self, IoHeader, Opcode, Status, FLAG_REBUILD};

/// One outbound rebuild session against one healthy peer.
pub struct DownstreamRebuild {
    peer: SocketAddr,
    volume: Arc<Volume>,
    step_size: u64,
}

impl DownstreamRebuild {
    pub fn new(peer: SocketAddr, volume: Arc<Volume>, step_size: u64) -> Self {
        Self {
            peer,
            volume,
            step_size,
        }
    }

    /// Run the session on a detached thread. The caller must have armed
    /// the volume's rebuild counters with
    /// [`Volume::begin_rebuild`](crate::core::Volume::begin_rebuild).
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("rebuild-dw".into())
            .spawn(move || self.run())
    }

    /// Pull every step, then settle the volume-wide rebuild bookkeeping.
    pub fn run(self) {
        let outcome = self.pull();
        self.settle(outcome);
    }

    fn pull(&self) -> Result<(), RebuildError> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .context(SocketSetup)?;
        // the stream owns the fd from here and closes it on any exit
        let _stream = unsafe { TcpStream::from_raw_fd(fd) };
        set_discard_linger(fd).context(SocketSetup)?;
        connect(fd, &SockAddr::new_inet(InetAddr::from_std(&self.peer)))
            .context(Connect {
                peer: self.peer,
            })?;

        let ckpt = self
            .volume
            .store()
            .last_committed_io_num()
            .context(Checkpoint)?;
        let size = self.volume.size();

        let mut handshake = IoHeader::new(Opcode::Handshake);
        handshake.len = self.volume.name().len() as u64 + 1;
        protocol::write_header(fd, &handshake).context(Wire)?;
        let mut name = self.volume.name().as_bytes().to_vec();
        name.push(0);
        protocol::write_exact(fd, &name).context(Wire)?;

        info!(
            "rebuilding volume {} from {}: size {}, checkpoint {}, step {}",
            self.volume.name(),
            self.peer,
            size,
            ckpt,
            self.step_size
        );

        let mut offset = 0;
        loop {
            self.bail_if_poisoned()?;

            if offset >= size {
                let done = IoHeader::new(Opcode::RebuildComplete);
                if let Err(e) = protocol::write_header(fd, &done) {
                    // the data itself is already applied; a torn final
                    // frame still counts as success with this peer
                    warn!(
                        "rebuild of volume {}: REBUILD_COMPLETE write \
                         failed ({}), counting as success with this peer",
                        self.volume.name(),
                        e
                    );
                } else {
                    info!(
                        "rebuilding volume {} completed",
                        self.volume.name()
                    );
                }
                let _ = shutdown(fd, Shutdown::Both);
                return Ok(());
            }

            let mut step = IoHeader::new(Opcode::RebuildStep);
            step.checkpointed_io_seq = ckpt;
            step.offset = offset;
            step.len = self.step_size.min(size - offset);
            protocol::write_header(fd, &step).context(Wire)?;

            self.apply_step(fd)?;
            offset += self.step_size;
        }
    }

    /// Consume one step's worth of inbound frames, applying each region
    /// until the peer signals the step is done.
    fn apply_step(&self, fd: std::os::unix::io::RawFd) -> Result<(), RebuildError> {
        loop {
            self.bail_if_poisoned()?;

            let mut header = protocol::read_header(fd).context(Wire)?;
            ensure!(
                header.status == Status::Ok,
                PeerStatus {
                    opcode: header.opcode
                }
            );
            if header.opcode == Opcode::RebuildStepDone {
                debug!(
                    "volume {}: rebuild step done",
                    self.volume.name()
                );
                return Ok(());
            }
            ensure!(
                header.opcode == Opcode::Read
                    && header.flags & FLAG_REBUILD != 0,
                UnexpectedOpcode {
                    opcode: header.opcode
                }
            );

            // repackage the peer's read as a rebuild write against our
            // own store; the chunked payload carries its own io numbers
            header.opcode = Opcode::Write;
            let mut cmd = IoCmd::new(header, fd, self.volume.clone());
            if let Some(buf) = cmd.buf.as_mut() {
                protocol::read_exact(fd, buf).context(Wire)?;
            }
            let status = match worker::process(cmd) {
                Some(cmd) => cmd.header.status,
                // rebuild writes always come back; treat anything else
                // as applied
                None => Status::Ok,
            };
            ensure!(
                status == Status::Ok,
                WriteFailed {
                    volume: self.volume.name().to_string()
                }
            );
        }
    }

    fn bail_if_poisoned(&self) -> Result<(), RebuildError> {
        ensure!(
            self.volume.rebuild_state() != RebuildState::Errored,
            Poisoned {
                volume: self.volume.name().to_string()
            }
        );
        Ok(())
    }

    /// Volume-wide terminal bookkeeping, shared by all drivers of the
    /// volume. The last driver out decides: any failure poisons the
    /// whole rebuild, a clean sweep promotes the replica to healthy and
    /// kicks the checkpoint timer awake.
    fn settle(&self, outcome: Result<(), RebuildError>) {
        let mut rb = self.volume.rebuild_lock();
        if let Err(e) = &outcome {
            error!(
                "rebuild session for volume {} failed: {}",
                self.volume.name(),
                e
            );
            rb.state = RebuildState::Errored;
            rb.failed_cnt += 1;
        }
        rb.done_cnt += 1;
        if rb.done_cnt != rb.cnt {
            return;
        }

        let terminal = if rb.failed_cnt != 0 {
            RebuildState::Failed
        } else {
            RebuildState::Done
        };
        info!(
            "volume {}: rebuild state {} -> {}",
            self.volume.name(),
            rb.state,
            terminal
        );
        rb.state = terminal;

        if terminal == RebuildState::Done {
            self.volume.set_status(VolumeStatus::Healthy);
            // zero timeout: leave the interval alone, just wake the timer
            checkpoint::update_ionum_interval(&self.volume, Duration::ZERO);
        }
        self.volume.notify_rebuild(terminal);
    }
}
