//! Scanner side of a rebuild: the healthy replica serving diffs.
//!
//! One detached thread per inbound rebuild connection. After the
//! handshake names the volume, every REBUILD_STEP walks the metadata
//! diff for the requested range and replays each qualifying region as a
//! synthetic READ through the regular worker; the completions stream
//! back to the peer via the volume's ack sender over this same socket,
//! followed by a REBUILD_STEP_DONE barrier so the peer knows the step
//! is fully acked.

use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::sys::socket::{shutdown, Shutdown};
use snafu::{ensure, ResultExt};

use super::{
    set_discard_linger,
    BadName,
    DiffWalk,
    DoubleHandshake,
    RebuildError,
    UnexpectedOpcode,
    VolumeNotFound,
    VolumeOffline,
    Wire,
};
use crate::core::{registry, worker, IoCmd, Volume, VolumeState};
use crate::protocol::{
    self,
    IoHeader,
    Opcode,
    FLAG_REBUILD,
    MAX_NAME_LEN,
};
use crate::store::StoreError;

pub fn serve(stream: TcpStream) {
    let fd = stream.as_raw_fd();
    if let Err(e) = set_discard_linger(fd) {
        error!("setsockopt failed on rebuild fd {}: {}", fd, e);
        return;
    }

    let mut volume: Option<Arc<Volume>> = None;
    if let Err(e) = scan(fd, &mut volume) {
        error!("rebuild connection on fd {}: {}", fd, e);
    }

    if let Some(volume) = &volume {
        info!(
            "closing rebuild connection for volume {}",
            volume.name()
        );
        volume.purge_pending(fd);
    } else {
        info!("closing rebuild connection on fd {}", fd);
    }
    if let Err(e) = shutdown(fd, Shutdown::Both) {
        debug!("shutdown of fd {} failed: {}", fd, e);
    }
}

fn scan(
    fd: RawFd,
    volume: &mut Option<Arc<Volume>>,
) -> Result<(), RebuildError> {
    loop {
        let header = protocol::read_header(fd).context(Wire)?;
        if let Some(vol) = volume.as_ref() {
            ensure!(
                vol.state() != VolumeState::Offline,
                VolumeOffline {
                    volume: vol.name().to_string()
                }
            );
        }
        debug!(
            "rebuild fd {}: opcode {:?} io_seq {}",
            fd, header.opcode, header.io_seq
        );

        match header.opcode {
            Opcode::Handshake => {
                let opened = handshake(fd, &header, volume.as_ref())?;
                *volume = Some(opened);
            }
            Opcode::RebuildStep => match volume.as_ref() {
                Some(vol) => serve_step(fd, vol, &header)?,
                // a step before the handshake is a protocol violation
                None => {
                    return UnexpectedOpcode {
                        opcode: header.opcode,
                    }
                    .fail()
                }
            },
            Opcode::RebuildComplete => {
                match volume.as_ref() {
                    Some(vol) => info!(
                        "rebuild process is over on volume {}",
                        vol.name()
                    ),
                    None => info!("rebuild process is over on fd {}", fd),
                }
                return Ok(());
            }
            opcode => {
                return UnexpectedOpcode {
                    opcode,
                }
                .fail()
            }
        }
    }
}

/// First message of the session: resolve the peer's volume by name and
/// take a reference on it for the life of the connection. A second
/// handshake is a protocol violation and drops the connection.
fn handshake(
    fd: RawFd,
    header: &IoHeader,
    current: Option<&Arc<Volume>>,
) -> Result<Arc<Volume>, RebuildError> {
    ensure!(header.len > 0 && header.len <= MAX_NAME_LEN, BadName);
    let mut payload = vec![0u8; header.len as usize];
    protocol::read_exact(fd, &mut payload).context(Wire)?;
    let name = match protocol::volume_name(&payload) {
        Some(name) => name,
        None => return BadName.fail(),
    };

    if let Some(vol) = current {
        error!(
            "second handshake (for {}) on rebuild connection of volume {}",
            name,
            vol.name()
        );
        return DoubleHandshake {
            volume: vol.name().to_string(),
        }
        .fail();
    }

    match registry::lookup(&name) {
        Some(volume) => {
            info!("rebuild scanner started on volume {}", name);
            Ok(volume)
        }
        None => VolumeNotFound {
            name,
        }
        .fail(),
    }
}

/// Serve one requested range: replay each region whose stored io number
/// is newer than the peer's checkpoint, then queue the step barrier.
fn serve_step(
    fd: RawFd,
    volume: &Arc<Volume>,
    request: &IoHeader,
) -> Result<(), RebuildError> {
    info!(
        "volume {}: rebuild step, checkpointed io_seq {}, offset {}, len {}",
        volume.name(),
        request.checkpointed_io_seq,
        request.offset,
        request.len
    );

    volume
        .store()
        .diff(
            request.checkpointed_io_seq,
            request.offset,
            request.len,
            &mut |offset, len, io_num| {
                if volume.state() == VolumeState::Offline {
                    return Err(StoreError::WalkAborted {
                        reason: format!(
                            "volume {} went offline",
                            volume.name()
                        ),
                    });
                }
                debug!("io number for rebuild {}", io_num);

                let mut header = IoHeader::new(Opcode::Read);
                header.flags = FLAG_REBUILD;
                header.io_seq = io_num;
                header.offset = offset;
                header.len = len;
                // any failure inside the worker travels to the degraded
                // peer as a FAILED completion; the peer then drops the
                // connection
                worker::process(IoCmd::new(header, fd, volume.clone()));
                Ok(())
            },
        )
        .context(DiffWalk)?;

    let barrier = IoHeader::new(Opcode::RebuildStepDone);
    worker::process(IoCmd::new(barrier, fd, volume.clone()));
    Ok(())
}
