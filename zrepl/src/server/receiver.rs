//! Per-connection client IO receiver.
//!
//! One detached thread per accepted IO connection. The first command must
//! be an OPEN naming the volume; after that the receiver reads headers,
//! allocates commands and runs the worker inline. Responses travel back
//! through the volume's ack sender, except the OPEN ack which is written
//! directly because the sender may not exist yet.

use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::sys::socket::{shutdown, Shutdown};

use crate::core::{registry, worker, IoCmd, Volume, VolumeState};
use crate::protocol::{
    self,
    IoHeader,
    Opcode,
    ProtocolError,
    Status,
    MAX_NAME_LEN,
};
use crate::server::ack;

pub fn serve(stream: TcpStream) {
    let fd = stream.as_raw_fd();
    let mut volume: Option<Arc<Volume>> = None;

    receive(fd, &mut volume);

    if let Some(volume) = &volume {
        info!(
            "closing IO connection on fd {} for volume {}",
            fd,
            volume.name()
        );
        volume.purge_pending(fd);
        ack::stop(volume);
    } else {
        info!("closing IO connection on fd {}", fd);
    }
    if let Err(e) = shutdown(fd, Shutdown::Both) {
        debug!("shutdown of fd {} failed: {}", fd, e);
    }
    // dropping the stream closes the fd
}

fn receive(fd: RawFd, volume: &mut Option<Arc<Volume>>) {
    loop {
        let header = match protocol::read_header(fd) {
            Ok(header) => header,
            Err(e @ ProtocolError::BadVersion { .. }) => {
                // drop the connection without writing anything back
                error!("IO connection on fd {}: {}", fd, e);
                return;
            }
            Err(e) => {
                info!("IO connection on fd {}: {}", fd, e);
                return;
            }
        };

        match (header.opcode, volume.as_ref()) {
            (Opcode::Open, None) => match open_volume(fd, &header) {
                Ok(opened) => *volume = Some(opened),
                Err(()) => return,
            },
            (Opcode::Read, Some(vol))
            | (Opcode::Write, Some(vol))
            | (Opcode::Sync, Some(vol)) => {
                if dispatch(fd, header, vol.clone()).is_err() {
                    return;
                }
            }
            (opcode, _) => {
                error!(
                    "unexpected opcode {:?} on IO connection fd {}",
                    opcode, fd
                );
                return;
            }
        }
    }
}

/// Handle the OPEN that starts every IO connection: resolve the volume
/// named in the payload, bring up its ack sender and ack the open
/// directly on the socket.
fn open_volume(fd: RawFd, header: &IoHeader) -> Result<Arc<Volume>, ()> {
    let mut response = *header;
    response.len = 0;

    if header.len == 0 || header.len > MAX_NAME_LEN {
        error!("OPEN with unreasonable name length {}", header.len);
        return Err(());
    }
    let mut payload = vec![0u8; header.len as usize];
    if let Err(e) = protocol::read_exact(fd, &mut payload) {
        error!("failed to read OPEN payload: {}", e);
        return Err(());
    }

    let volume = protocol::volume_name(&payload)
        .and_then(|name| registry::lookup(&name));
    match volume {
        Some(volume) => {
            info!("volume {} opened on fd {}", volume.name(), fd);
            // a client re-opening the volume brings it back into service
            volume.set_state(VolumeState::Online);
            ack::start(&volume);
            response.status = Status::Ok;
            match protocol::write_header(fd, &response) {
                Ok(()) => Ok(volume),
                Err(e) => {
                    error!("failed to ack OPEN: {}", e);
                    ack::stop(&volume);
                    Err(())
                }
            }
        }
        None => {
            error!("OPEN for unknown volume on fd {}", fd);
            response.status = Status::Failed;
            let _ = protocol::write_header(fd, &response);
            Err(())
        }
    }
}

/// Read the payload if the opcode has one, then run the worker inline on
/// this thread. Only a transport failure tears the connection down;
/// command failures are reported through the completion queue.
fn dispatch(
    fd: RawFd,
    header: IoHeader,
    volume: Arc<Volume>,
) -> Result<(), ()> {
    let mut cmd = IoCmd::new(header, fd, volume);
    if header.opcode == Opcode::Write {
        if let Some(buf) = cmd.buf.as_mut() {
            if let Err(e) = protocol::read_exact(fd, buf) {
                info!("failed to read WRITE payload on fd {}: {}", fd, e);
                return Err(());
            }
        }
    }
    // a client is not expected to send rebuild-flagged writes; if it
    // does, the suppressed ack comes back here and is simply dropped
    worker::process(cmd);
    Ok(())
}
