//! Per-volume ack sender.
//!
//! Drains the volume's completion queue and writes each response to the
//! socket the command arrived on. Commands from every connection of the
//! volume (client IO and rebuild scanners alike) funnel through the one
//! queue, which is why each command carries its own destination fd.

use std::sync::Arc;
use std::thread;

use crate::core::{IoCmd, Volume};
use crate::protocol::{
    self,
    Opcode,
    ProtocolError,
    RwSubHeader,
    Status,
    SUB_HEADER_SIZE,
};

/// Start the ack sender for `volume` unless one is already alive.
pub fn start(volume: &Arc<Volume>) {
    {
        let mut ack = volume.ack.lock();
        if ack.sender_alive {
            return;
        }
        ack.sender_alive = true;
    }
    let spawned = {
        let volume = volume.clone();
        thread::Builder::new()
            .name("ack-sender".into())
            .spawn(move || run(volume))
    };
    if let Err(e) = spawned {
        error!("failed to spawn ack sender thread: {}", e);
        volume.ack.lock().sender_alive = false;
    }
}

/// Tell the volume's ack sender to exit. Queued completions are dropped
/// by the sender on its way out; future completions are freed by the
/// worker instead of enqueued.
pub fn stop(volume: &Volume) {
    let mut ack = volume.ack.lock();
    if !ack.sender_alive {
        return;
    }
    ack.sender_alive = false;
    volume.ack_cv.notify_one();
}

fn run(volume: Arc<Volume>) {
    info!("ack sender for volume {} started", volume.name());
    loop {
        let cmd = {
            let mut ack = volume.ack.lock();
            loop {
                if !ack.sender_alive {
                    let dropped = ack.queue.len();
                    ack.queue.clear();
                    if dropped > 0 {
                        debug!(
                            "ack sender for volume {} dropped {} queued \
                             completion(s) on exit",
                            volume.name(),
                            dropped
                        );
                    }
                    info!("ack sender for volume {} exiting", volume.name());
                    return;
                }
                if let Some(cmd) = ack.queue.pop_front() {
                    ack.in_flight = Some(cmd.conn_fd);
                    break cmd;
                }
                ack.waiting = true;
                volume.ack_cv.wait(&mut ack);
                ack.waiting = false;
            }
        };

        let result = send_response(&cmd);

        let mut ack = volume.ack.lock();
        ack.in_flight = None;
        volume.in_flight_cv.notify_all();
        if let Err(e) = result {
            error!(
                "ack sender for volume {} failed writing to fd {}: {}",
                volume.name(),
                cmd.conn_fd,
                e
            );
            ack.sender_alive = false;
            ack.queue.clear();
            return;
        }
    }
}

/// Write one response. READ completions that carry metadata are framed
/// as `(sub header, data)` chunks so the payload is directly usable as a
/// WRITE by a rebuild downstream; the header length is fixed up to cover
/// the sub headers before it goes out.
fn send_response(cmd: &IoCmd) -> Result<(), ProtocolError> {
    let fd = cmd.conn_fd;
    let mut header = cmd.header;

    if cmd.header.opcode != Opcode::Read || header.status != Status::Ok {
        return protocol::write_header(fd, &header);
    }

    let data = cmd.buf.as_deref().unwrap_or(&[]);
    match cmd.metadata.as_deref() {
        Some(runs) => {
            header.len =
                data.len() as u64 + (runs.len() * SUB_HEADER_SIZE) as u64;
            protocol::write_header(fd, &header)?;
            let mut at = 0;
            for run in runs {
                let end = (at + run.len as usize).min(data.len());
                let sub = RwSubHeader {
                    io_num: run.io_num,
                    len: (end - at) as u64,
                };
                protocol::write_exact(fd, &sub.encode())?;
                protocol::write_exact(fd, &data[at .. end])?;
                at = end;
            }
            Ok(())
        }
        None => {
            protocol::write_header(fd, &header)?;
            protocol::write_exact(fd, data)
        }
    }
}
