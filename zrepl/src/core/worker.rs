//! Executes one command against the volume's block store and routes the
//! completion.
//!
//! There is no worker pool: a command runs inline on whichever thread
//! read it off the socket. That per-connection serialization is what
//! keeps completions in request order on the completion queue.

use std::sync::Arc;

use snafu::{ensure, ResultExt, Snafu};

use crate::core::{IoCmd, Volume, VolumeState};
use crate::protocol::{
    IoHeader,
    Opcode,
    RwSubHeader,
    Status,
    FLAG_READ_METADATA,
    FLAG_REBUILD,
    SUB_HEADER_SIZE,
};
use crate::store::StoreError;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum WorkerError {
    #[snafu(display("{}", source))]
    Store { source: StoreError },
    #[snafu(display("write payload truncated at byte {}", at))]
    TruncatedPayload { at: usize },
    #[snafu(display("volume is offline"))]
    VolumeOffline,
    #[snafu(display("opcode {:?} is not executable", opcode))]
    NotExecutable { opcode: Opcode },
}

/// Execute `cmd` and route its completion.
///
/// Returns the command back to the caller exactly when the completion
/// queue did not take ownership of it: rebuild WRITEs are never acked
/// (the downstream driver still owns the buffer and inspects the status
/// itself). `None` means the command was queued for the ack sender or
/// dropped because no sender is alive. Either way the volume reference
/// held by the command is released exactly once, when the command is
/// dropped by its final owner.
pub fn process(mut cmd: IoCmd) -> Option<IoCmd> {
    let volume = Arc::clone(&cmd.volume);
    let rebuild_req = cmd.header.flags & FLAG_REBUILD != 0;

    let result = if volume.state() == VolumeState::Offline {
        Err(WorkerError::VolumeOffline)
    } else {
        execute(&volume, &mut cmd, rebuild_req)
    };

    if let Err(e) = result {
        error!(
            "volume {}: {:?} failed: {}",
            volume.name(),
            cmd.header.opcode,
            e
        );
        cmd.header.status = Status::Failed;
        cmd.header.len = 0;
    } else {
        cmd.header.status = Status::Ok;
    }

    // no acks for writes that are part of a rebuild
    if rebuild_req && cmd.header.opcode == Opcode::Write {
        return Some(cmd);
    }

    let mut ack = volume.ack.lock();
    if !ack.sender_alive {
        // nobody to deliver it; dropping the cmd releases its volume ref
        return None;
    }
    ack.queue.push_back(cmd);
    if ack.waiting {
        volume.ack_cv.notify_one();
    }
    None
}

fn execute(
    volume: &Volume,
    cmd: &mut IoCmd,
    rebuild_req: bool,
) -> Result<(), WorkerError> {
    let read_metadata = cmd.header.flags & FLAG_READ_METADATA != 0;
    // a replica that is still catching up, a rebuild peer, or an explicit
    // request all need the stored io numbers along with the data
    let want_meta = rebuild_req || read_metadata || !volume.is_rebuilt();

    match cmd.header.opcode {
        Opcode::Read => {
            volume.stats().bump_reads();
            execute_read(volume, cmd, want_meta)
        }
        Opcode::Write => {
            volume.stats().bump_writes();
            let header = cmd.header;
            let payload = cmd.buf.as_deref().unwrap_or(&[]);
            submit_writes(volume, &header, payload, rebuild_req)
        }
        Opcode::Sync => {
            volume.stats().bump_syncs();
            volume.store().flush().context(Store)
        }
        // synthetic barrier the scanner queues behind a finished step
        Opcode::RebuildStepDone => Ok(()),
        opcode => NotExecutable {
            opcode,
        }
        .fail(),
    }
}

fn execute_read(
    volume: &Volume,
    cmd: &mut IoCmd,
    want_meta: bool,
) -> Result<(), WorkerError> {
    let offset = cmd.header.offset;
    let buf = match cmd.buf.as_mut() {
        Some(buf) => buf,
        None => {
            return NotExecutable {
                opcode: Opcode::Read,
            }
            .fail()
        }
    };
    if want_meta {
        let runs = volume
            .store()
            .read_with_metadata(offset, buf)
            .context(Store)?;
        cmd.metadata = Some(runs);
    } else {
        volume.store().read(offset, buf).context(Store)?;
    }
    Ok(())
}

/// Apply a WRITE payload: back-to-back `(sub header, data)` chunks, each
/// carrying its own io number. Normally there is a single chunk, but a
/// rebuild peer forwards whatever run structure its metadata had.
fn submit_writes(
    volume: &Volume,
    header: &IoHeader,
    payload: &[u8],
    rebuild: bool,
) -> Result<(), WorkerError> {
    let mut at = 0;
    let mut data_offset = header.offset;
    while at < payload.len() {
        ensure!(
            payload.len() - at >= SUB_HEADER_SIZE,
            TruncatedPayload {
                at
            }
        );
        let sub = RwSubHeader::decode(&payload[at .. at + SUB_HEADER_SIZE]);
        at += SUB_HEADER_SIZE;
        ensure!(
            payload.len() - at >= sub.len as usize,
            TruncatedPayload {
                at
            }
        );
        let chunk = &payload[at .. at + sub.len as usize];
        volume
            .store()
            .write(data_offset, chunk, sub.io_num, rebuild)
            .context(Store)?;
        volume.note_ionum(sub.io_num);
        at += sub.len as usize;
        data_offset += sub.len;
    }
    Ok(())
}
