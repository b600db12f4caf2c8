use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::core::Volume;
use crate::protocol::{IoHeader, Opcode};
use crate::store::MetaRun;

/// One in-flight command travelling the receiver → worker → completion
/// queue → ack sender pipeline.
///
/// The embedded `Arc<Volume>` is the refcount the dispatcher takes on the
/// target volume; it is released exactly once, when the command is
/// dropped by whichever component consumes it last.
pub struct IoCmd {
    pub header: IoHeader,
    /// Payload buffer, present for the opcodes that carry one.
    pub buf: Option<Vec<u8>>,
    /// Metadata runs covering `buf`, filled by a metadata read.
    pub metadata: Option<Vec<MetaRun>>,
    /// The socket the response must be routed back to; also the key used
    /// to purge stale completions when that socket dies.
    pub conn_fd: RawFd,
    pub volume: Arc<Volume>,
}

impl IoCmd {
    /// Allocate a command for `header`. READ, WRITE and OPEN get a zeroed
    /// buffer of `header.len` bytes; everything else carries no payload.
    pub fn new(header: IoHeader, conn_fd: RawFd, volume: Arc<Volume>) -> Self {
        let buf = match header.opcode {
            Opcode::Read | Opcode::Write | Opcode::Open => {
                Some(vec![0u8; header.len as usize])
            }
            _ => None,
        };
        Self {
            header,
            buf,
            metadata: None,
            conn_fd,
            volume,
        }
    }
}
