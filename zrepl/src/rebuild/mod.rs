//!
//! Replica-to-replica rebuild. A degraded replica runs the
//! [`downstream`] driver to pull every region a healthy peer has written
//! since the degraded replica's checkpoint; the healthy peer runs the
//! [`scanner`] to walk its metadata diff and serve those regions. Both
//! roles speak the same chunked, resumable range protocol keyed on the
//! checkpointed io sequence number.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use nix::sys::socket::{setsockopt, sockopt};
use snafu::Snafu;

use crate::protocol::{Opcode, ProtocolError};
use crate::store::StoreError;

pub mod downstream;
pub mod scanner;

pub use downstream::DownstreamRebuild;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum RebuildError {
    #[snafu(display("failed to configure rebuild socket: {}", source))]
    SocketSetup { source: nix::Error },
    #[snafu(display("failed to connect to rebuild peer {}: {}", peer, source))]
    Connect { peer: SocketAddr, source: nix::Error },
    #[snafu(display("{}", source))]
    Wire { source: ProtocolError },
    #[snafu(display("failed to read checkpointed io number: {}", source))]
    Checkpoint { source: StoreError },
    #[snafu(display("rebuild already errored for volume {}", volume))]
    Poisoned { volume: String },
    #[snafu(display("peer reported failure on {:?}", opcode))]
    PeerStatus { opcode: Opcode },
    #[snafu(display("unexpected opcode {:?} during rebuild", opcode))]
    UnexpectedOpcode { opcode: Opcode },
    #[snafu(display("rebuild write failed on volume {}", volume))]
    WriteFailed { volume: String },
    #[snafu(display("second handshake on rebuild connection for volume {}", volume))]
    DoubleHandshake { volume: String },
    #[snafu(display("handshake names unknown volume {}", name))]
    VolumeNotFound { name: String },
    #[snafu(display("handshake carries an unusable volume name"))]
    BadName,
    #[snafu(display("volume {} went offline", volume))]
    VolumeOffline { volume: String },
    #[snafu(display("metadata diff walk failed: {}", source))]
    DiffWalk { source: StoreError },
}

/// Arm `SO_LINGER(on, 0)` on a rebuild socket so that closing it discards
/// instead of lingering; a dead rebuild session must fail fast on the
/// peer, not drain.
pub(crate) fn set_discard_linger(fd: RawFd) -> Result<(), nix::Error> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    setsockopt(fd, sockopt::Linger, &linger)
}
