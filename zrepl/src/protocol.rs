//! Wire protocol spoken on both the client IO connection and the
//! replica-to-replica rebuild connection.
//!
//! Both ends are identical builds; the header is a fixed 44 byte layout
//! encoded little-endian. The version field is always read in isolation
//! first so that a peer speaking a different protocol revision never gets
//! a full header consumed on its behalf.

use std::convert::TryFrom;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use snafu::{ensure, Snafu};

/// The only protocol revision this replica speaks.
pub const REPLICA_VERSION: u16 = 3;

/// Size of the wire header in bytes.
pub const HEADER_SIZE: usize = 44;

/// Size of the per-chunk sub header embedded in WRITE payloads and
/// metadata-carrying READ responses.
pub const SUB_HEADER_SIZE: usize = 16;

/// Upper bound on the volume name carried by OPEN and HANDSHAKE payloads.
pub const MAX_NAME_LEN: u64 = 256;

/// Command is part of a rebuild session.
pub const FLAG_REBUILD: u32 = 1 << 0;
/// Caller wants the stored io numbers along with the data.
pub const FLAG_READ_METADATA: u32 = 1 << 1;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum ProtocolError {
    #[snafu(display("invalid replica protocol version {}", found))]
    BadVersion { found: u16 },
    #[snafu(display("connection closed by the peer"))]
    PeerClosed,
    #[snafu(display("socket {} error: {}", op, source))]
    SocketIo { op: &'static str, source: nix::Error },
    #[snafu(display("unknown opcode {} on the wire", code))]
    BadOpcode { code: u16 },
}

/// Operations carried in the wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Handshake = 1,
    Read = 2,
    Write = 3,
    Sync = 4,
    Open = 5,
    RebuildStep = 6,
    RebuildStepDone = 7,
    RebuildComplete = 8,
}

impl TryFrom<u16> for Opcode {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(Opcode::Handshake),
            2 => Ok(Opcode::Read),
            3 => Ok(Opcode::Write),
            4 => Ok(Opcode::Sync),
            5 => Ok(Opcode::Open),
            6 => Ok(Opcode::RebuildStep),
            7 => Ok(Opcode::RebuildStepDone),
            8 => Ok(Opcode::RebuildComplete),
            code => Err(ProtocolError::BadOpcode {
                code,
            }),
        }
    }
}

/// Completion status carried back to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Failed = 1,
}

impl Status {
    /// Anything other than a literal OK is treated as a failure.
    pub fn from_wire(code: u32) -> Self {
        if code == 0 {
            Status::Ok
        } else {
            Status::Failed
        }
    }
}

/// The fixed wire header exchanged ahead of every payload.
#[derive(Debug, Clone, Copy)]
pub struct IoHeader {
    pub version: u16,
    pub opcode: Opcode,
    pub flags: u32,
    pub status: Status,
    pub io_seq: u64,
    pub checkpointed_io_seq: u64,
    pub offset: u64,
    pub len: u64,
}

impl IoHeader {
    /// A fresh OK header for `opcode` with every other field zeroed.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            version: REPLICA_VERSION,
            opcode,
            flags: 0,
            status: Status::Ok,
            io_seq: 0,
            checkpointed_io_seq: 0,
            offset: 0,
            len: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0 .. 2].copy_from_slice(&self.version.to_le_bytes());
        buf[2 .. 4].copy_from_slice(&(self.opcode as u16).to_le_bytes());
        buf[4 .. 8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8 .. 12].copy_from_slice(&(self.status as u32).to_le_bytes());
        buf[12 .. 20].copy_from_slice(&self.io_seq.to_le_bytes());
        buf[20 .. 28].copy_from_slice(&self.checkpointed_io_seq.to_le_bytes());
        buf[28 .. 36].copy_from_slice(&self.offset.to_le_bytes());
        buf[36 .. 44].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Decode everything after the already validated version field.
    fn decode_rest(
        version: u16,
        rest: &[u8; HEADER_SIZE - 2],
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            version,
            opcode: Opcode::try_from(u16::from_le_bytes([rest[0], rest[1]]))?,
            flags: u32_at(rest, 2),
            status: Status::from_wire(u32_at(rest, 6)),
            io_seq: u64_at(rest, 10),
            checkpointed_io_seq: u64_at(rest, 18),
            offset: u64_at(rest, 26),
            len: u64_at(rest, 34),
        })
    }
}

/// Sub header prefixing each chunk of a WRITE payload. READ responses that
/// carry metadata use the same framing, which is what lets a rebuild
/// downstream feed a scanner's READ completion straight back in as a WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwSubHeader {
    pub io_num: u64,
    pub len: u64,
}

impl RwSubHeader {
    pub fn encode(&self) -> [u8; SUB_HEADER_SIZE] {
        let mut buf = [0u8; SUB_HEADER_SIZE];
        buf[0 .. 8].copy_from_slice(&self.io_num.to_le_bytes());
        buf[8 .. 16].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Decode from the first `SUB_HEADER_SIZE` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            io_num: u64_at(buf, 0),
            len: u64_at(buf, 8),
        }
    }
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at .. at + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at .. at + 8]);
    u64::from_le_bytes(b)
}

/// Read exactly `buf.len()` bytes from a blocking socket. A zero byte
/// read means the peer went away. EINTR is retried transparently.
pub fn read_exact(fd: RawFd, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut done = 0;
    while done < buf.len() {
        match nix::unistd::read(fd, &mut buf[done ..]) {
            Ok(0) => return Err(ProtocolError::PeerClosed),
            Ok(n) => done += n,
            Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
            Err(e) => {
                return Err(ProtocolError::SocketIo {
                    op: "read",
                    source: e,
                })
            }
        }
    }
    Ok(())
}

/// Write exactly `buf.len()` bytes to a blocking socket, retrying EINTR.
pub fn write_exact(fd: RawFd, buf: &[u8]) -> Result<(), ProtocolError> {
    let mut done = 0;
    while done < buf.len() {
        match nix::unistd::write(fd, &buf[done ..]) {
            Ok(n) => done += n,
            Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
            Err(e) => {
                return Err(ProtocolError::SocketIo {
                    op: "write",
                    source: e,
                })
            }
        }
    }
    Ok(())
}

/// Read a header in the safe two phase manner: the version field alone
/// first, the remainder only once the version checked out. A bad version
/// therefore never consumes more than two bytes of the stream.
pub fn read_header(fd: RawFd) -> Result<IoHeader, ProtocolError> {
    let mut vbuf = [0u8; 2];
    read_exact(fd, &mut vbuf)?;
    let version = u16::from_le_bytes(vbuf);
    ensure!(
        version == REPLICA_VERSION,
        BadVersion {
            found: version
        }
    );

    let mut rest = [0u8; HEADER_SIZE - 2];
    read_exact(fd, &mut rest)?;
    IoHeader::decode_rest(version, &rest)
}

pub fn write_header(fd: RawFd, header: &IoHeader) -> Result<(), ProtocolError> {
    write_exact(fd, &header.encode())
}

/// Extract the NUL terminated volume name from an OPEN or HANDSHAKE
/// payload. Returns None for an empty or non utf-8 name.
pub fn volume_name(payload: &[u8]) -> Option<String> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or_else(|| payload.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&payload[.. end]).ok().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn sample_header() -> IoHeader {
        IoHeader {
            version: REPLICA_VERSION,
            opcode: Opcode::Write,
            flags: FLAG_REBUILD,
            status: Status::Ok,
            io_seq: 42,
            checkpointed_io_seq: 17,
            offset: 4096,
            len: 8192,
        }
    }

    #[test]
    fn header_survives_the_wire() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(&sample_header().encode()).unwrap();

        let got = read_header(rx.as_raw_fd()).unwrap();
        assert_eq!(got.opcode, Opcode::Write);
        assert_eq!(got.flags, FLAG_REBUILD);
        assert_eq!(got.status, Status::Ok);
        assert_eq!(got.io_seq, 42);
        assert_eq!(got.checkpointed_io_seq, 17);
        assert_eq!(got.offset, 4096);
        assert_eq!(got.len, 8192);
    }

    #[test]
    fn bad_version_consumes_only_the_probe() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(&0xffffu16.to_le_bytes()).unwrap();
        tx.write_all(b"leftover").unwrap();

        let err = read_header(rx.as_raw_fd()).unwrap_err();
        assert_matches!(err, ProtocolError::BadVersion { found: 0xffff });

        // the stream after the two byte probe is untouched
        let mut rest = [0u8; 8];
        read_exact(rx.as_raw_fd(), &mut rest).unwrap();
        assert_eq!(&rest, b"leftover");
    }

    #[test]
    fn peer_close_is_distinguished() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        let err = read_header(rx.as_raw_fd()).unwrap_err();
        assert_matches!(err, ProtocolError::PeerClosed);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut hdr = sample_header().encode();
        hdr[2 .. 4].copy_from_slice(&99u16.to_le_bytes());

        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(&hdr).unwrap();
        let err = read_header(rx.as_raw_fd()).unwrap_err();
        assert_matches!(err, ProtocolError::BadOpcode { code: 99 });
    }

    #[test]
    fn name_parsing() {
        assert_eq!(volume_name(b"vol1\0"), Some("vol1".to_string()));
        assert_eq!(volume_name(b"vol1"), Some("vol1".to_string()));
        assert_eq!(volume_name(b"\0"), None);
        assert_eq!(volume_name(b""), None);
        assert_eq!(volume_name(&[0xff, 0xfe, 0x00]), None);
    }
}
