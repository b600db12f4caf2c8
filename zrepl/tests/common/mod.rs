//! Shared fixtures for the integration tests: a listening server, volume
//! setup and a minimal protocol client speaking the replica wire format.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use zrepl::core::{registry, Volume};
use zrepl::protocol::{
    self,
    IoHeader,
    Opcode,
    RwSubHeader,
    Status,
    SUB_HEADER_SIZE,
};
use zrepl::server::Acceptor;
use zrepl::store::mem::MemStore;

pub fn init_logging() {
    zrepl::logger::try_init("info");
}

/// Bind both listeners on ephemeral ports and run the acceptor on a
/// background thread. Returns `(io_addr, rebuild_addr)`.
pub fn start_server() -> (SocketAddr, SocketAddr) {
    let acceptor = Acceptor::bind(0, 0).expect("failed to bind listeners");
    let addrs = (acceptor.io_addr(), acceptor.rebuild_addr());
    thread::spawn(move || {
        let _ = acceptor.run();
    });
    addrs
}

/// A registered in-memory volume the server will find by name.
pub fn mem_volume(name: &str, size: u64) -> Arc<Volume> {
    let volume = Volume::new(name, Arc::new(MemStore::new(size)));
    registry::insert(volume.clone()).expect("duplicate volume name in test");
    volume
}

/// An in-memory volume that is *not* in the registry; used as the
/// degraded side of an in-process rebuild, where it shares its name with
/// the registered healthy volume.
pub fn detached_mem_volume(name: &str, size: u64) -> Arc<Volume> {
    Volume::new(name, Arc::new(MemStore::new(size)))
}

/// Poll `cond` until it holds or the timeout expires.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// One chunk of a metadata-framed response payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk {
    pub io_num: u64,
    pub data: Vec<u8>,
}

/// Minimal wire client for the replica protocol.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).expect("connect failed"),
        }
    }

    pub fn send_header(&mut self, header: &IoHeader) {
        self.stream
            .write_all(&header.encode())
            .expect("header write failed");
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("payload write failed");
    }

    pub fn recv_header(&mut self) -> IoHeader {
        protocol::read_header(self.stream.as_raw_fd())
            .expect("header read failed")
    }

    pub fn recv_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).expect("payload read failed");
        buf
    }

    /// True once the server has closed the connection without sending
    /// anything further. Rebuild sockets close with zero linger, so a
    /// reset counts as closed too.
    pub fn at_eof(&mut self) -> bool {
        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
        }
    }

    pub fn open(&mut self, name: &str) -> IoHeader {
        let mut header = IoHeader::new(Opcode::Open);
        header.len = name.len() as u64 + 1;
        self.send_header(&header);
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        self.send_bytes(&payload);
        self.recv_header()
    }

    /// Send a WRITE and wait for its ack.
    pub fn write(&mut self, offset: u64, io_num: u64, data: &[u8]) -> IoHeader {
        self.write_async(offset, io_num, data, io_num);
        self.recv_header()
    }

    /// Send a WRITE without waiting for the ack; `io_seq` tags the
    /// request so the ack can be matched up later.
    pub fn write_async(
        &mut self,
        offset: u64,
        io_num: u64,
        data: &[u8],
        io_seq: u64,
    ) {
        let sub = RwSubHeader {
            io_num,
            len: data.len() as u64,
        };
        let mut payload = sub.encode().to_vec();
        payload.extend_from_slice(data);

        let mut header = IoHeader::new(Opcode::Write);
        header.offset = offset;
        header.len = payload.len() as u64;
        header.io_seq = io_seq;
        self.send_header(&header);
        self.send_bytes(&payload);
    }

    pub fn sync(&mut self) -> IoHeader {
        self.send_header(&IoHeader::new(Opcode::Sync));
        self.recv_header()
    }

    /// READ whose response payload is metadata-framed chunks; that is
    /// the shape every read takes until the volume is rebuilt, and any
    /// read with the metadata flag set.
    pub fn read_chunked(
        &mut self,
        offset: u64,
        len: u64,
        flags: u32,
    ) -> (IoHeader, Vec<Chunk>) {
        let mut header = IoHeader::new(Opcode::Read);
        header.offset = offset;
        header.len = len;
        header.flags = flags;
        self.send_header(&header);

        let response = self.recv_header();
        if response.status != Status::Ok {
            return (response, Vec::new());
        }
        let payload = self.recv_bytes(response.len as usize);
        (response, parse_chunks(&payload))
    }

    /// READ whose response is the raw buffer (healthy volume, no
    /// metadata asked for).
    pub fn read_raw(&mut self, offset: u64, len: u64) -> (IoHeader, Vec<u8>) {
        let mut header = IoHeader::new(Opcode::Read);
        header.offset = offset;
        header.len = len;
        self.send_header(&header);

        let response = self.recv_header();
        if response.status != Status::Ok {
            return (response, Vec::new());
        }
        let data = self.recv_bytes(response.len as usize);
        (response, data)
    }
}

pub fn parse_chunks(payload: &[u8]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut at = 0;
    while at < payload.len() {
        let sub = RwSubHeader::decode(&payload[at .. at + SUB_HEADER_SIZE]);
        at += SUB_HEADER_SIZE;
        chunks.push(Chunk {
            io_num: sub.io_num,
            data: payload[at .. at + sub.len as usize].to_vec(),
        });
        at += sub.len as usize;
    }
    chunks
}
