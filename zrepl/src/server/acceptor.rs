//! Dual-listener connection acceptor.
//!
//! One socket accepts client IO connections, the other accepts inbound
//! rebuild connections from peer replicas. Both are non-blocking and
//! multiplexed through a single epoll set; each accepted connection gets
//! its own detached handler thread. Any event other than readability on
//! a listener is fatal: a replica that lost a listener is not serving.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::thread;

use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1,
    epoll_ctl,
    epoll_wait,
    EpollCreateFlags,
    EpollEvent,
    EpollFlags,
    EpollOp,
};
use nix::sys::socket::{
    bind,
    listen,
    setsockopt,
    socket,
    sockopt,
    AddressFamily,
    InetAddr,
    SockAddr,
    SockFlag,
    SockType,
};
use snafu::{ResultExt, Snafu};

use crate::rebuild::scanner;
use crate::server::receiver;

const MAX_EVENTS: usize = 64;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum AcceptorError {
    #[snafu(display("unable to bind port {}: {}", port, source))]
    Bind { port: u16, source: nix::Error },
    #[snafu(display("failed to inspect listener: {}", source))]
    ListenerAddr { source: std::io::Error },
    #[snafu(display("epoll {} failed: {}", op, source))]
    Epoll { op: &'static str, source: nix::Error },
    #[snafu(display("listener on fd {} raised {:?}", fd, events))]
    ListenerFailed { fd: RawFd, events: EpollFlags },
}

/// The two listening sockets of a replica.
pub struct Acceptor {
    io_listener: TcpListener,
    rebuild_listener: TcpListener,
    io_addr: SocketAddr,
    rebuild_addr: SocketAddr,
}

impl Acceptor {
    /// Bind both listeners. Port 0 asks the kernel for an ephemeral port;
    /// the bound addresses are available through the accessors.
    pub fn bind(io_port: u16, rebuild_port: u16) -> Result<Self, AcceptorError> {
        let io_listener = create_and_bind(io_port)?;
        let rebuild_listener = create_and_bind(rebuild_port)?;
        let io_addr = io_listener.local_addr().context(ListenerAddr)?;
        let rebuild_addr =
            rebuild_listener.local_addr().context(ListenerAddr)?;
        info!(
            "listening on {} for IO, {} for rebuild",
            io_addr, rebuild_addr
        );
        Ok(Self {
            io_listener,
            rebuild_listener,
            io_addr,
            rebuild_addr,
        })
    }

    pub fn io_addr(&self) -> SocketAddr {
        self.io_addr
    }

    pub fn rebuild_addr(&self) -> SocketAddr {
        self.rebuild_addr
    }

    pub fn io_fd(&self) -> RawFd {
        self.io_listener.as_raw_fd()
    }

    pub fn rebuild_fd(&self) -> RawFd {
        self.rebuild_listener.as_raw_fd()
    }

    /// The accept loop. Returns only on a fatal listener or epoll error;
    /// the caller decides whether that takes the process down.
    pub fn run(&self) -> Result<(), AcceptorError> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).context(
            Epoll {
                op: "create",
            },
        )?;
        let interest = EpollFlags::EPOLLIN
            | EpollFlags::EPOLLERR
            | EpollFlags::EPOLLHUP
            | EpollFlags::EPOLLRDHUP;
        for fd in &[self.io_fd(), self.rebuild_fd()] {
            let mut event = EpollEvent::new(interest, *fd as u64);
            epoll_ctl(epfd, EpollOp::EpollCtlAdd, *fd, &mut event)
                .context(Epoll {
                    op: "ctl",
                })?;
        }

        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        loop {
            let ready = match epoll_wait(epfd, &mut events, -1) {
                // signal handlers interrupt the wait; not an error
                Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(e).context(Epoll {
                        op: "wait",
                    })
                }
                Ok(n) => n,
            };

            for event in &events[.. ready] {
                let fd = event.data() as RawFd;
                let stray = event.events() & !EpollFlags::EPOLLIN;
                if !stray.is_empty() {
                    error!("listener fd {} raised {:?}", fd, stray);
                    return ListenerFailed {
                        fd,
                        events: stray,
                    }
                    .fail();
                }
                self.accept_one(fd);
            }
        }
    }

    fn accept_one(&self, listener_fd: RawFd) {
        let new_fd = match nix::sys::socket::accept(listener_fd) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("accept on fd {} failed: {}", listener_fd, e);
                return;
            }
        };
        let stream = unsafe { TcpStream::from_raw_fd(new_fd) };
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("could not restore blocking mode on fd {}: {}", new_fd, e);
            return;
        }

        let spawned = if listener_fd == self.io_fd() {
            info!("new data connection on fd {}", new_fd);
            thread::Builder::new()
                .name("io-recv".into())
                .spawn(move || receiver::serve(stream))
        } else {
            info!("new rebuild connection on fd {}", new_fd);
            thread::Builder::new()
                .name("rebuild-scan".into())
                .spawn(move || scanner::serve(stream))
        };
        if let Err(e) = spawned {
            error!("failed to spawn connection handler: {}", e);
        }
    }
}

/// Non-blocking IPv4 listener with a SOMAXCONN backlog. Built through the
/// raw socket calls so the backlog is explicit.
fn create_and_bind(port: u16) -> Result<TcpListener, AcceptorError> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context(Bind {
        port,
    })?;
    setsockopt(fd, sockopt::ReuseAddr, &true).context(Bind {
        port,
    })?;
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    bind(fd, &SockAddr::new_inet(InetAddr::from_std(&addr))).context(Bind {
        port,
    })?;
    listen(fd, libc::SOMAXCONN as usize).context(Bind {
        port,
    })?;
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}
