// src/syscalls.rs
use crate::error::EtudeResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket with SO_REUSEADDR.
pub fn create_listen_socket(host: &str, port: u16) -> EtudeResult<OwnedFd> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        // 1. Create socket
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Closes the socket on every early return below.
        let sock = OwnedFd::from_raw_fd(fd);

        // 2. SO_REUSEADDR so a restart does not wait out TIME_WAIT
        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }

        // 3. Bind
        let (storage, len) = socket_addr_to_raw(&addr);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // 4. Listen
        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(sock)
    }
}

/// Accept one pending connection as a non-blocking socket.
/// Returns `None` when the accept queue is empty.
pub fn accept_connection(listen_fd: RawFd) -> EtudeResult<Option<(OwnedFd, SocketAddr)>> {
    loop {
        unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
            let fd = libc::accept4(
                listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            );

            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(None),
                    // The peer gave up before we got to it, try the next one.
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }

            let sock = OwnedFd::from_raw_fd(fd);
            let peer = raw_to_socket_addr(&storage)
                .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
            return Ok(Some((sock, peer)));
        }
    }
}

/// Address a socket is bound to.
pub fn local_addr(fd: RawFd) -> EtudeResult<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        raw_to_socket_addr(&storage).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "not an inet socket").into()
        })
    }
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    // SAFETY: sockaddr_storage is plain data and large enough for both families.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            // SAFETY: the family says the storage holds a sockaddr_in.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: the family says the storage holds a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

// ---- Epoll Operations ----

pub use libc::epoll_event;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;
const EPOLLET: u32 = libc::EPOLLET as u32;

pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register a file descriptor. Registrations are always edge-triggered.
    pub fn add(&self, fd: RawFd, token: u64, interests: u32) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    /// Change the interest set; for one-shot registrations this re-arms.
    pub fn modify(&self, fd: RawFd, token: u64, interests: u32) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, interests: u32) -> EtudeResult<()> {
        let mut event = epoll_event {
            events: interests | EPOLLET,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> EtudeResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Data Transfer ----

/// One non-blocking receive. `Ok(None)` means would-block, `Ok(Some(0))`
/// means the peer closed its side.
pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> EtudeResult<Option<usize>> {
    loop {
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Vectored non-blocking send (scatter-gather I/O) of up to 8 segments.
/// `Ok(None)` means would-block. Never raises SIGPIPE.
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> EtudeResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    // Build iovec array on stack (max 8 segments)
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);
    for (iov, buf) in iovecs.iter_mut().zip(&bufs[..iov_count]) {
        *iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iovecs.as_mut_ptr();
    msg.msg_iovlen = iov_count as _;

    loop {
        let res = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

// ---- Reactor Wake-up Pipe ----

/// Self-pipe used by workers to interrupt the reactor's `epoll_wait`.
pub struct Waker {
    read: OwnedFd,
    write: OwnedFd,
}

impl Waker {
    pub fn new() -> EtudeResult<Self> {
        let mut fds = [0 as c_int; 2];
        unsafe {
            if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            })
        }
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// A full pipe already guarantees a pending wake-up, so EAGAIN is fine.
    pub fn wake(&self) -> EtudeResult<()> {
        let byte = 1u8;
        let n = unsafe {
            libc::write(self.write.as_raw_fd(), &byte as *const u8 as *const c_void, 1)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Consume all pending wake-ups.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::unix::net::UnixStream;

    #[test]
    fn listen_accept_and_local_addr() {
        let listener = create_listen_socket("127.0.0.1", 0).unwrap();
        let addr = local_addr(listener.as_raw_fd()).unwrap();
        assert_ne!(addr.port(), 0);

        assert!(accept_connection(listener.as_raw_fd()).unwrap().is_none());

        let _client = TcpStream::connect(addr).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(conn) = accept_connection(listener.as_raw_fd()).unwrap() {
                accepted = Some(conn);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (_sock, peer) = accepted.expect("connection was not accepted");
        assert!(peer.ip().is_loopback());
    }

    #[test]
    fn recv_and_writev_on_socket_pair() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(recv_nonblocking(a.as_raw_fd(), &mut buf).unwrap(), None);

        b.write_all(b"ping").unwrap();
        assert_eq!(recv_nonblocking(a.as_raw_fd(), &mut buf).unwrap(), Some(4));
        assert_eq!(&buf[..4], b"ping");

        let sent = writev_nonblocking(a.as_raw_fd(), &[b"he", b"llo"]).unwrap();
        assert_eq!(sent, Some(5));
        let mut got = [0u8; 5];
        b.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello");

        drop(b);
        assert_eq!(recv_nonblocking(a.as_raw_fd(), &mut buf).unwrap(), Some(0));
    }

    #[test]
    fn waker_wakes_epoll() {
        let epoll = Epoll::new().unwrap();
        let waker = Waker::new().unwrap();
        epoll.add(waker.read_fd(), 7, EPOLLIN).unwrap();

        let mut events = vec![epoll_event { events: 0, u64: 0 }; 4];
        assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);

        waker.wake().unwrap();
        waker.wake().unwrap();
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
        let token = events[0].u64;
        assert_eq!(token, 7);
        waker.drain();
    }
}
