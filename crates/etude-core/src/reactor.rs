// src/reactor.rs
use crate::conn::{Conn, Interest};
use crate::error::{EtudeError, EtudeResult};
use crate::metrics::ServerMetrics;
use crate::pool::{Completion, Readiness, Task, WorkerPool};
use crate::resolver::Resolver;
use crate::slab::ConnectionSlab;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll, Waker,
    epoll_event,
};
use crossbeam_channel::Receiver;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const LISTENER_TOKEN: u64 = u64::MAX;
const WAKER_TOKEN: u64 = u64::MAX - 1;

/// Wait timeout in ms, bounds how late pruning and shutdown are noticed.
const WAIT_TIMEOUT_MS: i32 = 1000;
const PRUNE_EVERY: Duration = Duration::from_secs(1);
const MAX_EVENTS: usize = 1024;

pub struct ReactorSettings {
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
}

/// Single-threaded event loop: accepts connections, turns socket readiness
/// into pool tasks and re-arms connections when they come back.
///
/// Every registration is one-shot, so a connection produces no further
/// events while a worker holds it.
pub struct Reactor {
    epoll: Epoll,
    listener: OwnedFd,
    waker: Arc<Waker>,
    slab: ConnectionSlab,
    pool: WorkerPool,
    completions: Receiver<Completion>,
    resolver: Arc<Resolver>,
    metrics: Arc<ServerMetrics>,
    idle_timeout: Option<Duration>,
    /// Set when accept failed with connections possibly left in the backlog.
    accept_pending: bool,
}

impl Reactor {
    pub fn new(
        listener: OwnedFd,
        workers: usize,
        settings: ReactorSettings,
        resolver: Arc<Resolver>,
        metrics: Arc<ServerMetrics>,
    ) -> EtudeResult<Self> {
        let epoll = Epoll::new()?;
        let waker = Arc::new(Waker::new()?);
        epoll.add(listener.as_raw_fd(), LISTENER_TOKEN, EPOLLIN)?;
        epoll.add(waker.read_fd(), WAKER_TOKEN, EPOLLIN)?;

        let (done_tx, completions) = crossbeam_channel::unbounded();
        let pool = WorkerPool::new(workers, done_tx, waker.clone())?;

        Ok(Self {
            epoll,
            listener,
            waker,
            slab: ConnectionSlab::new(settings.max_connections),
            pool,
            completions,
            resolver,
            metrics,
            idle_timeout: settings.idle_timeout,
            accept_pending: false,
        })
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        syscalls::local_addr(self.listener.as_raw_fd())
    }

    /// Run until `shutdown` is set, then close every connection.
    pub fn run(&mut self, shutdown: &AtomicBool) -> EtudeResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut last_prune = Instant::now();

        tracing::info!(addr = ?self.local_addr().ok(), workers = self.pool.threads(), "reactor running");

        while !shutdown.load(Ordering::Acquire) {
            let n = self.epoll.wait(&mut events, WAIT_TIMEOUT_MS)?;

            for event in &events[..n] {
                let token = event.u64;
                let flags = event.events;
                match token {
                    LISTENER_TOKEN => self.accept_all(),
                    WAKER_TOKEN => self.waker.drain(),
                    token => self.dispatch(token as usize, flags),
                }
            }
            self.drain_completions();

            if last_prune.elapsed() >= PRUNE_EVERY {
                // The listener is edge-triggered: a failed accept gets no new
                // event, so the backlog is retried here.
                if self.accept_pending {
                    self.accept_all();
                }
                self.prune_idle();
                last_prune = Instant::now();
            }
        }

        self.close_all();
        Ok(())
    }

    fn accept_all(&mut self) {
        let listener = self.listener.as_raw_fd();
        let drained = drain_backlog(
            || syscalls::accept_connection(listener),
            |socket, peer| self.admit(socket, peer),
        );
        self.accept_pending = !drained;
    }

    fn admit(&mut self, socket: OwnedFd, peer: SocketAddr) {
        let fd = socket.as_raw_fd();
        let capacity = self.slab.capacity();
        let (resolver, metrics) = (&self.resolver, &self.metrics);
        let make = || Box::new(Conn::new(resolver.clone(), metrics.clone()));

        let Some((idx, conn)) = self.slab.allocate(make) else {
            // Out of capacity - backpressure
            tracing::warn!(%peer, capacity, error = %EtudeError::SlabFull, "dropping connection");
            return;
        };
        conn.init(socket, peer);

        if let Err(e) = self.epoll.add(fd, idx as u64, EPOLLIN | EPOLLRDHUP | EPOLLONESHOT) {
            tracing::warn!(%peer, error = %e, "failed to register connection");
            conn.close_conn();
            self.slab.release(idx, None);
        }
    }

    fn dispatch(&mut self, idx: usize, flags: u32) {
        let Some(readiness) = readiness(flags) else {
            return;
        };

        let Some(conn) = self.slab.take(idx) else {
            tracing::error!(token = idx, "event for a connection that is not parked");
            return;
        };
        if let Err(task) = self.pool.submit(Task {
            token: idx,
            conn,
            readiness,
        }) {
            let mut conn = task.conn;
            conn.close_conn();
            self.slab.release(idx, Some(conn));
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(Completion { token, conn }) = self.completions.try_recv() {
            match conn {
                Some(conn) => self.settle(token, conn),
                None => self.slab.release(token, None),
            }
        }
    }

    /// Re-arm a connection a worker handed back, or free its slot.
    fn settle(&mut self, idx: usize, mut conn: Box<Conn>) {
        let armed = match (conn.raw_fd(), conn.interest()) {
            (Some(fd), Some(interest)) => {
                match self.epoll.modify(fd, idx as u64, interest_flags(interest)) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(token = idx, error = %e, "failed to re-arm connection");
                        false
                    }
                }
            }
            _ => false,
        };

        if armed {
            self.slab.park(idx, conn);
        } else {
            conn.close_conn();
            self.slab.release(idx, Some(conn));
        }
    }

    fn close_parked(&mut self, idx: usize) {
        if let Some(conn) = self.slab.get_mut(idx) {
            if let Some(fd) = conn.raw_fd() {
                self.epoll.delete(fd).ok();
            }
            conn.close_conn();
        }
        self.slab.release(idx, None);
    }

    fn prune_idle(&mut self) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let now = Instant::now();
        let stale: Vec<usize> = self
            .slab
            .parked()
            .filter(|(_, conn)| now.duration_since(conn.last_active()) > timeout)
            .map(|(idx, _)| idx)
            .collect();

        for idx in stale {
            tracing::debug!(token = idx, "closing idle connection");
            self.close_parked(idx);
        }
    }

    fn close_all(&mut self) {
        tracing::info!(open = self.slab.len(), "reactor shutting down");
        let parked: Vec<usize> = self.slab.parked().map(|(idx, _)| idx).collect();
        for idx in parked {
            self.close_parked(idx);
        }

        // Workers finish what they hold; those connections are closed as
        // they come back.
        self.pool.shutdown();
        while let Ok(Completion { token, conn }) = self.completions.try_recv() {
            if let Some(mut conn) = conn {
                conn.close_conn();
                self.slab.release(token, Some(conn));
            } else {
                self.slab.release(token, None);
            }
        }
    }
}

/// Accept until the backlog is empty. Returns `false` when accept failed
/// and connections may still be waiting.
fn drain_backlog<A, F>(mut accept: A, mut admit: F) -> bool
where
    A: FnMut() -> EtudeResult<Option<(OwnedFd, SocketAddr)>>,
    F: FnMut(OwnedFd, SocketAddr),
{
    loop {
        match accept() {
            Ok(Some((socket, peer))) => admit(socket, peer),
            Ok(None) => return true,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed, retrying in the next housekeeping pass");
                return false;
            }
        }
    }
}

/// Half-close only matters while waiting for a request. A writing
/// connection listens for `EPOLLOUT` alone, otherwise a peer that shut down
/// its sending side would keep firing while the send buffer is full.
fn interest_flags(interest: Interest) -> u32 {
    match interest {
        Interest::Readable => EPOLLIN | EPOLLRDHUP | EPOLLONESHOT,
        Interest::Writable => EPOLLOUT | EPOLLONESHOT,
    }
}

/// A half-closed peer maps to `Readable`: its request is still read and
/// answered, and the next read sees end of stream.
fn readiness(flags: u32) -> Option<Readiness> {
    if flags & (EPOLLERR | EPOLLHUP) != 0 {
        Some(Readiness::Hangup)
    } else if flags & EPOLLOUT != 0 {
        Some(Readiness::Writable)
    } else if flags & (EPOLLIN | EPOLLRDHUP) != 0 {
        Some(Readiness::Readable)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn event_flags_map_to_readiness() {
        assert_eq!(readiness(EPOLLIN), Some(Readiness::Readable));
        assert_eq!(readiness(EPOLLIN | EPOLLRDHUP), Some(Readiness::Readable));
        assert_eq!(readiness(EPOLLOUT | EPOLLRDHUP), Some(Readiness::Writable));
        assert_eq!(readiness(EPOLLIN | EPOLLHUP), Some(Readiness::Hangup));
        assert_eq!(readiness(EPOLLERR), Some(Readiness::Hangup));
        assert_eq!(readiness(0), None);
    }

    #[test]
    fn writing_connections_ignore_half_close() {
        let writable = interest_flags(Interest::Writable);
        assert_eq!(writable & EPOLLRDHUP, 0);
        assert_ne!(writable & EPOLLOUT, 0);

        let readable = interest_flags(Interest::Readable);
        assert_ne!(readable & EPOLLRDHUP, 0);
        assert_ne!(readable & EPOLLONESHOT, 0);
    }

    #[test]
    fn failed_accept_leaves_backlog_pending() {
        let mut script = vec![
            Ok(None),
            Err(EtudeError::Io(std::io::Error::from_raw_os_error(libc::EMFILE))),
            Ok(Some(UnixStream::pair().unwrap().0)),
        ];
        let mut accept = || {
            script
                .pop()
                .unwrap()
                .map(|s| s.map(|s| (OwnedFd::from(s), "127.0.0.1:40000".parse::<SocketAddr>().unwrap())))
        };
        let mut admitted = 0;

        assert!(!drain_backlog(&mut accept, |_, _| admitted += 1));
        assert_eq!(admitted, 1);
        assert!(drain_backlog(&mut accept, |_, _| admitted += 1));
        assert_eq!(admitted, 1);
    }
}
