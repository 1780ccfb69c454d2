// src/pool.rs
use crate::conn::{Conn, ConnState, ReadStatus};
use crate::error::{EtudeError, EtudeResult};
use crate::syscalls::Waker;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// What the reactor saw on a connection's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
    /// Error or full hang-up; the connection is closed.
    Hangup,
}

/// A connection on its way to a worker. The worker owns the `Conn` until it
/// sends it back as a [`Completion`].
pub struct Task {
    pub token: usize,
    pub conn: Box<Conn>,
    pub readiness: Readiness,
}

/// A connection on its way back to the reactor. `conn` is `None` when the
/// task panicked and the connection was dropped during unwinding.
pub struct Completion {
    pub token: usize,
    pub conn: Option<Box<Conn>>,
}

impl Task {
    /// Drive the connection for one readiness event.
    pub fn run(self) -> Completion {
        let Task {
            token,
            mut conn,
            readiness,
        } = self;

        match readiness {
            Readiness::Hangup => conn.close_conn(),
            // A response in flight is finished before anything is read.
            Readiness::Readable if conn.state() == ConnState::Writing => {
                if let Err(e) = conn.write() {
                    log_transport_error(token, &e);
                }
            }
            Readiness::Readable => match conn.read() {
                Ok(ReadStatus::Received(_)) => conn.process(),
                Ok(ReadStatus::WouldBlock) | Ok(ReadStatus::PeerClosed) => {}
                Err(e) => log_transport_error(token, &e),
            },
            Readiness::Writable => {
                if let Err(e) = conn.write() {
                    log_transport_error(token, &e);
                }
            }
        }

        Completion {
            token,
            conn: Some(conn),
        }
    }
}

fn log_transport_error(token: usize, err: &EtudeError) {
    if err.is_disconnect() {
        tracing::debug!(token, error = %err, "peer went away");
    } else {
        tracing::warn!(token, error = %err, "connection error");
    }
}

/// Fixed set of threads running connection tasks off a shared queue.
pub struct WorkerPool {
    queue: Option<Sender<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers. Finished tasks go to `completions` and each
    /// one is followed by a `waker` wake-up.
    pub fn new(
        threads: usize,
        completions: Sender<Completion>,
        waker: Arc<Waker>,
    ) -> EtudeResult<Self> {
        let (queue, tasks) = crossbeam_channel::unbounded::<Task>();
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(threads);

        for i in 0..threads {
            // Pin to core or wrap around
            let core_id = match core_ids.len() {
                0 => None,
                n => Some(core_ids[i % n]),
            };
            let tasks = tasks.clone();
            let completions = completions.clone();
            let waker = waker.clone();

            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            tracing::debug!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    worker_loop(i, tasks, completions, waker);
                })?;
            handles.push(handle);
        }

        Ok(Self {
            queue: Some(queue),
            handles,
        })
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Queue a task. Gives it back when the pool has been shut down.
    pub fn submit(&self, task: Task) -> Result<(), Task> {
        match &self.queue {
            Some(queue) => queue.send(task).map_err(|e| e.into_inner()),
            None => Err(task),
        }
    }

    /// Close the queue and wait for the workers to finish what they hold.
    pub fn shutdown(&mut self) {
        if self.queue.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, tasks: Receiver<Task>, completions: Sender<Completion>, waker: Arc<Waker>) {
    for task in tasks.iter() {
        let done = run_guarded(task);
        if completions.send(done).is_err() {
            break;
        }
        if let Err(e) = waker.wake() {
            tracing::error!(worker = id, error = %e, "failed to wake reactor");
        }
    }
    tracing::debug!(worker = id, "worker exiting");
}

#[cfg(feature = "catch-panic")]
fn run_guarded(task: Task) -> Completion {
    let token = task.token;
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || task.run())) {
        Ok(done) => done,
        Err(payload) => {
            let err = EtudeError::WorkerPanic(panic_message(payload.as_ref()));
            tracing::error!(token, error = %err, "connection task panicked");
            Completion { token, conn: None }
        }
    }
}

#[cfg(not(feature = "catch-panic"))]
fn run_guarded(task: Task) -> Completion {
    task.run()
}

#[cfg(feature = "catch-panic")]
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServerMetrics;
    use crate::resolver::Resolver;
    use std::fs;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;
    use tempfile::TempDir;

    fn connected(dir: &TempDir) -> (Box<Conn>, UnixStream) {
        let resolver = Arc::new(Resolver::new(dir.path()).unwrap());
        let mut conn = Box::new(Conn::new(resolver, Arc::new(ServerMetrics::new())));
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        conn.init(OwnedFd::from(server), "127.0.0.1:40001".parse().unwrap());
        (conn, client)
    }

    #[test]
    fn hangup_closes_the_connection() {
        let dir = TempDir::new().unwrap();
        let (conn, _client) = connected(&dir);
        let done = Task {
            token: 3,
            conn,
            readiness: Readiness::Hangup,
        }
        .run();
        assert_eq!(done.token, 3);
        assert!(!done.conn.unwrap().is_open());
    }

    #[test]
    fn readable_event_on_a_writing_connection_keeps_writing() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("index.html");
        fs::write(&index, "hi").unwrap();
        fs::set_permissions(&index, fs::Permissions::from_mode(0o644)).unwrap();
        let (conn, mut client) = connected(&dir);

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();
        let done = Task {
            token: 1,
            conn,
            readiness: Readiness::Readable,
        }
        .run();
        let conn = done.conn.unwrap();
        assert_eq!(conn.state(), ConnState::Writing);

        // Peer already half-closed: a read here would see end of stream.
        let done = Task {
            token: 1,
            conn,
            readiness: Readiness::Readable,
        }
        .run();
        assert!(!done.conn.unwrap().is_open());

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn pool_round_trips_a_request() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("index.html");
        fs::write(&index, "hi").unwrap();
        fs::set_permissions(&index, fs::Permissions::from_mode(0o644)).unwrap();
        let (conn, mut client) = connected(&dir);

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let waker = Arc::new(Waker::new().unwrap());
        let mut pool = WorkerPool::new(2, done_tx, waker).unwrap();
        assert_eq!(pool.threads(), 2);

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        assert!(
            pool.submit(Task {
                token: 0,
                conn,
                readiness: Readiness::Readable,
            })
            .is_ok()
        );
        let done = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let conn = done.conn.unwrap();
        assert_eq!(conn.state(), ConnState::Writing);

        assert!(
            pool.submit(Task {
                token: 0,
                conn,
                readiness: Readiness::Writable,
            })
            .is_ok()
        );
        let done = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!done.conn.unwrap().is_open());

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nhi"));

        pool.shutdown();
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn submit_after_shutdown_returns_the_task() {
        let dir = TempDir::new().unwrap();
        let (conn, _client) = connected(&dir);
        let (done_tx, _done_rx) = crossbeam_channel::unbounded();
        let mut pool = WorkerPool::new(1, done_tx, Arc::new(Waker::new().unwrap())).unwrap();
        pool.shutdown();

        let task = Task {
            token: 9,
            conn,
            readiness: Readiness::Readable,
        };
        let task = pool.submit(task).err().unwrap();
        assert_eq!(task.token, 9);
    }
}
