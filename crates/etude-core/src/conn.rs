// src/conn.rs
use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::{EtudeError, EtudeResult};
use crate::http::{CheckState, HttpCode};
use crate::metrics::ServerMetrics;
use crate::request::Request;
use crate::resolver::{MappedFile, Resolver};
use crate::response::{self, ComposeError, Output};
use crate::syscalls;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    /// No socket: freshly constructed or closed.
    #[default]
    Closed,
    /// Waiting for the first bytes of a request.
    Idle,
    /// Part of a request has been consumed, waiting for the rest.
    Parsing,
    Composing,
    /// A response is queued and being flushed.
    Writing,
}

/// Readiness a connection waits for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Received(usize),
    /// Nothing to read right now.
    WouldBlock,
    /// The peer closed its side; the connection has been closed.
    PeerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// No response is queued.
    Nothing,
    /// Part of the response is still unsent.
    Pending,
    /// Response sent, connection back to `Idle`.
    KeepAlive,
    /// Response sent, connection closed.
    Closed,
}

/// One client connection: buffers, request parser, resolved file and the
/// response being written.
///
/// A `Conn` is constructed once and re-used: [`init`](Self::init) attaches a
/// socket, [`close_conn`](Self::close_conn) detaches it. It is driven by
/// exactly one thread at a time, which is enforced by whoever owns the
/// `Box<Conn>` (see the reactor).
pub struct Conn {
    socket: Option<OwnedFd>,
    peer: Option<SocketAddr>,
    state: ConnState,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
    request: Request,
    file: Option<MappedFile>,
    output: Output,
    linger: bool,
    resolver: Arc<Resolver>,
    metrics: Arc<ServerMetrics>,
    last_active: Instant,
    requests_served: u32,
}

impl Conn {
    pub fn new(resolver: Arc<Resolver>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            socket: None,
            peer: None,
            state: ConnState::Closed,
            read_buf: ReadBuffer::new(),
            write_buf: WriteBuffer::new(),
            request: Request::new(),
            file: None,
            output: Output::default(),
            linger: false,
            resolver,
            metrics,
            last_active: Instant::now(),
            requests_served: 0,
        }
    }

    /// Attach a freshly accepted non-blocking socket.
    pub fn init(&mut self, socket: OwnedFd, peer: SocketAddr) {
        if self.socket.is_some() {
            tracing::error!(peer = ?self.peer, "init on an open connection, closing it first");
            self.close_conn();
        }
        self.socket = Some(socket);
        self.peer = Some(peer);
        self.metrics.inc_conn();
        self.reset();
        self.state = ConnState::Idle;
        self.last_active = Instant::now();
        self.requests_served = 0;
        tracing::debug!(%peer, "connection opened");
    }

    /// Clear everything request-scoped, keeping the socket.
    fn reset(&mut self) {
        self.read_buf.clear();
        self.write_buf.clear();
        self.request.reset();
        self.file = None;
        self.output = Output::default();
        self.linger = false;
    }

    /// Release the mapping, close the socket and drop the live count.
    /// Calling it on a closed connection does nothing.
    pub fn close_conn(&mut self) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        self.file = None;
        drop(socket);
        self.state = ConnState::Closed;
        self.metrics.dec_conn();
        tracing::debug!(peer = ?self.peer, served = self.requests_served, "connection closed");
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn has_mapping(&self) -> bool {
        self.file.is_some()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::Closed => None,
            ConnState::Idle | ConnState::Parsing => Some(Interest::Readable),
            ConnState::Composing | ConnState::Writing => Some(Interest::Writable),
        }
    }

    fn fd(&self) -> EtudeResult<RawFd> {
        self.raw_fd().ok_or(EtudeError::NotConnected)
    }

    /// One non-blocking receive into the read buffer.
    ///
    /// Transport errors and a full buffer close the connection before the
    /// error is returned.
    pub fn read(&mut self) -> EtudeResult<ReadStatus> {
        let fd = self.fd()?;
        if self.read_buf.is_full() {
            self.close_conn();
            return Err(EtudeError::ReadBufferFull);
        }

        match syscalls::recv_nonblocking(fd, self.read_buf.spare_mut()) {
            Ok(Some(0)) => {
                self.close_conn();
                Ok(ReadStatus::PeerClosed)
            }
            Ok(Some(n)) => {
                self.read_buf.advance(n);
                self.last_active = Instant::now();
                Ok(ReadStatus::Received(n))
            }
            Ok(None) => Ok(ReadStatus::WouldBlock),
            Err(e) => {
                self.close_conn();
                Err(e)
            }
        }
    }

    /// Parse what has been read so far and, once a request is complete,
    /// resolve it and queue the response.
    pub fn process(&mut self) {
        if !matches!(self.state, ConnState::Idle | ConnState::Parsing) {
            return;
        }

        self.state = ConnState::Parsing;
        let mut code = self.request.process_read(&mut self.read_buf);
        if code == HttpCode::NoRequest {
            if !self.read_buf.is_full() {
                return;
            }
            code = match self.request.check_state() {
                CheckState::Content => HttpCode::InternalError,
                CheckState::RequestLine | CheckState::Headers => HttpCode::BadRequest,
            };
            tracing::debug!(peer = ?self.peer, "request does not fit in the read buffer");
        }

        if code == HttpCode::GetRequest {
            self.metrics.inc_req();
            code = self.do_request();
        }

        self.state = ConnState::Composing;
        if !self.process_write(code) {
            self.close_conn();
            return;
        }
        self.state = ConnState::Writing;
    }

    fn do_request(&mut self) -> HttpCode {
        self.file = None;
        match self.resolver.resolve(self.request.url()) {
            Ok(file) => {
                self.file = Some(file);
                HttpCode::FileRequest
            }
            Err(code) => code,
        }
    }

    fn process_write(&mut self, code: HttpCode) -> bool {
        if code != HttpCode::FileRequest {
            self.file = None;
        }
        // Malformed or failed requests are answered, then the connection goes.
        self.linger = self.request.keep_alive()
            && !matches!(code, HttpCode::BadRequest | HttpCode::InternalError);

        match response::compose(&mut self.write_buf, code, self.linger, self.file.as_ref()) {
            Ok(output) => {
                self.output = output;
                true
            }
            Err(ComposeError::Overflow) => {
                tracing::warn!(?code, "response header overflow, answering 500");
                self.file = None;
                self.linger = false;
                match response::compose(&mut self.write_buf, HttpCode::InternalError, false, None) {
                    Ok(output) => {
                        self.output = output;
                        true
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "cannot compose a 500 response");
                        false
                    }
                }
            }
            Err(e @ ComposeError::NotTerminal(_)) => {
                if code != HttpCode::ClosedConnection {
                    tracing::error!(error = %e, "nothing to respond with");
                }
                false
            }
        }
    }

    /// One vectored send of whatever is left of the queued response.
    pub fn write(&mut self) -> EtudeResult<WriteStatus> {
        let fd = self.fd()?;
        if self.state != ConnState::Writing {
            return Ok(WriteStatus::Nothing);
        }
        if self.output.is_done() {
            return Ok(self.finish_response());
        }

        let sent = {
            let file = self.file.as_ref().map_or(&[][..], MappedFile::bytes);
            let segments = self.output.segments(self.write_buf.as_slice(), file);
            syscalls::writev_nonblocking(fd, &segments)
        };

        match sent {
            Ok(Some(n)) => {
                self.output.advance(n);
                self.metrics.add_bytes(n);
                self.last_active = Instant::now();
                if self.output.is_done() {
                    Ok(self.finish_response())
                } else {
                    Ok(WriteStatus::Pending)
                }
            }
            Ok(None) => Ok(WriteStatus::Pending),
            Err(e) => {
                self.close_conn();
                Err(e)
            }
        }
    }

    fn finish_response(&mut self) -> WriteStatus {
        self.file = None;
        self.requests_served += 1;
        if self.linger {
            self.reset();
            self.state = ConnState::Idle;
            WriteStatus::KeepAlive
        } else {
            self.close_conn();
            WriteStatus::Closed
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close_conn();
    }
}
