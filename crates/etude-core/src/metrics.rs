// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters shared by every connection.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ServerMetrics {
    pub live_conns: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            live_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.live_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        let prev = self.live_conns.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            tracing::error!("live connection counter underflow");
            self.live_conns.store(0, Ordering::Relaxed);
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn live(&self) -> usize {
        self.live_conns.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> usize {
        self.req_count.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
