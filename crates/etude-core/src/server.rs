// src/server.rs
use crate::config::Config;
use crate::error::{EtudeError, EtudeResult};
use crate::metrics::ServerMetrics;
use crate::reactor::{Reactor, ReactorSettings};
use crate::resolver::Resolver;
use crate::syscalls;
use crossbeam_channel::RecvTimeoutError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A bound, ready-to-run static file server.
///
/// The listener and the worker pool are set up by [`Server::new`], so the
/// address is known (and connections queue up) before [`serve`](Self::serve)
/// is called.
pub struct Server {
    config: Config,
    reactor: Reactor,
    metrics: Arc<ServerMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: Config) -> EtudeResult<Self> {
        config.validate()?;
        let resolver = Arc::new(Resolver::new(&config.doc_root)?);
        let metrics = Arc::new(ServerMetrics::new());

        let listener = syscalls::create_listen_socket(&config.host, config.port)?;
        let reactor = Reactor::new(
            listener,
            config.workers,
            ReactorSettings {
                max_connections: config.max_connections,
                idle_timeout: config.idle_timeout(),
            },
            resolver,
            metrics.clone(),
        )?;

        Ok(Self {
            config,
            reactor,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        self.reactor.local_addr()
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Flag that stops [`serve`](Self::serve) when set. The reactor notices
    /// within one wait timeout.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run on the calling thread until Ctrl-C or the shutdown flag.
    pub fn serve(mut self) -> EtudeResult<()> {
        // Setup signal handling - ctrl-c graceful shutdown
        let shutdown = self.shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            tracing::info!("received SIGINT, initiating graceful shutdown");
            shutdown.store(true, Ordering::SeqCst);
        }) {
            tracing::warn!(error = %e, "Ctrl-C handler not installed");
        }

        let (stop_tx, reporter) = match self.config.metrics_interval() {
            Some(every) => {
                let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
                let handle = spawn_reporter(self.metrics.clone(), every, stop_rx)?;
                (Some(stop_tx), Some(handle))
            }
            None => (None, None),
        };

        tracing::info!(
            addr = %self.local_addr()?,
            root = %self.config.doc_root.display(),
            workers = self.config.workers,
            "etude serving"
        );
        let result = self.reactor.run(&self.shutdown);

        drop(stop_tx);
        if let Some(handle) = reporter {
            if handle.join().is_err() {
                tracing::error!("metrics reporter panicked");
            }
        }

        tracing::info!(
            requests = self.metrics.requests(),
            bytes = self.metrics.bytes(),
            "etude server shut down"
        );
        result
    }
}

fn spawn_reporter(
    metrics: Arc<ServerMetrics>,
    every: Duration,
    stop: crossbeam_channel::Receiver<()>,
) -> EtudeResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("etude-metrics".to_string())
        .spawn(move || {
            loop {
                match stop.recv_timeout(every) {
                    Err(RecvTimeoutError::Timeout) => tracing::info!(
                        live = metrics.live(),
                        requests = metrics.requests(),
                        bytes_sent = metrics.bytes(),
                        "metrics"
                    ),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .map_err(EtudeError::from)
}
