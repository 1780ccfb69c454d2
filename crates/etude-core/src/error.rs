// src/error.rs
use std::io;

/// Central error type for the etude engine.
///
/// Request-level failures (bad syntax, missing files, ...) are not errors:
/// they travel as [`HttpCode`](crate::http::HttpCode) outcomes and end up
/// as HTTP responses. This type covers what is fatal to a connection or to
/// the server itself.
#[derive(Debug, thiserror::Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The read buffer filled up before a request completed.
    #[error("read buffer is full")]
    ReadBufferFull,
    /// An operation was attempted on a connection with no socket.
    #[error("connection is not open")]
    NotConnected,
    /// The connection slab reached its maximum capacity.
    #[error("connection slab is full")]
    SlabFull,
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// A worker thread panicked while running a connection task.
    #[error("worker panic: {0}")]
    WorkerPanic(String),
}

impl EtudeError {
    /// True when the error came from the peer going away rather than from
    /// anything on our side.
    pub fn is_disconnect(&self) -> bool {
        match self {
            EtudeError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_and_classify() {
        let err: EtudeError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(err.is_disconnect());
        assert!(!EtudeError::ReadBufferFull.is_disconnect());
        assert_eq!(EtudeError::SlabFull.to_string(), "connection slab is full");
    }
}
