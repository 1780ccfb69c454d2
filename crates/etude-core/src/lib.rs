// src/lib.rs
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod reactor;
pub mod request;
pub mod resolver;
pub mod response;
pub mod server;
pub mod slab;
pub mod syscalls;

// Re-exports for users
pub use config::Config;
pub use conn::{Conn, ConnState, ReadStatus, WriteStatus};
pub use error::{EtudeError, EtudeResult};
pub use http::{HttpCode, Method};
pub use metrics::ServerMetrics;
pub use resolver::Resolver;
pub use server::Server;
