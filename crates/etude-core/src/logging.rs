//! Logging initialization for etude.
//!
//! The engine logs through `tracing` macros only; nothing is printed until
//! a subscriber is installed with one of the functions below.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use etude_core::{Config, Server, logging};
//!
//! fn main() -> Result<(), etude_core::EtudeError> {
//!     // Initialize logging before the server starts
//!     logging::init_logging();
//!
//!     Server::new(Config::from_env()?)?.serve()
//! }
//! ```
//!
//! ## Configuration
//!
//! The logging level can be controlled via the `RUST_LOG` environment variable:
//!
//! ```bash
//! # Connection open/close and request lines
//! RUST_LOG=debug etude
//!
//! # Only warnings and errors (production)
//! RUST_LOG=warn etude
//!
//! # Fine-grained control
//! RUST_LOG=etude_core::request=trace,etude_core=info etude
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with sensible defaults (`info` unless `RUST_LOG` says
/// otherwise).
///
/// # Panics
///
/// This function will panic if called multiple times. Only call it once
/// at application startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a specific default level.
///
/// `RUST_LOG`, when set, still wins over `level`.
///
/// # Common Levels
///
/// - `"trace"` - Every header line and every unmapped file
/// - `"debug"` - Connection lifecycle and request lines
/// - `"info"` - Startup, shutdown and metrics reports
/// - `"warn"` - Only warnings and errors
/// - `"error"` - Only errors
///
/// # Panics
///
/// This function will panic if called multiple times. Only call it once
/// at application startup.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Initialize pretty-formatted logging (recommended for development).
///
/// `level` is the default filter, `RUST_LOG` still wins over it.
///
/// # Panics
///
/// This function will panic if called multiple times. Only call it once
/// at application startup.
pub fn init_logging_pretty(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(true),
        )
        .init();
}

/// Initialize JSON-formatted logging (recommended for production).
///
/// One JSON object per line, suitable for log aggregation. `level` is the
/// default filter, `RUST_LOG` still wins over it.
///
/// # Panics
///
/// This function will panic if called multiple times. Only call it once
/// at application startup.
pub fn init_logging_json(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
