use anyhow::Context;
use clap::{Parser, ValueEnum};
use etude_core::{Config, Server, logging};
use mimalloc::MiMalloc;
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Serve a directory over HTTP/1.1 from memory-mapped files")]
#[command(version)]
struct Cli {
    /// Directory to serve (overrides ETUDE_DOC_ROOT)
    #[arg(value_name = "DIR")]
    doc_root: Option<PathBuf>,

    /// Listen address (overrides ETUDE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides ETUDE_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Worker threads (overrides ETUDE_WORKERS)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum open connections (overrides ETUDE_MAX_CONNECTIONS)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Seconds before an idle connection is closed, 0 to never close
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Seconds between metrics log lines, 0 to disable
    #[arg(long)]
    metrics_interval: Option<u64>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Plain,
    Pretty,
    Json,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(doc_root) = self.doc_root {
            config.doc_root = doc_root;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(secs) = self.metrics_interval {
            config.metrics_interval_secs = secs;
        }
    }
}

impl Cli {
    fn init_logging(&self) {
        let init: fn(&str) = match self.log_format {
            LogFormat::Plain => logging::init_logging_with_level,
            LogFormat::Pretty => logging::init_logging_pretty,
            LogFormat::Json => logging::init_logging_json,
        };
        init(&self.log_level);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    cli.init_logging();

    let mut config = Config::from_env().context("failed to load configuration")?;
    cli.apply(&mut config);
    tracing::debug!(?config, "configuration loaded");

    let server = Server::new(config).context("failed to start server")?;
    server.serve().context("server stopped with an error")?;
    Ok(())
}
