use clap::Parser;
use pairflow_delivery::{Deliverer, DeliveryConfig, TmuxTransport};
use pairflow_hub::{router, spawn_reconcile_sweep, BrokerConfig, EventBroker, FsSnapshotSource};
use pairflow_storage::{
    default_repo_registry_path, default_runtime_sessions_path, RuntimeSessionRegistry,
};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:4173";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    log_dir: String,
    broker: BrokerConfig,
    sessions_path: PathBuf,
    reconcile_interval: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "pairflow-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// Repository to watch in addition to the repository registry.
    #[arg(long = "repo")]
    repos: Vec<PathBuf>,
    #[arg(long, default_value_t = 2000)]
    poll_ms: u64,
    #[arg(long, default_value_t = 150)]
    debounce_ms: u64,
    #[arg(long, default_value_t = 1000)]
    history_limit: usize,
    #[arg(long, default_value_t = false)]
    no_watch: bool,
    /// Stuck-input sweep cadence; 0 disables the sweep.
    #[arg(long, default_value_t = 0)]
    reconcile_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr, reason = "hub binds loopback only");
        return;
    }

    let sessions = RuntimeSessionRegistry::new(&config.sessions_path);
    let source = Arc::new(FsSnapshotSource::new(Some(sessions.clone())));
    let broker = EventBroker::new(config.broker.clone(), source);
    if let Err(err) = broker.start().await {
        error!(event = "hub_error", error = %err);
        return;
    }

    let deliverer = Arc::new(Deliverer::new(
        TmuxTransport::from_env(),
        sessions,
        DeliveryConfig::from_env(),
    ));
    if spawn_reconcile_sweep(&broker, deliverer, config.reconcile_interval) {
        info!(
            event = "hub_reconcile_enabled",
            interval_ms = config.reconcile_interval.as_millis() as u64
        );
    }

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            broker.close().await;
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        repos = config.broker.repos.len(),
        registry = ?config.broker.repo_registry_path,
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, router(broker.clone()))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
    broker.close().await;
    info!(event = "hub_stop");
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = resolve_addr(&args.addr);
    let debug = args.debug || env_true("PAIRFLOW_HUB_DEBUG");
    let log_dir = resolve_log_dir(&args.log_dir);
    Config {
        addr,
        debug,
        log_dir,
        broker: BrokerConfig {
            repos: args.repos,
            repo_registry_path: Some(default_repo_registry_path()),
            poll_interval: Duration::from_millis(args.poll_ms),
            debounce: Duration::from_millis(args.debounce_ms),
            history_limit: args.history_limit,
            watch: !args.no_watch,
            ..BrokerConfig::default()
        },
        sessions_path: default_runtime_sessions_path(),
        reconcile_interval: Duration::from_millis(args.reconcile_ms),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("PAIRFLOW_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees log lines to stdout and the hub log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("pairflow-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("PAIRFLOW_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_HUB_ADDR.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Ok(value) = std::env::var("PAIRFLOW_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    ".pairflow/logs".to_string()
}
