use anyhow::Result;
use clap::{Parser, Subcommand};
use pairflow_storage::{
    default_repo_registry_path, default_runtime_sessions_path, RegistryError,
    RepositoryRegistry, RuntimeSessionRegistry,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod deliver;
mod repo;
mod session;

const EXIT_DELIVERY_FAILED: u8 = 2;
const EXIT_LOCK_TIMEOUT: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "pairflow")]
#[command(about = "Pairflow registries and pane delivery", long_about = None)]
struct Cli {
    /// Repository registry file; defaults to PAIRFLOW_REPO_REGISTRY_PATH or ~/.pairflow/repos.json.
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    /// Runtime session registry file.
    #[arg(long, global = true)]
    sessions: Option<PathBuf>,
    #[arg(long, global = true)]
    lock_timeout_ms: Option<u64>,
    /// Print listings as JSON.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Manage registered repositories
    Repo {
        #[command(subcommand)]
        action: repo::RepoCommand,
    },
    /// Manage runtime sessions
    Session {
        #[command(subcommand)]
        action: session::SessionCommand,
    },
    /// Deliver one protocol envelope into its recipient's pane
    Deliver(deliver::DeliverArgs),
    /// Submit a delivery left sitting in an agent's input line
    Reconcile(deliver::ReconcileArgs),
}

/// How a command finished when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    DeliveryFailed,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();
    let mut stdout = io::stdout().lock();
    match run(cli, &mut stdout) {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::DeliveryFailed) => ExitCode::from(EXIT_DELIVERY_FAILED),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(cli: Cli, out: &mut dyn Write) -> Result<Outcome> {
    let lock_timeout = cli.lock_timeout_ms.map(Duration::from_millis);
    let sessions = session_registry(cli.sessions, lock_timeout);
    match cli.command {
        Commands::Repo { action } => {
            let mut registry =
                RepositoryRegistry::new(cli.registry.unwrap_or_else(default_repo_registry_path));
            if let Some(timeout) = lock_timeout {
                registry = registry.with_lock_timeout(timeout);
            }
            repo::run(action, &registry, cli.json, out)?;
            Ok(Outcome::Done)
        }
        Commands::Session { action } => {
            session::run(action, &sessions, cli.json, out)?;
            Ok(Outcome::Done)
        }
        Commands::Deliver(args) => deliver::run_deliver(&args, sessions, out),
        Commands::Reconcile(args) => deliver::run_reconcile(&args, sessions, out),
    }
}

fn session_registry(path: Option<PathBuf>, lock_timeout: Option<Duration>) -> RuntimeSessionRegistry {
    let registry = RuntimeSessionRegistry::new(path.unwrap_or_else(default_runtime_sessions_path));
    match lock_timeout {
        Some(timeout) => registry.with_lock_timeout(timeout),
        None => registry,
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let lock_timeout = err.chain().any(|cause| {
        cause
            .downcast_ref::<RegistryError>()
            .is_some_and(RegistryError::is_lock_timeout)
    });
    if lock_timeout {
        EXIT_LOCK_TIMEOUT
    } else {
        1
    }
}

fn init_logging() {
    let level = std::env::var("PAIRFLOW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn parses_nested_kebab_case_commands() {
        let cli = Cli::try_parse_from([
            "pairflow",
            "--lock-timeout-ms",
            "50",
            "repo",
            "add",
            "/tmp/project",
            "--label",
            "demo",
        ])
        .expect("parse");
        assert_eq!(cli.lock_timeout_ms, Some(50));
        match cli.command {
            Commands::Repo {
                action: repo::RepoCommand::Add { path, label },
            } => {
                assert_eq!(path, PathBuf::from("/tmp/project"));
                assert_eq!(label.as_deref(), Some("demo"));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from([
            "pairflow",
            "reconcile",
            "--bubble",
            "b1",
            "--agent",
            "reviewer",
            "--json",
        ])
        .expect("parse");
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Reconcile(_)));
    }

    #[test]
    fn lock_timeout_maps_to_its_own_exit_code() {
        let timeout: Result<()> = Err(RegistryError::LockTimeout {
            path: PathBuf::from("/tmp/repos.json.lock"),
            waited_ms: 50,
        })
        .context("register repository");
        assert_eq!(
            exit_code_for(&timeout.expect_err("error")),
            EXIT_LOCK_TIMEOUT
        );

        let invalid: Result<()> = Err(RegistryError::Invalid {
            path: PathBuf::from("/tmp/repos.json"),
            reason: "bad json".to_string(),
        })
        .context("list repositories");
        assert_eq!(exit_code_for(&invalid.expect_err("error")), 1);
    }

    #[test]
    fn repo_and_session_commands_share_overridden_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = dir.path().join("project");
        std::fs::create_dir_all(&project).expect("project");
        let registry = dir.path().join("repos.json");

        let mut out = Vec::new();
        let cli = Cli::try_parse_from([
            "pairflow".into(),
            "--registry".into(),
            registry.clone().into_os_string(),
            "repo".into(),
            "add".into(),
            project.clone().into_os_string(),
        ])
        .expect("parse");
        assert_eq!(run(cli, &mut out).expect("run"), Outcome::Done);
        assert!(registry.exists());

        let mut out = Vec::new();
        let cli = Cli::try_parse_from([
            "pairflow".into(),
            "--sessions".into(),
            dir.path().join("sessions.json").into_os_string(),
            "session".into(),
            "list".into(),
        ])
        .expect("parse");
        assert_eq!(run(cli, &mut out).expect("run"), Outcome::Done);
        assert_eq!(String::from_utf8(out).expect("utf8"), "no runtime sessions\n");
    }
}
