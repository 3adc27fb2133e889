use anyhow::{Context, Result};
use clap::Subcommand;
use pairflow_storage::{ListOptions, RepositoryEntry, RepositoryRegistry};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum RepoCommand {
    Add {
        path: PathBuf,
        #[arg(long)]
        label: Option<String>,
    },
    Remove {
        path: PathBuf,
    },
    List {
        /// Collapse aliases of the same repository before printing.
        #[arg(long, default_value_t = false)]
        normalize: bool,
    },
    /// Rewrite the registry with normalized, deduplicated paths.
    Refresh,
}

pub fn run(
    command: RepoCommand,
    registry: &RepositoryRegistry,
    json: bool,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        RepoCommand::Add { path, label } => {
            let outcome = registry
                .register(&path, label.as_deref())
                .with_context(|| format!("register repository {}", path.display()))?;
            report_warnings(&outcome.warnings);
            let verb = if outcome.added { "added" } else { "already registered" };
            writeln!(out, "{verb}: {}", outcome.entry.path.display())?;
        }
        RepoCommand::Remove { path } => {
            let outcome = registry
                .remove(&path)
                .with_context(|| format!("remove repository {}", path.display()))?;
            match outcome.entry {
                Some(entry) => writeln!(out, "removed: {}", entry.path.display())?,
                None => writeln!(out, "not registered: {}", path.display())?,
            }
        }
        RepoCommand::List { normalize } => {
            let listing = registry
                .list(ListOptions { normalize })
                .context("list repositories")?;
            report_warnings(&listing.warnings);
            print_entries(&listing.entries, json, out)?;
        }
        RepoCommand::Refresh => {
            let outcome = registry.refresh().context("refresh repository registry")?;
            report_warnings(&outcome.warnings);
            if json {
                print_entries(&outcome.entries, true, out)?;
            } else {
                let state = if outcome.changed { "rewritten" } else { "unchanged" };
                writeln!(out, "{state}: {} repositories", outcome.entries.len())?;
            }
        }
    }
    Ok(())
}

fn print_entries(entries: &[RepositoryEntry], json: bool, out: &mut dyn Write) -> Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(entries)?)?;
        return Ok(());
    }
    if entries.is_empty() {
        writeln!(out, "no repositories registered")?;
    }
    for entry in entries {
        match &entry.label {
            Some(label) => writeln!(out, "{}\t{label}", entry.path.display())?,
            None => writeln!(out, "{}", entry.path.display())?,
        }
    }
    Ok(())
}

fn report_warnings(warnings: &[String]) {
    for message in warnings {
        warn!(event = "repo_registry_warning", message = %message);
    }
}
