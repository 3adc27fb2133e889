use anyhow::{Context, Result};
use clap::Subcommand;
use pairflow_storage::RuntimeSessionRegistry;
use std::io::Write;
use tracing::info;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum SessionCommand {
    List,
    Remove {
        bubble_id: String,
    },
    /// Drop sessions whose worktree no longer exists.
    Prune,
}

pub fn run(
    command: SessionCommand,
    registry: &RuntimeSessionRegistry,
    json: bool,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        SessionCommand::List => {
            let sessions = registry.list().context("list runtime sessions")?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&sessions)?)?;
            } else if sessions.is_empty() {
                writeln!(out, "no runtime sessions")?;
            } else {
                for entry in &sessions {
                    writeln!(
                        out,
                        "{}\t{}\t{}",
                        entry.bubble_id,
                        entry.tmux_session_name,
                        entry.worktree_path.display()
                    )?;
                }
            }
        }
        SessionCommand::Remove { bubble_id } => {
            let removed = registry
                .remove(&bubble_id)
                .with_context(|| format!("remove runtime session {bubble_id}"))?;
            let state = if removed { "removed" } else { "no session" };
            writeln!(out, "{state}: {bubble_id}")?;
        }
        SessionCommand::Prune => {
            let dropped = registry
                .prune(|entry| entry.worktree_path.exists())
                .context("prune runtime sessions")?;
            for entry in &dropped {
                info!(
                    event = "session_pruned",
                    bubble_id = %entry.bubble_id,
                    worktree = %entry.worktree_path.display()
                );
                writeln!(out, "pruned: {}", entry.bubble_id)?;
            }
            if dropped.is_empty() {
                writeln!(out, "nothing to prune")?;
            }
        }
    }
    Ok(())
}
