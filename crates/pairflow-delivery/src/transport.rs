use std::io;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_TMUX_BIN: &str = "tmux";
pub const TMUX_BIN_ENV: &str = "PAIRFLOW_TMUX_BIN";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Return the output of a non-zero exit instead of raising.
    pub allow_failure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} {args} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        args: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Unreliable text channel into terminal panes. Implementations issue one
/// command per call and never retry or interpret pane contents.
pub trait PaneTransport: Send + Sync {
    fn run(&self, args: &[String], options: RunOptions) -> Result<CommandOutput, TransportError>;

    /// Visible pane text, including an unsubmitted input line. Wrapped lines
    /// are joined so a marker is never split across lines.
    fn capture(&self, target: &str) -> Result<String, TransportError> {
        let args = to_args(&["capture-pane", "-p", "-J", "-t", target]);
        self.run(&args, RunOptions::default())
            .map(|output| output.stdout)
    }

    fn send_literal(&self, target: &str, text: &str) -> Result<(), TransportError> {
        let args = to_args(&["send-keys", "-t", target, "-l", text]);
        self.run(&args, RunOptions::default()).map(|_| ())
    }

    fn send_key(&self, target: &str, key: &str) -> Result<(), TransportError> {
        let args = to_args(&["send-keys", "-t", target, key]);
        self.run(&args, RunOptions::default()).map(|_| ())
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

/// `<session>:0.<pane>`; every bubble session keeps its panes in window 0.
pub fn pane_target(session_name: &str, pane_index: u8) -> String {
    format!("{session_name}:0.{pane_index}")
}

#[derive(Debug, Clone)]
pub struct TmuxTransport {
    program: String,
}

impl TmuxTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_env() -> Self {
        match std::env::var(TMUX_BIN_ENV) {
            Ok(value) if !value.trim().is_empty() => Self::new(value.trim()),
            _ => Self::default(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for TmuxTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TMUX_BIN)
    }
}

impl PaneTransport for TmuxTransport {
    fn run(&self, args: &[String], options: RunOptions) -> Result<CommandOutput, TransportError> {
        debug!(event = "tmux_command", program = %self.program, args = ?args);
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| TransportError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        };
        if !result.success() && !options.allow_failure {
            return Err(TransportError::CommandFailed {
                program: self.program.clone(),
                args: args.join(" "),
                code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result)
    }
}
