use crate::protocol::PaneSessionLookup;
use crate::transport::{CommandOutput, PaneTransport, RunOptions, TransportError};
use pairflow_core::ProtocolEnvelope;
use pairflow_storage::{RegistryError, RuntimeSessionEntry};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Scripted pane: records every command and answers captures from a queue,
/// falling back to a fixed screen once the queue is drained.
#[derive(Debug, Default)]
pub(crate) struct FakePane {
    calls: Mutex<Vec<Vec<String>>>,
    captures: Mutex<VecDeque<String>>,
    default_capture: String,
    fail_literal: bool,
}

impl FakePane {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_captures(self, captures: Vec<String>) -> Self {
        Self {
            captures: Mutex::new(captures.into()),
            ..self
        }
    }

    pub(crate) fn with_default_capture(self, capture: &str) -> Self {
        Self {
            default_capture: capture.to_string(),
            ..self
        }
    }

    pub(crate) fn failing_literal(self) -> Self {
        Self {
            fail_literal: true,
            ..self
        }
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls").clone()
    }

    pub(crate) fn literal_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|args| args.first().map(String::as_str) == Some("send-keys"))
            .filter(|args| args.iter().any(|arg| arg == "-l"))
            .filter_map(|args| args.last().cloned())
            .collect()
    }

    pub(crate) fn submit_count(&self, key: &str) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some("send-keys"))
            .filter(|args| !args.iter().any(|arg| arg == "-l"))
            .filter(|args| args.last().map(String::as_str) == Some(key))
            .count()
    }

    pub(crate) fn capture_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some("capture-pane"))
            .count()
    }
}

impl PaneTransport for FakePane {
    fn run(&self, args: &[String], _options: RunOptions) -> Result<CommandOutput, TransportError> {
        self.calls.lock().expect("calls").push(args.to_vec());
        let command = args.first().map(String::as_str).unwrap_or_default();
        if command == "send-keys" && self.fail_literal && args.iter().any(|arg| arg == "-l") {
            return Err(TransportError::CommandFailed {
                program: "tmux".to_string(),
                args: args.join(" "),
                code: Some(1),
                stderr: "can't find pane".to_string(),
            });
        }
        let stdout = if command == "capture-pane" {
            self.captures
                .lock()
                .expect("captures")
                .pop_front()
                .unwrap_or_else(|| self.default_capture.clone())
        } else {
            String::new()
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct StaticSessions {
    sessions: BTreeMap<String, RuntimeSessionEntry>,
}

impl StaticSessions {
    pub(crate) fn with_session(bubble_id: &str, repo: &str, session_name: &str) -> Self {
        let mut sessions = BTreeMap::new();
        sessions.insert(
            bubble_id.to_string(),
            RuntimeSessionEntry::new(bubble_id, repo, format!("{repo}/.worktrees/{bubble_id}"), session_name),
        );
        Self { sessions }
    }
}

impl PaneSessionLookup for StaticSessions {
    fn lookup(&self, bubble_id: &str) -> Result<Option<RuntimeSessionEntry>, RegistryError> {
        Ok(self.sessions.get(bubble_id).cloned())
    }
}

pub(crate) fn envelope(id: &str, recipient: &str) -> ProtocolEnvelope {
    ProtocolEnvelope {
        id: id.to_string(),
        ts: "2026-10-16T09:00:00Z".to_string(),
        bubble_id: "b1".to_string(),
        sender: "orchestrator".to_string(),
        recipient: recipient.to_string(),
        r#type: "task".to_string(),
        round: 1,
        payload: serde_json::Value::Null,
        refs: Vec::new(),
    }
}
