use pairflow_core::bubble::TRANSCRIPT_FILE;
use pairflow_core::{Participant, ProtocolEnvelope};
use std::path::Path;

pub const MESSAGE_PREFIX: &str = "[pairflow]";

/// Single-line notification typed into the recipient pane. The envelope id
/// doubles as the delivery marker.
pub fn render_delivery_message(envelope: &ProtocolEnvelope, transcript: Option<&Path>) -> String {
    let pointer = reference_pointer(envelope, transcript);
    let line = format!(
        "{MESSAGE_PREFIX} r{} {} {}->{} msg={} ref={}. {}",
        envelope.round,
        envelope.r#type.to_uppercase(),
        envelope.sender,
        envelope.recipient,
        envelope.id,
        pointer,
        next_action(envelope.recipient_participant().ok()),
    );
    single_line(&line)
}

fn reference_pointer(envelope: &ProtocolEnvelope, transcript: Option<&Path>) -> String {
    if let Some(first) = envelope.refs.iter().find(|r| !r.trim().is_empty()) {
        return first.trim().to_string();
    }
    match transcript {
        Some(path) => format!("{}#{}", path.display(), envelope.id),
        None => format!("{}#{}", TRANSCRIPT_FILE, envelope.id),
    }
}

fn next_action(recipient: Option<Participant>) -> &'static str {
    match recipient {
        Some(Participant::Implementer) => {
            "Read the referenced entry, do the work, then hand off with `pairflow pass`."
        }
        Some(Participant::Reviewer) => {
            "Review the changes, then reply with `pairflow pass` or `pairflow converged`."
        }
        Some(Participant::Human) => "Answer with `pairflow reply`.",
        Some(Participant::Orchestrator) => "No agent action required.",
        None => "Route this message manually.",
    }
}

// A newline sent as literal text would submit early.
fn single_line(raw: &str) -> String {
    raw.split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
