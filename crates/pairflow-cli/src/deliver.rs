use crate::Outcome;
use anyhow::{Context, Result};
use clap::Args;
use pairflow_core::ProtocolEnvelope;
use pairflow_delivery::{
    Deliverer, DeliveryConfig, PaneSessionLookup, PaneTransport, ReconcileOutcome, TmuxTransport,
};
use pairflow_storage::RuntimeSessionRegistry;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct DeliverArgs {
    /// Envelope JSON file.
    #[arg(long)]
    pub envelope: PathBuf,
}

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    #[arg(long)]
    pub bubble: String,
    /// Participant whose pane should be checked.
    #[arg(long)]
    pub agent: String,
}

pub fn run_deliver(
    args: &DeliverArgs,
    sessions: RuntimeSessionRegistry,
    out: &mut dyn Write,
) -> Result<Outcome> {
    let envelope = load_envelope(&args.envelope)?;
    let deliverer = Deliverer::new(TmuxTransport::from_env(), sessions, DeliveryConfig::from_env());
    deliver_envelope(&deliverer, &envelope, out)
}

pub fn run_reconcile(
    args: &ReconcileArgs,
    sessions: RuntimeSessionRegistry,
    out: &mut dyn Write,
) -> Result<Outcome> {
    let deliverer = Deliverer::new(TmuxTransport::from_env(), sessions, DeliveryConfig::from_env());
    reconcile(&deliverer, &args.bubble, &args.agent, out)
}

pub fn load_envelope(path: &Path) -> Result<ProtocolEnvelope> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read envelope {}", path.display()))?;
    ProtocolEnvelope::from_json(&raw).with_context(|| format!("parse envelope {}", path.display()))
}

/// Prints the report as JSON; a failed delivery is reported, not raised.
fn deliver_envelope<T: PaneTransport, L: PaneSessionLookup>(
    deliverer: &Deliverer<T, L>,
    envelope: &ProtocolEnvelope,
    out: &mut dyn Write,
) -> Result<Outcome> {
    let report = deliverer.deliver(envelope);
    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(if report.is_delivered() {
        Outcome::Done
    } else {
        Outcome::DeliveryFailed
    })
}

fn reconcile<T: PaneTransport, L: PaneSessionLookup>(
    deliverer: &Deliverer<T, L>,
    bubble_id: &str,
    agent: &str,
    out: &mut dyn Write,
) -> Result<Outcome> {
    let outcome = deliverer.reconcile_stuck_input(bubble_id, agent);
    writeln!(out, "{}", serde_json::to_string(&outcome)?)?;
    Ok(match outcome {
        ReconcileOutcome::Failed { .. } => Outcome::DeliveryFailed,
        ReconcileOutcome::Nudged { .. } | ReconcileOutcome::Skipped { .. } => Outcome::Done,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairflow_delivery::{CommandOutput, RunOptions, TransportError};
    use pairflow_storage::RuntimeSessionEntry;
    use std::sync::Mutex;

    /// Pane that echoes back whatever literal text it was sent as submitted
    /// output.
    #[derive(Default)]
    struct EchoPane {
        sent: Mutex<Vec<String>>,
    }

    impl PaneTransport for EchoPane {
        fn run(&self, args: &[String], _options: RunOptions) -> Result<CommandOutput, TransportError> {
            let mut sent = self.sent.lock().expect("sent");
            let stdout = match args.first().map(String::as_str) {
                Some("send-keys") if args.iter().any(|arg| arg == "-l") => {
                    if let Some(text) = args.last() {
                        sent.push(text.clone());
                    }
                    String::new()
                }
                Some("capture-pane") => format!("{}\n› ", sent.join("\n")),
                _ => String::new(),
            };
            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
    }

    fn write_envelope(dir: &Path, recipient: &str) -> PathBuf {
        let path = dir.join("envelope.json");
        let body = serde_json::json!({
            "id": "msg_cli1",
            "ts": "2026-02-21T12:00:00Z",
            "bubble_id": "b1",
            "sender": "orchestrator",
            "recipient": recipient,
            "type": "TASK",
            "round": 1,
            "payload": {},
            "refs": []
        });
        std::fs::write(&path, body.to_string()).expect("envelope");
        path
    }

    fn registry(dir: &Path) -> RuntimeSessionRegistry {
        let sessions = RuntimeSessionRegistry::new(dir.join("sessions.json"));
        sessions
            .upsert(RuntimeSessionEntry::new("b1", dir, dir, "pf-b1"))
            .expect("upsert");
        sessions
    }

    fn text(out: Vec<u8>) -> String {
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn delivered_report_is_printed_as_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let envelope = load_envelope(&write_envelope(dir.path(), "reviewer")).expect("load");
        let deliverer = Deliverer::new(
            EchoPane::default(),
            registry(dir.path()),
            DeliveryConfig::immediate(),
        );

        let mut out = Vec::new();
        let outcome = deliver_envelope(&deliverer, &envelope, &mut out).expect("deliver");
        assert_eq!(outcome, Outcome::Done);
        let report: serde_json::Value = serde_json::from_str(&text(out)).expect("json");
        assert_eq!(report["status"], "delivered");
        assert_eq!(report["paneTarget"], "pf-b1:0.2");
        assert_eq!(report["verifications"], 1);
    }

    #[test]
    fn missing_session_is_a_delivery_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let envelope = load_envelope(&write_envelope(dir.path(), "implementer")).expect("load");
        let deliverer = Deliverer::new(
            EchoPane::default(),
            RuntimeSessionRegistry::new(dir.path().join("empty.json")),
            DeliveryConfig::immediate(),
        );

        let mut out = Vec::new();
        let outcome = deliver_envelope(&deliverer, &envelope, &mut out).expect("deliver");
        assert_eq!(outcome, Outcome::DeliveryFailed);
        let report: serde_json::Value = serde_json::from_str(&text(out)).expect("json");
        assert_eq!(report["failure"]["code"], "no_runtime_session");
        assert!(deliverer.transport().sent.lock().expect("sent").is_empty());
    }

    #[test]
    fn malformed_envelope_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("envelope.json");
        std::fs::write(&path, r#"{"id":"msg_1"}"#).expect("write");
        let err = load_envelope(&path).expect_err("invalid envelope");
        assert!(format!("{err:#}").contains("parse envelope"));
        assert!(load_envelope(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn reconcile_skips_pane_without_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let deliverer = Deliverer::new(
            EchoPane::default(),
            registry(dir.path()),
            DeliveryConfig::immediate(),
        );
        let mut out = Vec::new();
        let outcome = reconcile(&deliverer, "b1", "implementer", &mut out).expect("reconcile");
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(
            text(out).trim(),
            r#"{"outcome":"skipped","reason":"no_marker"}"#
        );
    }
}
