use crate::config::DeliveryConfig;
use crate::marker::{classify_marker, MarkerPosition};
use crate::render::render_delivery_message;
use crate::transport::{pane_target, PaneTransport};
use pairflow_core::bubble::BubblePaths;
use pairflow_core::ProtocolEnvelope;
use pairflow_storage::{RegistryError, RuntimeSessionEntry, RuntimeSessionRegistry};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolves the tmux session that hosts a bubble's panes.
pub trait PaneSessionLookup: Send + Sync {
    fn lookup(&self, bubble_id: &str) -> Result<Option<RuntimeSessionEntry>, RegistryError>;
}

impl PaneSessionLookup for RuntimeSessionRegistry {
    fn lookup(&self, bubble_id: &str) -> Result<Option<RuntimeSessionEntry>, RegistryError> {
        self.get(bubble_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStep {
    Confirmed,
    RetrySubmit,
    GiveUp,
}

/// Decides what follows verification number `attempt` (1-based).
pub fn next_step(position: MarkerPosition, attempt: u32, max_attempts: u32) -> DeliveryStep {
    match position {
        MarkerPosition::Submitted => DeliveryStep::Confirmed,
        MarkerPosition::StuckInInput | MarkerPosition::NotFound
            if attempt < max_attempts.max(1) =>
        {
            DeliveryStep::RetrySubmit
        }
        MarkerPosition::StuckInInput | MarkerPosition::NotFound => DeliveryStep::GiveUp,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum DeliveryFailure {
    NoRuntimeSession,
    UnsupportedRecipient(String),
    RegistryReadFailed(String),
    DeliveryUnconfirmed,
    TmuxSendFailed(String),
}

impl DeliveryFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryFailure::NoRuntimeSession => "no_runtime_session",
            DeliveryFailure::UnsupportedRecipient(_) => "unsupported_recipient",
            DeliveryFailure::RegistryReadFailed(_) => "registry_read_failed",
            DeliveryFailure::DeliveryUnconfirmed => "delivery_unconfirmed",
            DeliveryFailure::TmuxSendFailed(_) => "tmux_send_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "failure", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed(DeliveryFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    #[serde(flatten)]
    pub status: DeliveryStatus,
    pub envelope_id: String,
    pub message: String,
    pub pane_target: Option<String>,
    pub verifications: u32,
    pub retry_submits: u32,
    pub last_position: Option<MarkerPosition>,
}

impl DeliveryReport {
    fn new(envelope: &ProtocolEnvelope, message: String) -> Self {
        Self {
            status: DeliveryStatus::Delivered,
            envelope_id: envelope.id.clone(),
            message,
            pane_target: None,
            verifications: 0,
            retry_submits: 0,
            last_position: None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }

    pub fn failure(&self) -> Option<&DeliveryFailure> {
        match &self.status {
            DeliveryStatus::Delivered => None,
            DeliveryStatus::Failed(failure) => Some(failure),
        }
    }

    fn fail(mut self, failure: DeliveryFailure) -> Self {
        self.status = DeliveryStatus::Failed(failure);
        self
    }
}

/// Delivers envelopes into agent panes and confirms each one landed.
#[derive(Debug, Clone)]
pub struct Deliverer<T, L> {
    transport: T,
    sessions: L,
    config: DeliveryConfig,
}

impl<T: PaneTransport, L: PaneSessionLookup> Deliverer<T, L> {
    pub fn new(transport: T, sessions: L, config: DeliveryConfig) -> Self {
        Self {
            transport,
            sessions,
            config,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn sessions(&self) -> &L {
        &self.sessions
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Never fails with `Err`: every outcome, including transport faults, is
    /// reported in the returned report together with the rendered message.
    pub fn deliver(&self, envelope: &ProtocolEnvelope) -> DeliveryReport {
        let lookup = self.sessions.lookup(&envelope.bubble_id);
        let transcript = match &lookup {
            Ok(Some(entry)) => Some(BubblePaths::new(&entry.repo_path, &envelope.bubble_id).transcript),
            _ => None,
        };
        let message = render_delivery_message(envelope, transcript.as_deref());
        let report = DeliveryReport::new(envelope, message);

        let participant = match envelope.recipient_participant() {
            Ok(participant) => participant,
            Err(reason) => {
                warn!(
                    event = "delivery_unsupported_recipient",
                    bubble_id = %envelope.bubble_id,
                    envelope_id = %envelope.id,
                    recipient = %envelope.recipient,
                );
                return report.fail(DeliveryFailure::UnsupportedRecipient(reason));
            }
        };

        let session = match lookup {
            Ok(Some(session)) => session,
            Ok(None) => {
                warn!(
                    event = "delivery_no_runtime_session",
                    bubble_id = %envelope.bubble_id,
                    envelope_id = %envelope.id,
                );
                return report.fail(DeliveryFailure::NoRuntimeSession);
            }
            Err(err) => {
                warn!(
                    event = "delivery_registry_read_failed",
                    bubble_id = %envelope.bubble_id,
                    error = %err,
                );
                return report.fail(DeliveryFailure::RegistryReadFailed(err.to_string()));
            }
        };

        let target = pane_target(&session.tmux_session_name, participant.pane_index());
        let mut report = report;
        report.pane_target = Some(target.clone());
        self.confirm(envelope, &target, report)
    }

    fn confirm(
        &self,
        envelope: &ProtocolEnvelope,
        target: &str,
        mut report: DeliveryReport,
    ) -> DeliveryReport {
        if let Err(err) = self.transport.send_literal(target, &report.message) {
            return self.send_failed(report, target, err.to_string());
        }
        pause(self.config.settle_delay);
        if let Err(err) = self.transport.send_key(target, &self.config.submit_key) {
            return self.send_failed(report, target, err.to_string());
        }

        let mut attempt = 1;
        loop {
            pause(self.config.verify_delay);
            let capture = match self.transport.capture(target) {
                Ok(capture) => capture,
                Err(err) => return self.send_failed(report, target, err.to_string()),
            };
            report.verifications = attempt;
            let position = classify_marker(&capture, &envelope.id, &self.config.prompt_glyphs);
            report.last_position = Some(position);
            debug!(
                event = "delivery_verification",
                target = %target,
                envelope_id = %envelope.id,
                attempt,
                position = ?position,
            );

            match next_step(position, attempt, self.config.max_attempts) {
                DeliveryStep::Confirmed => {
                    info!(
                        event = "delivery_confirmed",
                        bubble_id = %envelope.bubble_id,
                        envelope_id = %envelope.id,
                        target = %target,
                        verifications = report.verifications,
                        retry_submits = report.retry_submits,
                    );
                    return report;
                }
                DeliveryStep::RetrySubmit => {
                    pause(self.config.retry_delay);
                    if let Err(err) = self.transport.send_key(target, &self.config.submit_key) {
                        return self.send_failed(report, target, err.to_string());
                    }
                    report.retry_submits += 1;
                    attempt += 1;
                }
                DeliveryStep::GiveUp => {
                    warn!(
                        event = "delivery_unconfirmed",
                        bubble_id = %envelope.bubble_id,
                        envelope_id = %envelope.id,
                        target = %target,
                        verifications = report.verifications,
                        last_position = ?position,
                    );
                    return report.fail(DeliveryFailure::DeliveryUnconfirmed);
                }
            }
        }
    }

    fn send_failed(&self, report: DeliveryReport, target: &str, reason: String) -> DeliveryReport {
        warn!(
            event = "delivery_tmux_send_failed",
            envelope_id = %report.envelope_id,
            target = %target,
            error = %reason,
        );
        report.fail(DeliveryFailure::TmuxSendFailed(reason))
    }
}

pub(crate) fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{envelope, FakePane, StaticSessions};

    fn deliverer(pane: FakePane, max_attempts: u32) -> Deliverer<FakePane, StaticSessions> {
        Deliverer::new(
            pane,
            StaticSessions::with_session("b1", "/r", "pf-b1"),
            DeliveryConfig::immediate().with_max_attempts(max_attempts),
        )
    }

    #[test]
    fn transition_function_bounds_retries() {
        assert_eq!(next_step(MarkerPosition::Submitted, 3, 3), DeliveryStep::Confirmed);
        assert_eq!(next_step(MarkerPosition::NotFound, 1, 3), DeliveryStep::RetrySubmit);
        assert_eq!(next_step(MarkerPosition::StuckInInput, 2, 3), DeliveryStep::RetrySubmit);
        assert_eq!(next_step(MarkerPosition::StuckInInput, 3, 3), DeliveryStep::GiveUp);
        assert_eq!(next_step(MarkerPosition::NotFound, 1, 0), DeliveryStep::GiveUp);
    }

    #[test]
    fn confirms_on_first_verification() {
        let pane = FakePane::new().with_default_capture(
            "• [pairflow] r1 TASK orchestrator->implementer msg=msg_0001\n\n› ",
        );
        let deliverer = deliverer(pane, 3);
        let report = deliverer.deliver(&envelope("msg_0001", "implementer"));

        assert!(report.is_delivered());
        assert_eq!(report.pane_target.as_deref(), Some("pf-b1:0.1"));
        assert_eq!(report.verifications, 1);
        assert_eq!(report.retry_submits, 0);
        assert_eq!(report.last_position, Some(MarkerPosition::Submitted));

        let pane = deliverer.transport();
        assert_eq!(pane.literal_texts(), vec![report.message.clone()]);
        assert_eq!(pane.submit_count("Enter"), 1);
        let calls = pane.calls();
        assert_eq!(calls[0][0], "send-keys");
        assert_eq!(calls[1], vec!["send-keys", "-t", "pf-b1:0.1", "Enter"]);
        assert_eq!(calls[2][0], "capture-pane");
    }

    #[test]
    fn stuck_input_is_resubmitted_then_confirmed() {
        let pane = FakePane::new()
            .with_captures(vec!["output\n› [pairflow] msg=msg_0001".to_string()])
            .with_default_capture("[pairflow] msg=msg_0001\n› ");
        let deliverer = deliverer(pane, 3);
        let report = deliverer.deliver(&envelope("msg_0001", "reviewer"));

        assert!(report.is_delivered());
        assert_eq!(report.pane_target.as_deref(), Some("pf-b1:0.2"));
        assert_eq!(report.verifications, 2);
        assert_eq!(report.retry_submits, 1);
        assert_eq!(deliverer.transport().submit_count("Enter"), 2);
    }

    #[test]
    fn never_visible_marker_uses_exactly_n_verifications() {
        let pane = FakePane::new().with_default_capture("› ");
        let deliverer = deliverer(pane, 4);
        let report = deliverer.deliver(&envelope("msg_0001", "implementer"));

        assert_eq!(
            report.failure(),
            Some(&DeliveryFailure::DeliveryUnconfirmed)
        );
        assert_eq!(report.verifications, 4);
        assert_eq!(report.retry_submits, 3);
        assert_eq!(report.last_position, Some(MarkerPosition::NotFound));
        let pane = deliverer.transport();
        assert_eq!(pane.capture_count(), 4);
        assert_eq!(pane.submit_count("Enter"), 4);
    }

    #[test]
    fn missing_session_reports_without_touching_panes() {
        let deliverer = Deliverer::new(
            FakePane::new(),
            StaticSessions::default(),
            DeliveryConfig::immediate(),
        );
        let report = deliverer.deliver(&envelope("msg_0001", "implementer"));
        assert_eq!(report.failure(), Some(&DeliveryFailure::NoRuntimeSession));
        assert!(report.message.contains("msg=msg_0001"));
        assert!(report.message.contains("ref=transcript.ndjson#msg_0001"));
        assert!(deliverer.transport().calls().is_empty());
    }

    #[test]
    fn unknown_recipient_is_unsupported() {
        let deliverer = deliverer(FakePane::new(), 3);
        let report = deliverer.deliver(&envelope("msg_0001", "observer"));
        assert_eq!(report.failure().map(|f| f.reason()), Some("unsupported_recipient"));
        assert!(report.pane_target.is_none());
        assert!(deliverer.transport().calls().is_empty());
    }

    #[test]
    fn human_and_orchestrator_route_to_status_pane() {
        let pane = FakePane::new().with_default_capture("msg_0001 seen");
        let deliverer = deliverer(pane, 1);
        let report = deliverer.deliver(&envelope("msg_0001", "human"));
        assert_eq!(report.pane_target.as_deref(), Some("pf-b1:0.0"));
        assert!(report.is_delivered());
    }

    #[test]
    fn transport_fault_is_tmux_send_failed() {
        let pane = FakePane::new().failing_literal();
        let deliverer = deliverer(pane, 3);
        let report = deliverer.deliver(&envelope("msg_0001", "implementer"));
        assert_eq!(report.failure().map(|f| f.reason()), Some("tmux_send_failed"));
        assert_eq!(report.verifications, 0);
        assert_eq!(deliverer.transport().submit_count("Enter"), 0);
    }

    #[test]
    fn unreadable_registry_is_registry_read_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{ not json").expect("seed");
        let deliverer = Deliverer::new(
            FakePane::new(),
            RuntimeSessionRegistry::new(&path),
            DeliveryConfig::immediate(),
        );
        let report = deliverer.deliver(&envelope("msg_0001", "implementer"));
        assert_eq!(report.failure().map(|f| f.reason()), Some("registry_read_failed"));
    }

    #[test]
    fn transcript_pointer_uses_session_repo() {
        let pane = FakePane::new().with_default_capture("msg_0001\n› ");
        let deliverer = deliverer(pane, 1);
        let report = deliverer.deliver(&envelope("msg_0001", "implementer"));
        assert!(report
            .message
            .contains("ref=/r/.pairflow/bubbles/b1/transcript.ndjson#msg_0001."));
    }

    #[test]
    fn report_serializes_status_and_failure_code() {
        let deliverer = Deliverer::new(
            FakePane::new(),
            StaticSessions::default(),
            DeliveryConfig::immediate(),
        );
        let report = deliverer.deliver(&envelope("msg_0001", "implementer"));
        let value = serde_json::to_value(&report).expect("serialize");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["failure"]["code"], "no_runtime_session");
        assert_eq!(value["envelopeId"], "msg_0001");
    }
}
