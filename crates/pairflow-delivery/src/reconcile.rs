use crate::config::DeliveryConfig;
use crate::marker::locate_marker;
use crate::protocol::{Deliverer, PaneSessionLookup};
use crate::transport::{pane_target, PaneTransport};
use pairflow_core::Participant;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoRuntimeSession,
    UnsupportedRecipient,
    NoMarker,
    AlreadySubmitted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Nudged { target: String },
    Skipped { reason: SkipReason },
    Failed { reason: String },
}

/// One stateless sweep of the active agent's pane: when a delivery marker is
/// sitting unsubmitted in the input line, send a single submit key.
pub fn reconcile_stuck_input<T, L>(
    transport: &T,
    sessions: &L,
    config: &DeliveryConfig,
    bubble_id: &str,
    active_agent: &str,
) -> ReconcileOutcome
where
    T: PaneTransport + ?Sized,
    L: PaneSessionLookup + ?Sized,
{
    let participant = match active_agent.parse::<Participant>() {
        Ok(participant) if participant.is_agent() => participant,
        _ => {
            return ReconcileOutcome::Skipped {
                reason: SkipReason::UnsupportedRecipient,
            }
        }
    };
    let session = match sessions.lookup(bubble_id) {
        Ok(Some(session)) => session,
        Ok(None) => {
            return ReconcileOutcome::Skipped {
                reason: SkipReason::NoRuntimeSession,
            }
        }
        Err(err) => {
            return ReconcileOutcome::Failed {
                reason: err.to_string(),
            }
        }
    };

    let target = pane_target(&session.tmux_session_name, participant.pane_index());
    let capture = match transport.capture(&target) {
        Ok(capture) => capture,
        Err(err) => {
            warn!(event = "reconcile_capture_failed", bubble_id, target = %target, error = %err);
            return ReconcileOutcome::Failed {
                reason: err.to_string(),
            };
        }
    };

    let location = locate_marker(&capture, &config.marker_prefix, &config.prompt_glyphs);
    if !location.in_input {
        let reason = if location.in_output {
            SkipReason::AlreadySubmitted
        } else {
            SkipReason::NoMarker
        };
        debug!(event = "reconcile_skipped", bubble_id, target = %target, reason = ?reason);
        return ReconcileOutcome::Skipped { reason };
    }

    if let Err(err) = transport.send_key(&target, &config.submit_key) {
        warn!(event = "reconcile_submit_failed", bubble_id, target = %target, error = %err);
        return ReconcileOutcome::Failed {
            reason: err.to_string(),
        };
    }
    info!(event = "reconcile_nudged", bubble_id, target = %target);
    ReconcileOutcome::Nudged { target }
}

impl<T: PaneTransport, L: PaneSessionLookup> Deliverer<T, L> {
    pub fn reconcile_stuck_input(&self, bubble_id: &str, active_agent: &str) -> ReconcileOutcome {
        reconcile_stuck_input(
            self.transport(),
            self.sessions(),
            self.config(),
            bubble_id,
            active_agent,
        )
    }
}
